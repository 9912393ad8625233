//! Read-only tool handlers
//!
//! The gateway exposes a fixed tool set: `query` for ad-hoc read-only
//! SQL, `list_tables` and `describe_table` for catalog browsing. Every
//! statement passes the read-only guard before it reaches the pool, and
//! result sets are truncated to the configured row limits.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::QueryLimits;
use crate::db::DatabasePool;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("{0}")]
    RejectedSql(String),

    #[error("{0}")]
    Execution(String),
}

/// Tool definitions for `tools/list`.
pub fn definitions() -> Value {
    json!([
        {
            "name": "query",
            "description": "Run a read-only SQL query and return rows as JSON",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "A single SELECT statement" },
                    "params": {
                        "type": "array",
                        "description": "Positional bind parameters",
                        "items": {}
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum rows to return"
                    }
                },
                "required": ["sql"]
            }
        },
        {
            "name": "list_tables",
            "description": "List tables visible in a schema",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "schema": { "type": "string", "description": "Schema to list; defaults to the connection schema" }
                }
            }
        },
        {
            "name": "describe_table",
            "description": "Describe the columns of a table",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "schema": { "type": "string" }
                },
                "required": ["table"]
            }
        }
    ])
}

/// Dispatches one `tools/call` invocation.
pub async fn call(
    name: &str,
    arguments: &Value,
    pool: Arc<dyn DatabasePool>,
    limits: QueryLimits,
) -> Result<Value, ToolError> {
    match name {
        "query" => run_query(arguments, pool, limits).await,
        "list_tables" => list_tables(arguments, pool, limits).await,
        "describe_table" => describe_table(arguments, pool, limits).await,
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

async fn run_query(
    arguments: &Value,
    pool: Arc<dyn DatabasePool>,
    limits: QueryLimits,
) -> Result<Value, ToolError> {
    let sql = arguments
        .get("sql")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments("sql must be a string".to_string()))?;

    ensure_read_only(sql).map_err(ToolError::RejectedSql)?;

    let params: Vec<Value> = arguments
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let requested = arguments.get("limit").and_then(Value::as_i64);
    let effective = requested
        .unwrap_or(limits.default_limit)
        .clamp(1, limits.max_limit) as usize;

    let mut rows = pool
        .execute(sql, &params)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;

    let truncated = rows.len() > effective;
    rows.truncate(effective);

    Ok(json!({
        "rows": rows,
        "rowCount": rows.len(),
        "truncated": truncated,
    }))
}

async fn list_tables(
    arguments: &Value,
    pool: Arc<dyn DatabasePool>,
    limits: QueryLimits,
) -> Result<Value, ToolError> {
    let schema = arguments.get("schema").and_then(Value::as_str);

    let (sql, params) = match schema {
        Some(schema) => (
            "SELECT table_schema, table_name, table_type \
             FROM information_schema.tables WHERE table_schema = $1 \
             ORDER BY table_name",
            vec![json!(schema)],
        ),
        None => (
            "SELECT table_schema, table_name, table_type \
             FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name",
            Vec::new(),
        ),
    };

    let mut rows = pool
        .execute(sql, &params)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    rows.truncate(limits.max_limit as usize);

    Ok(json!({ "tables": rows }))
}

async fn describe_table(
    arguments: &Value,
    pool: Arc<dyn DatabasePool>,
    limits: QueryLimits,
) -> Result<Value, ToolError> {
    let table = arguments
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments("table must be a string".to_string()))?;
    let schema = arguments.get("schema").and_then(Value::as_str);

    let (sql, params) = match schema {
        Some(schema) => (
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_name = $1 AND table_schema = $2 \
             ORDER BY ordinal_position",
            vec![json!(table), json!(schema)],
        ),
        None => (
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns WHERE table_name = $1 \
             ORDER BY ordinal_position",
            vec![json!(table)],
        ),
    };

    let mut rows = pool
        .execute(sql, &params)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    rows.truncate(limits.max_limit as usize);

    Ok(json!({ "table": table, "columns": rows }))
}

static FORBIDDEN_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|merge|drop|create|alter|truncate|grant|revoke|rename|call|exec|execute|set|lock|vacuum|copy|comment)\b",
    )
    .expect("sql keyword regex")
});

/// Rejects anything that is not a single read-only statement.
///
/// Conservative on purpose: a quoted literal containing a mutation
/// keyword is rejected too. False negatives are worse than false
/// positives against an untrusted caller.
pub fn ensure_read_only(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err("empty statement".to_string());
    }

    // One statement only; allow a single trailing terminator.
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    if body.contains(';') {
        return Err("multiple statements are not allowed".to_string());
    }

    let first_word = body
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !matches!(first_word.as_str(), "select" | "with" | "values") {
        return Err(format!("statement must be read-only, got {first_word:?}"));
    }

    if let Some(found) = FORBIDDEN_KEYWORD_RE.find(body) {
        return Err(format!(
            "forbidden keyword in statement: {}",
            found.as_str().to_ascii_lowercase()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDatabase;
    use crate::db::Database;

    #[test]
    fn select_variants_pass_the_guard() {
        assert!(ensure_read_only("SELECT * FROM customers").is_ok());
        assert!(ensure_read_only("  select 1;").is_ok());
        assert!(ensure_read_only("WITH t AS (SELECT 1 AS n) SELECT n FROM t").is_ok());
        assert!(ensure_read_only("VALUES (1), (2)").is_ok());
    }

    #[test]
    fn mutations_are_rejected() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "UPDATE t SET a = 1",
            "DELETE FROM t",
            "DROP TABLE t",
            "SELECT 1; DROP TABLE t",
            "select * from t; --",
            "CREATE TABLE t (a int)",
            "",
        ] {
            assert!(ensure_read_only(sql).is_err(), "should reject {sql:?}");
        }
    }

    #[test]
    fn embedded_keywords_are_rejected_conservatively() {
        assert!(ensure_read_only("SELECT * FROM t WHERE note = 'please DELETE me'").is_err());
        // Word boundaries keep ordinary column names usable.
        assert!(ensure_read_only("SELECT updated_at, created_at FROM t").is_ok());
        assert!(ensure_read_only("SELECT settings FROM t").is_ok());
    }

    #[tokio::test]
    async fn query_truncates_to_limit() {
        let database = MockDatabase::accept_all();
        let pool = database
            .open_pool(&crate::test_utils::database_config("svc", "secret"))
            .await
            .unwrap();
        database.opened_pools()[0].set_rows(vec![
            serde_json::json!({"n": 1}),
            serde_json::json!({"n": 2}),
            serde_json::json!({"n": 3}),
        ]);

        let limits = QueryLimits {
            default_limit: 1000,
            max_limit: 10_000,
        };
        let result = call(
            "query",
            &serde_json::json!({"sql": "SELECT n FROM t", "limit": 2}),
            pool,
            limits,
        )
        .await
        .unwrap();

        assert_eq!(result["rowCount"], 2);
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let database = MockDatabase::accept_all();
        let pool = database
            .open_pool(&crate::test_utils::database_config("svc", "secret"))
            .await
            .unwrap();
        let limits = QueryLimits {
            default_limit: 1000,
            max_limit: 10_000,
        };

        let err = call("write_stuff", &serde_json::json!({}), pool, limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }
}
