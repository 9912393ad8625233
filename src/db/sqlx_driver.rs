//! sqlx-backed production driver

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo};

use super::{Database, DatabasePool, DbError};
use crate::config::DatabaseConfig;

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Production [`Database`] backed by sqlx.
pub struct SqlxDatabase;

#[async_trait]
impl Database for SqlxDatabase {
    async fn open_pool(&self, config: &DatabaseConfig) -> Result<Arc<dyn DatabasePool>, DbError> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        for (key, value) in &config.options {
            options = options.options([(key.as_str(), value.as_str())]);
        }

        let schema = config.schema.clone();
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .after_connect(move |conn, _meta| {
                let schema = schema.clone();
                Box::pin(async move {
                    if let Some(schema) = schema {
                        let stmt = format!("SET search_path TO {}", quote_ident(&schema));
                        conn.execute(stmt.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        Ok(Arc::new(SqlxPool { pool }))
    }
}

struct SqlxPool {
    pool: PgPool,
}

#[async_trait]
impl DatabasePool for SqlxPool {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, DbError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else {
                        query.bind(n.as_f64().unwrap_or(0.0))
                    }
                }
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn probe(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn close(&self) -> Result<(), DbError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Double-quote an identifier so a configured schema name cannot smuggle
/// statements into `SET search_path`.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .ok()
                .flatten()
                .map(|v| Value::from(v as f64)),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
        };
        object.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}
