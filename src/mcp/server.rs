//! JSON-RPC dispatch onto the tool set
//!
//! [`GatewayServer`] is the protocol endpoint a transport connects to.
//! One instance serves one pool key; the pool itself is fetched from the
//! registry per call so a recreated pool is picked up transparently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::tools::{self, ToolError};
use super::PROTOCOL_VERSION;
use crate::config::QueryLimits;
use crate::db::PoolRegistry;
use crate::error::{
    rpc_error, RPC_INTERNAL_ERROR, RPC_INVALID_PARAMS, RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR,
};

pub const SERVER_NAME: &str = "dbmcp";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The protocol collaborator the session plane couples transports to.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Handles one JSON-RPC envelope. `None` means the request was a
    /// notification and produces no response body.
    async fn handle_request(&self, request: Value) -> Option<Value>;

    async fn close(&self) -> anyhow::Result<()>;
}

pub struct GatewayServer {
    pools: Arc<PoolRegistry>,
    pool_key: String,
    query_limits: QueryLimits,
    closed: AtomicBool,
}

impl GatewayServer {
    pub fn create(
        pools: Arc<PoolRegistry>,
        pool_key: &str,
        query_limits: QueryLimits,
    ) -> Arc<dyn ProtocolServer> {
        Arc::new(Self {
            pools,
            pool_key: pool_key.to_string(),
            query_limits,
            closed: AtomicBool::new(false),
        })
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
        })
    }

    async fn tools_call(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((RPC_INVALID_PARAMS, "tool name is required".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let pool = self.pools.get(&self.pool_key).ok_or((
            RPC_INTERNAL_ERROR,
            "no database pool for this session".to_string(),
        ))?;

        match tools::call(name, &arguments, pool, self.query_limits).await {
            Ok(result) => Ok(json!({
                "content": [{
                    "type": "text",
                    "text": result.to_string(),
                }],
                "isError": false,
            })),
            // Tool-level failures stay inside the result envelope so the
            // model sees them; protocol failures become JSON-RPC errors.
            Err(ToolError::Execution(msg)) | Err(ToolError::RejectedSql(msg)) => Ok(json!({
                "content": [{ "type": "text", "text": msg }],
                "isError": true,
            })),
            Err(ToolError::UnknownTool(name)) => {
                Err((RPC_METHOD_NOT_FOUND, format!("Unknown tool: {name}")))
            }
            Err(ToolError::InvalidArguments(msg)) => Err((RPC_INVALID_PARAMS, msg)),
        }
    }
}

#[async_trait]
impl ProtocolServer for GatewayServer {
    async fn handle_request(&self, request: Value) -> Option<Value> {
        let id = request.get("id").cloned();

        let method = match (
            request.get("jsonrpc").and_then(Value::as_str),
            request.get("method").and_then(Value::as_str),
        ) {
            (Some("2.0"), Some(method)) => method,
            _ => {
                return Some(rpc_error(
                    id.unwrap_or(Value::Null),
                    RPC_PARSE_ERROR,
                    "not a JSON-RPC 2.0 request",
                ))
            }
        };

        // Notifications never produce a response body.
        let Some(id) = id else {
            if method == "notifications/initialized" {
                tracing::debug!(pool_key = %self.pool_key, "client initialized");
            }
            return None;
        };

        if self.closed.load(Ordering::SeqCst) {
            return Some(rpc_error(id, RPC_INTERNAL_ERROR, "server is closed"));
        }

        let params = request.get("params").cloned().unwrap_or(json!({}));

        let result = match method {
            "initialize" => Ok(self.initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tools::definitions() })),
            "tools/call" => self.tools_call(&params).await,
            other => Err((RPC_METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        };

        Some(match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
            Err((code, message)) => rpc_error(id, code, message),
        })
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::GLOBAL_POOL_KEY;
    use crate::test_utils::{database_config, MockDatabase};

    fn limits() -> QueryLimits {
        QueryLimits {
            default_limit: 1000,
            max_limit: 10_000,
        }
    }

    async fn server_with_pool() -> Arc<dyn ProtocolServer> {
        let pools = Arc::new(PoolRegistry::new(Arc::new(MockDatabase::accept_all())));
        pools
            .ensure(GLOBAL_POOL_KEY, &database_config("svc", "secret"))
            .await
            .unwrap();
        GatewayServer::create(pools, GLOBAL_POOL_KEY, limits())
    }

    #[tokio::test]
    async fn initialize_negotiates_protocol() {
        let server = server_with_pool().await;
        let response = server
            .handle_request(json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}))
            .await
            .unwrap();

        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let server = server_with_pool().await;
        let response = server
            .handle_request(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tools_list_names_the_fixed_set() {
        let server = server_with_pool().await;
        let response = server
            .handle_request(json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}))
            .await
            .unwrap();

        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["query", "list_tables", "describe_table"]);
    }

    #[tokio::test]
    async fn tools_call_runs_read_only_sql() {
        let server = server_with_pool().await;
        let response = server
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": { "name": "query", "arguments": { "sql": "SELECT 1 AS ok" } },
                "id": 3,
            }))
            .await
            .unwrap();
        assert_eq!(response["result"]["isError"], false);
    }

    #[tokio::test]
    async fn rejected_sql_is_a_tool_result_not_a_protocol_error() {
        let server = server_with_pool().await;
        let response = server
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": { "name": "query", "arguments": { "sql": "DROP TABLE t" } },
                "id": 4,
            }))
            .await
            .unwrap();
        assert_eq!(response["result"]["isError"], true);
        assert!(response.get("error").is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let server = server_with_pool().await;
        let response = server
            .handle_request(json!({"jsonrpc": "2.0", "method": "resources/list", "id": 5}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], RPC_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_envelope_is_parse_error() {
        let server = server_with_pool().await;
        let response = server.handle_request(json!({"id": 6})).await.unwrap();
        assert_eq!(response["error"]["code"], RPC_PARSE_ERROR);
    }
}
