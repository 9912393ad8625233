//! Line-oriented single-client transport
//!
//! Reads one JSON-RPC envelope per line on stdin and writes one response
//! per line on stdout, driving the same [`GatewayServer`] as the network
//! transport over the shared global pool. Logs go to stderr so they
//! cannot corrupt the protocol stream.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::db::GLOBAL_POOL_KEY;
use crate::error::{rpc_error, RPC_PARSE_ERROR};
use crate::mcp::GatewayServer;
use crate::AppState;

pub async fn run(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    state
        .pools
        .ensure(GLOBAL_POOL_KEY, &state.config.database)
        .await?;
    let server = GatewayServer::create(
        state.pools.clone(),
        GLOBAL_POOL_KEY,
        state.config.query_limits,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    tracing::info!("stdio transport ready");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<Value>(line) {
                    Ok(request) => server.handle_request(request).await,
                    Err(_) => Some(rpc_error(Value::Null, RPC_PARSE_ERROR, "Parse error")),
                };

                if let Some(response) = response {
                    let mut out = serde_json::to_vec(&response)?;
                    out.push(b'\n');
                    stdout.write_all(&out).await?;
                    stdout.flush().await?;
                }
            }
        }
    }

    if let Err(e) = server.close().await {
        tracing::warn!(error = %e, "error closing stdio server");
    }
    Ok(())
}
