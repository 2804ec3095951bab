//! fastserve - a demo Fast RPC server.
//!
//! Exposes the canonical demo methods (`date`, `echo`, `sleep`, `words`,
//! `yes`) over TCP. The listen address can be given as the first argument
//! and defaults to 127.0.0.1:2030.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use fast_protocol::{RpcError, DEFAULT_PORT};
use fast_server::{HandlerResult, RequestContext, Server, ServerConfig};

const WORDS: &[&str] = &[
    "aardvark", "bonobo", "caiman", "dugong", "echidna", "fossa", "gharial", "hyrax", "ibex",
    "jerboa",
];

fn closed() -> RpcError {
    RpcError::new("FastError", "connection closed while responding")
}

async fn date_handler(ctx: RequestContext) -> HandlerResult {
    if !ctx.argv().is_empty() {
        return Err(RpcError::new("VError", "expected no arguments"));
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ctx.end_with(json!({
        "timestamp": now.as_millis() as u64,
        "iso8601": chrono::Utc::now().to_rfc3339(),
    }))
    .await
    .map_err(|_| closed())?;
    Ok(())
}

async fn echo_handler(ctx: RequestContext) -> HandlerResult {
    for arg in ctx.argv().to_vec() {
        ctx.write(json!({ "value": arg }))
            .await
            .map_err(|_| closed())?;
    }
    ctx.end().await.map_err(|_| closed())?;
    Ok(())
}

async fn sleep_handler(ctx: RequestContext) -> HandlerResult {
    let ms = ctx
        .argv()
        .first()
        .and_then(|arg| arg.get("ms"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    ctx.end_with(json!({ "ms": ms })).await.map_err(|_| closed())?;
    Ok(())
}

async fn words_handler(ctx: RequestContext) -> HandlerResult {
    for word in WORDS {
        ctx.write(json!(word)).await.map_err(|_| closed())?;
    }
    ctx.end().await.map_err(|_| closed())?;
    Ok(())
}

async fn yes_handler(ctx: RequestContext) -> HandlerResult {
    let arg = match ctx.argv() {
        [arg] => arg.clone(),
        _ => return Err(RpcError::new("VError", "expected one argument")),
    };
    let value = arg.get("value").cloned().unwrap_or(Value::Null);
    let found = arg.get("count").cloned().unwrap_or(Value::Null);
    let count = match found.as_i64() {
        Some(count) if (1..=10240).contains(&count) => count,
        _ => {
            return Err(RpcError::new(
                "VError",
                "count must be an integer in range [1, 10240]",
            )
            .with_info(json!({
                "foundValue": found,
                "minValue": 1,
                "maxValue": 10240,
            })));
        }
    };
    for _ in 0..count {
        ctx.write(json!({ "value": value }))
            .await
            .map_err(|_| closed())?;
    }
    ctx.end().await.map_err(|_| closed())?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT));
    let listener = TcpListener::bind(&addr).await?;

    let server = Arc::new(Server::new(ServerConfig::default()));
    server.register_rpc_method("date", date_handler)?;
    server.register_rpc_method("echo", echo_handler)?;
    server.register_rpc_method("sleep", sleep_handler)?;
    server.register_rpc_method("words", words_handler)?;
    server.register_rpc_method("yes", yes_handler)?;

    tracing::info!("listening for fast requests on {}", addr);

    // Drain gracefully on ctrl-c.
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal, draining");
        shutdown_server.close();
    });

    server.run(listener).await?;
    server.conns_destroyed().await;

    tracing::info!("server stopped");
    Ok(())
}
