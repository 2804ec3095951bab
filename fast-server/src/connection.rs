//! Per-connection message dispatch.
//!
//! One task owns each connection: it decodes inbound frames, tracks the
//! in-flight request map, spawns handler tasks, and drains the outbound
//! queue onto the socket. Handlers run concurrently, but every mutation of
//! per-connection state happens on the connection task, and no two inbound
//! messages for one connection are ever processed concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc};

use fast_protocol::{Message, MessageDecoder, MessageStatus, RpcError};

use crate::error::ServerError;
use crate::handler::{MethodRegistry, RequestContext, RpcHandler};
use crate::server::{ServerStats, Transport};

/// Read buffer size for socket reads (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Outbound queue capacity. Streaming handlers suspend on a full queue
/// until the drain catches up, pacing them against the socket.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub(crate) async fn handle_connection<S: Transport>(
    stream: S,
    peer: String,
    registry: Arc<RwLock<MethodRegistry>>,
    stats: Arc<ServerStats>,
    draining: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::info!("[{}] client connected", peer);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    // Handlers enqueue responses here; only this task writes the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);

    // In-flight requests on this connection: id -> method name.
    let mut requests: HashMap<u32, String> = HashMap::new();
    let mut shutdown_seen = false;

    loop {
        tokio::select! {
            biased;

            // Flush handler output before reading more requests.
            Some(message) = outbound_rx.recv() => {
                let id = message.id;
                let is_terminator = message.status.is_terminator();
                write_message(&mut writer, &message).await?;
                if is_terminator {
                    if let Some(method) = requests.remove(&id) {
                        tracing::debug!("[{}] request {} ({}) complete", peer, id, method);
                    }
                    if draining.load(Ordering::SeqCst) && requests.is_empty() {
                        tracing::debug!("[{}] drained, closing connection", peer);
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                }
            }

            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        decoder.finish()?;
                        tracing::debug!("[{}] connection closed by client", peer);
                        return Ok(());
                    }
                    Ok(n) => decoder.extend(&buf[..n]),
                    Err(e) => return Err(ServerError::Io(e)),
                }
                while let Some(message) = decoder.decode_message()? {
                    dispatch_message(
                        message,
                        &peer,
                        &registry,
                        &stats,
                        &draining,
                        &outbound_tx,
                        &mut requests,
                        &mut writer,
                    )
                    .await?;
                }
            }

            _ = shutdown.recv(), if !shutdown_seen => {
                shutdown_seen = true;
                if requests.is_empty() {
                    tracing::debug!("[{}] shutting down with no requests in flight", peer);
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                tracing::debug!(
                    "[{}] shutdown received, draining {} in-flight requests",
                    peer,
                    requests.len()
                );
            }
        }
    }
}

/// Routes one inbound message. `Err` means the client violated the
/// protocol and the connection must die.
#[allow(clippy::too_many_arguments)]
async fn dispatch_message<S: Transport>(
    message: Message,
    peer: &str,
    registry: &RwLock<MethodRegistry>,
    stats: &ServerStats,
    draining: &AtomicBool,
    outbound: &mpsc::Sender<Message>,
    requests: &mut HashMap<u32, String>,
    writer: &mut WriteHalf<S>,
) -> Result<(), ServerError> {
    if message.status != MessageStatus::Data {
        return Err(ServerError::UnexpectedTerminator(message.status));
    }

    let id = message.id;
    if requests.contains_key(&id) {
        return Err(ServerError::DuplicateRequestId(id));
    }

    let method = message.data.m.name.clone();
    stats.requests_total.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("[{}] request {} ({})", peer, id, method);

    if draining.load(Ordering::SeqCst) {
        let err = RpcError::new("ServerClosingError", "server is shutting down");
        return write_message(writer, &Message::error(id, method.as_str(), &err)).await;
    }

    let handler = registry.read().get(&method);
    let handler = match handler {
        Some(handler) => handler,
        None => {
            tracing::warn!("[{}] unsupported RPC method \"{}\"", peer, method);
            let err = RpcError::new(
                "UnsupportedMethodError",
                format!("unsupported RPC method: \"{}\"", method),
            );
            return write_message(writer, &Message::error(id, method.as_str(), &err)).await;
        }
    };

    requests.insert(id, method.clone());
    let ctx = RequestContext::new(id, method, message.items().to_vec(), outbound.clone());
    tokio::spawn(run_handler(handler, ctx));
    Ok(())
}

/// Drives one handler invocation and enforces the terminator contract.
async fn run_handler(handler: Arc<dyn RpcHandler>, ctx: RequestContext) {
    match handler.call(ctx.clone()).await {
        Ok(()) => {
            if !ctx.ended() {
                tracing::warn!(
                    "handler for \"{}\" returned without completing request {}",
                    ctx.method(),
                    ctx.id()
                );
                let err = RpcError::new(
                    "FastError",
                    "handler returned without completing the request",
                );
                let _ = ctx.fail(err).await;
            }
        }
        Err(err) => {
            let _ = ctx.fail(err).await;
        }
    }
}

async fn write_message<S: Transport>(
    writer: &mut WriteHalf<S>,
    message: &Message,
) -> Result<(), ServerError> {
    let encoded = message.encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
