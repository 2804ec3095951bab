//! Connection management and request multiplexing.
//!
//! One `Connection` owns one full-duplex byte transport. Requests are
//! submitted from any task; a background read loop decodes inbound
//! messages and routes them to the pending request with the matching id.
//! Responses may interleave freely across requests; within one request,
//! items are delivered in the order the peer emitted them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fast_protocol::{
    Message, MessageDecoder, MessageIdAllocator, MessageStatus, RpcError,
};

use crate::error::ClientError;
use crate::stream::{ResultStream, StreamEvent};

/// A full-duplex byte channel the client can run over. Blanket-implemented
/// for anything readable and writable; framing only assumes in-order
/// delivery.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Default bound on the recent-request history.
pub const DEFAULT_RECENT_REQUESTS: usize = 128;

/// Per-request item channel capacity. A consumer that stops pulling its
/// stream eventually fills this and pauses the connection's reads.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Read buffer size for socket reads (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How many completed requests to keep in the introspection history.
    pub n_recent_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            n_recent_requests: DEFAULT_RECENT_REQUESTS,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RpcOptions {
    /// Wall-clock limit for the whole request, measured from submission.
    pub timeout: Option<Duration>,
    /// Silently drop null items inside streamed data arrays.
    pub ignore_null_values: bool,
}

impl RpcOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ignore_null_values(mut self) -> Self {
        self.ignore_null_values = true;
        self
    }
}

/// How a finished request ended, for the introspection history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    Failed,
}

/// One entry in the recent-request history.
#[derive(Debug, Clone)]
pub struct RecentRequest {
    pub id: u32,
    pub method: String,
    pub outcome: RequestOutcome,
    pub elapsed: Duration,
}

struct LiveRequest {
    method: String,
    tx: mpsc::Sender<StreamEvent>,
    ignore_null_values: bool,
    started: Instant,
    /// Guards the timeout timer against acting on a reallocated id.
    generation: u64,
}

enum Pending {
    Live(LiveRequest),
    /// The caller already saw a timeout error, but the id stays claimed
    /// until a genuine terminator arrives so a reallocated id cannot be
    /// mis-routed. Inbound data for the id is discarded meanwhile.
    TimedOut,
}

/// A multiplexed client connection.
pub struct Connection {
    writer: tokio::sync::Mutex<Option<WriteHalf<Box<dyn Transport>>>>,
    ids: Mutex<MessageIdAllocator>,
    pending: Mutex<HashMap<u32, Pending>>,
    recent: Mutex<VecDeque<RecentRequest>>,
    n_recent: usize,
    generation: AtomicU64,
    detached: AtomicBool,
    closed: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl Connection {
    /// Wraps a transport and spawns the background read loop.
    pub fn spawn(transport: Box<dyn Transport>, config: ClientConfig) -> (Arc<Self>, JoinHandle<()>) {
        let (reader, writer) = tokio::io::split(transport);
        let conn = Arc::new(Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            ids: Mutex::new(MessageIdAllocator::new()),
            pending: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
            n_recent: config.n_recent_requests,
            generation: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        let read_conn = conn.clone();
        let task = tokio::spawn(async move {
            read_conn.read_loop(reader).await;
        });

        (conn, task)
    }

    /// Submits an RPC and returns its lazy result stream.
    pub async fn rpc(
        self: &Arc<Self>,
        method: &str,
        args: Vec<Value>,
        opts: RpcOptions,
    ) -> Result<ResultStream, ClientError> {
        if let Some(reason) = self.fatal.lock().clone() {
            return Err(ClientError::ConnectionError(reason));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }
        if self.detached.load(Ordering::SeqCst) {
            return Err(ClientError::Detached);
        }

        let id = self
            .ids
            .lock()
            .alloc()
            .ok_or(ClientError::IdSpaceExhausted)?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.pending.lock().insert(
            id,
            Pending::Live(LiveRequest {
                method: method.to_string(),
                tx,
                ignore_null_values: opts.ignore_null_values,
                started: Instant::now(),
                generation,
            }),
        );

        let request = Message::request(id, method, args);
        let encoded = match request.encode() {
            Ok(buf) => buf,
            Err(e) => {
                self.abandon(id);
                return Err(e.into());
            }
        };

        tracing::debug!("sending request {} ({}, {} bytes)", id, method, encoded.len());
        {
            let mut writer_guard = self.writer.lock().await;
            let writer = match writer_guard.as_mut() {
                Some(writer) => writer,
                None => {
                    self.abandon(id);
                    return Err(ClientError::ConnectionClosed);
                }
            };
            if let Err(e) = writer.write_all(&encoded).await {
                self.abandon(id);
                return Err(ClientError::Io(e));
            }
        }

        if let Some(timeout) = opts.timeout {
            self.arm_timeout(id, generation, timeout);
        }

        Ok(ResultStream::new(rx))
    }

    /// Stops response delivery without closing the transport. Every live
    /// request fails with `Detached`.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("detaching from transport");
        self.terminate_pending(|| ClientError::Detached);
    }

    /// Closes the transport. Every live request fails with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing connection");
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.terminate_pending(|| ClientError::ConnectionClosed);
    }

    /// Number of live (submitted, not yet terminated) requests.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|entry| matches!(entry, Pending::Live(_)))
            .count()
    }

    /// Number of message ids currently claimed, including ids held for
    /// timed-out requests awaiting their real terminator.
    pub fn claimed_ids(&self) -> usize {
        self.ids.lock().live_count()
    }

    /// Recently completed requests, most recent last.
    pub fn recent_requests(&self) -> Vec<RecentRequest> {
        self.recent.lock().iter().cloned().collect()
    }

    /// The fatal protocol error that killed this connection, if any. A
    /// connection with a fatal error is unusable.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Removes a request that never made it onto the wire.
    fn abandon(&self, id: u32) {
        self.pending.lock().remove(&id);
        self.ids.lock().release(id);
    }

    fn arm_timeout(self: &Arc<Self>, id: u32, generation: u64, timeout: Duration) {
        let conn = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            conn.expire(id, generation);
        });
    }

    /// Fails a request whose timer fired. The pending entry becomes a
    /// tombstone and the id stays claimed until a real terminator arrives.
    fn expire(&self, id: u32, generation: u64) {
        let expired = {
            let mut pending = self.pending.lock();
            match pending.remove(&id) {
                Some(Pending::Live(live)) if live.generation == generation => {
                    pending.insert(id, Pending::TimedOut);
                    Some(live)
                }
                Some(entry) => {
                    // The id now belongs to a different request; leave it.
                    pending.insert(id, entry);
                    None
                }
                None => None,
            }
        };

        if let Some(live) = expired {
            tracing::debug!("request {} ({}) timed out", id, live.method);
            self.record_recent(id, &live.method, RequestOutcome::Failed, live.started);
            let _ = live.tx.try_send(StreamEvent::Error(ClientError::Timeout));
        }
    }

    fn record_recent(&self, id: u32, method: &str, outcome: RequestOutcome, started: Instant) {
        let mut recent = self.recent.lock();
        recent.push_back(RecentRequest {
            id,
            method: method.to_string(),
            outcome,
            elapsed: started.elapsed(),
        });
        while recent.len() > self.n_recent {
            recent.pop_front();
        }
    }

    /// Fails every live request and releases every claimed id.
    fn terminate_pending(&self, make_error: impl Fn() -> ClientError) {
        let entries: Vec<(u32, Pending)> = self.pending.lock().drain().collect();
        {
            let mut ids = self.ids.lock();
            for (id, _) in &entries {
                ids.release(*id);
            }
        }
        for (id, entry) in entries {
            if let Pending::Live(live) = entry {
                self.record_recent(id, &live.method, RequestOutcome::Failed, live.started);
                let _ = live.tx.try_send(StreamEvent::Error(make_error()));
            }
        }
    }

    /// Records a fatal protocol violation and fails everything in flight.
    fn fail_connection(&self, reason: String) {
        tracing::error!("fatal connection error: {}", reason);
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(reason.clone());
            }
        }
        self.terminate_pending(|| ClientError::ConnectionError(reason.clone()));
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<Box<dyn Transport>>) {
        let mut decoder = MessageDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    match decoder.finish() {
                        Ok(()) => {
                            tracing::debug!("peer closed the connection");
                            self.closed.store(true, Ordering::SeqCst);
                            self.terminate_pending(|| ClientError::ConnectionClosed);
                        }
                        Err(e) => self.fail_connection(e.to_string()),
                    }
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        self.fail_connection(format!("read failed: {}", e));
                    }
                    return;
                }
            };

            decoder.extend(&buf[..n]);
            loop {
                match decoder.decode_message() {
                    Ok(Some(message)) => {
                        if let Err(reason) = self.route_message(message).await {
                            self.fail_connection(reason);
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail_connection(e.to_string());
                        return;
                    }
                }
            }
        }
    }

    /// Routes one inbound message to its request. An `Err` is a protocol
    /// violation that kills the connection.
    async fn route_message(&self, message: Message) -> Result<(), String> {
        if self.detached.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let id = message.id;
        enum Route {
            Deliver {
                tx: mpsc::Sender<StreamEvent>,
                ignore_null_values: bool,
            },
            Terminate(LiveRequest),
            Discard,
        }

        let route = {
            let mut pending = self.pending.lock();
            match pending.remove(&id) {
                None => {
                    return Err(format!(
                        "received {:?} message for unknown request id {}",
                        message.status, id
                    ));
                }
                Some(Pending::TimedOut) => {
                    if message.status.is_terminator() {
                        self.ids.lock().release(id);
                        tracing::debug!("late terminator for timed-out request {}", id);
                    } else {
                        pending.insert(id, Pending::TimedOut);
                    }
                    Route::Discard
                }
                Some(Pending::Live(live)) => {
                    if message.status.is_terminator() {
                        // Release before the caller can observe the
                        // terminator, so the id is reusable by then.
                        self.ids.lock().release(id);
                        Route::Terminate(live)
                    } else {
                        let tx = live.tx.clone();
                        let ignore_null_values = live.ignore_null_values;
                        pending.insert(id, Pending::Live(live));
                        Route::Deliver {
                            tx,
                            ignore_null_values,
                        }
                    }
                }
            }
        };

        match route {
            Route::Discard => {}
            Route::Deliver {
                tx,
                ignore_null_values,
            } => {
                for item in message.items() {
                    if ignore_null_values && item.is_null() {
                        continue;
                    }
                    // A full channel suspends here, pausing further reads
                    // until the consumer drains its stream.
                    if tx.send(StreamEvent::Item(item.clone())).await.is_err() {
                        break;
                    }
                }
            }
            Route::Terminate(live) => match message.status {
                MessageStatus::End => {
                    self.record_recent(id, &live.method, RequestOutcome::Completed, live.started);
                    for item in message.items() {
                        if live.ignore_null_values && item.is_null() {
                            continue;
                        }
                        if live.tx.send(StreamEvent::Item(item.clone())).await.is_err() {
                            break;
                        }
                    }
                    let _ = live.tx.send(StreamEvent::End).await;
                }
                MessageStatus::Error => {
                    self.record_recent(id, &live.method, RequestOutcome::Failed, live.started);
                    let err = RpcError::from_value(&message.data.d);
                    let _ = live.tx.send(StreamEvent::Error(err.into())).await;
                }
                MessageStatus::Data => unreachable!("terminators only"),
            },
        }

        Ok(())
    }
}
