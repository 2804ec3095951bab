//! RPC method registry and request contexts.
//!
//! A handler is an async function given a [`RequestContext`]. It reads its
//! arguments from `argv()`, streams zero or more values with `write`, and
//! finishes with `end` (success) or `fail` (error). Returning `Err` from
//! the handler before terminating also fails the request; the dispatcher
//! guarantees that every request gets exactly one terminator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use fast_protocol::{Message, RpcError};

use crate::error::ServerError;

/// Result type for handler functions.
pub type HandlerResult = Result<(), RpcError>;

/// Boxed future returned by handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An RPC method handler.
pub trait RpcHandler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext) -> BoxFuture<HandlerResult>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<HandlerResult> {
        Box::pin((self)(ctx))
    }
}

/// Registry mapping method names to handlers. Written during startup,
/// read-only once the server is dispatching.
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn RpcHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Registers a handler under a method name. Re-registering a name is an
    /// error.
    pub fn register(&mut self, name: &str, handler: impl RpcHandler) -> Result<(), ServerError> {
        if self.methods.contains_key(name) {
            return Err(ServerError::DuplicateMethod(name.to_string()));
        }
        self.methods.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ContextInner {
    id: u32,
    method: String,
    args: Vec<Value>,
    outbound: mpsc::Sender<Message>,
    /// Locked across the completion check and the enqueue, so a racing
    /// write can never land after the terminator on the wire.
    terminated: tokio::sync::Mutex<bool>,
    ended: AtomicBool,
}

/// Context passed to request handlers.
///
/// Cheaply cloneable; a handler may hand clones to tasks it spawns. All
/// response methods serialize through the connection's outbound queue, and
/// suspend while that queue is full, which is how streaming handlers pace
/// themselves against a slow client.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub(crate) fn new(
        id: u32,
        method: String,
        args: Vec<Value>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                method,
                args,
                outbound,
                terminated: tokio::sync::Mutex::new(false),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// The argument array from the request. Always present, possibly empty.
    pub fn argv(&self) -> &[Value] {
        &self.inner.args
    }

    /// Whether a terminator has already been sent for this request.
    pub fn ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Enqueues one data item on the response stream.
    pub async fn write(&self, item: Value) -> Result<(), ServerError> {
        let guard = self.inner.terminated.lock().await;
        if *guard {
            tracing::warn!(
                "write on completed request {} ({}) ignored",
                self.inner.id,
                self.inner.method
            );
            return Ok(());
        }
        let message = Message::data_items(self.inner.id, self.inner.method.as_str(), vec![item]);
        self.send(message).await
    }

    /// Terminates the request successfully.
    pub async fn end(&self) -> Result<(), ServerError> {
        self.terminate(Message::end(self.inner.id, self.inner.method.as_str()), "end")
            .await
    }

    /// Terminates the request successfully, delivering one final item.
    pub async fn end_with(&self, item: Value) -> Result<(), ServerError> {
        self.terminate(
            Message::end_with(self.inner.id, self.inner.method.as_str(), item),
            "end",
        )
        .await
    }

    /// Terminates the request with an error.
    pub async fn fail(&self, err: RpcError) -> Result<(), ServerError> {
        self.terminate(
            Message::error(self.inner.id, self.inner.method.as_str(), &err),
            "fail",
        )
        .await
    }

    async fn terminate(&self, message: Message, what: &str) -> Result<(), ServerError> {
        let mut guard = self.inner.terminated.lock().await;
        if *guard {
            tracing::warn!(
                "{} on completed request {} ({}) ignored",
                what,
                self.inner.id,
                self.inner.method
            );
            return Ok(());
        }
        *guard = true;
        self.inner.ended.store(true, Ordering::SeqCst);
        self.send(message).await
    }

    async fn send(&self, message: Message) -> Result<(), ServerError> {
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| ServerError::ConnectionClosed)
    }
}
