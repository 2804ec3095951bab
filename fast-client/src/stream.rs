//! Result streams for in-flight RPCs.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Events delivered from the connection's read loop to a result stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// One data item emitted by the peer.
    Item(Value),
    /// Successful completion.
    End,
    /// Failed completion; exactly one per stream.
    Error(ClientError),
}

/// The lazy, finite response stream of one RPC.
///
/// Yields zero or more data items in the order the peer emitted them, then
/// terminates exactly once: `next` returns `None` after a successful END,
/// or `Some(Err(_))` exactly once (followed by `None`) on failure.
pub struct ResultStream {
    rx: mpsc::Receiver<StreamEvent>,
    done: bool,
}

impl ResultStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx, done: false }
    }

    /// Waits for the next data item or the terminator.
    pub async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Item(value)) => Some(Ok(value)),
            Some(StreamEvent::End) => {
                self.done = true;
                None
            }
            Some(StreamEvent::Error(err)) => {
                self.done = true;
                Some(Err(err))
            }
            // The sender vanished without a terminator; surface it as a
            // connection-level failure rather than silently ending.
            None => {
                self.done = true;
                Some(Err(ClientError::ConnectionError(
                    "request abandoned without a terminator".to_string(),
                )))
            }
        }
    }

    /// Buffers the remaining items, returning them all on success or the
    /// stream's error.
    pub async fn collect(mut self) -> Result<Vec<Value>, ClientError> {
        let mut items = Vec::new();
        while let Some(next) = self.next().await {
            items.push(next?);
        }
        Ok(items)
    }
}
