//! Per-stream chunk queues.
//!
//! Every HTTP body and WebSocket relay crossing the tunnel is bridged through
//! one of these queues, keyed by stream id in the owning side's tables.
//! Closing is implicit: once the last [`StreamSender`] is dropped the
//! receiver yields the buffered chunks and then ends. [`StreamSender::abort`]
//! ends the stream with an error instead, which aborts the HTTP body built
//! on top of it.
//!
//! Queues are unbounded and delivery never waits. The receive loop of a
//! control channel feeds every stream of its connection, so a consumer that
//! stops reading only grows its own queue and never stalls the other ids.

use std::io;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// The consuming side of a stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream closed")]
pub struct StreamClosed;

/// Producing half of a stream, held in the id-keyed tables of a session.
/// Cloning it does not keep the stream open past [`StreamSender::abort`].
#[derive(Debug)]
pub struct StreamSender<T> {
    tx: mpsc::UnboundedSender<io::Result<T>>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// Consuming half of a stream: an HTTP body or a relay's frame source.
#[derive(Debug)]
pub struct StreamReceiver<T> {
    rx: mpsc::UnboundedReceiver<io::Result<T>>,
}

/// Creates a connected sender/receiver pair for one stream id.
pub fn stream_channel<T>() -> (StreamSender<T>, StreamReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSender { tx }, StreamReceiver { rx })
}

impl<T> StreamSender<T> {
    /// Queues one item. Fails once the receiver is dropped.
    pub fn send(&self, item: T) -> Result<(), StreamClosed> {
        self.tx.send(Ok(item)).map_err(|_| StreamClosed)
    }

    /// Ends the stream with an error carrying `reason`.
    pub fn abort(self, reason: impl Into<String>) {
        let error = io::Error::new(io::ErrorKind::ConnectionAborted, reason.into());
        let _ = self.tx.send(Err(error));
    }
}

impl<T> StreamReceiver<T> {
    pub async fn recv(&mut self) -> Option<io::Result<T>> {
        self.rx.recv().await
    }

    /// Adapts the queue into a `Stream`, suitable as an HTTP body.
    pub fn into_stream(self) -> UnboundedReceiverStream<io::Result<T>> {
        UnboundedReceiverStream::new(self.rx)
    }
}
