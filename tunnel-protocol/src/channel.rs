//! # Control Channel Transport
//!
//! The outbound half of an edge ↔ agent control channel. Any task can queue
//! a message through a cloned [`ControlSender`]; a single writer task drains
//! the queue in FIFO order, serializes each message and writes it to the
//! socket as a text frame.
//!
//! ## Guarantees
//! - Messages are written in the order they were accepted by the queue, so
//!   a task that sends all messages of one stream keeps that stream ordered.
//! - The queue is bounded: `send` waits while the writer is behind.
//! - After the channel closes every `send` fails with [`ChannelClosed`].
//!
//! The inbound half stays with each side's receive loop, which decodes
//! frames with [`crate::decode`] and dispatches on the message variant.

use std::fmt::Display;
use std::time::Duration;

use futures::{Sink, SinkExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Outbound messages buffered per connection before senders wait.
pub const CONTROL_CHANNEL_CAPACITY: usize = 256;

/// How long [`ControlChannel::close`] waits for queued messages to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// The control channel no longer accepts messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("control channel closed")]
pub struct ChannelClosed;

/// Cloneable handle for queueing outbound messages.
#[derive(Debug)]
pub struct ControlSender<M> {
    tx: mpsc::Sender<M>,
}

impl<M> Clone for ControlSender<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M> ControlSender<M> {
    /// Queues one message, waiting for capacity if the writer is behind.
    pub async fn send(&self, message: M) -> Result<(), ChannelClosed> {
        self.tx.send(message).await.map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates a bare sender/queue pair. [`ControlChannel::spawn`] attaches a
/// writer to the queue; tests can read the queue directly.
pub fn control_channel<M>(capacity: usize) -> (ControlSender<M>, mpsc::Receiver<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ControlSender { tx }, rx)
}

/// One side's outbound control channel: the sender handle plus the writer
/// task that owns the socket sink.
pub struct ControlChannel<M> {
    sender: ControlSender<M>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
}

impl<M> ControlChannel<M>
where
    M: Serialize + Send + 'static,
{
    /// Starts the writer task over `sink`.
    ///
    /// `to_frame` wraps a serialized message into the socket's text frame
    /// type; `close_frame` is written once the channel shuts down.
    pub fn spawn<S, T>(sink: S, to_frame: fn(String) -> T, close_frame: T) -> Self
    where
        S: Sink<T> + Unpin + Send + 'static,
        S::Error: Display,
        T: Send + 'static,
    {
        let (sender, rx) = control_channel(CONTROL_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let writer = tokio::spawn(run_writer(rx, sink, shutdown_rx, to_frame, close_frame));
        Self {
            sender,
            shutdown: Some(shutdown),
            writer,
        }
    }

    pub fn sender(&self) -> ControlSender<M> {
        self.sender.clone()
    }

    /// Stops accepting messages, flushes what is already queued and closes
    /// the socket.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut self.writer).await.is_err() {
            warn!("Control channel writer did not flush in time");
            self.writer.abort();
        }
    }
}

async fn run_writer<M, S, T>(
    mut rx: mpsc::Receiver<M>,
    mut sink: S,
    mut shutdown: oneshot::Receiver<()>,
    to_frame: fn(String) -> T,
    close_frame: T,
) where
    M: Serialize,
    S: Sink<T> + Unpin,
    S::Error: Display,
{
    let mut draining = false;
    loop {
        let next = if draining {
            rx.recv().await
        } else {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    // Refuse new messages but still deliver the queued ones.
                    draining = true;
                    rx.close();
                    continue;
                }
                message = rx.recv() => message,
            }
        };
        let Some(message) = next else { break };

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("Serialize error: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(to_frame(text)).await {
            debug!("Control socket write failed: {}", e);
            return;
        }
    }

    let _ = sink.send(close_frame).await;
    let _ = sink.close().await;
}
