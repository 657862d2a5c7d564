//! Per-socket serialized send queue.
//!
//! Multi-part frames must never interleave on a socket, so every socket
//! gets exactly one writer task. `send` enqueues and returns immediately;
//! the writer drains the queue in FIFO order with at most one write in
//! flight. A failed write is logged and does not stop later writes.
//!
//! The queue is unbounded: callers are never backpressured, matching the
//! fire-and-forget contract of the node API. Depth is observable via
//! [`SendQueue::depth`] for diagnostics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::frame::Frame;

/// Handle to a socket's writer task. Cheap to clone; all clones feed the
/// same queue. The writer task exits when every clone is dropped.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    depth: Arc<AtomicUsize>,
}

impl SendQueue {
    /// Spawns the writer task for `writer` and returns the queue handle.
    pub fn new<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let depth = Arc::new(AtomicUsize::new(0));
        let task_depth = depth.clone();
        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(error) = write_one(&mut writer, &buf).await {
                    warn!(
                        %error,
                        queued = task_depth.load(Ordering::Relaxed),
                        "queued write failed"
                    );
                }
                task_depth.fetch_sub(1, Ordering::Relaxed);
            }
        });
        Self { tx, depth }
    }

    /// Encodes `frame` and enqueues it. Returns immediately.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.send_bytes(frame.encode()?)
    }

    /// Enqueues an already-encoded frame.
    pub fn send_bytes(&self, buf: Bytes) -> Result<()> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(buf).is_err() {
            // writer task is gone; the link is down
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(crate::error::TransportError::NotConnected);
        }
        Ok(())
    }

    /// Number of writes waiting in the queue.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

async fn write_one<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}
