//! Node-level error taxonomy.

use std::time::Duration;

use hubmesh_transport::TransportError;
use thiserror::Error;

/// Errors surfaced through the node API.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The broker link is down; pending calls and locates are rejected
    /// with this rather than left hanging.
    #[error("broker link is down")]
    LinkDown,

    /// An `err` frame came back for this call: the remote handler failed
    /// or the call target was a dead endpoint.
    #[error("remote error: {0}")]
    Remote(String),

    /// A local per-call deadline elapsed before any reply arrived.
    #[error("call deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Transport failure underneath the node.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl NodeError {
    /// True when the error marks the call target unreachable.
    pub fn is_dead_endpoint(&self) -> bool {
        matches!(self, NodeError::Remote(msg) if msg.starts_with("dead endpoint"))
    }
}

/// Result alias used throughout the node crate.
pub type Result<T> = std::result::Result<T, NodeError>;
