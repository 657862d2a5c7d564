//! Call-target selection strategies.
//!
//! A call without an explicit target is routed to one handler chosen from
//! the topic's handler list. Selection is pluggable so the policy can be
//! swapped without protocol changes; the wire format never sees it.

use std::sync::atomic::{AtomicUsize, Ordering};

use hubmesh_transport::Cid;
use rand::Rng;

/// Picks one call target from the currently registered handlers.
pub trait SelectStrategy: Send + Sync {
    /// Returns the chosen cid, or `None` when no handler is registered.
    fn pick<'a>(&self, candidates: &'a [Cid]) -> Option<&'a Cid>;
}

/// Uniform random sampling over registered handlers. No fairness guarantee
/// beyond the uniform distribution.
#[derive(Debug, Default)]
pub struct UniformRandom;

impl SelectStrategy for UniformRandom {
    fn pick<'a>(&self, candidates: &'a [Cid]) -> Option<&'a Cid> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(idx)
    }
}

/// Deterministic rotation over handlers, in registration order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectStrategy for RoundRobin {
    fn pick<'a>(&self, candidates: &'a [Cid]) -> Option<&'a Cid> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx)
    }
}
