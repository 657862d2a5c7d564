//! Per-interval traffic counters.

/// Counters accumulated between stats reports. Logged and reset on each
/// report tick when any counter is non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Publications routed.
    pub pubs: u64,
    /// Subscriptions registered.
    pub subs: u64,
    /// Publications on ephemeral topics.
    pub epubs: u64,
    /// Subscriptions to ephemeral topics.
    pub esubs: u64,
    /// Ephemeral topics expired by GC.
    pub etimo: u64,
    /// Call handlers registered.
    pub hands: u64,
    /// Calls routed to a handler.
    pub calls: u64,
    /// Replies routed back to callers.
    pub repls: u64,
    /// Error frames forwarded.
    pub errs: u64,
    /// Calls that could not be delivered to any handler.
    pub deads: u64,
}

impl TrafficStats {
    /// True when every counter is zero.
    pub fn is_empty(&self) -> bool {
        *self == TrafficStats::default()
    }

    /// Returns the current counters and resets them.
    pub fn take(&mut self) -> TrafficStats {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets_counters() {
        let mut stats = TrafficStats {
            pubs: 3,
            calls: 1,
            ..Default::default()
        };
        assert!(!stats.is_empty());
        let snap = stats.take();
        assert_eq!(snap.pubs, 3);
        assert_eq!(snap.calls, 1);
        assert!(stats.is_empty());
    }
}
