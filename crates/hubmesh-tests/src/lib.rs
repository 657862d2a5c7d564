//! Hubmesh end-to-end test infrastructure.
//!
//! Spins up real brokers on ephemeral ports with fast timers and connects
//! real nodes to them, so routing, discovery, eviction, and link-recovery
//! behavior is exercised over actual sockets.

pub mod harness;

pub use harness::{fast_broker_config, fast_node_config, init_logging, wait_for, TestCluster};

#[cfg(test)]
mod broker_routing_tests;
