#![warn(missing_docs)]

//! Hubmesh broker: the routing core every hub, org, and app service talks
//! through. Maintains the subscription and handler registries, forwards
//! publications, load-balances calls, tracks in-flight calls for reply
//! routing, evicts silent peers, and garbage-collects ephemeral topics.

pub mod broker;
pub mod config;
pub mod select;
pub mod stats;

pub use broker::{Broker, RunningBroker};
pub use config::BrokerConfig;
pub use select::{RoundRobin, SelectStrategy, UniformRandom};
pub use stats::TrafficStats;
