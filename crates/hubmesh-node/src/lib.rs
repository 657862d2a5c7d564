#![warn(missing_docs)]

//! Hubmesh node: the client-side abstraction over the broker protocol.
//!
//! Every service in the hub (the hub itself, each org, each app) owns one
//! [`Node`] and talks to every other service through it: `publish` /
//! `subscribe` for fan-out events, `call` / `handle` for request-reply,
//! `send` for directed fire-and-forget messages, and `locate` for
//! discovery. The node also watches broker liveness and transparently
//! replays its registrations when the broker comes back.

pub mod config;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{CallHandler, Located, Node};
