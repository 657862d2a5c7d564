#![warn(missing_docs)]

//! Hubmesh transport subsystem: framed JSON wire protocol, serialized send
//! queue, and the router/dealer style server and client sockets the broker
//! and nodes are built on.

pub mod client;
pub mod error;
pub mod frame;
pub mod sendq;
pub mod server;
pub mod topic;

pub use client::{Client, ClientConfig};
pub use error::{Result, TransportError};
pub use frame::{Cid, Frame, Mid, SubOpts};
pub use sendq::SendQueue;
pub use server::{FrameHandler, Server, ServerConfig, ServerHandle};
