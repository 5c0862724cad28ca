//! Backend component links for the connection manager.
//!
//! The manager talks to the XMPP server over a small pool of component
//! connections. Each connection authenticates with the shared-secret
//! handshake, carries session management iqs and routed stanzas towards the
//! server, and reads routed stanzas, close requests and policy pushes back.
//!
//! ```text
//!              ┌──────────── BackendPool ────────────┐
//! sessions ──▶ │ TaskQueue ──▶ worker 1 ──▶ writer ──┼──▶ server
//!              │           └─▶ worker N ──▶ writer ──┼──▶
//!              │                                     │
//! sessions ◀── │ InboundRouter ◀── reader ◀──────────┼─── server
//!              └─────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod failure_tracker;
pub mod handshake;
pub mod inbound;
pub mod keepalive;
pub mod pool;
pub mod queue;
pub mod tasks;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types
pub use error::PoolError;
pub use failure_tracker::ConstructionFailureTracker;
pub use handshake::{handshake_digest, negotiate, BackendConnector, BackendEndpoint, BackendStream, XmppConnector};
pub use inbound::{run_reader, BackendControl, InboundRouter, RouterContext};
pub use keepalive::{send_heartbeats, DEFAULT_HEARTBEAT_INTERVAL, HEARTBEAT};
pub use pool::{BackendPool, PoolSettings, ShutdownMode};
pub use tasks::BackendTask;
pub use worker::{worker_name, WorkerHandle};
