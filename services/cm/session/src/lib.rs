//! Client sessions for the connection manager.
//!
//! This crate owns everything on the client side of the multiplexer: the
//! session record and its registry, the stream negotiation state machine that
//! drives a socket client through TLS, SASL and compression, the HTTP-binding
//! long-poll engine, and the [`BackendLink`] seam through which sessions reach
//! the backend pool.
//!
//! ## Session lifecycle
//!
//! ```text
//! stream open ──> register (unique id) ──> notify_session_created
//!      │
//!      ├─ SASL success ──> Authenticated
//!      │
//!      └─ close (client, backend, idle, shutdown)
//!             ──> fail queued output back ──> unregister ──> notify_session_closed
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod client;
pub mod connection;
pub mod context;
pub mod error;
pub mod features;
pub mod httpbind;
pub mod id;
pub mod policy;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use backend::{classify_undeliverable, escalate_undeliverable, BackendLink, Undeliverable};
pub use client::{ClientConnection, ClientHandler, Flow, ProtocolState, DEFAULT_LANGUAGE};
pub use connection::{run_client, serve_clients, SocketConnection};
pub use context::{ClientSettings, MultiplexerContext};
pub use error::{BoshError, SessionError};
pub use features::{stream_features, COMPRESSION_METHOD};
pub use httpbind::{BoshManager, BoshSession, BoshSettings};
pub use id::StreamIdFactory;
pub use policy::{ClientPolicy, CompressionPolicy, PolicyCache, TlsPolicy};
pub use registry::SessionRegistry;
pub use session::{ClientOutbound, SaslVerdict, Session, SessionStatus, Transport};
pub use transport::{
    connect_tcp, listen_tcp, AsyncStream, IoStream, PlainTransport, StreamUpgrader,
};

#[cfg(feature = "tls")]
pub use transport::tls;
