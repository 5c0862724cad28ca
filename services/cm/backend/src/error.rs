//! Backend link error types.

use std::time::Duration;
use thiserror::Error;

/// Reasons a backend connection could not be built
#[derive(Error, Debug)]
pub enum PoolError {
    /// No shared secret configured
    #[error("no backend password configured")]
    NoPassword,

    /// Backend speaks a pre-1.0 stream
    #[error("backend does not support XMPP 1.0 (version {0})")]
    UnsupportedVersion(String),

    /// Backend insists on TLS we cannot provide
    #[error("backend requires TLS but TLS is not configured")]
    TlsRequired,

    /// A `<stream:error>` arrived during negotiation
    #[error("backend sent a stream error: {0}")]
    StreamError(String),

    /// The backend answered with something unexpected
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The backend closed the stream or the socket
    #[error("backend closed the stream")]
    Closed,

    /// A negotiation read took too long
    #[error("timed out waiting for the backend after {0:?}")]
    Timeout(Duration),
}
