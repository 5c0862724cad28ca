//! Session layer error types.

use thiserror::Error;

/// Session layer errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A session with this stream id is already registered
    #[error("stream id {0} already registered")]
    DuplicateStreamId(String),

    /// No free stream id could be allocated
    #[error("could not allocate a unique stream id after {0} attempts")]
    IdExhausted(usize),

    /// Invalid policy keyword in configuration
    #[error("invalid policy value: {0}")]
    InvalidPolicy(String),
}

/// Conditions that terminate an HTTP-binding session
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoshError {
    /// The request body could not be understood
    #[error("bad-request")]
    BadRequest,

    /// Unknown session, rid outside the window, or a retransmission with no recorded answer
    #[error("item-not-found")]
    ItemNotFound,

    /// Overactivity
    #[error("policy-violation")]
    PolicyViolation,

    /// `to` does not name a served domain
    #[error("host-unknown")]
    HostUnknown,

    /// The session could not be created
    #[error("internal-server-error")]
    InternalServerError,
}

impl BoshError {
    /// Value of the `condition` attribute on a terminating body
    pub fn condition(&self) -> &'static str {
        match self {
            BoshError::BadRequest => "bad-request",
            BoshError::ItemNotFound => "item-not-found",
            BoshError::PolicyViolation => "policy-violation",
            BoshError::HostUnknown => "host-unknown",
            BoshError::InternalServerError => "internal-server-error",
        }
    }
}
