//! HTTP-binding (long-poll) sessions.

mod body;
mod manager;
mod session;

pub use body::{answer_body, terminate_body, BoshRequest};
pub use manager::{BoshManager, BoshSettings};
pub use session::{Admission, BoshLimits, BoshSession, HeldRequest, RequestKind, SessionListener};
