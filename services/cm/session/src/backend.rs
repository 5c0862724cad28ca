//! Seam between client sessions and the backend connection pool.

use async_trait::async_trait;
use cm_wire::{stanza_error_reply, Element};
use tracing::debug;

/// Fire-and-forget operations a session needs from the backend.
///
/// Implementations queue the work and return without waiting for it to reach
/// the backend.
#[async_trait]
pub trait BackendLink: Send + Sync {
    /// A client session was created
    async fn notify_session_created(&self, stream_id: &str);

    /// A client session ended
    async fn notify_session_closed(&self, stream_id: &str);

    /// A backend stanza could not be delivered to the client
    async fn notify_delivery_failed(&self, stanza: Element, stream_id: &str);

    /// Forward a client stanza to the backend
    async fn route(&self, stanza: Element, stream_id: &str);
}

/// What to do with a stanza whose target session is gone
#[derive(Debug, Clone, PartialEq)]
pub enum Undeliverable {
    /// Report the message back to the backend
    ReportFailure(Element),
    /// Route an error reply to the original sender
    Bounce(Element),
    /// Drop silently
    Drop,
}

/// Classify an undeliverable stanza.
///
/// Messages are reported as failed deliveries. `get`/`set` iqs (a missing type
/// counts as `get`) are bounced with `unexpected-request`. Everything else,
/// including iq results and errors, is dropped.
pub fn classify_undeliverable(stanza: Element) -> Undeliverable {
    match stanza.name() {
        "message" => Undeliverable::ReportFailure(stanza),
        "iq" => match stanza.get_attr("type").unwrap_or("get") {
            "get" | "set" => Undeliverable::Bounce(stanza_error_reply(
                &stanza,
                "wait",
                "unexpected-request",
            )),
            _ => Undeliverable::Drop,
        },
        _ => Undeliverable::Drop,
    }
}

/// Escalate a stanza that could not reach session `stream_id`
pub async fn escalate_undeliverable(backend: &dyn BackendLink, stanza: Element, stream_id: &str) {
    match classify_undeliverable(stanza) {
        Undeliverable::ReportFailure(message) => {
            backend.notify_delivery_failed(message, stream_id).await
        }
        Undeliverable::Bounce(reply) => backend.route(reply, stream_id).await,
        Undeliverable::Drop => debug!("Dropping undeliverable stanza for {}", stream_id),
    }
}
