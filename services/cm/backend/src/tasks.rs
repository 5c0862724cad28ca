//! Units of work queued for the backend pool.
//!
//! Every task renders to the XML a worker writes on its connection:
//!
//! ```text
//! SessionCreated  <iq type="set"><session id=..><create/></session></iq>
//! SessionClosed   <iq type="set"><session id=..><close/></session></iq>
//! DeliveryFailed  <iq type="set"><session id=..><failed>stanza</failed></session></iq>
//! Route           <route to=.. from=.. streamid=..>stanza</route>
//! ```

use cm_session::SessionRegistry;
use cm_wire::{ns, Element};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static IQ_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Management iq id: a random prefix and a process-wide sequence number
pub fn next_iq_id() -> String {
    let prefix: u32 = rand::thread_rng().gen_range(0..1000);
    format!("{}-{}", prefix, IQ_SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

/// A task for any live backend worker
#[derive(Debug, Clone, PartialEq)]
pub enum BackendTask {
    /// A client session was opened
    SessionCreated(String),
    /// A client session ended
    SessionClosed(String),
    /// A backend stanza could not reach its session
    DeliveryFailed {
        /// Target stream id
        stream_id: String,
        /// The undelivered stanza
        stanza: Element,
    },
    /// A client stanza for the backend
    Route {
        /// Originating stream id
        stream_id: String,
        /// The client stanza
        stanza: Element,
    },
}

impl BackendTask {
    /// Stream id the task concerns
    pub fn stream_id(&self) -> &str {
        match self {
            BackendTask::SessionCreated(id) | BackendTask::SessionClosed(id) => id,
            BackendTask::DeliveryFailed { stream_id, .. } | BackendTask::Route { stream_id, .. } => {
                stream_id
            }
        }
    }

    /// Render the task as sent by worker `jid` to `domain`
    pub fn render(&self, domain: &str, jid: &str) -> String {
        match self {
            BackendTask::SessionCreated(stream_id) => {
                session_iq(domain, jid, stream_id, Element::new("create")).to_xml()
            }
            BackendTask::SessionClosed(stream_id) => {
                session_iq(domain, jid, stream_id, Element::new("close")).to_xml()
            }
            BackendTask::DeliveryFailed { stream_id, stanza } => session_iq(
                domain,
                jid,
                stream_id,
                Element::new("failed").child(stanza.clone()),
            )
            .to_xml(),
            BackendTask::Route { stream_id, stanza } => Element::new("route")
                .attr("to", domain)
                .attr("from", jid)
                .attr("streamid", stream_id.as_str())
                .child(stanza.clone())
                .to_xml(),
        }
    }

    /// Fallback for a task still queued when the pool is torn down
    pub fn on_backend_unavailable(&self, registry: &SessionRegistry) {
        match self {
            BackendTask::SessionCreated(stream_id)
            | BackendTask::Route { stream_id, .. }
            | BackendTask::DeliveryFailed { stream_id, .. } => {
                if let Some(session) = registry.lookup(stream_id) {
                    debug!("Backend unavailable, closing session {}", stream_id);
                    session.close(true);
                }
            }
            BackendTask::SessionClosed(_) => {}
        }
    }
}

fn session_iq(domain: &str, jid: &str, stream_id: &str, action: Element) -> Element {
    Element::new("iq")
        .attr("type", "set")
        .attr("to", domain)
        .attr("from", jid)
        .attr("id", next_iq_id())
        .child(
            Element::with_ns("session", ns::CM_SESSION)
                .attr("id", stream_id)
                .child(action),
        )
}
