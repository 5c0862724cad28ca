//! Session record shared by socket and HTTP-binding clients.
//!
//! A [`Session`] is created when a client's opening stream tag is accepted and
//! lives in the registry until it closes. The transport-specific part is a
//! [`Transport`] variant; delivery, feature advertisement and close dispatch on
//! it.

use cm_wire::{ns, Element, XmppVersion};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::features::stream_features;
use crate::httpbind::BoshSession;
use crate::policy::ClientPolicy;

/// Session lifecycle status; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    /// Stream open, not yet authenticated
    Initializing = 0,
    /// SASL completed successfully
    Authenticated = 1,
    /// Terminal
    Closed = 2,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Initializing,
            1 => SessionStatus::Authenticated,
            _ => SessionStatus::Closed,
        }
    }
}

/// Outcome of a SASL exchange step, as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslVerdict {
    /// `<success/>`
    Success,
    /// `<failure/>`
    Failure,
    /// `<challenge/>`
    Challenge,
}

impl SaslVerdict {
    fn from_stanza(stanza: &Element) -> Option<Self> {
        if stanza.ns().is_some_and(|uri| uri != ns::SASL) {
            return None;
        }
        match stanza.name() {
            "success" => Some(SaslVerdict::Success),
            "failure" => Some(SaslVerdict::Failure),
            "challenge" => Some(SaslVerdict::Challenge),
            _ => None,
        }
    }
}

/// Work handed to a socket client's connection task
#[derive(Debug)]
pub enum ClientOutbound {
    /// Write a stanza to the client
    Stanza(Element),
    /// Close the stream; `system_stopped` selects the system-shutdown error
    Close {
        /// Close because the manager or backend is going away
        system_stopped: bool,
    },
}

/// Socket transport half held by the session
#[derive(Debug)]
pub struct SocketLink {
    outbound: mpsc::UnboundedSender<ClientOutbound>,
    sasl_waiter: Mutex<Option<oneshot::Sender<SaslVerdict>>>,
}

impl SocketLink {
    fn signal_sasl(&self, verdict: SaslVerdict) {
        let waiter = self
            .sasl_waiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(verdict);
        }
    }
}

/// Transport-specific session payload
#[derive(Debug)]
pub enum Transport {
    /// Persistent socket owned by a connection task
    Socket(SocketLink),
    /// HTTP long-poll binding
    Bosh(BoshSession),
}

/// A client session keyed by its stream id
#[derive(Debug)]
pub struct Session {
    stream_id: String,
    server_name: String,
    version: XmppVersion,
    language: String,
    status: AtomicU8,
    lane: Mutex<VecDeque<Element>>,
    lane_guard: tokio::sync::Mutex<()>,
    transport: Transport,
}

impl Session {
    /// Create a socket session whose output goes to `outbound`
    pub fn socket(
        stream_id: String,
        server_name: String,
        version: XmppVersion,
        language: String,
        outbound: mpsc::UnboundedSender<ClientOutbound>,
    ) -> Self {
        Self::with_transport(
            stream_id,
            server_name,
            version,
            language,
            Transport::Socket(SocketLink {
                outbound,
                sasl_waiter: Mutex::new(None),
            }),
        )
    }

    /// Create an HTTP-binding session
    pub fn new_bosh(
        stream_id: String,
        server_name: String,
        language: String,
        bosh: BoshSession,
    ) -> Self {
        Self::with_transport(
            stream_id,
            server_name,
            XmppVersion::MAX,
            language,
            Transport::Bosh(bosh),
        )
    }

    fn with_transport(
        stream_id: String,
        server_name: String,
        version: XmppVersion,
        language: String,
        transport: Transport,
    ) -> Self {
        Self {
            stream_id,
            server_name,
            version,
            language,
            status: AtomicU8::new(SessionStatus::Initializing as u8),
            lane: Mutex::new(VecDeque::new()),
            lane_guard: tokio::sync::Mutex::new(()),
            transport,
        }
    }

    /// Stream id
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Domain served to this client
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Negotiated stream version
    pub fn version(&self) -> XmppVersion {
        self.version
    }

    /// Negotiated language
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Transport payload
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// HTTP-binding state, if this is a long-poll session
    pub fn bosh(&self) -> Option<&BoshSession> {
        match &self.transport {
            Transport::Bosh(bosh) => Some(bosh),
            Transport::Socket(_) => None,
        }
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// True once closed
    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    /// True once SASL succeeded (and not closed)
    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    /// Move Initializing to Authenticated; no effect in any other state
    pub fn mark_authenticated(&self) -> bool {
        self.status
            .compare_exchange(
                SessionStatus::Initializing as u8,
                SessionStatus::Authenticated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to Closed. Returns true only for the caller that performed the move.
    fn mark_closed(&self) -> bool {
        self.status.swap(SessionStatus::Closed as u8, Ordering::AcqRel) != SessionStatus::Closed as u8
    }

    /// Arm the SASL waiter for a socket session.
    ///
    /// The returned receiver resolves with the next success, failure or
    /// challenge delivered to this session.
    pub fn arm_sasl_waiter(&self) -> Option<oneshot::Receiver<SaslVerdict>> {
        match &self.transport {
            Transport::Socket(link) => {
                let (tx, rx) = oneshot::channel();
                *link
                    .sasl_waiter
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
                Some(rx)
            }
            Transport::Bosh(_) => None,
        }
    }

    /// Deliver a backend-originated stanza to the client.
    ///
    /// Returns the stanza back when the session can no longer take it.
    pub fn deliver(&self, stanza: Element) -> Result<(), Element> {
        if self.is_closed() {
            return Err(stanza);
        }

        let verdict = if self.status() == SessionStatus::Initializing {
            SaslVerdict::from_stanza(&stanza)
        } else {
            None
        };
        if verdict == Some(SaslVerdict::Success) {
            self.mark_authenticated();
        }

        match &self.transport {
            Transport::Socket(link) => {
                // Queue the stanza before waking the reader so the client
                // sees the verdict before anything sent after it.
                let queued = link
                    .outbound
                    .send(ClientOutbound::Stanza(stanza))
                    .map_err(|mpsc::error::SendError(out)| out);
                if let Some(verdict) = verdict {
                    link.signal_sasl(verdict);
                }
                match queued {
                    Ok(()) => Ok(()),
                    Err(ClientOutbound::Stanza(stanza)) => Err(stanza),
                    Err(ClientOutbound::Close { .. }) => Ok(()),
                }
            }
            Transport::Bosh(bosh) => bosh.deliver(stanza),
        }
    }

    /// Stream features this session should currently advertise.
    ///
    /// `secured` and `compressible` describe the socket; long-poll sessions
    /// are always treated as secured and never offer compression.
    pub fn available_features(
        &self,
        policy: &ClientPolicy,
        secured: bool,
        compressible: bool,
    ) -> Element {
        let (secured, compressible) = match &self.transport {
            Transport::Socket(_) => (secured, compressible),
            Transport::Bosh(_) => (true, false),
        };
        stream_features(policy, secured, compressible, self.is_authenticated())
    }

    /// Close the session. Only the first call has any effect.
    ///
    /// Socket sessions hand the close to their connection task, which writes
    /// the closing tags and unregisters. Long-poll sessions answer their open
    /// requests and notify their listeners.
    pub fn close(&self, system_stopped: bool) -> bool {
        if !self.mark_closed() {
            return false;
        }
        debug!(
            "Closing session {} (system_stopped: {})",
            self.stream_id, system_stopped
        );
        match &self.transport {
            Transport::Socket(link) => {
                let _ = link.outbound.send(ClientOutbound::Close { system_stopped });
                // Wakes a reader blocked on a SASL verdict
                link.sasl_waiter
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
            }
            Transport::Bosh(bosh) => bosh.close(),
        }
        true
    }

    /// Queue a backend stanza on this session's inbound lane
    pub fn push_inbound(&self, stanza: Element) {
        self.lane
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(stanza);
    }

    /// Take the oldest stanza from the inbound lane
    pub fn pop_inbound(&self) -> Option<Element> {
        self.lane
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    /// Exclusive access to the inbound lane; hold it while draining
    pub async fn lock_lane(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lane_guard.lock().await
    }
}
