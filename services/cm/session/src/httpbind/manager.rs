//! Entry point for HTTP-binding request bodies.
//!
//! An HTTP layer hands every POSTed `<body/>` to [`BoshManager::handle_request`]
//! and writes back the returned body. Session creation, the request window,
//! payload forwarding and the inactivity sweep all live here; the HTTP
//! listener itself does not.

use cm_wire::{ns, Element};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::body::{terminate_body, BoshRequest};
use super::session::{Admission, BoshLimits, BoshSession, RequestKind, SessionListener};
use crate::backend::escalate_undeliverable;
use crate::client::DEFAULT_LANGUAGE;
use crate::context::MultiplexerContext;
use crate::error::BoshError;
use crate::session::Session;

/// Manager-wide long-poll limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoshSettings {
    /// Upper bound for a client's requested `wait`
    pub wait: u32,
    /// Default `hold`
    pub hold: u32,
    /// Concurrent requests per session
    pub requests: u32,
    /// Shortest polling interval
    pub polling: u32,
    /// Inactivity period
    pub inactivity: u32,
    /// Longest pause
    pub max_pause: u32,
    /// Disable overactivity checks
    pub overactivity_override: bool,
}

impl Default for BoshSettings {
    fn default() -> Self {
        Self {
            wait: 60,
            hold: 1,
            requests: 2,
            polling: 5,
            inactivity: 30,
            max_pause: 300,
            overactivity_override: false,
        }
    }
}

impl BoshSettings {
    /// Limits for a session whose creation request asked for `wait`/`hold`
    pub fn negotiate(&self, wait: Option<u32>, hold: Option<u32>) -> BoshLimits {
        let hold_cap = self.requests.saturating_sub(1);
        BoshLimits {
            wait: wait.unwrap_or(self.wait).min(self.wait),
            hold: hold.unwrap_or(self.hold).min(hold_cap),
            requests: self.requests,
            polling: self.polling,
            inactivity: self.inactivity,
            max_pause: self.max_pause,
            overactivity_override: self.overactivity_override,
        }
    }
}

struct BoshShared {
    ctx: Arc<MultiplexerContext>,
    settings: BoshSettings,
    sessions: DashMap<String, Arc<Session>>,
}

/// Long-poll session manager
#[derive(Clone)]
pub struct BoshManager {
    shared: Arc<BoshShared>,
}

impl BoshManager {
    /// Create a manager registering its sessions in `ctx.registry`
    pub fn new(ctx: Arc<MultiplexerContext>, settings: BoshSettings) -> Self {
        Self {
            shared: Arc::new(BoshShared {
                ctx,
                settings,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Live long-poll sessions
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Handle one request body and produce the response body
    pub async fn handle_request(&self, body: &str) -> String {
        let request = match BoshRequest::parse(body) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting unparsable request body: {}", e);
                return terminate_body(Some(e));
            }
        };

        match request.sid.clone() {
            None => self.create_session(request).await,
            Some(sid) => self.continue_session(&sid, request).await,
        }
    }

    async fn create_session(&self, request: BoshRequest) -> String {
        let shared = &self.shared;
        let settings = &shared.ctx.settings;

        if settings.validate_host
            && request
                .to
                .as_deref()
                .is_some_and(|to| to != settings.server_name)
        {
            debug!("Long-poll session requested for unknown host {:?}", request.to);
            return terminate_body(Some(BoshError::HostUnknown));
        }

        let limits = shared.settings.negotiate(request.wait, request.hold);
        let language = request
            .language
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let session = match shared.ctx.registry.register_new(&shared.ctx.ids, |id| {
            let engine = BoshSession::new(id.clone(), limits, request.rid);
            Session::new_bosh(id, settings.server_name.clone(), language.clone(), engine)
        }) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to register long-poll session: {}", e);
                return terminate_body(Some(BoshError::InternalServerError));
            }
        };
        let sid = session.stream_id().to_string();
        let Some(engine) = session.bosh() else {
            return terminate_body(Some(BoshError::InternalServerError));
        };
        engine.add_listener(Arc::new(CleanupListener {
            shared: Arc::downgrade(shared),
        }));
        shared.sessions.insert(sid.clone(), session.clone());
        shared.ctx.backend.notify_session_created(&sid).await;

        let features = session.available_features(&shared.ctx.policy.load(), true, false);
        let response = Element::with_ns("body", ns::HTTPBIND)
            .attr("sid", sid.as_str())
            .attr("authid", sid.as_str())
            .attr("secure", "true")
            .attr("requests", limits.requests.to_string())
            .attr("inactivity", limits.inactivity.to_string())
            .attr("polling", limits.polling.to_string())
            .attr("wait", limits.wait.to_string())
            .attr("hold", limits.hold.to_string())
            .attr("maxpause", limits.max_pause.to_string())
            .attr("xmlns:xmpp", ns::XBOSH)
            .attr("xmpp:version", session.version().to_string())
            .child(features.attr("xmlns:stream", ns::STREAMS))
            .to_xml();
        engine.record_response(request.rid, response.clone());

        info!(
            "Long-poll session {} created (wait {}, hold {})",
            sid, limits.wait, limits.hold
        );
        response
    }

    async fn continue_session(&self, sid: &str, request: BoshRequest) -> String {
        let shared = &self.shared;
        let Some(session) = shared.sessions.get(sid).map(|entry| entry.value().clone()) else {
            debug!("Request for unknown long-poll session {}", sid);
            return terminate_body(Some(BoshError::ItemNotFound));
        };
        let Some(engine) = session.bosh() else {
            return terminate_body(Some(BoshError::ItemNotFound));
        };

        if request.terminate {
            self.forward(sid, request.payload).await;
            session.close(false);
            return terminate_body(None);
        }

        if let Some(ack) = request.ack {
            engine.acknowledge(ack);
        }

        let kind = if let Some(pause) = request.pause {
            RequestKind::Pause(pause)
        } else if request.restart {
            let features = session.available_features(&shared.ctx.policy.load(), true, false);
            RequestKind::Restart(features.attr("xmlns:stream", ns::STREAMS))
        } else {
            RequestKind::Poll
        };

        let admission = match engine.admit(request.rid, kind) {
            Ok(admission) => admission,
            Err(e) => {
                debug!("Terminating long-poll session {}: {}", sid, e);
                session.close(false);
                return terminate_body(Some(e));
            }
        };

        match admission {
            Admission::Replay(body) => body,
            Admission::Answered(body) => {
                self.forward(sid, request.payload).await;
                body
            }
            Admission::Held(held) => {
                self.forward(sid, request.payload).await;
                engine.await_answer(held).await
            }
        }
    }

    async fn forward(&self, sid: &str, payload: Vec<Element>) {
        for stanza in payload {
            self.shared.ctx.backend.route(stanza, sid).await;
        }
    }

    /// Close every session past its inactivity (or pause) deadline
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .filter(|entry| entry.value().bosh().is_some_and(|b| b.is_expired(now)))
            .map(|entry| entry.value().clone())
            .collect();

        let mut closed = 0;
        for session in expired {
            debug!("Long-poll session {} inactive, closing", session.stream_id());
            if session.close(false) {
                closed += 1;
            }
        }
        closed
    }

    /// Run [`sweep`](Self::sweep) every `period` until the task is dropped
    pub async fn run_reaper(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let closed = self.sweep();
            if closed > 0 {
                info!("Closed {} inactive long-poll sessions", closed);
            }
        }
    }
}

/// Unregisters a closed long-poll session and fails its buffer back
struct CleanupListener {
    shared: Weak<BoshShared>,
}

impl SessionListener for CleanupListener {
    fn session_closed(&self, sid: &str, undelivered: Vec<Element>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.sessions.remove(sid);
        shared.ctx.registry.unregister(sid);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to report closure of {}; {} stanzas dropped",
                sid,
                undelivered.len()
            );
            return;
        };
        let sid = sid.to_string();
        handle.spawn(async move {
            let backend = shared.ctx.backend.clone();
            for stanza in undelivered {
                escalate_undeliverable(backend.as_ref(), stanza, &sid).await;
            }
            backend.notify_session_closed(&sid).await;
        });
    }
}
