//! Long-poll request window and acknowledgement engine.
//!
//! Each HTTP request carries a request id (`rid`). The engine keeps the open
//! requests ordered by rid, answers them with backend content strictly in rid
//! order, remembers the last `hold` answers for retransmissions, and reports
//! as `ack` the longest contiguous run of answered rids.
//!
//! ## Admission of a request
//!
//! ```text
//! rid <= last answered        -> replay recorded answer, or item-not-found
//! rid >  last + requests      -> item-not-found
//! too many open / polling too fast -> policy-violation
//! buffered content or polling -> answer now
//! otherwise                   -> hold open; trim the queue back to `hold`
//! ```

use cm_wire::Element;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::body::{answer_body, terminate_body};
use crate::error::BoshError;

/// Negotiated limits of one long-poll session, in seconds where applicable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoshLimits {
    /// Longest time a request may be held
    pub wait: u32,
    /// Requests the manager may hold open
    pub hold: u32,
    /// Concurrent requests the client may make
    pub requests: u32,
    /// Shortest polling interval
    pub polling: u32,
    /// Longest period without an open request
    pub inactivity: u32,
    /// Longest pause the client may request
    pub max_pause: u32,
    /// Disable overactivity checks
    pub overactivity_override: bool,
}

impl BoshLimits {
    /// Polling sessions never hold requests open
    pub fn is_polling(&self) -> bool {
        self.wait == 0 || self.hold == 0
    }
}

/// Observer of a long-poll session
pub trait SessionListener: Send + Sync {
    /// A request is being held open
    fn connection_opened(&self, _sid: &str, _rid: u64) {}

    /// A held request was answered
    fn connection_closed(&self, _sid: &str, _rid: u64) {}

    /// The session closed; `undelivered` holds buffered backend stanzas.
    /// Called exactly once.
    fn session_closed(&self, sid: &str, undelivered: Vec<Element>);
}

/// Kind of a non-terminating request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    /// Ordinary request, possibly carrying payload
    Poll,
    /// `pause='secs'`
    Pause(u32),
    /// `xmpp:restart`; answered with these features
    Restart(Element),
}

/// Result of admitting a request
#[derive(Debug)]
pub enum Admission {
    /// A retransmission; replay the recorded answer and forward nothing
    Replay(String),
    /// Answered right away
    Answered(String),
    /// Held open until content arrives or `wait` elapses
    Held(HeldRequest),
}

/// A request waiting for its answer
#[derive(Debug)]
pub struct HeldRequest {
    rid: u64,
    answer: oneshot::Receiver<String>,
}

impl HeldRequest {
    /// Request id
    pub fn rid(&self) -> u64 {
        self.rid
    }
}

#[derive(Default)]
struct Events {
    opened: Vec<u64>,
    closed: Vec<u64>,
}

struct WindowState {
    /// Highest rid such that every rid up to it has been answered
    last_request_id: u64,
    /// Answered rids above `last_request_id`
    answered_ahead: BTreeSet<u64>,
    open: BTreeMap<u64, oneshot::Sender<String>>,
    pending: Vec<Element>,
    history: VecDeque<(u64, String)>,
    last_answer_empty: bool,
    last_request_at: Option<Instant>,
    idle_deadline: Option<Instant>,
    closed: bool,
}

/// Long-poll state attached to a session
pub struct BoshSession {
    sid: String,
    limits: BoshLimits,
    state: Mutex<WindowState>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl fmt::Debug for BoshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoshSession")
            .field("sid", &self.sid)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl BoshSession {
    /// Create the engine for a session opened by request `creation_rid`
    pub fn new(sid: impl Into<String>, limits: BoshLimits, creation_rid: u64) -> Self {
        Self {
            sid: sid.into(),
            limits,
            state: Mutex::new(WindowState {
                last_request_id: creation_rid,
                answered_ahead: BTreeSet::new(),
                open: BTreeMap::new(),
                pending: Vec::new(),
                history: VecDeque::new(),
                last_answer_empty: false,
                last_request_at: None,
                idle_deadline: Some(Instant::now() + secs(limits.inactivity)),
                closed: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Session id
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Negotiated limits
    pub fn limits(&self) -> BoshLimits {
        self.limits
    }

    /// Highest contiguous answered rid; reported as `ack`
    pub fn last_request_id(&self) -> u64 {
        self.lock().last_request_id
    }

    /// Number of requests currently held
    pub fn open_requests(&self) -> usize {
        self.lock().open.len()
    }

    /// Number of buffered backend stanzas
    pub fn pending_stanzas(&self) -> usize {
        self.lock().pending.len()
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Remember the answer to `rid` (used for the creation response)
    pub fn record_response(&self, rid: u64, body: String) {
        let mut state = self.lock();
        push_history(&mut state, self.limits.hold, rid, body);
    }

    /// The client has seen every answer up to `ack`; those are never
    /// retransmitted, so drop them from the history
    pub fn acknowledge(&self, ack: u64) {
        let mut state = self.lock();
        let before = state.history.len();
        state.history.retain(|(rid, _)| *rid > ack);
        if state.history.len() < before {
            trace!(
                "Dropped {} acknowledged answers for {}",
                before - state.history.len(),
                self.sid
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn fire(&self, events: Events) {
        if events.opened.is_empty() && events.closed.is_empty() {
            return;
        }
        for listener in self.listeners() {
            for rid in &events.opened {
                listener.connection_opened(&self.sid, *rid);
            }
            for rid in &events.closed {
                listener.connection_closed(&self.sid, *rid);
            }
        }
    }

    /// Admit request `rid`
    pub fn admit(&self, rid: u64, kind: RequestKind) -> Result<Admission, BoshError> {
        let mut events = Events::default();
        let admission = self.admit_locked(rid, kind, &mut events);
        self.fire(events);
        admission
    }

    fn admit_locked(
        &self,
        rid: u64,
        kind: RequestKind,
        events: &mut Events,
    ) -> Result<Admission, BoshError> {
        let limits = self.limits;
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return Err(BoshError::ItemNotFound);
        }

        if rid <= state.last_request_id || state.answered_ahead.contains(&rid) {
            return match state.history.iter().find(|(answered, _)| *answered == rid) {
                Some((_, body)) => {
                    debug!("Replaying answer to rid {} for {}", rid, self.sid);
                    Ok(Admission::Replay(body.clone()))
                }
                None => {
                    debug!("No recorded answer to rid {} for {}", rid, self.sid);
                    Err(BoshError::ItemNotFound)
                }
            };
        }

        if rid > state.last_request_id.saturating_add(u64::from(limits.requests)) {
            debug!(
                "rid {} outside window (last {}, requests {}) for {}",
                rid, state.last_request_id, limits.requests, self.sid
            );
            return Err(BoshError::ItemNotFound);
        }

        if state.open.contains_key(&rid) {
            debug!("rid {} is already held for {}", rid, self.sid);
            return Err(BoshError::BadRequest);
        }

        if !limits.overactivity_override {
            let too_many = state.open.len() >= limits.requests as usize;
            let too_fast = limits.is_polling()
                && state.last_answer_empty
                && state
                    .last_request_at
                    .is_some_and(|at| now.duration_since(at) < secs(limits.polling));
            if too_many || too_fast {
                debug!(
                    "Overactivity on {} (open {}, polling too fast: {})",
                    self.sid,
                    state.open.len(),
                    too_fast
                );
                return Err(BoshError::PolicyViolation);
            }
        }
        state.last_request_at = Some(now);

        match kind {
            RequestKind::Pause(requested) => {
                let pause = requested.min(limits.max_pause);
                for (held, sender) in std::mem::take(&mut state.open) {
                    let body = answer(&mut state, limits, held, &[], now);
                    let _ = sender.send(body);
                    events.closed.push(held);
                }
                let body = answer(&mut state, limits, rid, &[], now);
                state.idle_deadline = Some(now + secs(pause));
                debug!("Session {} paused for {}s", self.sid, pause);
                Ok(Admission::Answered(body))
            }
            RequestKind::Restart(features) => {
                let body = answer(&mut state, limits, rid, &[features], now);
                Ok(Admission::Answered(body))
            }
            RequestKind::Poll if !state.pending.is_empty() || limits.is_polling() => {
                let stanzas = std::mem::take(&mut state.pending);
                let body = answer(&mut state, limits, rid, &stanzas, now);
                Ok(Admission::Answered(body))
            }
            RequestKind::Poll => {
                let (sender, receiver) = oneshot::channel();
                state.open.insert(rid, sender);
                state.idle_deadline = None;
                events.opened.push(rid);

                if state.open.len() > limits.hold as usize {
                    let newest = state.open.keys().next_back().copied();
                    if newest != Some(rid) {
                        // Arrived out of order: answer every held request
                        trace!("rid {} arrived out of order on {}; flushing", rid, self.sid);
                        for (held, sender) in std::mem::take(&mut state.open) {
                            let body = answer(&mut state, limits, held, &[], now);
                            let _ = sender.send(body);
                            events.closed.push(held);
                        }
                    } else {
                        while state.open.len() > limits.hold as usize {
                            let Some((oldest, sender)) = state.open.pop_first() else {
                                break;
                            };
                            let body = answer(&mut state, limits, oldest, &[], now);
                            let _ = sender.send(body);
                            events.closed.push(oldest);
                        }
                    }
                }
                Ok(Admission::Held(HeldRequest {
                    rid,
                    answer: receiver,
                }))
            }
        }
    }

    /// Wait for a held request's answer, answering it empty after `wait`
    pub async fn await_answer(&self, held: HeldRequest) -> String {
        let HeldRequest { rid, mut answer } = held;
        match timeout(secs(self.limits.wait), &mut answer).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => terminate_body(None),
            Err(_) => match self.expire(rid) {
                Some(body) => body,
                // Answered between the timeout and the lock
                None => answer.await.unwrap_or_else(|_| terminate_body(None)),
            },
        }
    }

    /// Answer a still-held request with an empty body
    pub fn expire(&self, rid: u64) -> Option<String> {
        let body = {
            let mut state = self.lock();
            let _sender = state.open.remove(&rid)?;
            answer(&mut state, self.limits, rid, &[], Instant::now())
        };
        self.fire(Events {
            opened: Vec::new(),
            closed: vec![rid],
        });
        Some(body)
    }

    /// Hand a backend stanza to the client.
    ///
    /// Goes to the held request `last_request_id + 1` if there is one, and is
    /// buffered otherwise.
    pub fn deliver(&self, stanza: Element) -> Result<(), Element> {
        let answered = {
            let mut state = self.lock();
            if state.closed {
                return Err(stanza);
            }
            state.pending.push(stanza);
            let next = state.last_request_id.saturating_add(1);
            match state.open.remove(&next) {
                Some(sender) => {
                    let stanzas = std::mem::take(&mut state.pending);
                    let body = answer(&mut state, self.limits, next, &stanzas, Instant::now());
                    let _ = sender.send(body);
                    Some(next)
                }
                None => None,
            }
        };
        if let Some(rid) = answered {
            self.fire(Events {
                opened: Vec::new(),
                closed: vec![rid],
            });
        }
        Ok(())
    }

    /// True when the session has had no held request for longer than its
    /// inactivity (or pause) period
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.lock();
        !state.closed && state.open.is_empty() && state.idle_deadline.is_some_and(|d| now >= d)
    }

    /// Answer every held request with an empty body, drop the window and
    /// notify listeners once
    pub fn close(&self) {
        let (answered, undelivered) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Later requests get item-not-found
            let empty = answer_body(state.last_request_id, &[]);
            let mut answered = Vec::new();
            for (rid, sender) in std::mem::take(&mut state.open) {
                let _ = sender.send(empty.clone());
                answered.push(rid);
            }
            (answered, std::mem::take(&mut state.pending))
        };
        debug!(
            "Long-poll session {} closed ({} held, {} undelivered)",
            self.sid,
            answered.len(),
            undelivered.len()
        );

        let listeners = self.listeners();
        for listener in &listeners {
            for rid in &answered {
                listener.connection_closed(&self.sid, *rid);
            }
        }
        if let Some((last, rest)) = listeners.split_last() {
            for listener in rest {
                listener.session_closed(&self.sid, undelivered.clone());
            }
            last.session_closed(&self.sid, undelivered);
        }
    }
}

fn secs(value: u32) -> Duration {
    Duration::from_secs(u64::from(value))
}

/// Record `rid` as answered and render its body
fn answer(
    state: &mut WindowState,
    limits: BoshLimits,
    rid: u64,
    stanzas: &[Element],
    now: Instant,
) -> String {
    if rid > state.last_request_id {
        state.answered_ahead.insert(rid);
    }
    while let Some(next) = state.last_request_id.checked_add(1) {
        if !state.answered_ahead.remove(&next) {
            break;
        }
        state.last_request_id = next;
    }

    let body = answer_body(state.last_request_id, stanzas);
    push_history(state, limits.hold, rid, body.clone());
    state.last_answer_empty = stanzas.is_empty();
    if state.open.is_empty() {
        state.idle_deadline = Some(now + secs(limits.inactivity));
    }
    body
}

fn push_history(state: &mut WindowState, hold: u32, rid: u64, body: String) {
    state.history.push_back((rid, body));
    while state.history.len() > hold as usize {
        state.history.pop_front();
    }
}
