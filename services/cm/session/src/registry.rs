//! Stream id to session map.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::id::StreamIdFactory;
use crate::session::Session;

/// Attempts made by [`SessionRegistry::register_new`] before giving up
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Concurrent registry of live sessions.
///
/// Lookups never take a global lock; each key is guarded by its shard only.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its stream id; fails if the id is taken
    pub fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        match self.sessions.entry(session.stream_id().to_string()) {
            Entry::Occupied(entry) => Err(SessionError::DuplicateStreamId(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!("Registered session {}", entry.key());
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Build and register a session under a freshly allocated id.
    ///
    /// `build` receives each candidate id; the first one the registry accepts wins.
    pub fn register_new<F>(
        &self,
        ids: &StreamIdFactory,
        mut build: F,
    ) -> Result<Arc<Session>, SessionError>
    where
        F: FnMut(String) -> Session,
    {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session = Arc::new(build(ids.next_id()));
            match self.register(session.clone()) {
                Ok(()) => return Ok(session),
                Err(SessionError::DuplicateStreamId(id)) => {
                    debug!("Stream id {} collided, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Find a session by stream id
    pub fn lookup(&self, stream_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(stream_id).map(|entry| entry.value().clone())
    }

    /// Remove a session; a no-op if absent
    pub fn unregister(&self, stream_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(stream_id).map(|(_, session)| session);
        if removed.is_some() {
            debug!("Unregistered session {}", stream_id);
        }
        removed
    }

    /// Close every registered session with the given flag
    pub fn close_all(&self, system_stopped: bool) -> usize {
        // Snapshot first so no shard lock is held while sessions close
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(
            "Closing {} client sessions (system_stopped: {})",
            sessions.len(),
            system_stopped
        );
        sessions
            .iter()
            .filter(|session| session.close(system_stopped))
            .count()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
