//! The multiplexer context shared by every client connection.

use cm_wire::DEFAULT_MAX_STANZA_SIZE;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendLink;
use crate::id::StreamIdFactory;
use crate::policy::PolicyCache;
use crate::registry::SessionRegistry;
use crate::transport::StreamUpgrader;

/// Per-client settings fixed at startup
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Domain the manager serves
    pub server_name: String,
    /// Manager name; prefix of stream ids
    pub manager_name: String,
    /// Reject stream opens whose `to` is not `server_name`
    pub validate_host: bool,
    /// Close clients silent for this long
    pub idle_timeout: Duration,
    /// Maximum wait for the backend's SASL verdict
    pub sasl_timeout: Duration,
    /// Largest accepted stanza
    pub max_stanza_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            manager_name: "cm".to_string(),
            validate_host: false,
            idle_timeout: Duration::from_secs(30 * 60),
            sasl_timeout: Duration::from_secs(5 * 60),
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
        }
    }
}

/// Everything a client connection needs, passed explicitly instead of
/// through process-wide singletons
pub struct MultiplexerContext {
    /// Client settings
    pub settings: ClientSettings,
    /// Live sessions
    pub registry: Arc<SessionRegistry>,
    /// Backend-pushed client policy
    pub policy: Arc<PolicyCache>,
    /// Route to the backend pool
    pub backend: Arc<dyn BackendLink>,
    /// Stream id source
    pub ids: StreamIdFactory,
    /// TLS/compression seam for client streams
    pub upgrader: Arc<dyn StreamUpgrader>,
}

impl MultiplexerContext {
    /// Assemble a context
    pub fn new(
        settings: ClientSettings,
        registry: Arc<SessionRegistry>,
        policy: Arc<PolicyCache>,
        backend: Arc<dyn BackendLink>,
        upgrader: Arc<dyn StreamUpgrader>,
    ) -> Self {
        let ids = StreamIdFactory::new(settings.manager_name.clone());
        Self {
            settings,
            registry,
            policy,
            backend,
            ids,
            upgrader,
        }
    }
}
