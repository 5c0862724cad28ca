//! Configuration handling for the connection manager.
//!
//! Settings come from a YAML file, then `CM_*` environment variables, then
//! command line flags. Every key has a default so a missing file still yields
//! a runnable (if unauthenticated) manager.

use anyhow::{Context, Result};
use cm_backend::{BackendEndpoint, PoolSettings};
use cm_session::{BoshSettings, ClientSettings, CompressionPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Connection manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CmConfig {
    /// Identity of this manager
    pub manager: ManagerConfig,
    /// Client listener
    pub clients: ClientsConfig,
    /// Backend links
    pub backend: BackendConfig,
    /// HTTP-binding limits
    pub httpbind: HttpBindConfig,
}

/// Manager identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Prefix of stream ids and worker JIDs
    pub name: String,
    /// Served XMPP domain
    pub domain: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "cm".to_string(),
            domain: "localhost".to_string(),
        }
    }
}

/// Client listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Reject stream opens addressed to another domain
    pub validate_host: bool,
    /// Close clients silent for this long (seconds)
    pub idle_timeout_secs: u64,
    /// Wait for the backend's SASL verdict (seconds)
    pub sasl_timeout_secs: u64,
    /// Certificate for client STARTTLS
    pub tls: TlsConfig,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5222)),
            validate_host: false,
            idle_timeout_secs: 30 * 60,
            sasl_timeout_secs: 5 * 60,
            tls: TlsConfig::default(),
        }
    }
}

/// TLS files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM)
    pub cert_file: String,
    /// Path to private key (PEM)
    pub key_file: String,
}

impl TlsConfig {
    /// True if both files are set
    pub fn is_configured(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

/// Backend link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend host, resolved on every connection attempt
    pub host: String,
    /// Component port
    pub port: u16,
    /// Shared secret
    pub password: String,
    /// Pool size
    pub connections: usize,
    /// Concurrent inbound stanzas per connection
    pub incoming_threads: usize,
    /// Task queue length
    pub queue_capacity: usize,
    /// TCP connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Per-read handshake timeout (seconds)
    pub handshake_timeout_secs: u64,
    /// Backend silence that drops a connection (seconds)
    pub idle_timeout_secs: u64,
    /// Whitespace keepalive period (seconds)
    pub heartbeat_secs: u64,
    /// `disabled` or `optional`
    pub compression: String,
    /// CA bundle trusted for backend STARTTLS
    pub tls_ca_file: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5262,
            password: String::new(),
            connections: 5,
            incoming_threads: 5,
            queue_capacity: 1024,
            connect_timeout_secs: 20,
            handshake_timeout_secs: 7,
            idle_timeout_secs: 300,
            heartbeat_secs: 30,
            compression: "disabled".to_string(),
            tls_ca_file: String::new(),
        }
    }
}

/// HTTP-binding limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBindConfig {
    /// Longest a request is held (seconds)
    pub wait: u32,
    /// Requests held per session
    pub hold: u32,
    /// Concurrent requests per session
    pub requests: u32,
    /// Shortest polling interval (seconds)
    pub polling_secs: u32,
    /// Inactivity before a session is swept (seconds)
    pub inactivity_secs: u32,
    /// Longest pause a client may ask for (seconds)
    pub max_pause_secs: u32,
    /// Skip overactivity checks
    pub overactivity_override: bool,
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        let defaults = BoshSettings::default();
        Self {
            wait: defaults.wait,
            hold: defaults.hold,
            requests: defaults.requests,
            polling_secs: defaults.polling,
            inactivity_secs: defaults.inactivity,
            max_pause_secs: defaults.max_pause,
            overactivity_override: defaults.overactivity_override,
        }
    }
}

impl CmConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final configuration: manager={}, domain={}, listen={}, backend={}:{} x{}",
            config.manager.name,
            config.manager.domain,
            config.clients.listen,
            config.backend.host,
            config.backend.port,
            config.backend.connections
        );
        if config.backend.password.is_empty() {
            warn!("No backend password configured; backend connections will fail");
        }

        Ok(config)
    }

    /// Parse a YAML document; missing keys keep their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document parses as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("CM_MANAGER_NAME") {
            info!("Manager name overridden by environment: {}", name);
            self.manager.name = name;
        }

        if let Some(domain) = lookup("CM_DOMAIN") {
            info!("Domain overridden by environment: {}", domain);
            self.manager.domain = domain;
        }

        if let Some(listen) = lookup("CM_CLIENT_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.clients.listen = addr;
                    info!("Client listener overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid CM_CLIENT_LISTEN: {}", listen),
            }
        }

        if let Some(host) = lookup("CM_BACKEND_HOST") {
            info!("Backend host overridden by environment: {}", host);
            self.backend.host = host;
        }

        if let Some(port) = lookup("CM_BACKEND_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.backend.port = port;
                    info!("Backend port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid CM_BACKEND_PORT: {}", port),
            }
        }

        if let Some(password) = lookup("CM_BACKEND_PASSWORD") {
            info!("Backend password overridden by environment");
            self.backend.password = password;
        }

        if let Some(connections) = lookup("CM_BACKEND_CONNECTIONS") {
            match connections.parse::<usize>() {
                Ok(connections) if connections > 0 => {
                    self.backend.connections = connections;
                    info!("Backend pool size overridden by environment: {}", connections);
                }
                _ => warn!("Ignoring invalid CM_BACKEND_CONNECTIONS: {}", connections),
            }
        }
    }

    /// Settings for client connections
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            server_name: self.manager.domain.clone(),
            manager_name: self.manager.name.clone(),
            validate_host: self.clients.validate_host,
            idle_timeout: Duration::from_secs(self.clients.idle_timeout_secs),
            sasl_timeout: Duration::from_secs(self.clients.sasl_timeout_secs),
            ..ClientSettings::default()
        }
    }

    /// Where and how backend links connect
    pub fn backend_endpoint(&self) -> Result<BackendEndpoint> {
        let compression: CompressionPolicy = self
            .backend
            .compression
            .parse()
            .context("Invalid backend.compression")?;
        Ok(BackendEndpoint {
            host: self.backend.host.clone(),
            port: self.backend.port,
            manager_name: self.manager.name.clone(),
            password: self.backend.password.clone(),
            connect_timeout: Duration::from_secs(self.backend.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.backend.handshake_timeout_secs),
            compression,
        })
    }

    /// Backend pool tuning
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            domain: self.manager.domain.clone(),
            connections: self.backend.connections.max(1),
            queue_capacity: self.backend.queue_capacity.max(1),
            heartbeat: Duration::from_secs(self.backend.heartbeat_secs),
            incoming_threads: self.backend.incoming_threads.max(1),
            idle_timeout: Duration::from_secs(self.backend.idle_timeout_secs),
            ..PoolSettings::default()
        }
    }

    /// Long-poll limits
    pub fn bosh_settings(&self) -> BoshSettings {
        BoshSettings {
            wait: self.httpbind.wait,
            hold: self.httpbind.hold,
            requests: self.httpbind.requests,
            polling: self.httpbind.polling_secs,
            inactivity: self.httpbind.inactivity_secs,
            max_pause: self.httpbind.max_pause_secs,
            overactivity_override: self.httpbind.overactivity_override,
        }
    }
}
