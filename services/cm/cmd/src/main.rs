//! XMPP connection manager binary.
//!
//! Accepts client streams, multiplexes them over a pool of component
//! connections to the XMPP server, and keeps the long-poll session sweeper
//! running for an HTTP-binding front end.

use clap::Parser;
use cm_backend::{BackendPool, ShutdownMode, XmppConnector};
use cm_session::{
    listen_tcp, serve_clients, BoshManager, MultiplexerContext, PlainTransport, PolicyCache,
    SessionRegistry, StreamUpgrader,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CmConfig;
use logging::CmLogFormatter;

/// How often idle long-poll sessions are swept
const BOSH_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// XMPP connection manager
#[derive(Parser, Debug)]
#[command(name = "xmpp-cm", version, about = "XMPP connection manager")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Client listen address, e.g. 0.0.0.0:5222
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Served XMPP domain
    #[arg(long)]
    domain: Option<String>,

    /// Backend host
    #[arg(long)]
    backend_host: Option<String>,

    /// Backend component port
    #[arg(long)]
    backend_port: Option<u16>,

    /// Number of backend connections
    #[arg(long)]
    connections: Option<usize>,

    /// Client idle timeout, e.g. 30m
    #[arg(long)]
    client_idle_timeout: Option<humantime::Duration>,

    /// Backend heartbeat interval, e.g. 30s
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,
}

impl Args {
    /// Flags win over the file and the environment
    fn apply_to(&self, config: &mut CmConfig) {
        if let Some(listen) = self.listen {
            config.clients.listen = listen;
        }
        if let Some(domain) = &self.domain {
            config.manager.domain = domain.clone();
        }
        if let Some(host) = &self.backend_host {
            config.backend.host = host.clone();
        }
        if let Some(port) = self.backend_port {
            config.backend.port = port;
        }
        if let Some(connections) = self.connections {
            config.backend.connections = connections;
        }
        if let Some(idle) = self.client_idle_timeout {
            config.clients.idle_timeout_secs = Duration::from(idle).as_secs();
        }
        if let Some(heartbeat) = self.heartbeat {
            config.backend.heartbeat_secs = Duration::from(heartbeat).as_secs().max(1);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("xmpp_cm={}", args.log_level).parse()?)
        .add_directive(format!("cm_wire={}", args.log_level).parse()?)
        .add_directive(format!("cm_session={}", args.log_level).parse()?)
        .add_directive(format!("cm_backend={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(CmLogFormatter::new())
        .init();

    info!("Starting XMPP connection manager v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CmConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let upgrader = build_upgrader(&config)?;
    let registry = Arc::new(SessionRegistry::new());
    let policy = Arc::new(PolicyCache::default());

    // Backend pool; connections are built on first use
    let connector = XmppConnector::new(config.backend_endpoint()?, upgrader.clone());
    let pool = BackendPool::new(
        config.pool_settings(),
        registry.clone(),
        policy.clone(),
        Arc::new(connector),
    );
    let heartbeat = pool.spawn_heartbeat();

    let ctx = Arc::new(MultiplexerContext::new(
        config.client_settings(),
        registry.clone(),
        policy,
        Arc::new(pool.clone()),
        upgrader,
    ));

    let bosh = BoshManager::new(ctx.clone(), config.bosh_settings());
    let reaper = tokio::spawn(bosh.run_reaper(BOSH_SWEEP_INTERVAL));

    let listener = listen_tcp(config.clients.listen).await?;
    let server = tokio::spawn(serve_clients(ctx, listener));

    info!(
        component = "main",
        "Connection manager {} serving {} (backend {}:{})",
        config.manager.name,
        config.manager.domain,
        config.backend.host,
        config.backend.port
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT signal, shutting down"),
        result = server => warn!("Client listener stopped unexpectedly: {:?}", result),
    }

    // Cleanup
    let closed = registry.close_all(true);
    info!(component = "main", "Closed {} client sessions", closed);
    pool.shutdown(ShutdownMode::Graceful).await;
    heartbeat.abort();
    reaper.abort();

    info!("Connection manager stopped");
    Ok(())
}

/// Pick the stream upgrader for client STARTTLS and backend links
fn build_upgrader(config: &CmConfig) -> anyhow::Result<Arc<dyn StreamUpgrader>> {
    let wants_tls = config.clients.tls.is_configured() || !config.backend.tls_ca_file.is_empty();
    if !wants_tls {
        info!("TLS not configured; client STARTTLS will not be offered");
        return Ok(Arc::new(PlainTransport));
    }

    #[cfg(not(feature = "tls"))]
    {
        anyhow::bail!("TLS files configured but not compiled with TLS support. Build with --features tls");
    }

    #[cfg(feature = "tls")]
    {
        use anyhow::Context;
        use cm_session::tls::{make_client_config, make_server_config, RustlsUpgrader};

        let server = if config.clients.tls.is_configured() {
            let cert = std::fs::read_to_string(&config.clients.tls.cert_file)
                .with_context(|| format!("Failed to read {}", config.clients.tls.cert_file))?;
            let key = std::fs::read_to_string(&config.clients.tls.key_file)
                .with_context(|| format!("Failed to read {}", config.clients.tls.key_file))?;
            Some(make_server_config(&cert, &key)?)
        } else {
            None
        };

        let client = if config.backend.tls_ca_file.is_empty() {
            None
        } else {
            let ca = std::fs::read_to_string(&config.backend.tls_ca_file)
                .with_context(|| format!("Failed to read {}", config.backend.tls_ca_file))?;
            Some(make_client_config(&ca)?)
        };

        Ok(Arc::new(RustlsUpgrader::new(server, client)))
    }
}
