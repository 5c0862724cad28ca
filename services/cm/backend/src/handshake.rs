//! Component handshake with the backend.
//!
//! Each worker connection goes through the same negotiation before it can
//! carry traffic:
//!
//! ```text
//! TCP connect (resolved host, bounded by connect_timeout)
//!   -> <stream:stream xmlns="jabber:connectionmanager" to="manager/worker" version="1.0">
//!   <- stream header (id, version >= 1.0), <stream:features>
//!   [-> <starttls/> <- <proceed/>  TLS, restart stream]
//!   [-> <compress><method>zlib</method></compress> <- <compressed/>  restart stream]
//!   -> <handshake>hex(sha1(id ++ secret))</handshake>
//!   <- <handshake/>
//! ```
//!
//! Every read during negotiation is bounded by `handshake_timeout`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use cm_session::{CompressionPolicy, IoStream, StreamUpgrader, COMPRESSION_METHOD};
use cm_wire::{component_stream_header, ns, Element, StreamParser, StreamToken, XmppVersion};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::PoolError;

/// Where and how to reach the backend
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    /// Backend host name or address
    pub host: String,
    /// Backend component port
    pub port: u16,
    /// Manager name; first half of every worker JID
    pub manager_name: String,
    /// Shared secret; empty means no worker can authenticate
    pub password: String,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-read timeout while negotiating
    pub handshake_timeout: Duration,
    /// Whether backend links may be compressed
    pub compression: CompressionPolicy,
}

impl Default for BackendEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5262,
            manager_name: "cm".to_string(),
            password: String::new(),
            connect_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(7),
            compression: CompressionPolicy::Disabled,
        }
    }
}

/// A negotiated backend connection
#[derive(Debug)]
pub struct BackendStream {
    /// The (possibly secured and compressed) stream
    pub stream: IoStream,
    /// Parser holding any bytes read past the handshake
    pub parser: StreamParser,
    /// Stream id assigned by the backend
    pub stream_id: String,
    /// JID this worker authenticated as
    pub jid: String,
    /// TLS is active
    pub secure: bool,
    /// Compression is active
    pub compressed: bool,
}

/// Builds authenticated backend connections for the pool
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Connect and authenticate the worker called `worker_name`
    async fn connect(&self, worker_name: &str) -> Result<BackendStream>;
}

/// `hex(sha1(stream_id ++ secret))`
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Connector speaking the component protocol over TCP
pub struct XmppConnector {
    endpoint: BackendEndpoint,
    upgrader: Arc<dyn StreamUpgrader>,
}

impl XmppConnector {
    /// Create a connector
    pub fn new(endpoint: BackendEndpoint, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        Self { endpoint, upgrader }
    }

    async fn open_tcp(&self) -> Result<TcpStream> {
        let endpoint = &self.endpoint;
        let addrs: Vec<_> = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .with_context(|| format!("DNS lookup of {} failed", endpoint.host))?
            .collect();

        let mut last_error = anyhow!("{} did not resolve to any address", endpoint.host);
        for addr in addrs {
            debug!(
                "Trying to connect to {}:{} ({})",
                endpoint.host, endpoint.port, addr
            );
            match timeout(endpoint.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!("Plain connection to {} successful", addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = anyhow!(e).context(format!("connect to {} failed", addr)),
                Err(_) => last_error = anyhow!("connect to {} timed out", addr),
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl BackendConnector for XmppConnector {
    async fn connect(&self, worker_name: &str) -> Result<BackendStream> {
        let tcp = self.open_tcp().await?;
        negotiate(
            IoStream::Plain(tcp),
            &self.endpoint,
            self.upgrader.as_ref(),
            worker_name,
        )
        .await
    }
}

/// Run the component negotiation on an already connected stream
pub async fn negotiate(
    mut stream: IoStream,
    endpoint: &BackendEndpoint,
    upgrader: &dyn StreamUpgrader,
    worker_name: &str,
) -> Result<BackendStream> {
    if endpoint.password.is_empty() {
        bail!(PoolError::NoPassword);
    }

    let jid = format!("{}/{}", endpoint.manager_name, worker_name);
    let header = component_stream_header(&jid);
    let read_timeout = endpoint.handshake_timeout;
    let mut parser = StreamParser::new();

    stream.write_all(header.as_bytes()).await?;
    let (mut stream_id, mut features) = read_stream_start(&mut stream, &mut parser, read_timeout).await?;
    let mut secure = false;
    let mut compressed = false;

    if let Some(starttls) = features.find_ns("starttls", ns::TLS) {
        if upgrader.can_connect_tls() {
            debug!("Negotiating TLS with backend {}", endpoint.host);
            stream
                .write_all(Element::with_ns("starttls", ns::TLS).to_xml().as_bytes())
                .await?;
            let answer = read_element(&mut stream, &mut parser, read_timeout).await?;
            if answer.name() != "proceed" {
                bail!(PoolError::Rejected(format!("expected <proceed/>, got <{}>", answer.qualified_name())));
            }
            stream = upgrader.connect_tls(stream, &endpoint.host).await?;
            secure = true;
            parser.reset();
            stream.write_all(header.as_bytes()).await?;
            (stream_id, features) = read_stream_start(&mut stream, &mut parser, read_timeout).await?;
        } else if starttls.has_child("required") {
            bail!(PoolError::TlsRequired);
        } else {
            debug!("Backend offers TLS but it is not configured locally");
        }
    }

    if endpoint.compression == CompressionPolicy::Optional {
        if let Some(compression) = features.find_ns("compression", ns::COMPRESS_FEATURE) {
            let zlib = compression
                .children()
                .any(|method| method.name() == "method" && method.text().trim() == COMPRESSION_METHOD);
            if !zlib {
                bail!("backend compression does not offer {}", COMPRESSION_METHOD);
            }
            if upgrader.supports_compression() {
                let request = Element::with_ns("compress", ns::COMPRESS_PROTOCOL)
                    .child(Element::new("method").text_node(COMPRESSION_METHOD));
                stream.write_all(request.to_xml().as_bytes()).await?;
                let answer = read_element(&mut stream, &mut parser, read_timeout).await?;
                if answer.name() != "compressed" {
                    bail!(PoolError::Rejected("stream compression refused".to_string()));
                }
                stream = upgrader.compress(stream).await?;
                compressed = true;
                parser.reset();
                stream.write_all(header.as_bytes()).await?;
                (stream_id, _) = read_stream_start(&mut stream, &mut parser, read_timeout).await?;
            } else {
                debug!("Backend offers compression but no codec is available");
            }
        }
    }

    let digest = handshake_digest(&stream_id, &endpoint.password);
    stream
        .write_all(Element::new("handshake").text_node(digest).to_xml().as_bytes())
        .await?;
    let answer = read_element(&mut stream, &mut parser, read_timeout).await?;
    if answer.name() != "handshake" {
        warn!("Handshake failed for {} (stream {})", jid, stream_id);
        bail!(PoolError::Rejected(format!("<{}>", answer.qualified_name())));
    }

    info!(
        "Backend connection {} established (stream {}, tls: {}, compressed: {})",
        jid, stream_id, secure, compressed
    );
    Ok(BackendStream {
        stream,
        parser,
        stream_id,
        jid,
        secure,
        compressed,
    })
}

/// Read the backend's stream header and its features.
///
/// Returns the stream id and the features element.
async fn read_stream_start(
    stream: &mut IoStream,
    parser: &mut StreamParser,
    read_timeout: Duration,
) -> Result<(String, Element)> {
    let header = match read_token(stream, parser, read_timeout).await? {
        StreamToken::Open(header) => header,
        StreamToken::Stanza(stanza) => bail!("expected stream header, got <{}>", stanza.qualified_name()),
        StreamToken::Close => bail!(PoolError::Closed),
    };
    let stream_id = header
        .get_attr("id")
        .ok_or_else(|| anyhow!("backend stream header has no id"))?
        .to_string();
    let version = XmppVersion::parse(header.get_attr("version"));
    if version.major < 1 {
        bail!(PoolError::UnsupportedVersion(version.to_string()));
    }

    let features = read_element(stream, parser, read_timeout).await?;
    if features.name() == "error" {
        bail!(PoolError::StreamError(features.to_xml()));
    }
    Ok((stream_id, features))
}

async fn read_element(
    stream: &mut IoStream,
    parser: &mut StreamParser,
    read_timeout: Duration,
) -> Result<Element> {
    match read_token(stream, parser, read_timeout).await? {
        StreamToken::Stanza(element) => Ok(element),
        StreamToken::Open(_) => bail!("unexpected stream restart"),
        StreamToken::Close => bail!(PoolError::Closed),
    }
}

async fn read_token(
    stream: &mut IoStream,
    parser: &mut StreamParser,
    read_timeout: Duration,
) -> Result<StreamToken> {
    loop {
        if let Some(token) = parser.next_token()? {
            return Ok(token);
        }
        let read = timeout(read_timeout, stream.read_buf(parser.buffer_mut()))
            .await
            .map_err(|_| PoolError::Timeout(read_timeout))??;
        if read == 0 {
            bail!(PoolError::Closed);
        }
    }
}
