//! TCP and TLS transport for client and backend streams.
//!
//! [`IoStream`] unifies plain sockets, TLS sockets and layered streams (TLS
//! over an already wrapped stream, or a compression codec) behind one
//! `AsyncRead + AsyncWrite` type. [`StreamUpgrader`] is the seam through which
//! a stream is secured or compressed in place.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Any bidirectional byte stream usable as a transport layer
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Unified stream type for every transport layer
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Server-side TLS over TCP
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client-side TLS over TCP
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
    /// Layered or in-memory stream
    Boxed(Box<dyn AsyncStream>),
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            IoStream::Plain(_) => "Plain",
            #[cfg(feature = "tls")]
            IoStream::Tls(_) => "Tls",
            #[cfg(feature = "tls")]
            IoStream::TlsClient(_) => "TlsClient",
            IoStream::Boxed(_) => "Boxed",
        };
        f.debug_tuple("IoStream").field(&kind).finish()
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Boxed(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Boxed(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Wrap any stream, e.g. an in-memory duplex or a codec layer
    pub fn boxed<S: AsyncStream + 'static>(stream: S) -> Self {
        IoStream::Boxed(Box::new(stream))
    }

    /// Get the peer address of the underlying socket
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
            IoStream::Boxed(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "layered stream has no peer address",
            )),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Secures or compresses a stream in place.
///
/// Both client streams (server side of STARTTLS) and backend links (client
/// side) go through the same upgrader.
#[async_trait]
pub trait StreamUpgrader: Send + Sync {
    /// True if client streams can be secured
    fn can_accept_tls(&self) -> bool;

    /// True if backend links can be secured
    fn can_connect_tls(&self) -> bool;

    /// Run the server side of a TLS handshake on `stream`
    async fn accept_tls(&self, stream: IoStream) -> anyhow::Result<IoStream>;

    /// Run the client side of a TLS handshake on `stream`
    async fn connect_tls(&self, stream: IoStream, server_name: &str) -> anyhow::Result<IoStream>;

    /// True if a zlib codec is available
    fn supports_compression(&self) -> bool {
        false
    }

    /// Layer a zlib codec over `stream`
    async fn compress(&self, stream: IoStream) -> anyhow::Result<IoStream> {
        let _ = stream;
        anyhow::bail!("stream compression is not available")
    }
}

/// Upgrader with neither TLS nor compression
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

#[async_trait]
impl StreamUpgrader for PlainTransport {
    fn can_accept_tls(&self) -> bool {
        false
    }

    fn can_connect_tls(&self) -> bool {
        false
    }

    async fn accept_tls(&self, _stream: IoStream) -> anyhow::Result<IoStream> {
        anyhow::bail!("TLS is not configured")
    }

    async fn connect_tls(&self, _stream: IoStream, _server_name: &str) -> anyhow::Result<IoStream> {
        anyhow::bail!("TLS is not configured")
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// rustls-backed upgrader for client STARTTLS and backend links
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::{debug, info};

    /// Create a TLS server configuration for client STARTTLS
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig> {
        info!("Creating TLS server configuration for client streams");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = rustls_pemfile::certs(&mut cert_chain_pem.as_bytes())
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }

        let key = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))?;

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")
    }

    /// Create a TLS client configuration trusting the given CA bundle
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig> {
        info!("Creating TLS client configuration for backend links");

        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        for ca_cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
            roots
                .add(ca_cert.context("Failed to parse CA certificates")?)
                .context("Failed to add CA certificate to root store")?;
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Upgrader backed by rustls configurations
    #[derive(Clone, Default)]
    pub struct RustlsUpgrader {
        acceptor: Option<TlsAcceptor>,
        connector: Option<TlsConnector>,
    }

    impl RustlsUpgrader {
        /// Create an upgrader; either side may be absent
        pub fn new(server: Option<ServerConfig>, client: Option<ClientConfig>) -> Self {
            Self {
                acceptor: server.map(|config| TlsAcceptor::from(Arc::new(config))),
                connector: client.map(|config| TlsConnector::from(Arc::new(config))),
            }
        }
    }

    #[async_trait]
    impl StreamUpgrader for RustlsUpgrader {
        fn can_accept_tls(&self) -> bool {
            self.acceptor.is_some()
        }

        fn can_connect_tls(&self) -> bool {
            self.connector.is_some()
        }

        async fn accept_tls(&self, stream: IoStream) -> Result<IoStream> {
            let acceptor = self
                .acceptor
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("No server certificate configured"))?;
            debug!("Accepting TLS on {:?}", stream);
            let secured = match stream {
                IoStream::Plain(tcp) => IoStream::Tls(
                    acceptor.accept(tcp).await.context("TLS handshake failed")?,
                ),
                other => IoStream::boxed(
                    acceptor.accept(other).await.context("TLS handshake failed")?,
                ),
            };
            Ok(secured)
        }

        async fn connect_tls(&self, stream: IoStream, server_name: &str) -> Result<IoStream> {
            let connector = self
                .connector
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("No trust roots configured"))?;
            let sni = ServerName::try_from(server_name.to_owned())
                .map_err(|_| anyhow::anyhow!("Invalid server name: {}", server_name))?;
            debug!("Connecting via TLS to {} over {:?}", server_name, stream);
            let secured = match stream {
                IoStream::Plain(tcp) => IoStream::TlsClient(
                    connector
                        .connect(sni, tcp)
                        .await
                        .with_context(|| format!("TLS handshake failed with {}", server_name))?,
                ),
                other => IoStream::boxed(
                    connector
                        .connect(sni, other)
                        .await
                        .with_context(|| format!("TLS handshake failed with {}", server_name))?,
                ),
            };
            Ok(secured)
        }
    }
}
