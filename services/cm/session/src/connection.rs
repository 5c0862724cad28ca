//! Socket driver for client connections.
//!
//! One task per accepted socket: it reads bytes into the stream parser, feeds
//! tokens to the [`ClientHandler`], writes whatever the session queued for the
//! client, waits on SASL verdicts, and enforces the idle timeout.

use async_trait::async_trait;
use bytes::BytesMut;
use cm_wire::{StreamErrorCondition, StreamParser};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{ClientConnection, ClientHandler, Flow};
use crate::context::MultiplexerContext;
use crate::session::SaslVerdict;
use crate::transport::{IoStream, StreamUpgrader};

/// A client socket plus its negotiated layers
pub struct SocketConnection {
    stream: Option<IoStream>,
    upgrader: Arc<dyn StreamUpgrader>,
    secure: bool,
    compressed: bool,
}

impl SocketConnection {
    /// Wrap an accepted stream
    pub fn new(stream: IoStream, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        Self {
            stream: Some(stream),
            upgrader,
            secure: false,
            compressed: false,
        }
    }

    /// Read more bytes into `buf`; 0 means the peer closed
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_buf(buf).await,
            None => Ok(0),
        }
    }

    fn take_stream(&mut self) -> anyhow::Result<IoStream> {
        self.stream
            .take()
            .ok_or_else(|| anyhow::anyhow!("connection already closed"))
    }
}

#[async_trait]
impl ClientConnection for SocketConnection {
    async fn send(&mut self, data: &str) -> std::io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        stream.write_all(data.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_tls(&mut self) -> anyhow::Result<()> {
        let stream = self.take_stream()?;
        self.stream = Some(self.upgrader.accept_tls(stream).await?);
        self.secure = true;
        Ok(())
    }

    async fn start_compression(&mut self) -> anyhow::Result<()> {
        let stream = self.take_stream()?;
        self.stream = Some(self.upgrader.compress(stream).await?);
        self.compressed = true;
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn can_compress(&self) -> bool {
        self.upgrader.supports_compression()
    }

    async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

struct PendingSasl {
    verdict: oneshot::Receiver<SaslVerdict>,
    deadline: Instant,
}

enum SaslWait {
    Verdict(SaslVerdict),
    Dropped,
    TimedOut,
}

async fn next_verdict(pending: &mut Option<PendingSasl>) -> SaslWait {
    match pending {
        Some(p) => match timeout_at(p.deadline, &mut p.verdict).await {
            Ok(Ok(verdict)) => SaslWait::Verdict(verdict),
            Ok(Err(_)) => SaslWait::Dropped,
            Err(_) => SaslWait::TimedOut,
        },
        None => std::future::pending().await,
    }
}

/// Drive one client connection until it closes
pub async fn run_client(ctx: Arc<MultiplexerContext>, stream: IoStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "local".to_string());
    debug!("Client connection from {}", peer);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = SocketConnection::new(stream, ctx.upgrader.clone());
    let mut handler = ClientHandler::new(ctx.clone(), tx);
    let mut parser = StreamParser::with_max_size(ctx.settings.max_stanza_size);
    let mut sasl: Option<PendingSasl> = None;
    let idle_timeout = ctx.settings.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;

    loop {
        if sasl.is_none() {
            match drain_tokens(&mut parser, &mut handler, &mut conn, &peer).await {
                Drained::NeedInput => {}
                Drained::AwaitSasl => {
                    if let Some(verdict) = handler.take_sasl_waiter() {
                        sasl = Some(PendingSasl {
                            verdict,
                            deadline: Instant::now() + ctx.settings.sasl_timeout,
                        });
                    }
                }
                Drained::Close => break,
            }
        }

        tokio::select! {
            biased;

            Some(outbound) = rx.recv() => {
                if handler.write_outbound(&mut conn, outbound).await == Flow::Close {
                    break;
                }
            }

            wait = next_verdict(&mut sasl), if sasl.is_some() => {
                sasl = None;
                let flow = match wait {
                    SaslWait::Verdict(verdict) => handler.on_sasl_verdict(verdict),
                    // The session closed; its close request is already queued
                    SaslWait::Dropped => Flow::Continue,
                    SaslWait::TimedOut => handler.on_sasl_timeout(&mut conn).await,
                };
                if flow == Flow::Close {
                    break;
                }
            }

            read = conn.read_buf(parser.buffer_mut()), if sasl.is_none() => {
                match read {
                    Ok(0) => {
                        debug!("Client {} disconnected", peer);
                        break;
                    }
                    Ok(n) => {
                        debug!("Read {} bytes from {}", n, peer);
                        idle_deadline = Instant::now() + idle_timeout;
                    }
                    Err(e) => {
                        debug!("Read error from {}: {}", peer, e);
                        break;
                    }
                }
            }

            _ = sleep_until(idle_deadline), if sasl.is_none() => {
                info!("Idle timeout reached for {}; closing", peer);
                handler
                    .close_with(&mut conn, StreamErrorCondition::ConnectionTimeout)
                    .await;
                break;
            }
        }
    }

    // Cleanup
    conn.shutdown().await;
    handler.teardown(&mut rx).await;
    debug!("Client connection from {} ended", peer);
}

enum Drained {
    NeedInput,
    AwaitSasl,
    Close,
}

/// Hand every complete buffered token to the handler
async fn drain_tokens(
    parser: &mut StreamParser,
    handler: &mut ClientHandler,
    conn: &mut SocketConnection,
    peer: &str,
) -> Drained {
    loop {
        let flow = match parser.next_token() {
            Ok(Some(token)) => handler.handle(conn, token).await,
            Ok(None) => return Drained::NeedInput,
            Err(e) => {
                warn!("Malformed input from {}: {}", peer, e);
                handler
                    .close_with(conn, StreamErrorCondition::NotWellFormed)
                    .await;
                return Drained::Close;
            }
        };
        match flow {
            Flow::Continue => {}
            // Bytes read before the upgrade belong to the old layer
            Flow::Restart => parser.reset(),
            Flow::AwaitSasl => return Drained::AwaitSasl,
            Flow::Close => return Drained::Close,
        }
    }
}

/// Accept client sockets and spawn a driver for each
pub async fn serve_clients(ctx: Arc<MultiplexerContext>, listener: TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!("Accepting client connections on {}", addr),
        Err(e) => warn!("Client listener has no local address: {}", e),
    }
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                tokio::spawn(run_client(ctx.clone(), IoStream::Plain(socket)));
            }
            Err(e) => {
                error!("Failed to accept client connection: {}", e);
            }
        }
    }
}
