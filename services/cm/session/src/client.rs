//! Per-client protocol state machine.
//!
//! [`ClientHandler`] consumes stream tokens from one client and decides what
//! is handled locally (stream open, STARTTLS, compression, SASL bridging) and
//! what is forwarded to the backend. It is transport-agnostic: all I/O goes
//! through a [`ClientConnection`], and the socket driver in
//! [`crate::connection`] feeds it tokens and outbound work.

use async_trait::async_trait;
use cm_wire::{
    client_stream_header, is_stream_header, ns, Element, StreamErrorCondition, StreamToken,
    XmppVersion, STREAM_CLOSE,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::escalate_undeliverable;
use crate::context::MultiplexerContext;
use crate::features::COMPRESSION_METHOD;
use crate::policy::{CompressionPolicy, TlsPolicy};
use crate::session::{ClientOutbound, SaslVerdict, Session};

/// Default language when the client's stream header carries none
pub const DEFAULT_LANGUAGE: &str = "en";

/// I/O surface the state machine drives
#[async_trait]
pub trait ClientConnection: Send {
    /// Write raw XML to the client
    async fn send(&mut self, data: &str) -> std::io::Result<()>;

    /// Secure the transport in place (server side)
    async fn start_tls(&mut self) -> anyhow::Result<()>;

    /// Layer compression over the transport
    async fn start_compression(&mut self) -> anyhow::Result<()>;

    /// True once TLS is active
    fn is_secure(&self) -> bool;

    /// True once compression is active
    fn is_compressed(&self) -> bool;

    /// True if a compression codec is available
    fn can_compress(&self) -> bool;

    /// Close the transport
    async fn shutdown(&mut self);
}

/// Negotiation state of one client stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Waiting for an opening stream tag
    StreamStart,
    /// Stream open, not authenticated
    Negotiating,
    /// Stream open and authenticated
    Established,
    /// Terminal
    Closed,
}

/// What the driver must do after a token was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// The transport was upgraded; discard parser state
    Restart,
    /// Stop reading until the backend's SASL verdict arrives
    AwaitSasl,
    /// Close the connection
    Close,
}

/// Protocol state machine for one client connection
pub struct ClientHandler {
    ctx: Arc<MultiplexerContext>,
    outbound: mpsc::UnboundedSender<ClientOutbound>,
    state: ProtocolState,
    session: Option<Arc<Session>>,
    sasl_in_progress: bool,
    pending_verdict: Option<oneshot::Receiver<SaslVerdict>>,
}

impl ClientHandler {
    /// Create a handler; sessions it creates send their output to `outbound`
    pub fn new(
        ctx: Arc<MultiplexerContext>,
        outbound: mpsc::UnboundedSender<ClientOutbound>,
    ) -> Self {
        Self {
            ctx,
            outbound,
            state: ProtocolState::StreamStart,
            session: None,
            sasl_in_progress: false,
            pending_verdict: None,
        }
    }

    /// Current negotiation state
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The session, once the first stream header was accepted
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// True while a SASL exchange is bridged to the backend
    pub fn sasl_in_progress(&self) -> bool {
        self.sasl_in_progress
    }

    /// Receiver for the verdict armed by the last SASL forward
    pub fn take_sasl_waiter(&mut self) -> Option<oneshot::Receiver<SaslVerdict>> {
        self.pending_verdict.take()
    }

    /// Handle one token read from the client
    pub async fn handle(&mut self, conn: &mut dyn ClientConnection, token: StreamToken) -> Flow {
        if self.state == ProtocolState::Closed {
            return Flow::Close;
        }
        match token {
            StreamToken::Open(header) => self.on_stream_open(conn, header).await,
            StreamToken::Stanza(stanza) => self.on_stanza(conn, stanza).await,
            StreamToken::Close => {
                debug!("Client closed stream {:?}", self.stream_id());
                let _ = conn.send(STREAM_CLOSE).await;
                self.state = ProtocolState::Closed;
                Flow::Close
            }
        }
    }

    async fn on_stream_open(&mut self, conn: &mut dyn ClientConnection, header: Element) -> Flow {
        if self.state != ProtocolState::StreamStart {
            return self.close_with(conn, StreamErrorCondition::BadFormat).await;
        }

        if !is_stream_header(&header) || header.get_attr("xmlns") != Some(ns::CLIENT) {
            warn!(
                "Closing client stream with bad namespace prefix: {:?}",
                header.get_attr("xmlns")
            );
            return self
                .reject_open(conn, StreamErrorCondition::BadNamespacePrefix)
                .await;
        }

        let settings = &self.ctx.settings;
        if let Some(host) = header.get_attr("to") {
            if settings.validate_host && host != settings.server_name {
                warn!("Closing client stream for unknown host {}", host);
                return self.reject_open(conn, StreamErrorCondition::HostUnknown).await;
            }
        }

        let session = match &self.session {
            Some(session) => session.clone(),
            None => match self.create_session(&header).await {
                Some(session) => session,
                None => {
                    return self
                        .reject_open(conn, StreamErrorCondition::InternalServerError)
                        .await
                }
            },
        };

        let mut reply = client_stream_header(
            session.server_name(),
            session.stream_id(),
            session.language(),
            session.version(),
        );
        if session.version().major >= 1 {
            let policy = self.ctx.policy.load();
            reply.push_str(
                &session
                    .available_features(
                        &policy,
                        conn.is_secure(),
                        conn.can_compress() && !conn.is_compressed(),
                    )
                    .to_xml(),
            );
        }
        if conn.send(&reply).await.is_err() {
            return Flow::Close;
        }

        self.state = if session.is_authenticated() {
            ProtocolState::Established
        } else {
            ProtocolState::Negotiating
        };
        Flow::Continue
    }

    async fn create_session(&mut self, header: &Element) -> Option<Arc<Session>> {
        let version = XmppVersion::negotiate(
            XmppVersion::parse(header.get_attr("version")),
            XmppVersion::MAX,
        );
        let language = header
            .get_attr("xml:lang")
            .filter(|lang| !lang.is_empty())
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string();
        let server_name = self.ctx.settings.server_name.clone();
        let outbound = self.outbound.clone();

        let session = match self.ctx.registry.register_new(&self.ctx.ids, |id| {
            Session::socket(
                id,
                server_name.clone(),
                version,
                language.clone(),
                outbound.clone(),
            )
        }) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to register client session: {}", e);
                return None;
            }
        };

        info!(
            "Client session {} opened (version {}, lang {})",
            session.stream_id(),
            version,
            session.language()
        );
        self.ctx
            .backend
            .notify_session_created(session.stream_id())
            .await;
        self.session = Some(session.clone());
        Some(session)
    }

    async fn on_stanza(&mut self, conn: &mut dyn ClientConnection, stanza: Element) -> Flow {
        let session = match (&self.session, self.state) {
            (Some(session), ProtocolState::Negotiating | ProtocolState::Established) => {
                session.clone()
            }
            _ => {
                debug!("Stanza <{}> arrived before the stream was open", stanza.name());
                return self.close_with(conn, StreamErrorCondition::BadFormat).await;
            }
        };

        if self.sasl_in_progress {
            return self.forward_sasl(&session, stanza).await;
        }

        match (stanza.name(), stanza.ns()) {
            ("starttls", Some(ns::TLS)) => self.on_starttls(conn).await,
            ("auth", Some(ns::SASL)) => {
                if self.tls_required_unsatisfied(conn) {
                    return self.close_with(conn, StreamErrorCondition::NotAuthorized).await;
                }
                self.sasl_in_progress = true;
                self.forward_sasl(&session, stanza).await
            }
            ("compress", Some(ns::COMPRESS_PROTOCOL)) => self.on_compress(conn, &stanza).await,
            _ => {
                if self.tls_required_unsatisfied(conn) {
                    return self.close_with(conn, StreamErrorCondition::NotAuthorized).await;
                }
                self.ctx.backend.route(stanza, session.stream_id()).await;
                Flow::Continue
            }
        }
    }

    fn tls_required_unsatisfied(&self, conn: &dyn ClientConnection) -> bool {
        self.ctx.policy.load().tls == TlsPolicy::Required && !conn.is_secure()
    }

    async fn forward_sasl(&mut self, session: &Arc<Session>, stanza: Element) -> Flow {
        // Armed before routing; the verdict may race the forward
        self.pending_verdict = session.arm_sasl_waiter();
        self.ctx.backend.route(stanza, session.stream_id()).await;
        Flow::AwaitSasl
    }

    async fn on_starttls(&mut self, conn: &mut dyn ClientConnection) -> Flow {
        if self.ctx.policy.load().tls == TlsPolicy::Disabled || conn.is_secure() {
            return self.close_with(conn, StreamErrorCondition::NotAuthorized).await;
        }

        let proceed = Element::with_ns("proceed", ns::TLS).to_xml();
        if conn.send(&proceed).await.is_err() {
            return Flow::Close;
        }
        if let Err(e) = conn.start_tls().await {
            warn!("TLS negotiation failed for {:?}: {:#}", self.stream_id(), e);
            let _ = conn
                .send(&Element::with_ns("failure", ns::TLS).to_xml())
                .await;
            self.state = ProtocolState::Closed;
            return Flow::Close;
        }

        debug!("Stream {:?} secured", self.stream_id());
        self.state = ProtocolState::StreamStart;
        Flow::Restart
    }

    async fn on_compress(&mut self, conn: &mut dyn ClientConnection, request: &Element) -> Flow {
        let policy = self.ctx.policy.load();
        if policy.compression == CompressionPolicy::Disabled
            || conn.is_compressed()
            || !conn.can_compress()
        {
            return self.compression_failure(conn, "setup-failed").await;
        }

        let method = request.find("method").map(|m| m.text());
        if method.as_deref() != Some(COMPRESSION_METHOD) {
            return self.compression_failure(conn, "unsupported-method").await;
        }

        let compressed = Element::with_ns("compressed", ns::COMPRESS_PROTOCOL).to_xml();
        if conn.send(&compressed).await.is_err() {
            return Flow::Close;
        }
        if let Err(e) = conn.start_compression().await {
            warn!("Compression failed for {:?}: {:#}", self.stream_id(), e);
            self.state = ProtocolState::Closed;
            return Flow::Close;
        }

        self.state = ProtocolState::StreamStart;
        Flow::Restart
    }

    async fn compression_failure(&mut self, conn: &mut dyn ClientConnection, condition: &str) -> Flow {
        let failure =
            Element::with_ns("failure", ns::COMPRESS_PROTOCOL).child(Element::new(condition));
        match conn.send(&failure.to_xml()).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close,
        }
    }

    /// Apply the backend's SASL verdict
    pub fn on_sasl_verdict(&mut self, verdict: SaslVerdict) -> Flow {
        debug!("SASL verdict for {:?}: {:?}", self.stream_id(), verdict);
        match verdict {
            SaslVerdict::Success => {
                self.sasl_in_progress = false;
                self.state = ProtocolState::StreamStart;
            }
            SaslVerdict::Failure => self.sasl_in_progress = false,
            SaslVerdict::Challenge => {}
        }
        Flow::Continue
    }

    /// The backend did not answer the SASL exchange in time
    pub async fn on_sasl_timeout(&mut self, conn: &mut dyn ClientConnection) -> Flow {
        warn!("SASL verdict for {:?} timed out", self.stream_id());
        self.close_with(conn, StreamErrorCondition::ConnectionTimeout).await
    }

    /// Write queued output to the client
    pub async fn write_outbound(
        &mut self,
        conn: &mut dyn ClientConnection,
        outbound: ClientOutbound,
    ) -> Flow {
        match outbound {
            ClientOutbound::Stanza(stanza) => {
                if let Err(e) = conn.send(&stanza.to_xml()).await {
                    debug!("Write to client {:?} failed: {}", self.stream_id(), e);
                    if let Some(stream_id) = self.stream_id() {
                        escalate_undeliverable(self.ctx.backend.as_ref(), stanza, &stream_id).await;
                    }
                    self.state = ProtocolState::Closed;
                    return Flow::Close;
                }
                Flow::Continue
            }
            ClientOutbound::Close { system_stopped } => {
                if system_stopped {
                    self.close_with(conn, StreamErrorCondition::SystemShutdown).await
                } else {
                    let _ = conn.send(STREAM_CLOSE).await;
                    self.state = ProtocolState::Closed;
                    Flow::Close
                }
            }
        }
    }

    /// Emit a stream error followed by the closing tag
    pub async fn close_with(
        &mut self,
        conn: &mut dyn ClientConnection,
        condition: StreamErrorCondition,
    ) -> Flow {
        let mut out = condition.to_element().to_xml();
        out.push_str(STREAM_CLOSE);
        let _ = conn.send(&out).await;
        self.state = ProtocolState::Closed;
        Flow::Close
    }

    async fn reject_open(
        &mut self,
        conn: &mut dyn ClientConnection,
        condition: StreamErrorCondition,
    ) -> Flow {
        let id = format!("{:x}", rand::random::<u32>());
        let mut out =
            client_stream_header(&self.ctx.settings.server_name, &id, DEFAULT_LANGUAGE, XmppVersion::MAX);
        out.push_str(&condition.to_element().to_xml());
        out.push_str(STREAM_CLOSE);
        let _ = conn.send(&out).await;
        self.state = ProtocolState::Closed;
        Flow::Close
    }

    fn stream_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.stream_id().to_string())
    }

    /// End the session once the connection is gone.
    ///
    /// Marks the session closed, escalates stanzas still queued for the
    /// client, unregisters it and tells the backend. Runs at most once.
    pub async fn teardown(&mut self, outbound: &mut mpsc::UnboundedReceiver<ClientOutbound>) {
        self.state = ProtocolState::Closed;
        let Some(session) = self.session.take() else {
            return;
        };
        session.close(false);

        outbound.close();
        while let Ok(pending) = outbound.try_recv() {
            if let ClientOutbound::Stanza(stanza) = pending {
                escalate_undeliverable(self.ctx.backend.as_ref(), stanza, session.stream_id())
                    .await;
            }
        }

        self.ctx.registry.unregister(session.stream_id());
        self.ctx
            .backend
            .notify_session_closed(session.stream_id())
            .await;
        info!("Client session {} closed", session.stream_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ClientPolicy;
    use crate::testing::{test_context, BackendCall, MockConnection, RecordingBackend};
    use cm_wire::parse_element;

    const OPEN: &str = "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
                        xmlns='jabber:client' to='example.com' version='1.0'>";

    fn header(xml: &str) -> Element {
        let mut parser = cm_wire::StreamParser::new();
        parser.feed(xml.as_bytes());
        match parser.next_token().unwrap() {
            Some(StreamToken::Open(header)) => header,
            other => panic!("expected stream header, got {:?}", other),
        }
    }

    fn setup(
        policy: ClientPolicy,
    ) -> (
        ClientHandler,
        mpsc::UnboundedReceiver<ClientOutbound>,
        Arc<RecordingBackend>,
        Arc<MultiplexerContext>,
    ) {
        let backend = Arc::new(RecordingBackend::default());
        let ctx = test_context(backend.clone(), policy);
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandler::new(ctx.clone(), tx), rx, backend, ctx)
    }

    async fn open(handler: &mut ClientHandler, conn: &mut MockConnection) {
        let flow = handler.handle(conn, StreamToken::Open(header(OPEN))).await;
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn test_stream_open_creates_session_and_features() {
        let (mut handler, _rx, backend, ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;

        let session = handler.session().unwrap().clone();
        assert!(session.stream_id().starts_with("cm"));
        assert!(ctx.registry.lookup(session.stream_id()).is_some());
        assert_eq!(handler.state(), ProtocolState::Negotiating);
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Created(session.stream_id().to_string())]
        );

        let sent = conn.output();
        assert!(sent.contains(&format!("id=\"{}\"", session.stream_id())));
        assert!(sent.contains("version=\"1.0\""));
        assert!(sent.contains("xml:lang=\"en\""));
        assert!(sent.contains("<stream:features"));
    }

    #[tokio::test]
    async fn test_legacy_client_gets_no_features() {
        let (mut handler, _rx, _backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        let legacy = "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
                      xmlns='jabber:client' xml:lang='de'>";
        handler
            .handle(&mut conn, StreamToken::Open(header(legacy)))
            .await;

        let sent = conn.output();
        assert!(sent.starts_with("<?xml version='1.0'"));
        assert!(!sent.contains(" version=\""));
        assert!(!sent.contains("stream:features"));
        assert!(sent.contains("xml:lang=\"de\""));
    }

    #[tokio::test]
    async fn test_bad_namespace_is_rejected() {
        let (mut handler, _rx, backend, ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        let bad = "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
                   xmlns='jabber:server' version='1.0'>";
        let flow = handler.handle(&mut conn, StreamToken::Open(header(bad))).await;

        assert_eq!(flow, Flow::Close);
        assert!(conn.output().contains("bad-namespace-prefix"));
        assert!(conn.output().ends_with(STREAM_CLOSE));
        assert!(ctx.registry.is_empty());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_host_validation() {
        let backend = Arc::new(RecordingBackend::default());
        let mut ctx = crate::testing::test_context_inner(backend, ClientPolicy::default());
        ctx.settings.validate_host = true;
        ctx.settings.server_name = "other.org".to_string();
        let ctx = Arc::new(ctx);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handler = ClientHandler::new(ctx.clone(), tx);
        let mut conn = MockConnection::default();

        let flow = handler.handle(&mut conn, StreamToken::Open(header(OPEN))).await;
        assert_eq!(flow, Flow::Close);
        assert!(conn.output().contains("host-unknown"));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_stanza_before_open_is_bad_format() {
        let (mut handler, _rx, backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        let flow = handler
            .handle(&mut conn, StreamToken::Stanza(Element::new("presence")))
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(conn.output().contains("bad-format"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tls_required_rejects_stanza_exactly_once() {
        let policy = ClientPolicy {
            tls: TlsPolicy::Required,
            ..ClientPolicy::default()
        };
        let (mut handler, _rx, backend, _ctx) = setup(policy);
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        conn.clear();

        let message = parse_element("<message to='bob@example.com'><body>hi</body></message>").unwrap();
        let flow = handler.handle(&mut conn, StreamToken::Stanza(message.clone())).await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(conn.output().matches("not-authorized").count(), 1);

        // Nothing after close reaches the backend
        let flow = handler.handle(&mut conn, StreamToken::Stanza(message)).await;
        assert_eq!(flow, Flow::Close);
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Route(..))));
    }

    #[tokio::test]
    async fn test_starttls_upgrade_and_restart() {
        let policy = ClientPolicy {
            tls: TlsPolicy::Required,
            ..ClientPolicy::default()
        };
        let (mut handler, _rx, _backend, _ctx) = setup(policy);
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        assert!(conn.output().contains("<required/>"));
        conn.clear();

        let starttls = Element::with_ns("starttls", ns::TLS);
        let flow = handler.handle(&mut conn, StreamToken::Stanza(starttls)).await;
        assert_eq!(flow, Flow::Restart);
        assert!(conn.secure);
        assert!(conn.output().contains("<proceed"));
        assert_eq!(handler.state(), ProtocolState::StreamStart);
        conn.clear();

        let id = handler.session().unwrap().stream_id().to_string();
        open(&mut handler, &mut conn).await;
        assert_eq!(handler.session().unwrap().stream_id(), id);
        assert!(!conn.output().contains("starttls"));
    }

    #[tokio::test]
    async fn test_starttls_when_disabled_closes() {
        let (mut handler, _rx, _backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;

        let flow = handler
            .handle(&mut conn, StreamToken::Stanza(Element::with_ns("starttls", ns::TLS)))
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(conn.output().contains("not-authorized"));
        assert!(!conn.secure);
    }

    #[tokio::test]
    async fn test_failed_tls_upgrade_sends_failure() {
        let policy = ClientPolicy {
            tls: TlsPolicy::Optional,
            ..ClientPolicy::default()
        };
        let (mut handler, _rx, _backend, _ctx) = setup(policy);
        let mut conn = MockConnection {
            fail_tls: true,
            ..MockConnection::default()
        };
        open(&mut handler, &mut conn).await;
        conn.clear();

        let flow = handler
            .handle(&mut conn, StreamToken::Stanza(Element::with_ns("starttls", ns::TLS)))
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(conn.output().contains("<failure xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>"));
    }

    #[tokio::test]
    async fn test_sasl_round_trip() {
        let (mut handler, _rx, backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        let session = handler.session().unwrap().clone();

        let auth = parse_element(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGE=</auth>",
        )
        .unwrap();
        assert_eq!(
            handler.handle(&mut conn, StreamToken::Stanza(auth)).await,
            Flow::AwaitSasl
        );
        assert!(handler.sasl_in_progress());
        let waiter = handler.take_sasl_waiter().unwrap();

        session
            .deliver(parse_element("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").unwrap())
            .unwrap();
        let verdict = waiter.await.unwrap();
        assert_eq!(handler.on_sasl_verdict(verdict), Flow::Continue);
        assert!(handler.sasl_in_progress());

        let response =
            parse_element("<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>xyz</response>").unwrap();
        assert_eq!(
            handler.handle(&mut conn, StreamToken::Stanza(response)).await,
            Flow::AwaitSasl
        );
        let waiter = handler.take_sasl_waiter().unwrap();
        session
            .deliver(parse_element("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").unwrap())
            .unwrap();
        let verdict = waiter.await.unwrap();
        handler.on_sasl_verdict(verdict);

        assert!(!handler.sasl_in_progress());
        assert!(session.is_authenticated());
        assert_eq!(handler.state(), ProtocolState::StreamStart);

        conn.clear();
        open(&mut handler, &mut conn).await;
        assert_eq!(handler.state(), ProtocolState::Established);
        assert!(conn.output().contains("urn:ietf:params:xml:ns:xmpp-bind"));
        assert!(!conn.output().contains("mechanisms"));

        let routed = backend
            .calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::Route(..)))
            .count();
        assert_eq!(routed, 2);
    }

    #[tokio::test]
    async fn test_sasl_failure_allows_retry() {
        let (mut handler, _rx, _backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;

        let auth = Element::with_ns("auth", ns::SASL).attr("mechanism", "PLAIN");
        handler.handle(&mut conn, StreamToken::Stanza(auth.clone())).await;
        handler.on_sasl_verdict(SaslVerdict::Failure);
        assert!(!handler.sasl_in_progress());
        assert_eq!(handler.state(), ProtocolState::Negotiating);

        assert_eq!(
            handler.handle(&mut conn, StreamToken::Stanza(auth)).await,
            Flow::AwaitSasl
        );
    }

    #[tokio::test]
    async fn test_sasl_timeout_closes() {
        let (mut handler, _rx, _backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        assert_eq!(handler.on_sasl_timeout(&mut conn).await, Flow::Close);
        assert!(conn.output().contains("connection-timeout"));
    }

    fn compression_policy() -> ClientPolicy {
        ClientPolicy {
            compression: CompressionPolicy::Optional,
            ..ClientPolicy::default()
        }
    }

    fn compress(method: &str) -> Element {
        Element::with_ns("compress", ns::COMPRESS_PROTOCOL)
            .child(Element::new("method").text_node(method))
    }

    #[tokio::test]
    async fn test_compression_offered_only_with_codec() {
        let (mut handler, _rx, _backend, _ctx) = setup(compression_policy());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        assert!(!conn.output().contains("<compression"));

        let (mut handler, _rx, _backend, _ctx) = setup(compression_policy());
        let mut conn = MockConnection {
            codec: true,
            ..MockConnection::default()
        };
        open(&mut handler, &mut conn).await;
        assert!(conn.output().contains("<compression"));
    }

    #[tokio::test]
    async fn test_compress_success_restarts() {
        let (mut handler, _rx, _backend, _ctx) = setup(compression_policy());
        let mut conn = MockConnection {
            codec: true,
            ..MockConnection::default()
        };
        open(&mut handler, &mut conn).await;
        conn.clear();

        let flow = handler.handle(&mut conn, StreamToken::Stanza(compress("zlib"))).await;
        assert_eq!(flow, Flow::Restart);
        assert!(conn.compressed);
        assert!(conn.output().contains("<compressed"));
    }

    #[tokio::test]
    async fn test_compress_while_compressed_is_setup_failed() {
        let (mut handler, _rx, _backend, _ctx) = setup(compression_policy());
        let mut conn = MockConnection {
            codec: true,
            compressed: true,
            ..MockConnection::default()
        };
        open(&mut handler, &mut conn).await;
        conn.clear();

        let flow = handler.handle(&mut conn, StreamToken::Stanza(compress("zlib"))).await;
        assert_eq!(flow, Flow::Continue);
        assert!(conn.output().contains("setup-failed"));
        assert!(conn.compressed);
        assert_eq!(conn.compressions, 0);
        assert_eq!(handler.state(), ProtocolState::Negotiating);
    }

    #[tokio::test]
    async fn test_compress_unsupported_method_and_disabled_policy() {
        let (mut handler, _rx, _backend, _ctx) = setup(compression_policy());
        let mut conn = MockConnection {
            codec: true,
            ..MockConnection::default()
        };
        open(&mut handler, &mut conn).await;
        conn.clear();
        handler.handle(&mut conn, StreamToken::Stanza(compress("lzw"))).await;
        assert!(conn.output().contains("unsupported-method"));

        let (mut handler, _rx, _backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection {
            codec: true,
            ..MockConnection::default()
        };
        open(&mut handler, &mut conn).await;
        conn.clear();
        handler.handle(&mut conn, StreamToken::Stanza(compress("zlib"))).await;
        assert!(conn.output().contains("setup-failed"));
        assert!(!conn.compressed);
    }

    #[tokio::test]
    async fn test_established_stanzas_are_routed_with_stream_id() {
        let (mut handler, _rx, backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        let id = handler.session().unwrap().stream_id().to_string();

        let presence = Element::new("presence");
        assert_eq!(
            handler.handle(&mut conn, StreamToken::Stanza(presence.clone())).await,
            Flow::Continue
        );
        assert!(backend
            .calls()
            .contains(&BackendCall::Route(presence, id)));
    }

    #[tokio::test]
    async fn test_teardown_runs_once_and_escalates_queue() {
        let (mut handler, mut rx, backend, ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        let session = handler.session().unwrap().clone();
        let id = session.stream_id().to_string();

        session.deliver(Element::new("message").attr("id", "m1")).unwrap();
        handler.teardown(&mut rx).await;
        handler.teardown(&mut rx).await;

        assert!(session.is_closed());
        assert!(ctx.registry.lookup(&id).is_none());
        let calls = backend.calls();
        assert_eq!(
            calls.iter().filter(|c| matches!(c, BackendCall::Closed(_))).count(),
            1
        );
        assert!(calls
            .iter()
            .any(|c| matches!(c, BackendCall::DeliveryFailed(m, sid) if m.get_attr("id") == Some("m1") && *sid == id)));
    }

    #[tokio::test]
    async fn test_system_stopped_close_sends_shutdown_error() {
        let (mut handler, _rx, _backend, _ctx) = setup(ClientPolicy::default());
        let mut conn = MockConnection::default();
        open(&mut handler, &mut conn).await;
        conn.clear();

        let flow = handler
            .write_outbound(&mut conn, ClientOutbound::Close { system_stopped: true })
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(conn.output().contains("system-shutdown"));
        assert!(conn.output().ends_with(STREAM_CLOSE));
    }
}
