//! Backend-to-client routing.
//!
//! Each backend connection has a reader that splits the stream into stanzas
//! and hands them to an [`InboundRouter`]. Stanzas that belong to a session
//! are appended to that session's lane and drained under the session's lane
//! lock, so one session sees its stanzas in arrival order however many are
//! processed concurrently. Everything else runs on any free permit.
//!
//! ## What the backend sends
//!
//! ```text
//! <route streamid=..>stanza</route>           deliver to the session (or bounce)
//! <iq type=set><session><close/></session>    close the session
//! <iq type=set><configuration/>               update client policy, ack
//! <iq type=error><session><create/></session> backend refused the session
//! <iq type=result>                            ignored
//! <stream:error><system-shutdown/>            close every session
//! ```

use cm_session::{escalate_undeliverable, BackendLink, PolicyCache, Session, SessionRegistry};
use cm_wire::{ns, Element, StreamParser, StreamToken};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::worker::WorkerHandle;

/// Pool-level reactions the router can trigger
pub trait BackendControl: Send + Sync {
    /// The backend announced `system-shutdown`
    fn backend_stopped(&self);
}

/// Collaborators shared by every connection's router
#[derive(Clone)]
pub struct RouterContext {
    /// Live sessions
    pub registry: Arc<SessionRegistry>,
    /// Client policy updated by configuration pushes
    pub policy: Arc<PolicyCache>,
    /// Where bounces and delivery failures go
    pub backend: Arc<dyn BackendLink>,
    /// Pool reactions
    pub control: Arc<dyn BackendControl>,
    /// Served domain
    pub domain: String,
}

/// Dispatches the stanzas read from one backend connection
pub struct InboundRouter {
    ctx: RouterContext,
    reply: WorkerHandle,
    permits: Arc<Semaphore>,
}

impl InboundRouter {
    /// Create the router for the connection behind `reply`, processing at most
    /// `concurrency` stanzas at a time
    pub fn new(ctx: RouterContext, reply: WorkerHandle, concurrency: usize) -> Self {
        Self {
            ctx,
            reply,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Connection this router reads for
    pub fn connection(&self) -> &WorkerHandle {
        &self.reply
    }

    fn session_for(&self, stanza: &Element) -> Option<Arc<Session>> {
        let stream_id = if stanza.name() == "route" {
            stanza.get_attr("streamid")
        } else {
            stanza.find("session").and_then(|wrapper| wrapper.get_attr("id"))
        }?;
        self.ctx.registry.lookup(stream_id)
    }

    /// Queue `stanza` for processing
    pub fn dispatch(self: &Arc<Self>, stanza: Element) {
        let router = self.clone();
        match self.session_for(&stanza) {
            Some(session) => {
                session.push_inbound(stanza);
                tokio::spawn(async move {
                    let Ok(_permit) = router.permits.clone().acquire_owned().await else {
                        return;
                    };
                    let _lane = session.lock_lane().await;
                    while let Some(stanza) = session.pop_inbound() {
                        router.handle(stanza).await;
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    let Ok(_permit) = router.permits.clone().acquire_owned().await else {
                        return;
                    };
                    router.handle(stanza).await;
                });
            }
        }
    }

    /// Process one backend stanza
    pub async fn handle(&self, stanza: Element) {
        match stanza.name() {
            "route" => self.process_route(stanza).await,
            "iq" => self.process_iq(stanza),
            "error" if stanza.prefix() == Some("stream") || stanza.ns() == Some(ns::STREAMS) => {
                if stanza.has_child("system-shutdown") {
                    info!("Backend is shutting down; closing all client sessions");
                    self.ctx.control.backend_stopped();
                } else {
                    warn!("Backend sent unexpected stream error: {}", stanza);
                }
            }
            _ => warn!("Unknown stanza from backend: {}", stanza),
        }
    }

    async fn process_route(&self, route: Element) {
        let Some(stream_id) = route.get_attr("streamid").map(str::to_string) else {
            warn!("Route without streamid discarded: {}", route);
            return;
        };
        let Some(stanza) = route.into_children().next() else {
            debug!("Empty route for {} discarded", stream_id);
            return;
        };

        let undelivered = match self.ctx.registry.lookup(&stream_id) {
            Some(session) if !session.is_closed() => session.deliver(stanza).err(),
            _ => Some(stanza),
        };
        if let Some(stanza) = undelivered {
            debug!("Session {} is gone; escalating <{}>", stream_id, stanza.name());
            escalate_undeliverable(self.ctx.backend.as_ref(), stanza, &stream_id).await;
        }
    }

    fn process_iq(&self, iq: Element) {
        match iq.get_attr("type") {
            Some("set") => {
                if let Some(wrapper) = iq.find("session") {
                    if wrapper.has_child("close") {
                        self.close_session(wrapper.get_attr("id"));
                    } else {
                        warn!("Invalid session iq from backend: {}", iq);
                    }
                } else if let Some(configuration) = iq.find("configuration") {
                    self.ctx.policy.apply_configuration(configuration);
                    self.acknowledge(&iq);
                } else {
                    warn!("Invalid iq of type set from backend: {}", iq);
                }
            }
            Some("result") => debug!("Discarding iq result: {}", iq),
            Some("error") => match iq.find("session") {
                Some(wrapper) if wrapper.has_child("create") => {
                    debug!("Backend refused session {:?}", wrapper.get_attr("id"));
                    self.close_session(wrapper.get_attr("id"));
                }
                _ => debug!("Discarding iq error: {}", iq),
            },
            _ => debug!("Discarding iq with invalid type: {}", iq),
        }
    }

    fn close_session(&self, stream_id: Option<&str>) {
        if let Some(session) = stream_id.and_then(|id| self.ctx.registry.lookup(id)) {
            session.close(false);
        }
    }

    fn acknowledge(&self, push: &Element) {
        let mut ack = push.clone();
        ack.set_attr("type", "result");
        ack.set_attr("to", self.ctx.domain.as_str());
        ack.set_attr("from", self.reply.jid());
        if !self.reply.send_raw(ack.to_xml()) {
            warn!("Could not acknowledge configuration on {}", self.reply.name());
        }
    }
}

/// Read stanzas from a backend connection until it closes, fails or stays
/// silent for `idle_timeout`
pub async fn run_reader<R>(
    mut reader: R,
    mut parser: StreamParser,
    router: Arc<InboundRouter>,
    idle_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    let name = router.connection().name().to_string();

    'read: loop {
        loop {
            match parser.next_token() {
                Ok(Some(StreamToken::Stanza(stanza))) => router.dispatch(stanza),
                Ok(Some(StreamToken::Close)) => {
                    info!("Backend closed stream on {}", name);
                    break 'read;
                }
                Ok(Some(StreamToken::Open(_))) => debug!("Ignoring stream restart on {}", name),
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed data from backend on {}: {}", name, e);
                    break 'read;
                }
            }
        }

        match timeout(idle_timeout, reader.read_buf(parser.buffer_mut())).await {
            Ok(Ok(0)) => {
                debug!("Backend connection {} reached EOF", name);
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("Read from backend on {} failed: {}", name, e);
                break;
            }
            Err(_) => {
                info!("Backend connection {} idle for {:?}; dropping it", name, idle_timeout);
                break;
            }
        }
    }

    // Cleanup
    router.connection().close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LinkCall, RecordingControl, RecordingLink};
    use crate::worker::LinkCommand;
    use cm_session::{ClientOutbound, SessionStatus, TlsPolicy};
    use cm_wire::{parse_element, XmppVersion};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    struct Fixture {
        router: Arc<InboundRouter>,
        registry: Arc<SessionRegistry>,
        policy: Arc<PolicyCache>,
        link: Arc<RecordingLink>,
        control: Arc<RecordingControl>,
        written: mpsc::UnboundedReceiver<LinkCommand>,
    }

    fn fixture(concurrency: usize) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let policy = Arc::new(PolicyCache::default());
        let link = Arc::new(RecordingLink::default());
        let control = Arc::new(RecordingControl::default());
        let (tx, written) = mpsc::unbounded_channel();
        let ctx = RouterContext {
            registry: registry.clone(),
            policy: policy.clone(),
            backend: link.clone(),
            control: control.clone(),
            domain: "example.com".to_string(),
        };
        let reply = WorkerHandle::new("Connection Worker - 1", "cm/Connection Worker - 1", tx);
        Fixture {
            router: Arc::new(InboundRouter::new(ctx, reply, concurrency)),
            registry,
            policy,
            link,
            control,
            written,
        }
    }

    fn socket_session(
        registry: &SessionRegistry,
        id: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<ClientOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::socket(
            id.to_string(),
            "example.com".to_string(),
            XmppVersion::MAX,
            "en".to_string(),
            tx,
        ));
        registry.register(session.clone()).unwrap();
        (session, rx)
    }

    fn element(xml: &str) -> Element {
        parse_element(xml).unwrap()
    }

    #[tokio::test]
    async fn test_route_delivers_to_session() {
        let f = fixture(2);
        let (_session, mut rx) = socket_session(&f.registry, "s1");
        f.router
            .handle(element("<route streamid='s1'><message xmlns='jabber:client' id='m'/></route>"))
            .await;

        match rx.try_recv() {
            Ok(ClientOutbound::Stanza(message)) => assert_eq!(message.get_attr("id"), Some("m")),
            other => panic!("expected stanza, got {:?}", other),
        }
        assert!(f.link.calls().is_empty());
    }

    #[tokio::test]
    async fn test_route_to_missing_session_escalates() {
        let f = fixture(2);
        f.router
            .handle(element("<route streamid='gone'><message id='m'/></route>"))
            .await;
        f.router
            .handle(element(
                "<route streamid='gone'><iq from='a@example.com' to='b@example.com' id='q'><query/></iq></route>",
            ))
            .await;
        f.router
            .handle(element("<route streamid='gone'><presence/></route>"))
            .await;

        let calls = f.link.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], LinkCall::DeliveryFailed(m, id) if m.get_attr("id") == Some("m") && id == "gone"));
        match &calls[1] {
            LinkCall::Route(reply, id) => {
                assert_eq!(id, "gone");
                assert_eq!(reply.get_attr("type"), Some("error"));
                assert_eq!(reply.get_attr("to"), Some("a@example.com"));
                assert!(reply.find("error").unwrap().has_child("unexpected-request"));
            }
            other => panic!("expected bounce, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_to_closed_session_escalates() {
        let f = fixture(2);
        let (session, _rx) = socket_session(&f.registry, "s1");
        session.close(false);
        f.router
            .handle(element("<route streamid='s1'><message id='late'/></route>"))
            .await;
        assert!(matches!(&f.link.calls()[0], LinkCall::DeliveryFailed(..)));
    }

    #[tokio::test]
    async fn test_close_request() {
        let f = fixture(2);
        let (session, mut rx) = socket_session(&f.registry, "s1");
        f.router
            .handle(element(
                "<iq type='set' id='c'><session xmlns='http://jabber.org/protocol/connectionmanager' id='s1'><close/></session></iq>",
            ))
            .await;
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientOutbound::Close {
                system_stopped: false
            })
        ));
    }

    #[tokio::test]
    async fn test_refused_session_is_closed() {
        let f = fixture(2);
        let (session, _rx) = socket_session(&f.registry, "s1");
        f.router
            .handle(element("<iq type='error' id='e'><session id='s1'><create/></session></iq>"))
            .await;
        assert!(session.is_closed());

        let (other, _rx) = socket_session(&f.registry, "s2");
        f.router
            .handle(element("<iq type='error' id='e'><session id='s2'><close/></session></iq>"))
            .await;
        f.router.handle(element("<iq type='result' id='r'/>")).await;
        assert!(!other.is_closed());
    }

    #[tokio::test]
    async fn test_configuration_push_is_applied_and_acked() {
        let mut f = fixture(2);
        f.router
            .handle(element(
                "<iq type='set' id='cfg1' from='example.com'>\
                   <configuration xmlns='http://jabber.org/protocol/connectionmanager'>\
                     <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
                     <auth xmlns='http://jabber.org/features/iq-auth'/>\
                   </configuration>\
                 </iq>",
            ))
            .await;

        let policy = f.policy.load();
        assert_eq!(policy.tls, TlsPolicy::Optional);
        assert!(policy.non_sasl_auth);

        let ack = match f.written.try_recv() {
            Ok(LinkCommand::Write(xml)) => element(&xml),
            other => panic!("expected ack, got {:?}", other),
        };
        assert_eq!(ack.get_attr("type"), Some("result"));
        assert_eq!(ack.get_attr("id"), Some("cfg1"));
        assert_eq!(ack.get_attr("to"), Some("example.com"));
        assert_eq!(ack.get_attr("from"), Some("cm/Connection Worker - 1"));
    }

    #[tokio::test]
    async fn test_system_shutdown_stream_error() {
        let f = fixture(2);
        let mut parser = StreamParser::new();
        parser.feed(
            b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:connectionmanager' id='x' version='1.0'>\
              <stream:error><system-shutdown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        );
        assert!(matches!(parser.next_token().unwrap(), Some(StreamToken::Open(_))));
        let Some(StreamToken::Stanza(error)) = parser.next_token().unwrap() else {
            panic!("expected stream error");
        };

        f.router.handle(error).await;
        assert_eq!(f.control.stopped(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_session_order_under_concurrency() {
        let f = fixture(4);
        let (_a, mut rx_a) = socket_session(&f.registry, "a");
        let (_b, mut rx_b) = socket_session(&f.registry, "b");

        for i in 0..200 {
            let target = if i % 3 == 0 { "b" } else { "a" };
            f.router.dispatch(element(&format!(
                "<route streamid='{}'><message id='{}'/></route>",
                target, i
            )));
        }

        let mut order_a = Vec::new();
        let mut order_b = Vec::new();
        while order_a.len() + order_b.len() < 200 {
            tokio::select! {
                Some(ClientOutbound::Stanza(m)) = rx_a.recv() => order_a.push(m.get_attr("id").unwrap().parse::<u32>().unwrap()),
                Some(ClientOutbound::Stanza(m)) = rx_b.recv() => order_b.push(m.get_attr("id").unwrap().parse::<u32>().unwrap()),
                _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("timed out"),
            }
        }
        assert!(order_a.windows(2).all(|w| w[0] < w[1]));
        assert!(order_b.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(order_b.len(), 67);
    }

    #[tokio::test]
    async fn test_reader_dispatches_until_close() {
        let f = fixture(2);
        let (_session, mut rx) = socket_session(&f.registry, "s1");
        let (ours, mut backend) = tokio::io::duplex(4096);

        let mut parser = StreamParser::new();
        parser.feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:connectionmanager' id='x' version='1.0'>");
        let reader = tokio::spawn(run_reader(ours, parser, f.router.clone(), Duration::from_secs(60)));

        backend
            .write_all(b" <route streamid='s1'><message id='1'/></route> </stream:stream>")
            .await
            .unwrap();
        reader.await.unwrap();

        assert!(matches!(rx.recv().await, Some(ClientOutbound::Stanza(_))));
        assert!(!f.router.connection().is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_idle_timeout_invalidates() {
        let f = fixture(1);
        let (ours, _backend) = tokio::io::duplex(64);
        run_reader(ours, StreamParser::new(), f.router.clone(), Duration::from_secs(300)).await;
        assert!(!f.router.connection().is_valid());
    }
}
