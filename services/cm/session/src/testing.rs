//! Shared test doubles.

use async_trait::async_trait;
use cm_wire::Element;
use std::sync::{Arc, Mutex};

use crate::backend::BackendLink;
use crate::client::ClientConnection;
use crate::context::{ClientSettings, MultiplexerContext};
use crate::policy::{ClientPolicy, PolicyCache};
use crate::registry::SessionRegistry;
use crate::transport::PlainTransport;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BackendCall {
    Created(String),
    Closed(String),
    DeliveryFailed(Element, String),
    Route(Element, String),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
}

impl RecordingBackend {
    pub(crate) fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BackendLink for RecordingBackend {
    async fn notify_session_created(&self, stream_id: &str) {
        self.record(BackendCall::Created(stream_id.to_string()));
    }

    async fn notify_session_closed(&self, stream_id: &str) {
        self.record(BackendCall::Closed(stream_id.to_string()));
    }

    async fn notify_delivery_failed(&self, stanza: Element, stream_id: &str) {
        self.record(BackendCall::DeliveryFailed(stanza, stream_id.to_string()));
    }

    async fn route(&self, stanza: Element, stream_id: &str) {
        self.record(BackendCall::Route(stanza, stream_id.to_string()));
    }
}

pub(crate) fn test_context_inner(
    backend: Arc<RecordingBackend>,
    policy: ClientPolicy,
) -> MultiplexerContext {
    let settings = ClientSettings {
        server_name: "example.com".to_string(),
        ..ClientSettings::default()
    };
    MultiplexerContext::new(
        settings,
        Arc::new(SessionRegistry::new()),
        Arc::new(PolicyCache::new(policy)),
        backend,
        Arc::new(PlainTransport),
    )
}

pub(crate) fn test_context(
    backend: Arc<RecordingBackend>,
    policy: ClientPolicy,
) -> Arc<MultiplexerContext> {
    Arc::new(test_context_inner(backend, policy))
}

#[derive(Debug, Default)]
pub(crate) struct MockConnection {
    pub(crate) sent: Vec<String>,
    pub(crate) secure: bool,
    pub(crate) compressed: bool,
    pub(crate) codec: bool,
    pub(crate) fail_tls: bool,
    pub(crate) compressions: usize,
    pub(crate) shut_down: bool,
}

impl MockConnection {
    pub(crate) fn output(&self) -> String {
        self.sent.concat()
    }

    pub(crate) fn clear(&mut self) {
        self.sent.clear();
    }
}

#[async_trait]
impl ClientConnection for MockConnection {
    async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if self.shut_down {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        self.sent.push(data.to_string());
        Ok(())
    }

    async fn start_tls(&mut self) -> anyhow::Result<()> {
        if self.fail_tls {
            anyhow::bail!("handshake failed");
        }
        self.secure = true;
        Ok(())
    }

    async fn start_compression(&mut self) -> anyhow::Result<()> {
        self.compressions += 1;
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
        self.codec
    }

    async fn shutdown(&mut self) {
        self.shut_down = true;
    }
}
