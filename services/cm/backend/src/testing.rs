//! Test doubles for the pool and router.

use anyhow::{bail, Result};
use async_trait::async_trait;
use cm_session::{BackendLink, IoStream};
use cm_wire::{Element, StreamParser};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::handshake::{BackendConnector, BackendStream};
use crate::inbound::BackendControl;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Created(String),
    Closed(String),
    DeliveryFailed(Element, String),
    Route(Element, String),
}

#[derive(Debug, Default)]
pub struct RecordingLink {
    calls: Mutex<Vec<LinkCall>>,
}

impl RecordingLink {
    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BackendLink for RecordingLink {
    async fn notify_session_created(&self, stream_id: &str) {
        self.record(LinkCall::Created(stream_id.to_string()));
    }

    async fn notify_session_closed(&self, stream_id: &str) {
        self.record(LinkCall::Closed(stream_id.to_string()));
    }

    async fn notify_delivery_failed(&self, stanza: Element, stream_id: &str) {
        self.record(LinkCall::DeliveryFailed(stanza, stream_id.to_string()));
    }

    async fn route(&self, stanza: Element, stream_id: &str) {
        self.record(LinkCall::Route(stanza, stream_id.to_string()));
    }
}

#[derive(Debug, Default)]
pub struct RecordingControl {
    stopped: AtomicUsize,
}

impl RecordingControl {
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl BackendControl for RecordingControl {
    fn backend_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector whose attempts succeed or fail from a script; successful
/// connections hand the backend side of an in-memory pipe to the test
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<bool>>,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<(String, DuplexStream)>,
}

impl ScriptedConnector {
    pub fn new(outcomes: &[bool]) -> (Self, mpsc::UnboundedReceiver<(String, DuplexStream)>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
            peers,
        };
        (connector, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    async fn connect(&self, worker_name: &str) -> Result<BackendStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        // Unscripted attempts fail
        let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
        if !succeed {
            bail!("scripted failure for {}", worker_name);
        }

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let _ = self.peers.send((worker_name.to_string(), theirs));
        Ok(BackendStream {
            stream: IoStream::boxed(ours),
            parser: StreamParser::new(),
            stream_id: "backend-stream".to_string(),
            jid: format!("cm/{}", worker_name),
            secure: false,
            compressed: false,
        })
    }
}
