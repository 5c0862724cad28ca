//! Backend worker handles and the connection writer.
//!
//! A worker is one live component connection. Its [`WorkerHandle`] is what the
//! pool, the heartbeat and the inbound router hold: a name, the JID the
//! backend knows it by, a validity flag and a channel to the task that owns
//! the write half of the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use cm_wire::STREAM_CLOSE;

/// Prefix of worker names; workers are numbered from 1
pub const WORKER_NAME_PREFIX: &str = "Connection Worker - ";

/// Name of the `n`th worker
pub fn worker_name(n: usize) -> String {
    format!("{}{}", WORKER_NAME_PREFIX, n)
}

/// Writes queued for a backend connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Raw XML to write
    Write(String),
    /// Write the closing stream tag and shut the socket down
    Close,
}

#[derive(Debug)]
struct WorkerState {
    valid: AtomicBool,
    invalidated: Notify,
}

/// Shared handle to a live backend connection
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    jid: Arc<str>,
    outbound: mpsc::UnboundedSender<LinkCommand>,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    /// Create a handle writing through `outbound`
    pub fn new(
        name: impl Into<String>,
        jid: impl Into<String>,
        outbound: mpsc::UnboundedSender<LinkCommand>,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            jid: Arc::from(jid.into()),
            outbound,
            state: Arc::new(WorkerState {
                valid: AtomicBool::new(true),
                invalidated: Notify::new(),
            }),
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full JID, `managerName/workerName`
    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// True while the connection is usable
    pub fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Mark the connection unusable; returns false if it already was
    pub fn invalidate(&self) -> bool {
        let was_valid = self.state.valid.swap(false, Ordering::SeqCst);
        if was_valid {
            debug!("Backend connection {} invalidated", self.name);
            self.state.invalidated.notify_waiters();
        }
        was_valid
    }

    /// Resolves once the handle has been invalidated
    pub async fn invalidated(&self) {
        loop {
            let notified = self.state.invalidated.notified();
            if !self.state.valid.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Queue raw XML; false if the writer is gone
    pub fn send_raw(&self, xml: String) -> bool {
        if self.outbound.send(LinkCommand::Write(xml)).is_err() {
            self.invalidate();
            return false;
        }
        true
    }

    /// Invalidate and ask the writer to close the stream
    pub fn close(&self) {
        self.invalidate();
        let _ = self.outbound.send(LinkCommand::Close);
    }
}

/// Own the write half of a backend connection until it fails or is closed
pub async fn run_writer<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    handle: WorkerHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        let result = match command {
            LinkCommand::Write(xml) => {
                trace!("{} -> backend: {}", handle.name(), xml);
                match writer.write_all(xml.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                }
            }
            LinkCommand::Close => {
                let _ = writer.write_all(STREAM_CLOSE.as_bytes()).await;
                let _ = writer.shutdown().await;
                break;
            }
        };
        if let Err(e) = result {
            warn!("Write to backend on {} failed: {}", handle.name(), e);
            break;
        }
    }

    // Cleanup
    handle.invalidate();
    debug!("Backend writer for {} finished", handle.name());
}
