//! Pool of backend component connections.
//!
//! Client sessions hand their traffic to the pool as [`BackendTask`]s. The
//! tasks wait in a bounded queue and are written by whichever worker pops
//! them first. Workers are built lazily, one per submission, until the pool
//! holds `connections` of them.
//!
//! ```text
//!  notify_* / route ──▶ TaskQueue ──▶ worker loop ──▶ writer ──▶ backend
//!        │ full                          │ stale: resubmit, exit
//!        └─▶ write on any live worker     ▼
//!                                      slot released, next submit rebuilds
//!
//!  backend ──▶ reader ──▶ InboundRouter ──▶ sessions
//! ```
//!
//! Construction failures are counted; two in a row with no live worker means
//! the backend is gone and every client session is dropped so clients can
//! fail over.

use async_trait::async_trait;
use cm_session::{BackendLink, PolicyCache, SessionRegistry};
use cm_wire::{Element, StreamErrorCondition};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::failure_tracker::ConstructionFailureTracker;
use crate::handshake::{BackendConnector, BackendStream};
use crate::inbound::{run_reader, BackendControl, InboundRouter, RouterContext};
use crate::keepalive::{run_heartbeat, send_heartbeats, DEFAULT_HEARTBEAT_INTERVAL};
use crate::queue::{PushError, TaskQueue};
use crate::tasks::BackendTask;
use crate::worker::{run_writer, worker_name, WorkerHandle};

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Served domain, the `to` of management stanzas
    pub domain: String,
    /// Maximum number of backend connections
    pub connections: usize,
    /// Task queue length before submitters write tasks themselves
    pub queue_capacity: usize,
    /// Whitespace keepalive period
    pub heartbeat: Duration,
    /// Concurrent inbound stanzas per connection
    pub incoming_threads: usize,
    /// Backend silence after which a connection is dropped
    pub idle_timeout: Duration,
    /// Bound on a graceful shutdown
    pub drain_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            connections: 5,
            queue_capacity: 1024,
            heartbeat: DEFAULT_HEARTBEAT_INTERVAL,
            incoming_threads: 5,
            idle_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// How queued tasks are treated on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let the workers write what is queued
    Graceful,
    /// Discard the queue, running each task's fallback
    Immediate,
}

struct PoolShared {
    settings: PoolSettings,
    registry: Arc<SessionRegistry>,
    policy: Arc<PolicyCache>,
    connector: Arc<dyn BackendConnector>,
    queue: TaskQueue,
    live: DashMap<String, WorkerHandle>,
    /// Workers being built plus worker loops running
    slots: AtomicUsize,
    idle: Notify,
    next_worker: AtomicUsize,
    tracker: ConstructionFailureTracker,
    shutting_down: AtomicBool,
}

/// Shared handle to the backend connection pool
#[derive(Clone)]
pub struct BackendPool {
    shared: Arc<PoolShared>,
}

impl BackendPool {
    /// Create an empty pool; connections are built as tasks arrive
    pub fn new(
        settings: PoolSettings,
        registry: Arc<SessionRegistry>,
        policy: Arc<PolicyCache>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        info!(
            "Backend pool for {} with up to {} connections",
            settings.domain, settings.connections
        );
        let queue = TaskQueue::new(settings.queue_capacity);
        Self {
            shared: Arc::new(PoolShared {
                settings,
                registry,
                policy,
                connector,
                queue,
                live: DashMap::new(),
                slots: AtomicUsize::new(0),
                idle: Notify::new(),
                next_worker: AtomicUsize::new(0),
                tracker: ConstructionFailureTracker::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot of the live connections
    pub fn live_workers(&self) -> Vec<WorkerHandle> {
        self.shared
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of queued tasks
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// True once [`shutdown`](Self::shutdown) started
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Start the whitespace keepalive; it stops with the pool
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(run_heartbeat(self.shared.settings.heartbeat, move || {
            if pool.is_shut_down() {
                return false;
            }
            send_heartbeats(pool.live_workers().iter());
            true
        }))
    }

    /// Queue a task for any live worker
    pub fn submit(&self, task: BackendTask) {
        let shared = &self.shared;
        if self.is_shut_down() {
            debug!("Pool is shut down; dropping task for {}", task.stream_id());
            task.on_backend_unavailable(&shared.registry);
            return;
        }
        match shared.queue.try_push(task) {
            Ok(()) => {}
            Err(PushError::Closed(task)) => {
                task.on_backend_unavailable(&shared.registry);
                return;
            }
            Err(PushError::Full(task)) => self.run_inline(task),
        }
        self.ensure_worker();
    }

    /// Write `task` from the submitting task when the queue is saturated
    fn run_inline(&self, task: BackendTask) {
        let shared = &self.shared;
        let worker = shared
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .find(WorkerHandle::is_valid);
        match worker {
            Some(worker) if worker.send_raw(task.render(&shared.settings.domain, worker.jid())) => {
                debug!("Queue full; wrote task for {} on {}", task.stream_id(), worker.name());
            }
            _ => {
                warn!(
                    "Queue full and no live backend connection; giving up on task for {}",
                    task.stream_id()
                );
                task.on_backend_unavailable(&shared.registry);
            }
        }
    }

    fn ensure_worker(&self) {
        let shared = &self.shared;
        let limit = shared.settings.connections.max(1);
        let reserved = shared
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |slots| {
                (slots < limit).then_some(slots + 1)
            });
        if reserved.is_err() {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move { pool.construct_worker().await });
    }

    fn release_slot(&self) {
        if self.shared.slots.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }

    async fn construct_worker(self) {
        let shared = &self.shared;
        let name = worker_name(shared.next_worker.fetch_add(1, Ordering::SeqCst) + 1);
        match shared.connector.connect(&name).await {
            Ok(stream) => {
                shared.tracker.record_success();
                if self.is_shut_down() && shared.queue.is_empty() {
                    debug!("Pool shut down while {} connected; dropping it", name);
                    self.release_slot();
                    return;
                }
                self.start_worker(name, stream);
            }
            Err(e) => {
                warn!("Failed to create backend connection {}: {:#}", name, e);
                self.release_slot();
                let (_, unavailable) = shared.tracker.record_failure(shared.live.len());
                if unavailable {
                    let closed = shared.registry.close_all(false);
                    error!(
                        "Backend appears to be down; closed {} client sessions",
                        closed
                    );
                }
            }
        }
    }

    fn router_context(&self) -> RouterContext {
        RouterContext {
            registry: self.shared.registry.clone(),
            policy: self.shared.policy.clone(),
            backend: Arc::new(self.clone()),
            control: Arc::new(self.clone()),
            domain: self.shared.settings.domain.clone(),
        }
    }

    fn start_worker(&self, name: String, link: BackendStream) {
        let shared = &self.shared;
        let BackendStream {
            stream,
            parser,
            jid,
            secure,
            compressed,
            ..
        } = link;
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::new(name.clone(), jid, tx);

        shared.live.insert(name.clone(), handle.clone());
        info!(
            "Backend connection {} established (secure: {}, compressed: {})",
            name, secure, compressed
        );

        tokio::spawn(run_writer(writer, rx, handle.clone()));

        let router = Arc::new(InboundRouter::new(
            self.router_context(),
            handle.clone(),
            shared.settings.incoming_threads,
        ));
        let pool = self.clone();
        let idle_timeout = shared.settings.idle_timeout;
        tokio::spawn(async move {
            run_reader(reader, parser, router, idle_timeout).await;
            pool.shared.live.remove(&name);
        });

        tokio::spawn(self.clone().run_worker(handle));
    }

    async fn run_worker(self, handle: WorkerHandle) {
        let shared = &self.shared;
        loop {
            let task = tokio::select! {
                biased;
                _ = handle.invalidated() => break,
                task = shared.queue.pop() => match task {
                    Some(task) => task,
                    None => {
                        // Queue closed and drained: keep the connection for the
                        // shutdown notice
                        debug!("{} finished draining", handle.name());
                        self.release_slot();
                        return;
                    }
                },
            };

            if !handle.is_valid() {
                debug!("{} is stale; handing task back to the pool", handle.name());
                self.retire(&handle);
                self.submit(task);
                return;
            }

            let xml = task.render(&shared.settings.domain, handle.jid());
            if !handle.send_raw(xml) {
                self.retire(&handle);
                self.submit(task);
                return;
            }
        }

        // Cleanup
        self.retire(&handle);
    }

    fn retire(&self, handle: &WorkerHandle) {
        self.shared.live.remove(handle.name());
        handle.close();
        self.release_slot();
        debug!("Backend worker {} retired", handle.name());
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.slots.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop the pool.
    ///
    /// Graceful shutdown lets the workers write what is queued, bounded by
    /// `drain_timeout`. Whatever is left runs its fallback. The backend is then
    /// told about the shutdown over one live connection and every connection is
    /// closed.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let shared = &self.shared;
        if shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down backend pool ({:?})", mode);
        shared.queue.close();

        if mode == ShutdownMode::Graceful
            && timeout(shared.settings.drain_timeout, self.wait_idle())
                .await
                .is_err()
        {
            warn!(
                "Backend pool did not drain within {:?}",
                shared.settings.drain_timeout
            );
        }

        let leftovers = shared.queue.drain();
        if !leftovers.is_empty() {
            info!("Discarding {} queued backend tasks", leftovers.len());
        }
        for task in leftovers {
            task.on_backend_unavailable(&shared.registry);
        }

        let workers = self.live_workers();
        let notice = StreamErrorCondition::SystemShutdown.to_element().to_xml();
        let notified = workers
            .iter()
            .find(|worker| worker.is_valid())
            .filter(|worker| worker.send_raw(notice));
        match notified {
            Some(worker) => debug!("Sent system-shutdown to backend on {}", worker.name()),
            None => debug!("No live backend connection for the shutdown notice"),
        }
        for worker in &workers {
            worker.close();
        }
        shared.live.clear();
    }
}

impl BackendControl for BackendPool {
    fn backend_stopped(&self) {
        let closed = self.shared.registry.close_all(true);
        info!("Backend stopped; closed {} client sessions", closed);
    }
}

#[async_trait]
impl BackendLink for BackendPool {
    async fn notify_session_created(&self, stream_id: &str) {
        self.submit(BackendTask::SessionCreated(stream_id.to_string()));
    }

    async fn notify_session_closed(&self, stream_id: &str) {
        self.submit(BackendTask::SessionClosed(stream_id.to_string()));
    }

    async fn notify_delivery_failed(&self, stanza: Element, stream_id: &str) {
        self.submit(BackendTask::DeliveryFailed {
            stream_id: stream_id.to_string(),
            stanza,
        });
    }

    async fn route(&self, stanza: Element, stream_id: &str) {
        self.submit(BackendTask::Route {
            stream_id: stream_id.to_string(),
            stanza,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnector;
    use cm_session::{ClientOutbound, Session};
    use cm_wire::XmppVersion;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn settings() -> PoolSettings {
        PoolSettings {
            domain: "example.com".to_string(),
            connections: 1,
            drain_timeout: Duration::from_secs(2),
            ..PoolSettings::default()
        }
    }

    fn pool_with(
        settings: PoolSettings,
        outcomes: &[bool],
    ) -> (
        BackendPool,
        Arc<SessionRegistry>,
        Arc<ScriptedConnector>,
        mpsc::UnboundedReceiver<(String, DuplexStream)>,
    ) {
        let registry = Arc::new(SessionRegistry::new());
        let (connector, peers) = ScriptedConnector::new(outcomes);
        let connector = Arc::new(connector);
        let pool = BackendPool::new(
            settings,
            registry.clone(),
            Arc::new(PolicyCache::default()),
            connector.clone(),
        );
        (pool, registry, connector, peers)
    }

    fn session(
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

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn read_until(peer: &mut DuplexStream, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            let n = timeout(Duration::from_secs(2), peer.read(&mut buf))
                .await
                .expect("backend read timed out")
                .unwrap();
            assert!(n > 0, "connection closed before {:?}; got {:?}", needle, seen);
            seen.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        seen
    }

    #[tokio::test]
    async fn test_tasks_are_written_by_a_worker() {
        let (pool, _registry, _connector, mut peers) = pool_with(settings(), &[true]);
        pool.notify_session_created("cm1").await;

        let (name, mut peer) = peers.recv().await.unwrap();
        assert_eq!(name, "Connection Worker - 1");
        let written = read_until(&mut peer, "</iq>").await;
        assert!(written.contains("to=\"example.com\""));
        assert!(written.contains("from=\"cm/Connection Worker - 1\""));
        assert!(written.contains("id=\"cm1\""));
        assert!(written.contains("<create/>"));

        pool.route(Element::new("message").attr("id", "m1"), "cm1").await;
        let written = read_until(&mut peer, "</route>").await;
        assert!(written.contains("streamid=\"cm1\""));
        assert!(written.contains("<message id=\"m1\"/>"));
    }

    #[tokio::test]
    async fn test_two_failures_without_workers_close_sessions_once() {
        let (pool, registry, connector, _peers) = pool_with(settings(), &[]);
        let (first, mut first_rx) = session(&registry, "a");

        pool.notify_session_created("a").await;
        wait_until(|| connector.attempts() == 1).await;
        assert!(!first.is_closed());

        pool.notify_session_created("a").await;
        wait_until(|| first.is_closed()).await;
        assert!(matches!(
            first_rx.try_recv(),
            Ok(ClientOutbound::Close {
                system_stopped: false
            })
        ));

        // The counter started over
        let (second, _second_rx) = session(&registry, "b");
        pool.notify_session_created("b").await;
        wait_until(|| connector.attempts() == 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_failures_with_a_live_worker_keep_sessions() {
        let settings = PoolSettings {
            connections: 2,
            ..settings()
        };
        let (pool, registry, connector, mut peers) = pool_with(settings, &[true]);
        let (client, _rx) = session(&registry, "a");

        pool.notify_session_created("a").await;
        let (_name, _peer) = peers.recv().await.unwrap();
        wait_until(|| pool.live_workers().len() == 1).await;

        pool.notify_session_closed("x").await;
        wait_until(|| connector.attempts() == 2).await;
        pool.notify_session_closed("y").await;
        wait_until(|| connector.attempts() == 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_dead_connection_is_replaced() {
        let (pool, _registry, connector, mut peers) = pool_with(settings(), &[true, true]);
        pool.notify_session_created("s1").await;
        let (_, mut first) = peers.recv().await.unwrap();
        read_until(&mut first, "</iq>").await;

        drop(first);
        wait_until(|| pool.live_workers().is_empty()).await;
        wait_until(|| pool.shared.slots.load(Ordering::SeqCst) == 0).await;

        pool.notify_session_created("s2").await;
        let (name, mut second) = peers.recv().await.unwrap();
        assert_eq!(name, "Connection Worker - 2");
        let written = read_until(&mut second, "</iq>").await;
        assert!(written.contains("id=\"s2\""));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_runs_on_a_live_worker() {
        let (pool, _registry, _connector, mut peers) = pool_with(settings(), &[true]);
        pool.notify_session_created("s1").await;
        let (_, mut peer) = peers.recv().await.unwrap();
        wait_until(|| pool.live_workers().len() == 1).await;

        pool.run_inline(BackendTask::Route {
            stream_id: "s9".to_string(),
            stanza: Element::new("presence"),
        });
        let written = read_until(&mut peer, "</route>").await;
        assert!(written.contains("streamid=\"s9\""));
    }

    #[tokio::test]
    async fn test_full_queue_without_workers_falls_back() {
        let settings = PoolSettings {
            queue_capacity: 1,
            ..settings()
        };
        let (pool, registry, _connector, _peers) = pool_with(settings, &[]);
        let (_first, _first_rx) = session(&registry, "s1");
        let (second, mut second_rx) = session(&registry, "s2");

        pool.route(Element::new("message"), "s1").await;
        pool.route(Element::new("message"), "s2").await;

        assert!(second.is_closed());
        assert!(matches!(
            second_rx.try_recv(),
            Ok(ClientOutbound::Close {
                system_stopped: true
            })
        ));
    }

    #[tokio::test]
    async fn test_immediate_shutdown_runs_fallbacks() {
        let (pool, registry, _connector, _peers) = pool_with(settings(), &[]);
        let (created, mut rx) = session(&registry, "s1");
        pool.notify_session_created("s1").await;

        pool.shutdown(ShutdownMode::Immediate).await;
        assert!(created.is_closed());
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientOutbound::Close {
                system_stopped: true
            })
        ));
        assert_eq!(pool.queued(), 0);

        let (late, _late_rx) = session(&registry, "s2");
        pool.notify_session_created("s2").await;
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_then_notifies() {
        let (pool, _registry, _connector, mut peers) = pool_with(settings(), &[true]);
        pool.notify_session_created("s1").await;
        pool.notify_session_closed("s1").await;
        let (_, mut peer) = peers.recv().await.unwrap();

        pool.shutdown(ShutdownMode::Graceful).await;

        let mut written = String::new();
        timeout(Duration::from_secs(2), peer.read_to_string(&mut written))
            .await
            .unwrap()
            .unwrap();
        let created = written.find("<create/>").unwrap();
        let closed = written.find("<close/>").unwrap();
        let notice = written.find("system-shutdown").unwrap();
        assert!(created < closed && closed < notice);
        assert!(written.ends_with("</stream:stream>"));
        assert!(pool.live_workers().is_empty());
    }

    #[tokio::test]
    async fn test_backend_stopped_closes_sessions() {
        let (pool, registry, _connector, _peers) = pool_with(settings(), &[]);
        let (client, mut rx) = session(&registry, "s1");

        pool.backend_stopped();
        assert!(client.is_closed());
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientOutbound::Close {
                system_stopped: true
            })
        ));
        assert!(!pool.is_shut_down());
    }
}
