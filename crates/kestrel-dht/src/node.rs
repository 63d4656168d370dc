//! DHT node - listener, maintenance, and supervision wiring.
//!
//! [`DhtNode`] owns the local identity, the transport endpoint, the
//! routing table, and the request supervisor; the collaborators never
//! hold references back to the node, only callbacks supplied at
//! registration time. Four background activities run between `start` and
//! `shutdown`:
//!
//! - **listener**: decodes inbound frames, observes senders, dispatches
//!   to the protocol handlers
//! - **cleaner**: sweeps the supervisor for expired requests
//! - **insertion worker**: issues the liveness probes the routing table
//!   defers full-bucket insertions behind
//! - **CRON**: refreshes stale buckets and re-runs the self-lookup after
//!   long idleness
//!
//! Shutdown is join-based: the signal stops each loop at its next
//! wakeup, the node awaits them all, cancels outstanding requests
//! without firing callbacks, and only then closes the transport.
//!
//! Lock discipline: the routing-table lock and the supervisor lock are
//! each held only for short non-awaiting sections, and no call site
//! holds both. Callbacks always run with no locks held.

use crate::config::{ConfigError, DhtConfig};
use crate::handlers;
use crate::lookup;
use crate::messages::{Message, MessageError, PeerInfo};
use crate::node_id::NodeId;
use crate::routing::{ObserveOutcome, Peer, ProbeTarget, RoutingTable};
use crate::supervisor::RequestSupervisor;
use kestrel_transport::{Transport, TransportError, TransportStats};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Result alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Node errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration; fatal at startup only.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message codec failure.
    #[error("Message codec error: {0}")]
    Message(#[from] MessageError),

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The node is not running.
    #[error("Node is not running")]
    NotRunning,

    /// The request deadline elapsed without a response.
    #[error("Request timed out")]
    Timeout,

    /// The node shut down while the operation was outstanding.
    #[error("Node shut down")]
    ShutDown,
}

/// Snapshot of node activity.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    /// Peers currently in the routing table.
    pub peers: usize,
    /// Requests awaiting a response or timeout.
    pub outstanding_requests: usize,
    /// Transport counters.
    pub transport: TransportStats,
}

/// Work items for the insertion worker.
pub(crate) enum ProbeCommand {
    /// Issue a liveness probe against a bucket head.
    Probe(ProbeTarget),
    /// A probe completed; reconcile the bucket.
    Completed {
        bucket: usize,
        head_id: NodeId,
        alive: bool,
    },
}

/// Shared node state. Collaborators reach each other through this; only
/// callbacks cross back in from the supervisor.
pub(crate) struct NodeInner {
    pub(crate) local_id: NodeId,
    pub(crate) config: DhtConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) table: Mutex<RoutingTable>,
    pub(crate) supervisor: RequestSupervisor,
    probe_tx: mpsc::UnboundedSender<ProbeCommand>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl NodeInner {
    /// Record liveness evidence and dispatch any probe it triggers.
    pub(crate) fn observe_peer(&self, id: NodeId, addr: SocketAddr) {
        let outcome = {
            let mut table = self.table.lock().expect("routing table lock poisoned");
            table.observe(Peer::new(id, addr))
        };
        if let ObserveOutcome::Queued { probe: Some(target) } = outcome {
            let _ = self.probe_tx.send(ProbeCommand::Probe(target));
        }
    }

    /// Encode and send one message.
    pub(crate) async fn send_message(&self, message: &Message, addr: SocketAddr) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.transport.send_to(&bytes, addr).await?;
        Ok(())
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// A Kademlia-style DHT node.
///
/// # Examples
///
/// ```no_run
/// use kestrel_dht::{DhtConfig, DhtNode};
/// use kestrel_transport::udp::UdpTransport;
/// use std::net::SocketAddr;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "0.0.0.0:8470".parse()?;
/// let transport = Arc::new(UdpTransport::bind(addr).await?);
/// let node = DhtNode::new(DhtConfig::default(), transport)?;
/// node.start().await?;
///
/// let found = node.lookup(*node.local_id()).await?;
/// println!("neighborhood: {} peers", found.len());
///
/// node.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct DhtNode {
    inner: Arc<NodeInner>,
    /// Handed to the insertion worker on start.
    probe_rx: Mutex<Option<mpsc::UnboundedReceiver<ProbeCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DhtNode {
    /// Create a node over the given transport.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if the configuration is invalid;
    /// this is the only fatal error path.
    pub fn new(config: DhtConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let local_id = config.local_id.unwrap_or_else(NodeId::random);
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = NodeInner {
            local_id,
            table: Mutex::new(RoutingTable::new(local_id, config.k)),
            supervisor: RequestSupervisor::new(),
            config,
            transport,
            probe_tx,
            shutdown,
            running: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
            probe_rx: Mutex::new(Some(probe_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The local node id.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    /// The transport address the node listens on.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Whether the node is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Peers currently in the routing table.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner
            .table
            .lock()
            .expect("routing table lock poisoned")
            .peer_count()
    }

    /// Snapshot of every peer in the routing table.
    #[must_use]
    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.inner
            .table
            .lock()
            .expect("routing table lock poisoned")
            .all_peers()
            .iter()
            .map(Peer::info)
            .collect()
    }

    /// Activity snapshot.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peers: self.peer_count(),
            outstanding_requests: self.inner.supervisor.outstanding(),
            transport: self.inner.transport.stats(),
        }
    }

    /// Start the background loops and join the network.
    ///
    /// Seeds the routing table from the bootstrap list, then runs the
    /// initial self-lookup to populate the close neighborhood.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if the node is already
    /// running or was already shut down.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState("node already running".to_string()));
        }
        let probe_rx = self
            .probe_rx
            .lock()
            .expect("probe receiver lock poisoned")
            .take();
        let Some(probe_rx) = probe_rx else {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(NodeError::InvalidState("node already shut down".to_string()));
        };

        info!(local_id = %self.inner.local_id, "node starting");

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(spawn_listener(Arc::clone(&self.inner)));
        tasks.push(spawn_cleaner(Arc::clone(&self.inner)));
        tasks.push(spawn_insertion_worker(Arc::clone(&self.inner), probe_rx));
        tasks.push(spawn_cron(Arc::clone(&self.inner)));

        for seed in &self.inner.config.bootstrap {
            self.inner.observe_peer(seed.id, seed.addr);
        }
        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let found = lookup::iterative_find_node(&inner, inner.local_id).await;
            debug!(found = found.len(), "bootstrap self-lookup complete");
        }));

        Ok(())
    }

    /// Stop the node and wait for every background activity to quiesce.
    ///
    /// Outstanding requests are cancelled without firing callbacks; the
    /// transport closes only after all tasks have joined. Calling
    /// `shutdown` on a node that is not running is a benign no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        let cancelled = self.inner.supervisor.cancel_all();
        trace!(cancelled, "supervisor drained");
        self.inner.transport.close().await?;
        info!(local_id = %self.inner.local_id, "node stopped");
        Ok(())
    }

    /// Ping a peer and measure the round trip.
    ///
    /// # Errors
    ///
    /// [`NodeError::Timeout`] if no PONG arrives within the request
    /// timeout; [`NodeError::NotRunning`] / [`NodeError::ShutDown`] on
    /// lifecycle races; transport errors if the send fails.
    pub async fn ping(&self, peer: PeerInfo) -> Result<Duration> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }

        let token = self.inner.supervisor.next_token();
        let (done_tx, done_rx) = oneshot::channel::<Result<()>>();
        let slot = Arc::new(Mutex::new(Some(done_tx)));

        let on_response = {
            let slot = Arc::clone(&slot);
            Box::new(move |_message: Message| {
                if let Some(tx) = slot.lock().expect("ping slot lock poisoned").take() {
                    let _ = tx.send(Ok(()));
                }
            })
        };
        let on_timeout = {
            let slot = Arc::clone(&slot);
            Box::new(move |_peer: NodeId| {
                if let Some(tx) = slot.lock().expect("ping slot lock poisoned").take() {
                    let _ = tx.send(Err(NodeError::Timeout));
                }
            })
        };

        self.inner
            .supervisor
            .register(
                token,
                peer.id,
                self.inner.config.request_timeout,
                on_response,
                on_timeout,
            )
            .map_err(|e| NodeError::InvalidState(e.to_string()))?;

        let started = Instant::now();
        let request = Message::Ping {
            sender_id: self.inner.local_id,
            token,
        };
        trace!(token, peer = %peer.id, "request sent");
        if let Err(error) = self.inner.send_message(&request, peer.addr).await {
            self.inner.supervisor.cancel(token);
            return Err(error);
        }

        match done_rx.await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(error)) => Err(error),
            // Entry cancelled on shutdown: sender dropped unfired.
            Err(_) => Err(NodeError::ShutDown),
        }
    }

    /// Iterative FIND_NODE toward `target`.
    ///
    /// Returns up to k responders closest to the target, ascending XOR
    /// distance.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotRunning`] if the node has not been
    /// started.
    pub async fn lookup(&self, target: NodeId) -> Result<Vec<PeerInfo>> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        Ok(lookup::iterative_find_node(&self.inner, target).await)
    }
}

/// Listener: one frame at a time from the transport to the handlers.
fn spawn_listener(inner: Arc<NodeInner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.subscribe_shutdown();
    tokio::spawn(async move {
        let mut buf = vec![0u8; inner.transport.max_frame_size()];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = inner.transport.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        handlers::handle_frame(&inner, from, &buf[..len]).await;
                    }
                    Err(TransportError::Closed) => break,
                    Err(error) => {
                        warn!(%error, "transport receive failed");
                    }
                },
            }
        }
        debug!("listener stopped");
    })
}

/// Cleaner: periodic supervisor sweep for expired requests.
fn spawn_cleaner(inner: Arc<NodeInner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.subscribe_shutdown();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let expired = inner.supervisor.sweep();
                    if expired > 0 {
                        trace!(expired, "sweep expired requests");
                    }
                }
            }
        }
        debug!("cleaner stopped");
    })
}

/// Insertion worker: serializes liveness probes of bucket heads and
/// feeds the results back into the routing table.
fn spawn_insertion_worker(
    inner: Arc<NodeInner>,
    mut probe_rx: mpsc::UnboundedReceiver<ProbeCommand>,
) -> JoinHandle<()> {
    let mut shutdown_rx = inner.subscribe_shutdown();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    // Drain without issuing new probes; queued candidates
                    // are simply never admitted.
                    while probe_rx.try_recv().is_ok() {}
                    break;
                }
                command = probe_rx.recv() => match command {
                    None => break,
                    Some(ProbeCommand::Probe(target)) => {
                        issue_probe(&inner, target).await;
                    }
                    Some(ProbeCommand::Completed { bucket, head_id, alive }) => {
                        let next = {
                            let mut table =
                                inner.table.lock().expect("routing table lock poisoned");
                            table.on_probe_result(bucket, &head_id, alive)
                        };
                        if let Some(target) = next {
                            issue_probe(&inner, target).await;
                        }
                    }
                },
            }
        }
        debug!("insertion worker stopped");
    })
}

/// Ping a bucket head; the supervisor routes the outcome back to the
/// worker as a `Completed` command.
async fn issue_probe(inner: &Arc<NodeInner>, target: ProbeTarget) {
    let ProbeTarget { bucket, head } = target;
    let token = inner.supervisor.next_token();
    let head_id = head.id;

    let response_tx = inner.probe_tx.clone();
    let on_response = Box::new(move |_message: Message| {
        let _ = response_tx.send(ProbeCommand::Completed {
            bucket,
            head_id,
            alive: true,
        });
    });
    let timeout_tx = inner.probe_tx.clone();
    let on_timeout = Box::new(move |_peer: NodeId| {
        let _ = timeout_tx.send(ProbeCommand::Completed {
            bucket,
            head_id,
            alive: false,
        });
    });

    if inner
        .supervisor
        .register(
            token,
            head_id,
            inner.config.request_timeout,
            on_response,
            on_timeout,
        )
        .is_err()
    {
        return;
    }

    let ping = Message::Ping {
        sender_id: inner.local_id,
        token,
    };
    debug!(token, peer = %head_id, bucket, "probe sent");
    if let Err(error) = inner.send_message(&ping, head.addr).await {
        // Unreachable from here counts as a failed probe.
        warn!(peer = %head_id, %error, "probe send failed");
        inner.supervisor.cancel(token);
        let _ = inner.probe_tx.send(ProbeCommand::Completed {
            bucket,
            head_id,
            alive: false,
        });
    }
}

/// CRON: bucket refresh, idle self-lookup, republish hook.
fn spawn_cron(inner: Arc<NodeInner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.subscribe_shutdown();
    tokio::spawn(async move {
        let period = inner.config.maintenance_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => maintenance_tick(&inner).await,
            }
        }
        debug!("cron stopped");
    })
}

async fn maintenance_tick(inner: &Arc<NodeInner>) {
    let stale = {
        let table = inner.table.lock().expect("routing table lock poisoned");
        table.stale_buckets(inner.config.stale_after)
    };
    for bucket in stale {
        let target = NodeId::random_within_bucket(&inner.local_id, bucket);
        debug!(bucket, %target, "refreshing stale bucket");
        lookup::iterative_find_node(inner, target).await;
    }

    let idle = {
        let table = inner.table.lock().expect("routing table lock poisoned");
        table.idle_for()
    };
    if idle >= inner.config.stale_after {
        debug!(idle_secs = idle.as_secs(), "idle self-lookup");
        lookup::iterative_find_node(inner, inner.local_id).await;
    }

    if let Some(hook) = &inner.config.maintenance_hook {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_transport::memory::MemoryHub;

    fn test_config() -> DhtConfig {
        DhtConfig {
            request_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
            ..DhtConfig::default()
        }
    }

    #[tokio::test]
    async fn test_node_creation() {
        let hub = MemoryHub::new();
        let node = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();
        assert!(!node.is_running());
        assert_eq!(node.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let hub = MemoryHub::new();
        let config = DhtConfig {
            k: 0,
            ..DhtConfig::default()
        };
        assert!(matches!(
            DhtNode::new(config, Arc::new(hub.open())),
            Err(NodeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_local_id_override() {
        let hub = MemoryHub::new();
        let id = NodeId::random();
        let config = DhtConfig {
            local_id: Some(id),
            ..test_config()
        };
        let node = DhtNode::new(config, Arc::new(hub.open())).unwrap();
        assert_eq!(node.local_id(), &id);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let hub = MemoryHub::new();
        let node = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();

        node.start().await.unwrap();
        assert!(node.is_running());

        // Cannot start twice.
        assert!(matches!(
            node.start().await,
            Err(NodeError::InvalidState(_))
        ));

        node.shutdown().await.unwrap();
        assert!(!node.is_running());

        // Shutdown again is benign.
        node.shutdown().await.unwrap();

        // Restart after shutdown is refused (transport is gone).
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_ops_refused_when_not_running() {
        let hub = MemoryHub::new();
        let node = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();

        let peer = PeerInfo {
            id: NodeId::random(),
            addr: "127.0.0.1:19999".parse().unwrap(),
        };
        assert!(matches!(node.ping(peer).await, Err(NodeError::NotRunning)));
        assert!(matches!(
            node.lookup(NodeId::random()).await,
            Err(NodeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_ping_unreachable_peer_times_out() {
        let hub = MemoryHub::new();
        let node = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();
        node.start().await.unwrap();

        // Endpoint exists on the hub but nobody reads or replies.
        let silent = hub.open();
        let peer = PeerInfo {
            id: NodeId::random(),
            addr: silent.local_addr().unwrap(),
        };
        let result = node.ping(peer).await;
        assert!(matches!(result, Err(NodeError::Timeout)));
        assert_eq!(node.stats().outstanding_requests, 0);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_unknown_address_fails_fast() {
        let hub = MemoryHub::new();
        let node = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();
        node.start().await.unwrap();

        let peer = PeerInfo {
            id: NodeId::random(),
            addr: "127.0.0.1:64999".parse().unwrap(),
        };
        assert!(matches!(
            node.ping(peer).await,
            Err(NodeError::Transport(_))
        ));
        // The cancelled entry must not linger.
        assert_eq!(node.stats().outstanding_requests, 0);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_nodes_ping() {
        let hub = MemoryHub::new();
        let a = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();
        let b = DhtNode::new(test_config(), Arc::new(hub.open())).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let b_info = PeerInfo {
            id: *b.local_id(),
            addr: b.local_addr().unwrap(),
        };
        let rtt = a.ping(b_info).await.unwrap();
        assert!(rtt < Duration::from_secs(1));

        // Both sides observed each other through the exchange.
        assert_eq!(a.peer_count(), 1);
        assert_eq!(b.peer_count(), 1);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_quiesces_with_pending_request() {
        let hub = MemoryHub::new();
        let config = DhtConfig {
            request_timeout: Duration::from_secs(30),
            ..test_config()
        };
        let node = DhtNode::new(config, Arc::new(hub.open())).unwrap();
        node.start().await.unwrap();

        let silent = hub.open();
        let peer = PeerInfo {
            id: NodeId::random(),
            addr: silent.local_addr().unwrap(),
        };
        let node = Arc::new(node);
        let pinger = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.ping(peer).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.shutdown().await.unwrap();
        let result = pinger.await.unwrap();
        assert!(matches!(result, Err(NodeError::ShutDown)));
        assert_eq!(node.stats().outstanding_requests, 0);
    }
}
