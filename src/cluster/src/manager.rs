//! Cluster manager: drives the replication substrate for one node.
//!
//! A single command loop serializes all mutations coming from the cache
//! actor, applies them to the local store, and fans them out to peers over
//! persistent per-peer links. Each link delivers writes in submission
//! order, so writes from one origin are applied in order everywhere.
//! Quorum bookkeeping runs off to the side: the local apply is the first
//! acknowledgement, remote acks are counted against the configured policy,
//! and the outcome is pushed back into the cache actor's mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};

use cache::{CacheKey, ChangeNotification, Notifier, Replicator, VersionedEntry, WriteOutcome};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::quorum::QuorumTracker;
use crate::replication::{
    deserialize_replication_entry, read_frame_body, serialize_replication_entry, write_frame,
    ReplicationEntry, ReplicationOp,
};
use crate::store::{ReplicatedStore, StoreSnapshot};
use crate::types::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A mutation submitted by the cache actor
#[derive(Debug)]
enum Command {
    RegisterKey(String),
    Put { key: String, entry: VersionedEntry },
    Remove(String),
    Subscribe(CacheKey),
}

/// One write queued for a peer link, with the channel its ack is counted on
struct PeerCommand {
    entry: ReplicationEntry,
    ack_tx: mpsc::UnboundedSender<()>,
}

/// Cloneable, fire-and-forget handle the cache actor writes through
#[derive(Clone)]
pub struct ClusterHandle {
    tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClusterHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Replicator for ClusterHandle {
    fn register_key(&self, key: &CacheKey) {
        let _ = self.tx.send(Command::RegisterKey(key.to_string()));
    }

    fn put(&self, key: &CacheKey, entry: VersionedEntry) {
        let _ = self.tx.send(Command::Put {
            key: key.to_string(),
            entry,
        });
    }

    fn remove(&self, key: &CacheKey) {
        let _ = self.tx.send(Command::Remove(key.to_string()));
    }

    fn subscribe(&self, key: &CacheKey) {
        let _ = self.tx.send(Command::Subscribe(key.clone()));
    }
}

/// Cluster manager handles all replication for one node
pub struct ClusterManager {
    config: ClusterConfig,
    store: Arc<ReplicatedStore>,
    notifier: Notifier,
    peers: Arc<RwLock<HashMap<String, PeerNode>>>,
    peer_queues: HashMap<String, mpsc::Sender<PeerCommand>>,
    sequence: AtomicU64,
    command_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClusterManager {
    pub fn new(
        config: ClusterConfig,
        store: Arc<ReplicatedStore>,
        notifier: Notifier,
    ) -> (Self, ClusterHandle) {
        let (tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = ClusterHandle {
            tx,
            shutdown_tx: shutdown_tx.clone(),
        };
        let manager = ClusterManager {
            config,
            store,
            notifier,
            peers: Arc::new(RwLock::new(HashMap::new())),
            peer_queues: HashMap::new(),
            sequence: AtomicU64::new(0),
            command_rx,
            shutdown_tx,
        };
        (manager, handle)
    }

    /// Run the substrate until shutdown: listener, peer links, heartbeats,
    /// initial sync, and the command loop
    pub async fn run(mut self) -> tokio::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.cluster_port)).await?;
        info!(
            "Node '{}' listening for cluster traffic on port {} ({} peers, {} consistency)",
            self.config.node_id,
            self.config.cluster_port,
            self.config.peers.len(),
            self.config.write_consistency
        );

        self.spawn_listener(listener);
        self.spawn_peer_links().await;
        self.spawn_heartbeats();
        self.spawn_initial_sync();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Node '{}' cluster manager stopped", self.config.node_id);
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterKey(key) => {
                self.store.register_key(&key);
                self.fan_out(key, ReplicationOp::RegisterKey);
            }
            Command::Put { key, entry } => {
                self.store.apply_local_put(&key, entry.clone());
                self.fan_out(key, ReplicationOp::Put { entry });
            }
            Command::Remove(key) => {
                self.store.apply_remove(&key, &self.config.node_id);
                self.fan_out(key, ReplicationOp::Remove);
            }
            Command::Subscribe(key) => self.store.subscribe(&key),
        }
    }

    /// Queue a write on every peer link and track its quorum off-task
    fn fan_out(&self, key: String, op: ReplicationOp) {
        let entry = ReplicationEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            key: key.clone(),
            op,
            origin_node: self.config.node_id.clone(),
        };

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        for (peer_id, queue) in &self.peer_queues {
            let cmd = PeerCommand {
                entry: entry.clone(),
                ack_tx: ack_tx.clone(),
            };
            if queue.try_send(cmd).is_err() {
                warn!(
                    "Replication queue to '{}' is full; write for '{}' will rely on sync",
                    peer_id, key
                );
            }
        }
        drop(ack_tx);

        let mut tracker =
            QuorumTracker::new(self.config.write_consistency, self.config.replica_count());
        let timeout = self.config.write_timeout;
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if !tracker.reached() {
                let _ = tokio::time::timeout(timeout, async {
                    while !tracker.reached() {
                        match ack_rx.recv().await {
                            Some(()) => {
                                tracker.record_ack();
                            }
                            None => break,
                        }
                    }
                })
                .await;
            }
            let outcome = if tracker.reached() {
                WriteOutcome::Acknowledged
            } else {
                warn!(
                    "Write seq={} for '{}' got {}/{} acks before timeout",
                    entry.sequence,
                    key,
                    tracker.acks(),
                    tracker.required()
                );
                WriteOutcome::TimedOut
            };
            notifier.notify(ChangeNotification::Write { key, outcome });
        });
    }

    fn spawn_listener(&self, listener: TcpListener) {
        let store = self.store.clone();
        let node_id = self.config.node_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            let store = store.clone();
                            let node_id = node_id.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_cluster_connection(stream, store, node_id).await
                                {
                                    debug!("Cluster connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept cluster connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    async fn spawn_peer_links(&mut self) {
        let mut peers = self.peers.write().await;
        for spec in &self.config.peers {
            let (tx, rx) = mpsc::channel(1024);
            self.peer_queues.insert(spec.id.clone(), tx);
            peers.insert(spec.id.clone(), PeerNode::new(spec.clone()));
            tokio::spawn(run_peer_link(
                spec.clone(),
                rx,
                self.store.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    fn spawn_heartbeats(&self) {
        if self.config.peers.is_empty() {
            return;
        }
        let peers = self.peers.clone();
        let node_id = self.config.node_id.clone();
        let interval = self.config.heartbeat_interval;
        let timeout = self.config.heartbeat_timeout;
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(run_heartbeats(peers, node_id, interval, timeout, shutdown_rx));
    }

    fn spawn_initial_sync(&self) {
        if self.config.peers.is_empty() {
            return;
        }
        let peers = self.config.peers.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            for spec in &peers {
                match request_sync(spec).await {
                    Ok(snapshot) => {
                        info!(
                            "Synchronized initial state from '{}' ({} keys)",
                            spec.id,
                            snapshot.keys.len()
                        );
                        store.merge_snapshot(snapshot);
                        return;
                    }
                    Err(e) => debug!("Initial sync with '{}' failed: {}", spec.id, e),
                }
            }
            warn!("No peer reachable for initial sync; starting from local state only");
        });
    }
}

/// Serve one inbound peer connection until it closes
async fn handle_cluster_connection(
    mut stream: TcpStream,
    store: Arc<ReplicatedStore>,
    node_id: String,
) -> tokio::io::Result<()> {
    loop {
        let op = match stream.read_u8().await {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        };

        match op {
            CLUSTER_OP_REPLICATE => {
                let body = read_frame_body(&mut stream).await?;
                let mut acked_seq = 0;
                if let Some(entry) = deserialize_replication_entry(&body) {
                    acked_seq = entry.sequence;
                    apply_remote_entry(&store, entry);
                }
                // Malformed entries are dropped but still acknowledged so
                // the sending link does not stall on a version mismatch
                stream.write_u8(CLUSTER_OP_REPLICATE_ACK).await?;
                stream.write_u64(acked_seq).await?;
                stream.flush().await?;
            }
            CLUSTER_OP_HEARTBEAT => {
                let body = read_frame_body(&mut stream).await?;
                let peer_id = String::from_utf8_lossy(&body);
                debug!("Heartbeat from '{}'", peer_id);
                write_frame(&mut stream, CLUSTER_OP_HEARTBEAT_ACK, node_id.as_bytes()).await?;
            }
            CLUSTER_OP_SYNC_REQUEST => {
                let _ = read_frame_body(&mut stream).await?;
                let snapshot = store.snapshot();
                match serde_json::to_vec(&snapshot) {
                    Ok(body) => {
                        info!(
                            "Serving state sync ({} keys, {} slots)",
                            snapshot.keys.len(),
                            snapshot.slots.len()
                        );
                        write_frame(&mut stream, CLUSTER_OP_SYNC_DATA, &body).await?;
                    }
                    Err(e) => warn!("Failed to serialize sync snapshot: {}", e),
                }
            }
            CLUSTER_OP_SYNC_DATA => {
                let body = read_frame_body(&mut stream).await?;
                match serde_json::from_slice::<StoreSnapshot>(&body) {
                    Ok(snapshot) => store.merge_snapshot(snapshot),
                    Err(e) => warn!("Dropping malformed sync snapshot: {}", e),
                }
            }
            other => {
                warn!("Unknown cluster operation: {}", other);
                return Ok(());
            }
        }
    }
}

fn apply_remote_entry(store: &ReplicatedStore, entry: ReplicationEntry) {
    debug!(
        "Applying replicated entry seq={} key='{}' from '{}'",
        entry.sequence, entry.key, entry.origin_node
    );
    match entry.op {
        ReplicationOp::RegisterKey => {
            store.register_key(&entry.key);
        }
        ReplicationOp::Put { entry: versioned } => {
            store.apply_remote_put(&entry.key, versioned);
        }
        ReplicationOp::Remove => {
            store.apply_remove(&entry.key, &entry.origin_node);
        }
    }
}

/// Own the outbound link to one peer: deliver queued writes in order,
/// reconnecting as needed
///
/// After an outage every write in between was lost for this peer, so the
/// first successful reconnect pushes a full state snapshot before new
/// writes resume.
async fn run_peer_link(
    spec: PeerSpec,
    mut rx: mpsc::Receiver<PeerCommand>,
    store: Arc<ReplicatedStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut conn: Option<TcpStream> = None;
    let mut lost_writes = false;

    loop {
        let cmd = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => return,
            },
            _ = shutdown_rx.recv() => return,
        };

        let mut delivered = false;
        for _attempt in 0..2 {
            if conn.is_none() {
                match connect_peer(&spec, lost_writes, &store).await {
                    Some(stream) => {
                        conn = Some(stream);
                        lost_writes = false;
                    }
                    None => break,
                }
            }
            if let Some(stream) = conn.as_mut() {
                match send_entry(stream, &cmd.entry).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        debug!("Link to '{}' failed: {}", spec.id, e);
                        conn = None;
                    }
                }
            }
        }

        if delivered {
            let _ = cmd.ack_tx.send(());
        } else {
            lost_writes = true;
            debug!(
                "Write seq={} not delivered to '{}'; state sync will catch it up",
                cmd.entry.sequence, spec.id
            );
        }
    }
}

async fn connect_peer(
    spec: &PeerSpec,
    push_sync: bool,
    store: &Arc<ReplicatedStore>,
) -> Option<TcpStream> {
    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(spec.addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("Cannot connect to '{}' at {}: {}", spec.id, spec.addr(), e);
            return None;
        }
        Err(_) => {
            debug!("Connection to '{}' timed out", spec.id);
            return None;
        }
    };

    if push_sync {
        // The peer missed writes while unreachable; hand it our state
        let snapshot = store.snapshot();
        let body = match serde_json::to_vec(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize catch-up snapshot: {}", e);
                return Some(stream);
            }
        };
        if let Err(e) = write_frame(&mut stream, CLUSTER_OP_SYNC_DATA, &body).await {
            debug!("Catch-up sync to '{}' failed: {}", spec.id, e);
            return None;
        }
        info!("Pushed catch-up snapshot to '{}'", spec.id);
    }
    Some(stream)
}

async fn send_entry(stream: &mut TcpStream, entry: &ReplicationEntry) -> Result<(), ClusterError> {
    let body = serialize_replication_entry(entry);
    write_frame(stream, CLUSTER_OP_REPLICATE, body.as_slice()).await?;

    let op = stream.read_u8().await?;
    if op != CLUSTER_OP_REPLICATE_ACK {
        return Err(ClusterError::UnexpectedOpcode(op));
    }
    let acked = stream.read_u64().await?;
    if acked != entry.sequence {
        return Err(ClusterError::AckMismatch {
            expected: entry.sequence,
            got: acked,
        });
    }
    Ok(())
}

async fn run_heartbeats(
    peers: Arc<RwLock<HashMap<String, PeerNode>>>,
    node_id: String,
    interval: Duration,
    timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => return,
        }

        let specs: Vec<PeerSpec> = {
            let peers = peers.read().await;
            peers.values().map(|p| p.spec.clone()).collect()
        };

        for spec in specs {
            let alive = send_heartbeat(&spec, &node_id).await.is_ok();
            let mut peers = peers.write().await;
            if let Some(peer) = peers.get_mut(&spec.id) {
                if alive {
                    if peer.state != NodeState::Healthy {
                        info!("Peer '{}' is healthy", spec.id);
                    }
                    peer.state = NodeState::Healthy;
                    peer.last_heartbeat = Instant::now();
                } else if peer.last_heartbeat.elapsed() > timeout {
                    if peer.state != NodeState::Dead {
                        warn!("Peer '{}' considered dead (no heartbeat ack)", spec.id);
                    }
                    peer.state = NodeState::Dead;
                } else {
                    peer.state = NodeState::Suspect;
                }
            }
        }
    }
}

async fn send_heartbeat(spec: &PeerSpec, node_id: &str) -> Result<(), ClusterError> {
    let mut stream =
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(spec.addr())).await??;
    write_frame(&mut stream, CLUSTER_OP_HEARTBEAT, node_id.as_bytes()).await?;
    let op = stream.read_u8().await?;
    if op != CLUSTER_OP_HEARTBEAT_ACK {
        return Err(ClusterError::UnexpectedOpcode(op));
    }
    let _ = read_frame_body(&mut stream).await?;
    Ok(())
}

async fn request_sync(spec: &PeerSpec) -> Result<StoreSnapshot, ClusterError> {
    let mut stream =
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(spec.addr())).await??;
    write_frame(&mut stream, CLUSTER_OP_SYNC_REQUEST, &[]).await?;

    let op = stream.read_u8().await?;
    if op != CLUSTER_OP_SYNC_DATA {
        return Err(ClusterError::UnexpectedOpcode(op));
    }
    let body = read_frame_body(&mut stream).await?;
    Ok(serde_json::from_slice(&body)?)
}
