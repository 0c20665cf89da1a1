//! Node wiring.
//!
//! A node owns the clock, the topology window, and one command store per
//! local shard slice. External collaborators (transport, data store, journal,
//! agent) are trait objects supplied by the embedding; the protocol core
//! never performs IO directly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time;

use crate::clock::HybridClock;
use crate::command::Command;
use crate::keys::{Key, Participants, Ranges};
use crate::messages::{Reply, Request};
use crate::progress::{ProgressEvent, ProgressPhase};
use crate::store::CommandStore;
use crate::topology::{Topologies, Topology};
use crate::topology_manager::{TopologyError, TopologyManager};
use crate::txn::{Domain, Kind, NodeId, Timestamp, Txn, TxnId};

/// Message transport. Implementations deliver a request to a peer and return
/// its reply; timeouts and faults surface as errors.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: NodeId, request: Request) -> anyhow::Result<Reply>;
}

/// Reads and writes of user values at a timestamp. The protocol treats
/// update payloads and outcomes as opaque bytes.
pub trait DataStore: Send + Sync + 'static {
    fn read(&self, keys: &Participants, at: Timestamp) -> BTreeMap<Key, Option<Vec<u8>>>;
    fn write(&self, keys: &Participants, update: &[u8], at: Timestamp);
}

/// Host-embedding hooks: invariant violations and uncaught errors are
/// reported here rather than propagated across tasks.
pub trait Agent: Send + Sync + 'static {
    fn on_violation(&self, message: &str);
    fn on_uncaught(&self, error: anyhow::Error) {
        tracing::error!(error = ?error, "uncaught protocol error");
    }
}

/// Opaque per-store persistence. Replay returns saved commands in save
/// order; the store folds them back into its registers on startup.
pub trait Journal: Send + Sync + 'static {
    fn save_command(&self, store_id: u32, command: &Command) -> anyhow::Result<()>;
    fn replay(&self, store_id: u32) -> anyhow::Result<Vec<Command>>;
}

/// No-op journal for embeddings that keep everything in memory.
pub struct NoopJournal;

impl Journal for NoopJournal {
    fn save_command(&self, _store_id: u32, _command: &Command) -> anyhow::Result<()> {
        Ok(())
    }

    fn replay(&self, _store_id: u32) -> anyhow::Result<Vec<Command>> {
        Ok(Vec::new())
    }
}

/// Timeouts and pruning knobs surfaced to the embedding agent.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Upper bound for one protocol RPC.
    pub rpc_timeout: Duration,
    /// Replica-local expiry for preaccepted EphemeralReads.
    pub preaccept_timeout: Duration,
    /// Client-facing deadline for one coordination attempt.
    pub local_expires_at: Duration,
    /// Base delay before a replica attempts to take over a coordination.
    pub attempt_coordination_delay: Duration,
    /// Base delay between dependency status probes.
    pub seek_progress_delay: Duration,
    /// How long a transaction may sit unprogressed before recovery fires.
    pub retry_await_timeout: Duration,
    /// Drop CFK entries older than this many HLC microseconds behind.
    pub cfk_hlc_prune_delta: u64,
    /// Prune a CFK after this many updates.
    pub cfk_prune_interval: usize,
    /// As above, for the per-store max-conflict registers.
    pub max_conflicts_hlc_prune_delta: u64,
    pub max_conflicts_prune_interval: usize,
    /// Number of command stores this node splits its ranges across.
    pub store_count: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(500),
            preaccept_timeout: Duration::from_secs(5),
            local_expires_at: Duration::from_secs(10),
            attempt_coordination_delay: Duration::from_millis(200),
            seek_progress_delay: Duration::from_millis(100),
            retry_await_timeout: Duration::from_millis(400),
            cfk_hlc_prune_delta: 1 << 26,
            cfk_prune_interval: 1024,
            max_conflicts_hlc_prune_delta: 1 << 26,
            max_conflicts_prune_interval: 4096,
            store_count: 1,
        }
    }
}

impl NodeConfig {
    /// Delay before the `retry_count`-th coordination takeover attempt.
    /// Jittered so contending recoverers desynchronize.
    pub fn attempt_coordination_delay(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(6);
        Self::jitter(self.attempt_coordination_delay * (1 << shift))
    }

    /// Delay before the `retry_count`-th dependency probe.
    pub fn seek_progress_delay(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(6);
        Self::jitter(self.seek_progress_delay * (1 << shift))
    }

    fn jitter(base: Duration) -> Duration {
        use rand::Rng;
        let spread = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
    }
}

/// An empty transaction used for sync points and system barriers.
pub fn empty_system_txn(kind: Kind, domain: Domain, scope: Participants) -> Txn {
    debug_assert!(kind.is_sync_point() || matches!(domain, Domain::Range));
    Txn::empty(kind, scope)
}

/// A single reply paired with its sender, streamed from a broadcast.
pub type VoteRx = mpsc::UnboundedReceiver<(NodeId, anyhow::Result<Reply>)>;

pub struct Node {
    pub id: NodeId,
    pub config: NodeConfig,
    pub clock: HybridClock,
    pub topology: RwLock<TopologyManager>,
    pub transport: Arc<dyn Transport>,
    pub agent: Arc<dyn Agent>,
    stores: Vec<CommandStore>,
}

impl Node {
    pub fn new(
        id: NodeId,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        data: Arc<dyn DataStore>,
        agent: Arc<dyn Agent>,
        journal: Arc<dyn Journal>,
    ) -> Arc<Self> {
        let store_count = config.store_count.max(1);
        let stores = (0..store_count as u32)
            .map(|store_id| {
                CommandStore::new(store_id, id, config.clone(), data.clone(), agent.clone(), journal.clone())
            })
            .collect();
        Arc::new(Self {
            id,
            config,
            clock: HybridClock::new(),
            topology: RwLock::new(TopologyManager::new(id)),
            transport,
            agent,
            stores,
        })
    }

    pub fn stores(&self) -> &[CommandStore] {
        &self.stores
    }

    /// The stores whose assigned slice intersects `scope`, with the union of
    /// each store's slices across the whole epoch window (an old owner keeps
    /// serving its ranges until hand-off completes).
    pub async fn stores_for(&self, scope: &Participants) -> Vec<(CommandStore, Ranges)> {
        let topologies: Vec<Topology> = {
            let manager = self.topology.read().await;
            (manager.min_epoch()..=manager.current_epoch())
                .filter_map(|epoch| manager.state(epoch).map(|s| s.topology.clone()))
                .collect()
        };
        if topologies.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (index, store) in self.stores.iter().enumerate() {
            let mut slice = Ranges::empty();
            for topology in &topologies {
                slice = slice.union(&self.store_slice(topology, index));
            }
            if scope.intersects(&slice) {
                out.push((store.clone(), slice));
            }
        }
        out
    }

    fn store_slice(&self, topology: &Topology, index: usize) -> Ranges {
        topology
            .shards
            .iter()
            .enumerate()
            .filter(|(shard_index, shard)| {
                shard.contains_node(self.id) && shard_index % self.stores.len() == index
            })
            .map(|(_, shard)| shard.range.clone())
            .collect()
    }

    /// Mint a transaction id from the local clock at the current epoch.
    pub async fn next_txn_id(&self, kind: Kind, domain: Domain) -> TxnId {
        let epoch = self.topology.read().await.current_epoch();
        TxnId::new(epoch, self.clock.next(), kind, domain, self.id)
    }

    /// Install the next topology and propagate this node's view to stores.
    pub async fn receive_topology(&self, topology: Topology) -> Result<(), TopologyError> {
        let epoch = topology.epoch;
        {
            let mut manager = self.topology.write().await;
            manager.receive(topology.clone())?;
            manager.acknowledge(epoch)?;
        }
        for (index, store) in self.stores.iter().enumerate() {
            let slice = self.store_slice(&topology, index);
            store.install_ranges(epoch, slice).await;
        }
        Ok(())
    }

    pub async fn select_unsynced(
        &self,
        scope: &Participants,
        min_epoch: u64,
        max_epoch: u64,
    ) -> Result<Topologies, TopologyError> {
        self.topology
            .read()
            .await
            .with_unsynced_epochs(scope, min_epoch, max_epoch)
    }

    /// Scatter a request to `targets`, streaming `(node, reply)` pairs. Each
    /// send is bounded by the configured RPC timeout.
    pub fn broadcast(self: &Arc<Self>, targets: Vec<NodeId>, request: Request) -> VoteRx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broadcast_into(targets, request, &tx);
        rx
    }

    /// As `broadcast`, but deliver into an existing channel; used to funnel
    /// redispatched requests into an in-progress reply loop.
    pub fn broadcast_into(
        self: &Arc<Self>,
        targets: Vec<NodeId>,
        request: Request,
        tx: &mpsc::UnboundedSender<(NodeId, anyhow::Result<Reply>)>,
    ) {
        for target in targets {
            let transport = self.transport.clone();
            let request = request.clone();
            let tx = tx.clone();
            let timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                let reply = match time::timeout(timeout, transport.send(target, request)).await {
                    Ok(reply) => reply,
                    Err(_) => Err(anyhow::anyhow!("rpc to {target} timed out")),
                };
                let _ = tx.send((target, reply));
            });
        }
    }

    /// Server-side entry: route a request to the intersecting stores and
    /// merge their replies.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Reply {
        crate::store::dispatch(self, request).await
    }

    /// Start the progress driver: a loop per store that ticks its progress
    /// log and acts on whatever fires.
    pub fn spawn_progress_driver(self: &Arc<Self>) {
        for store in self.stores.iter().cloned() {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(Duration::from_millis(50));
                interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    // draw a fresh sample so the driver tracks wall time even
                    // on an otherwise idle node
                    let now_ms = crate::clock::decompose(node.clock.next()).0 / 1_000;
                    let events = store.progress_tick(now_ms).await;
                    for event in events {
                        node.clone().act_on_progress(&store, event).await;
                    }
                }
            });
        }
    }

    async fn act_on_progress(self: Arc<Self>, store: &CommandStore, event: ProgressEvent) {
        let ProgressEvent {
            txn_id,
            phase,
            retries,
        } = event;
        match phase {
            ProgressPhase::Undecided => {
                let Some(route) = store.route_of(txn_id).await else {
                    return;
                };
                let node = self.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    match crate::recovery::recover(&node, txn_id, route).await {
                        Ok(()) => store.progress_clear(txn_id).await,
                        Err(err) if !err.is_transient() => {
                            // terminal: invalidated, redundant, or unservable
                            tracing::debug!(?txn_id, error = %err, "recovery terminal");
                            store.progress_clear(txn_id).await;
                        }
                        Err(err) => {
                            tracing::debug!(?txn_id, retries, error = %err, "recovery attempt failed");
                            let delay =
                                node.config.attempt_coordination_delay(retries).as_millis() as u64;
                            store
                                .progress_reschedule(txn_id, ProgressPhase::Undecided, delay)
                                .await;
                        }
                    }
                });
            }
            ProgressPhase::Awaiting => {
                let node = self.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    if store.seek_dependencies(&node, txn_id).await {
                        let delay = node.config.seek_progress_delay(retries).as_millis() as u64;
                        store
                            .progress_reschedule(txn_id, ProgressPhase::Awaiting, delay)
                            .await;
                        return;
                    }
                    if store.needs_outcome(txn_id).await {
                        // deps settled but the outcome never arrived
                        let recovered = match store.route_of(txn_id).await {
                            Some(route) => {
                                crate::recovery::recover(&node, txn_id, route).await.is_ok()
                            }
                            None => false,
                        };
                        if recovered {
                            store.progress_clear(txn_id).await;
                        } else {
                            let delay =
                                node.config.attempt_coordination_delay(retries).as_millis() as u64;
                            store
                                .progress_reschedule(txn_id, ProgressPhase::Awaiting, delay)
                                .await;
                        }
                        return;
                    }
                    store.progress_clear(txn_id).await;
                });
            }
            ProgressPhase::Durable => {
                store.progress_clear(txn_id).await;
            }
            ProgressPhase::EphemeralExpiry => {
                store.erase_ephemeral(txn_id).await;
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}, {} stores)", self.id, self.stores.len())
    }
}
