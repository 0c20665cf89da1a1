//! Shared helpers for integration tests: an in-memory transport mesh, a
//! versioned memory data store, and a cluster builder.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use keel_accord::messages::{Reply, Request};
use keel_accord::{
    coordinate, CoordinateResult, DataStore, Domain, Key, KeyRange, Keys, Kind, Node, NodeConfig,
    NodeId, Outcome, Participants, Ranges, Route, Shard, Timestamp, Topology, Transport, Txn,
    TxnId,
};

/// How long `wait_until` polls before giving up.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport delivering requests directly to peer nodes, with per-node
/// partitioning for fault tests.
pub struct MeshTransport {
    nodes: RwLock<BTreeMap<NodeId, Arc<Node>>>,
    down: Mutex<HashSet<NodeId>>,
}

impl MeshTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            down: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes.write().expect("mesh lock").insert(node.id, node);
    }

    /// Sever a node: requests to it fail until `revive`.
    pub fn kill(&self, node: NodeId) {
        self.down.lock().expect("down lock").insert(node);
    }

    pub fn revive(&self, node: NodeId) {
        self.down.lock().expect("down lock").remove(&node);
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn send(&self, to: NodeId, request: Request) -> anyhow::Result<Reply> {
        if self.down.lock().expect("down lock").contains(&to) {
            anyhow::bail!("node {to} unreachable");
        }
        let node = self
            .nodes
            .read()
            .expect("mesh lock")
            .get(&to)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown node {to}"))?;
        Ok(node.handle(request).await)
    }
}

/// Versioned in-memory store: each key keeps every written version so reads
/// at a timestamp are reproducible.
#[derive(Default)]
pub struct MemoryStore {
    versions: Mutex<BTreeMap<Key, BTreeMap<Timestamp, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The latest value of `key`, regardless of timestamp.
    pub fn latest(&self, key: &Key) -> Option<Vec<u8>> {
        self.versions
            .lock()
            .expect("store lock")
            .get(key)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    /// `(timestamp, value)` pairs for `key`, oldest first.
    pub fn history(&self, key: &Key) -> Vec<(Timestamp, Vec<u8>)> {
        self.versions
            .lock()
            .expect("store lock")
            .get(key)
            .map(|versions| versions.iter().map(|(t, v)| (*t, v.clone())).collect())
            .unwrap_or_default()
    }
}

impl DataStore for MemoryStore {
    fn read(&self, keys: &Participants, at: Timestamp) -> BTreeMap<Key, Option<Vec<u8>>> {
        let versions = self.versions.lock().expect("store lock");
        let mut out = BTreeMap::new();
        match keys {
            Participants::Keys(keys) => {
                for key in keys.iter() {
                    let value = versions.get(key).and_then(|history| {
                        history.range(..=at).next_back().map(|(_, v)| v.clone())
                    });
                    out.insert(key.clone(), value);
                }
            }
            Participants::Ranges(ranges) => {
                for (key, history) in versions.iter() {
                    if ranges.contains_key(key) {
                        let value = history.range(..=at).next_back().map(|(_, v)| v.clone());
                        out.insert(key.clone(), value);
                    }
                }
            }
        }
        out
    }

    fn write(&self, keys: &Participants, update: &[u8], at: Timestamp) {
        let mut versions = self.versions.lock().expect("store lock");
        for key in keys.routing_keys() {
            versions
                .entry(key)
                .or_default()
                .insert(at, update.to_vec());
        }
    }
}

/// Agent that records invariant violations for assertion.
#[derive(Default)]
pub struct TestAgent {
    violations: Mutex<Vec<String>>,
}

impl TestAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().expect("agent lock").clone()
    }
}

impl keel_accord::Agent for TestAgent {
    fn on_violation(&self, message: &str) {
        self.violations
            .lock()
            .expect("agent lock")
            .push(message.to_string());
    }
}

/// A small in-process cluster sharing one mesh transport.
pub struct Cluster {
    pub transport: Arc<MeshTransport>,
    pub nodes: BTreeMap<NodeId, Arc<Node>>,
    pub data: BTreeMap<NodeId, Arc<MemoryStore>>,
    pub agents: BTreeMap<NodeId, Arc<TestAgent>>,
}

impl Cluster {
    /// `n` nodes, one shard owning the whole keyspace, epoch 1.
    pub async fn new(n: u64) -> Cluster {
        Self::with_config(n, NodeConfig::default()).await
    }

    /// `n` nodes, with only `members` owning the epoch-1 shard.
    pub async fn with_members(n: u64, members: Vec<NodeId>) -> Cluster {
        Self::build(n, members, NodeConfig::default()).await
    }

    pub async fn with_config(n: u64, config: NodeConfig) -> Cluster {
        let members: Vec<NodeId> = (1..=n).collect();
        Self::build(n, members, config).await
    }

    async fn build(n: u64, members: Vec<NodeId>, config: NodeConfig) -> Cluster {
        let transport = MeshTransport::new();
        let mut nodes = BTreeMap::new();
        let mut data = BTreeMap::new();
        let mut agents = BTreeMap::new();
        for id in 1..=n {
            let store = MemoryStore::new();
            let agent = TestAgent::new();
            let node = Node::new(
                id,
                config.clone(),
                transport.clone(),
                store.clone(),
                agent.clone(),
                Arc::new(keel_accord::node::NoopJournal),
            );
            transport.register(node.clone());
            data.insert(id, store);
            agents.insert(id, agent);
            nodes.insert(id, node);
        }
        let topology = Topology::new(
            1,
            vec![Shard::new(KeyRange::all(), members)],
        );
        for node in nodes.values() {
            node.receive_topology(topology.clone())
                .await
                .expect("install topology");
        }
        Cluster {
            transport,
            nodes,
            data,
            agents,
        }
    }

    pub fn node(&self, id: NodeId) -> Arc<Node> {
        self.nodes.get(&id).expect("node exists").clone()
    }

    /// Start progress drivers (recovery, dependency chasing) on every node.
    pub fn start_progress(&self) {
        for node in self.nodes.values() {
            node.spawn_progress_driver();
        }
    }

    pub async fn install_topology(&self, topology: Topology) {
        for node in self.nodes.values() {
            node.receive_topology(topology.clone())
                .await
                .expect("install topology");
        }
    }

    pub async fn submit_write(
        &self,
        via: NodeId,
        key: &str,
        value: &[u8],
    ) -> CoordinateResult<Outcome> {
        let node = self.node(via);
        let txn_id = node.next_txn_id(Kind::Write, Domain::Key).await;
        let (txn, route) = write_txn(key, value);
        coordinate(&node, txn_id, txn, route).await
    }

    pub async fn submit_read(&self, via: NodeId, key: &str) -> CoordinateResult<Outcome> {
        let node = self.node(via);
        let txn_id = node.next_txn_id(Kind::Read, Domain::Key).await;
        let (txn, route) = read_txn(key);
        coordinate(&node, txn_id, txn, route).await
    }

    /// The `(status, executeAt)` a node's store records for a transaction.
    pub async fn command_state(
        &self,
        on: NodeId,
        txn_id: TxnId,
    ) -> Option<(keel_accord::SaveStatus, Option<Timestamp>)> {
        let node = self.node(on);
        let store = node.stores()[0].clone();
        store
            .execute(move |inner| {
                inner
                    .command(txn_id)
                    .map(|c| (c.save_status, c.execute_at))
            })
            .await
    }

    pub async fn command_durability(
        &self,
        on: NodeId,
        txn_id: TxnId,
    ) -> Option<keel_accord::Durability> {
        let node = self.node(on);
        let store = node.stores()[0].clone();
        store
            .execute(move |inner| inner.command(txn_id).map(|c| c.durability))
            .await
    }

    pub fn assert_no_violations(&self) {
        for (id, agent) in &self.agents {
            let violations = agent.violations();
            assert!(
                violations.is_empty(),
                "node {id} recorded violations: {violations:?}"
            );
        }
    }
}

pub fn write_txn(key: &str, value: &[u8]) -> (Txn, Route) {
    let keys = Participants::Keys(Keys::of(vec![Key::from(key)]));
    let txn = Txn {
        kind: Kind::Write,
        keys: keys.clone(),
        read_scope: Participants::empty_keys(),
        update: Some(value.to_vec()),
    };
    (txn, Route::full(Key::from(key), keys))
}

pub fn read_txn(key: &str) -> (Txn, Route) {
    let keys = Participants::Keys(Keys::of(vec![Key::from(key)]));
    let txn = Txn {
        kind: Kind::Read,
        keys: keys.clone(),
        read_scope: keys.clone(),
        update: None,
    };
    (txn, Route::full(Key::from(key), keys))
}

/// Poll until `check` passes or the settle timeout expires.
pub async fn wait_until<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Convenience: all-ranges participants for range-domain transactions.
pub fn whole_range() -> Participants {
    Participants::Ranges(Ranges::single(KeyRange::all()))
}
