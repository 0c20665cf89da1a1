//! Shards, per-epoch topologies, and epoch-spanning selections.
//!
//! A shard is a contiguous key range plus the replica set owning it in one
//! epoch. A `Topologies` is the contiguous run of epochs a single
//! coordination spans, oldest first; trackers count votes against it.

use std::collections::BTreeSet;
use std::fmt;

use crate::keys::{Key, KeyRange, Participants, Ranges};
use crate::txn::NodeId;

/// A key range and the replicas that own it in a given epoch.
#[derive(Clone, PartialEq, Eq)]
pub struct Shard {
    pub range: KeyRange,
    /// Full replica set, sorted.
    pub nodes: Vec<NodeId>,
    /// Replicas counted toward the fast path; must number at least the slow
    /// quorum. Sorted subset of `nodes`.
    pub fast_path_electorate: Vec<NodeId>,
    /// Joining replicas that receive messages but do not vote yet.
    pub pending: Vec<NodeId>,
}

impl Shard {
    pub fn new(range: KeyRange, mut nodes: Vec<NodeId>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Self {
            range,
            fast_path_electorate: nodes.clone(),
            nodes,
            pending: Vec::new(),
        }
    }

    pub fn with_electorate(mut self, mut electorate: Vec<NodeId>) -> Self {
        electorate.sort_unstable();
        electorate.dedup();
        debug_assert!(
            electorate.len() >= self.slow_quorum_size(),
            "fast-path electorate smaller than slow quorum is invalid"
        );
        self.fast_path_electorate = electorate;
        self
    }

    pub fn replica_count(&self) -> usize {
        self.nodes.len()
    }

    /// Tolerated failures: `f = (replicas - 1) / 2`.
    pub fn max_failures(&self) -> usize {
        self.nodes.len().saturating_sub(1) / 2
    }

    pub fn slow_quorum_size(&self) -> usize {
        self.nodes.len() - self.max_failures()
    }

    /// `ceil((electorate + replicas) / 2)`, floored at the slow quorum.
    pub fn fast_quorum_size(&self) -> usize {
        let fp = self.fast_path_electorate.len();
        let rs = self.nodes.len();
        ((fp + rs + 1) / 2).max(self.slow_quorum_size())
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    pub fn is_in_electorate(&self, node: NodeId) -> bool {
        self.fast_path_electorate.binary_search(&node).is_ok()
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shard({:?} nodes={:?})", self.range, self.nodes)
    }
}

/// The shard assignment for one epoch. Shards are sorted by range start and
/// do not overlap.
#[derive(Clone, PartialEq, Eq)]
pub struct Topology {
    pub epoch: u64,
    pub shards: Vec<Shard>,
}

impl Topology {
    pub fn new(epoch: u64, mut shards: Vec<Shard>) -> Self {
        shards.sort_by(|a, b| a.range.start.cmp(&b.range.start));
        Self { epoch, shards }
    }

    pub fn empty(epoch: u64) -> Self {
        Self {
            epoch,
            shards: Vec::new(),
        }
    }

    pub fn ranges(&self) -> Ranges {
        self.shards.iter().map(|s| s.range.clone()).collect()
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.shards
            .iter()
            .flat_map(|s| s.nodes.iter().copied())
            .collect()
    }

    pub fn shard_for_key(&self, key: &Key) -> Option<&Shard> {
        self.shards.iter().find(|s| s.range.contains(key))
    }

    /// Shards intersecting the given participants.
    pub fn shards_for(&self, participants: &Participants) -> Vec<&Shard> {
        self.shards
            .iter()
            .filter(|shard| participants.intersects(&Ranges::single(shard.range.clone())))
            .collect()
    }

    /// The ranges of this topology owned by `node`.
    pub fn ranges_for_node(&self, node: NodeId) -> Ranges {
        self.shards
            .iter()
            .filter(|s| s.contains_node(node))
            .map(|s| s.range.clone())
            .collect()
    }

    /// This node's view: only the shards it participates in.
    pub fn for_node(&self, node: NodeId) -> Topology {
        Topology {
            epoch: self.epoch,
            shards: self
                .shards
                .iter()
                .filter(|s| s.contains_node(node) || s.pending.contains(&node))
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topology(e{} {:?})", self.epoch, self.shards)
    }
}

/// A contiguous run of epochs, oldest first. Coordinations that straddle a
/// topology change carry every epoch whose shards must vote.
#[derive(Clone, PartialEq, Eq)]
pub struct Topologies {
    topologies: Vec<Topology>,
}

impl Topologies {
    pub fn single(topology: Topology) -> Self {
        Self {
            topologies: vec![topology],
        }
    }

    pub fn new(mut topologies: Vec<Topology>) -> Self {
        topologies.sort_by_key(|t| t.epoch);
        debug_assert!(
            topologies.windows(2).all(|w| w[1].epoch == w[0].epoch + 1),
            "topologies must cover contiguous epochs"
        );
        Self { topologies }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topology> {
        self.topologies.iter()
    }

    pub fn len(&self) -> usize {
        self.topologies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topologies.is_empty()
    }

    pub fn min_epoch(&self) -> u64 {
        self.topologies.first().map(|t| t.epoch).unwrap_or(0)
    }

    pub fn max_epoch(&self) -> u64 {
        self.topologies.last().map(|t| t.epoch).unwrap_or(0)
    }

    pub fn for_epoch(&self, epoch: u64) -> Option<&Topology> {
        self.topologies.iter().find(|t| t.epoch == epoch)
    }

    pub fn current(&self) -> &Topology {
        self.topologies.last().expect("topologies never empty")
    }

    /// Every node appearing in any epoch of the selection.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.topologies.iter().flat_map(|t| t.nodes()).collect()
    }

    /// Total number of shard electorates a tracker must satisfy.
    pub fn shard_count(&self) -> usize {
        self.topologies.iter().map(|t| t.shards.len()).sum()
    }
}

impl fmt::Debug for Topologies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.topologies.iter()).finish()
    }
}
