//! Vote accumulation over a `Topologies`.
//!
//! A tracker owns one `ShardTracker` per shard per epoch in the selection.
//! A node's reply is credited to every shard containing it; replies from
//! non-members are silently ignored. Trackers only report a terminal status
//! once.

use std::collections::BTreeSet;

use crate::topology::{Shard, Topologies};
use crate::txn::NodeId;

/// Outcome of folding one reply into a tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    NoChange,
    Success,
    Failed,
}

/// Votes for one shard.
#[derive(Debug)]
pub struct ShardTracker {
    pub shard: Shard,
    successes: BTreeSet<NodeId>,
    fast_path_successes: BTreeSet<NodeId>,
    failures: BTreeSet<NodeId>,
}

impl ShardTracker {
    fn new(shard: Shard) -> Self {
        Self {
            shard,
            successes: BTreeSet::new(),
            fast_path_successes: BTreeSet::new(),
            failures: BTreeSet::new(),
        }
    }

    fn record_success(&mut self, node: NodeId, fast_path: bool) {
        if !self.shard.contains_node(node) {
            return;
        }
        self.failures.remove(&node);
        self.successes.insert(node);
        if fast_path && self.shard.is_in_electorate(node) {
            self.fast_path_successes.insert(node);
        }
    }

    fn record_failure(&mut self, node: NodeId) {
        if !self.shard.contains_node(node) {
            return;
        }
        if !self.successes.contains(&node) {
            self.failures.insert(node);
        }
    }

    pub fn has_reached_quorum(&self) -> bool {
        self.successes.len() >= self.shard.slow_quorum_size()
    }

    pub fn has_reached_fast_path(&self) -> bool {
        self.fast_path_successes.len() >= self.shard.fast_quorum_size()
    }

    pub fn has_all_replies(&self) -> bool {
        self.successes.len() + self.failures.len() >= self.shard.replica_count()
    }

    /// Too many failures for a slow quorum to ever form.
    pub fn has_failed(&self) -> bool {
        let reachable = self.shard.replica_count() - self.failures.len();
        reachable < self.shard.slow_quorum_size()
    }

    /// The fast path is unreachable (but a slow quorum may still form).
    pub fn fast_path_unattainable(&self) -> bool {
        let electorate = &self.shard.fast_path_electorate;
        let lost = electorate
            .iter()
            .filter(|n| self.failures.contains(n))
            .count();
        let declined = electorate
            .iter()
            .filter(|n| self.successes.contains(n) && !self.fast_path_successes.contains(n))
            .count();
        electorate.len() - lost - declined < self.shard.fast_quorum_size()
    }
}

fn trackers_for(topologies: &Topologies) -> Vec<ShardTracker> {
    topologies
        .iter()
        .flat_map(|t| t.shards.iter().cloned())
        .map(ShardTracker::new)
        .collect()
}

/// Succeeds once every shard in the selection reaches its slow quorum.
#[derive(Debug)]
pub struct QuorumTracker {
    shards: Vec<ShardTracker>,
    done: bool,
}

impl QuorumTracker {
    pub fn new(topologies: &Topologies) -> Self {
        Self {
            shards: trackers_for(topologies),
            done: false,
        }
    }

    pub fn record_success(&mut self, node: NodeId) -> RequestStatus {
        for shard in &mut self.shards {
            shard.record_success(node, false);
        }
        self.check()
    }

    pub fn record_failure(&mut self, node: NodeId) -> RequestStatus {
        for shard in &mut self.shards {
            shard.record_failure(node);
        }
        if self.done {
            return RequestStatus::NoChange;
        }
        if self.shards.iter().any(ShardTracker::has_failed) {
            self.done = true;
            return RequestStatus::Failed;
        }
        RequestStatus::NoChange
    }

    fn check(&mut self) -> RequestStatus {
        if self.done {
            return RequestStatus::NoChange;
        }
        if self.shards.iter().all(ShardTracker::has_reached_quorum) {
            self.done = true;
            return RequestStatus::Success;
        }
        RequestStatus::NoChange
    }

    pub fn shards(&self) -> &[ShardTracker] {
        &self.shards
    }
}

/// Quorum tracker that additionally decides the fast path: accepted iff every
/// shard independently reached its fast-path threshold with matching votes.
#[derive(Debug)]
pub struct FastPathTracker {
    shards: Vec<ShardTracker>,
    done: bool,
}

impl FastPathTracker {
    pub fn new(topologies: &Topologies) -> Self {
        Self {
            shards: trackers_for(topologies),
            done: false,
        }
    }

    /// `fast_path` is the replica's vote: it preaccepted with
    /// `executeAt == txnId`.
    pub fn record_success(&mut self, node: NodeId, fast_path: bool) -> RequestStatus {
        for shard in &mut self.shards {
            shard.record_success(node, fast_path);
        }
        if self.done {
            return RequestStatus::NoChange;
        }
        let quorate = self.shards.iter().all(ShardTracker::has_reached_quorum);
        if !quorate {
            return RequestStatus::NoChange;
        }
        // With a slow quorum everywhere we can stop as soon as the fast path
        // is settled either way; otherwise wait for more replies.
        if self.has_fast_path_accepted() || self.fast_path_settled_negative() || self.all_replied()
        {
            self.done = true;
            return RequestStatus::Success;
        }
        RequestStatus::NoChange
    }

    pub fn record_failure(&mut self, node: NodeId) -> RequestStatus {
        for shard in &mut self.shards {
            shard.record_failure(node);
        }
        if self.done {
            return RequestStatus::NoChange;
        }
        if self.shards.iter().any(ShardTracker::has_failed) {
            self.done = true;
            return RequestStatus::Failed;
        }
        if self.shards.iter().all(ShardTracker::has_reached_quorum) && self.fast_path_settled_negative()
        {
            self.done = true;
            return RequestStatus::Success;
        }
        RequestStatus::NoChange
    }

    pub fn has_fast_path_accepted(&self) -> bool {
        self.shards.iter().all(ShardTracker::has_reached_fast_path)
    }

    fn fast_path_settled_negative(&self) -> bool {
        self.shards.iter().any(ShardTracker::fast_path_unattainable)
    }

    fn all_replied(&self) -> bool {
        self.shards.iter().all(ShardTracker::has_all_replies)
    }

    pub fn shards(&self) -> &[ShardTracker] {
        &self.shards
    }
}

/// Requires a reply from every replica in the selection.
#[derive(Debug)]
pub struct AllTracker {
    remaining: BTreeSet<NodeId>,
    failed: bool,
    done: bool,
}

impl AllTracker {
    pub fn new(topologies: &Topologies) -> Self {
        Self {
            remaining: topologies.nodes(),
            failed: false,
            done: false,
        }
    }

    pub fn record_success(&mut self, node: NodeId) -> RequestStatus {
        self.remaining.remove(&node);
        if self.done {
            return RequestStatus::NoChange;
        }
        if self.remaining.is_empty() {
            self.done = true;
            return if self.failed {
                RequestStatus::Failed
            } else {
                RequestStatus::Success
            };
        }
        RequestStatus::NoChange
    }

    pub fn record_failure(&mut self, node: NodeId) -> RequestStatus {
        if !self.remaining.remove(&node) {
            return RequestStatus::NoChange;
        }
        self.failed = true;
        if self.done {
            return RequestStatus::NoChange;
        }
        if self.remaining.is_empty() {
            self.done = true;
            return RequestStatus::Failed;
        }
        RequestStatus::NoChange
    }
}

/// One successful read per shard, with replacement dispatch on failure.
#[derive(Debug)]
pub struct ReadTracker {
    shards: Vec<ReadShard>,
    done: bool,
}

#[derive(Debug)]
struct ReadShard {
    shard: Shard,
    untried: Vec<NodeId>,
    in_flight: BTreeSet<NodeId>,
    succeeded: bool,
}

impl ReadTracker {
    pub fn new(topologies: &Topologies) -> Self {
        let shards = topologies
            .iter()
            .flat_map(|t| t.shards.iter().cloned())
            .map(|shard| ReadShard {
                untried: shard.nodes.clone(),
                in_flight: BTreeSet::new(),
                succeeded: false,
                shard,
            })
            .collect();
        Self {
            shards,
            done: false,
        }
    }

    /// Pick the first wave: one replica per shard, reusing a node across
    /// shards when it serves several.
    pub fn initial_contacts(&mut self) -> Vec<NodeId> {
        let mut contacts: BTreeSet<NodeId> = BTreeSet::new();
        for shard in &mut self.shards {
            if shard
                .in_flight
                .iter()
                .chain(contacts.iter())
                .any(|n| shard.shard.contains_node(*n))
            {
                // an already-chosen contact covers this shard
                let covered: Vec<NodeId> = contacts
                    .iter()
                    .copied()
                    .filter(|n| shard.shard.contains_node(*n))
                    .collect();
                for node in covered {
                    shard.untried.retain(|n| *n != node);
                    shard.in_flight.insert(node);
                }
                continue;
            }
            if let Some(node) = shard.untried.first().copied() {
                shard.untried.retain(|n| *n != node);
                shard.in_flight.insert(node);
                contacts.insert(node);
            }
        }
        contacts.into_iter().collect()
    }

    pub fn record_success(&mut self, node: NodeId) -> RequestStatus {
        for shard in &mut self.shards {
            if shard.in_flight.remove(&node) || shard.shard.contains_node(node) {
                shard.succeeded = true;
            }
        }
        if self.done {
            return RequestStatus::NoChange;
        }
        if self.shards.iter().all(|s| s.succeeded) {
            self.done = true;
            return RequestStatus::Success;
        }
        RequestStatus::NoChange
    }

    /// On failure, returns replacement contacts to dispatch; `Failed` when a
    /// shard has no candidates left.
    pub fn record_failure(&mut self, node: NodeId) -> (RequestStatus, Vec<NodeId>) {
        let mut redispatch = Vec::new();
        for shard in &mut self.shards {
            shard.in_flight.remove(&node);
            shard.untried.retain(|n| *n != node);
            if shard.succeeded || !shard.in_flight.is_empty() {
                continue;
            }
            match shard.untried.first().copied() {
                Some(next) => {
                    shard.untried.retain(|n| *n != next);
                    shard.in_flight.insert(next);
                    redispatch.push(next);
                }
                None => {
                    if !self.done {
                        self.done = true;
                        return (RequestStatus::Failed, Vec::new());
                    }
                }
            }
        }
        redispatch.sort_unstable();
        redispatch.dedup();
        (RequestStatus::NoChange, redispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRange;
    use crate::topology::{Topologies, Topology};

    fn one_shard(nodes: &[NodeId]) -> Topologies {
        Topologies::single(Topology::new(
            1,
            vec![Shard::new(KeyRange::new("a", "z"), nodes.to_vec())],
        ))
    }

    fn two_shards() -> Topologies {
        Topologies::single(Topology::new(
            1,
            vec![
                Shard::new(KeyRange::new("a", "m"), vec![1, 2, 3]),
                Shard::new(KeyRange::new("m", "z"), vec![3, 4, 5]),
            ],
        ))
    }

    #[test]
    fn quorum_tracker_succeeds_on_slow_quorum_everywhere() {
        let mut tracker = QuorumTracker::new(&two_shards());
        assert_eq!(tracker.record_success(1), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(3), RequestStatus::NoChange);
        // shard 2 still needs one more
        assert_eq!(tracker.record_success(4), RequestStatus::Success);
        // terminal status reported once
        assert_eq!(tracker.record_success(5), RequestStatus::NoChange);
    }

    #[test]
    fn quorum_tracker_fails_when_quorum_unreachable() {
        let mut tracker = QuorumTracker::new(&one_shard(&[1, 2, 3]));
        assert_eq!(tracker.record_failure(1), RequestStatus::NoChange);
        assert_eq!(tracker.record_failure(2), RequestStatus::Failed);
    }

    #[test]
    fn non_member_votes_are_ignored() {
        let mut tracker = QuorumTracker::new(&one_shard(&[1, 2, 3]));
        assert_eq!(tracker.record_success(9), RequestStatus::NoChange);
        assert_eq!(tracker.record_failure(9), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(1), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(2), RequestStatus::Success);
    }

    #[test]
    fn fast_path_requires_full_electorate_quorum() {
        // 3 replicas, full electorate: fast quorum is 3
        let mut tracker = FastPathTracker::new(&one_shard(&[1, 2, 3]));
        assert_eq!(tracker.record_success(1, true), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(2, true), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(3, true), RequestStatus::Success);
        assert!(tracker.has_fast_path_accepted());
    }

    #[test]
    fn fast_path_settles_negative_without_waiting_for_all() {
        let mut tracker = FastPathTracker::new(&one_shard(&[1, 2, 3]));
        // a slow-path vote from one electorate member makes fast unattainable
        assert_eq!(tracker.record_success(1, false), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(2, true), RequestStatus::Success);
        assert!(!tracker.has_fast_path_accepted());
    }

    #[test]
    fn all_tracker_waits_for_everyone() {
        let mut tracker = AllTracker::new(&two_shards());
        for node in [1, 2, 3, 4] {
            assert_eq!(tracker.record_success(node), RequestStatus::NoChange);
        }
        assert_eq!(tracker.record_success(5), RequestStatus::Success);
    }

    #[test]
    fn read_tracker_redispatches_on_failure() {
        let mut tracker = ReadTracker::new(&two_shards());
        let contacts = tracker.initial_contacts();
        assert_eq!(contacts, vec![1, 3]);

        // fail shard 1's contact; a replacement is offered
        let (status, replacements) = tracker.record_failure(1);
        assert_eq!(status, RequestStatus::NoChange);
        assert_eq!(replacements, vec![2]);

        // node 3 serves both shards, so its success covers both
        assert_eq!(tracker.record_success(3), RequestStatus::Success);
        assert_eq!(tracker.record_success(2), RequestStatus::NoChange);
    }

    #[test]
    fn read_tracker_fails_when_shard_exhausted() {
        let mut tracker = ReadTracker::new(&one_shard(&[1, 2]));
        tracker.initial_contacts();
        let (status, replacements) = tracker.record_failure(1);
        assert_eq!(status, RequestStatus::NoChange);
        assert_eq!(replacements, vec![2]);
        let (status, _) = tracker.record_failure(2);
        assert_eq!(status, RequestStatus::Failed);
    }
}
