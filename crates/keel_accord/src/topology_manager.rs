//! Epoch window management.
//!
//! The manager holds a contiguous window `[min_epoch, current_epoch]` of
//! epoch states: the global topology, this node's view, which ranges have
//! been transferred (synced) from the previous epoch, which are closed to
//! new proposals, and which are redundant (globally applied and eligible for
//! GC). Selections for a coordination extend downward through any epoch that
//! still owes un-transferred ranges.

use std::collections::{BTreeSet, VecDeque};

use tokio::sync::oneshot;

use crate::keys::{Participants, Ranges};
use crate::topology::{Topologies, Topology};
use crate::txn::NodeId;

/// Which watermark a downward epoch extension consults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Watermark {
    Synced,
    Closed,
    Complete,
}

/// Per-epoch bookkeeping.
#[derive(Debug)]
pub struct EpochState {
    pub topology: Topology,
    /// Ranges whose ownership transferred into this epoch is complete.
    /// Ranges added in this epoch (no previous owner) start synced.
    pub synced: Ranges,
    /// Ranges closed to new proposals in this epoch.
    pub closed: Ranges,
    /// Ranges for which every proposable transaction of this epoch has been
    /// globally applied.
    pub redundant: Ranges,
    /// Ranges that first appeared in this epoch.
    pub added: Ranges,
    /// Ranges that left the topology in this epoch.
    pub removed: Ranges,
    /// Nodes that reported sync completion for this epoch.
    sync_reporters: BTreeSet<NodeId>,
    pub acknowledged: bool,
}

impl EpochState {
    fn new(topology: Topology, previous: Option<&Topology>) -> Self {
        let ranges = topology.ranges();
        let (added, removed) = match previous {
            None => (ranges.clone(), Ranges::empty()),
            Some(prev) => {
                let prev_ranges = prev.ranges();
                (
                    ranges.without(&prev_ranges),
                    prev_ranges.without(&ranges),
                )
            }
        };
        Self {
            topology,
            // added ranges have no prior owner to transfer from
            synced: added.clone(),
            closed: Ranges::empty(),
            redundant: Ranges::empty(),
            added,
            removed,
            sync_reporters: BTreeSet::new(),
            acknowledged: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.topology.epoch
    }

    pub fn is_sync_complete(&self) -> bool {
        self.synced.contains_all(&self.topology.ranges())
    }

    /// Recompute synced ranges from the reporter set: a shard's range is
    /// transferred once a slow quorum of its (non-faulty) replicas reported.
    fn recompute_synced(&mut self, faulty: &BTreeSet<NodeId>) {
        let mut synced = self.added.clone();
        for shard in &self.topology.shards {
            let reporters = shard
                .nodes
                .iter()
                .filter(|n| self.sync_reporters.contains(n) && !faulty.contains(n))
                .count();
            if reporters >= shard.slow_quorum_size() {
                synced = synced.union(&Ranges::single(shard.range.clone()));
            }
        }
        self.synced = synced;
    }
}

/// Errors surfaced by epoch operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("epoch {got} out of order (expected {expected})")]
    EpochOutOfOrder { expected: u64, got: u64 },
    #[error("epoch {0} not in window")]
    UnknownEpoch(u64),
    #[error("cannot truncate epoch {0}: sync incomplete")]
    SyncIncomplete(u64),
}

/// The node-local epoch window and selection logic.
pub struct TopologyManager {
    node: NodeId,
    epochs: VecDeque<EpochState>,
    last_acknowledged: u64,
    faulty: BTreeSet<NodeId>,
    awaiting: Vec<(u64, oneshot::Sender<()>)>,
}

impl TopologyManager {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            epochs: VecDeque::new(),
            last_acknowledged: 0,
            faulty: BTreeSet::new(),
            awaiting: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn min_epoch(&self) -> u64 {
        self.epochs.front().map(|e| e.epoch()).unwrap_or(0)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.back().map(|e| e.epoch()).unwrap_or(0)
    }

    pub fn current(&self) -> Option<&Topology> {
        self.epochs.back().map(|e| &e.topology)
    }

    pub fn state(&self, epoch: u64) -> Option<&EpochState> {
        let min = self.min_epoch();
        if epoch < min || epoch > self.current_epoch() {
            return None;
        }
        self.epochs.get((epoch - min) as usize)
    }

    fn state_mut(&mut self, epoch: u64) -> Option<&mut EpochState> {
        let min = self.min_epoch();
        if epoch < min || epoch > self.current_epoch() {
            return None;
        }
        self.epochs.get_mut((epoch - min) as usize)
    }

    /// This node's owned ranges in `epoch`.
    pub fn owned_ranges(&self, epoch: u64) -> Ranges {
        self.state(epoch)
            .map(|s| s.topology.ranges_for_node(self.node))
            .unwrap_or_else(Ranges::empty)
    }

    /// Install the next epoch's topology. Must be `current + 1` (or the very
    /// first topology seen).
    pub fn receive(&mut self, topology: Topology) -> Result<(), TopologyError> {
        let expected = if self.epochs.is_empty() {
            topology.epoch
        } else {
            self.current_epoch() + 1
        };
        if topology.epoch != expected {
            return Err(TopologyError::EpochOutOfOrder {
                expected,
                got: topology.epoch,
            });
        }
        let previous = self.epochs.back().map(|e| &e.topology);
        let state = EpochState::new(topology, previous);
        tracing::debug!(
            epoch = state.epoch(),
            added = ?state.added,
            removed = ?state.removed,
            "received topology"
        );
        self.epochs.push_back(state);
        Ok(())
    }

    /// Locally acknowledge an epoch. Must arrive in epoch order; releases
    /// `await_epoch` waiters.
    pub fn acknowledge(&mut self, epoch: u64) -> Result<(), TopologyError> {
        if epoch != self.last_acknowledged + 1 && !(self.last_acknowledged == 0 && epoch == self.min_epoch())
        {
            return Err(TopologyError::EpochOutOfOrder {
                expected: self.last_acknowledged + 1,
                got: epoch,
            });
        }
        if self.state(epoch).is_none() {
            return Err(TopologyError::UnknownEpoch(epoch));
        }
        if let Some(state) = self.state_mut(epoch) {
            state.acknowledged = true;
        }
        self.last_acknowledged = epoch;
        let acknowledged = self.last_acknowledged;
        self.awaiting.retain_mut(|(awaited, tx)| {
            if *awaited <= acknowledged {
                // receiver may have gone away; ignore
                let (dummy_tx, _rx) = oneshot::channel();
                let tx = std::mem::replace(tx, dummy_tx);
                let _ = tx.send(());
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// Wait until `epoch` has been acknowledged locally.
    pub fn await_epoch(&mut self, epoch: u64) -> Option<oneshot::Receiver<()>> {
        if epoch <= self.last_acknowledged {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.awaiting.push((epoch, tx));
        Some(rx)
    }

    /// A replica reports it finished syncing `epoch`. Completion of an epoch
    /// cascades: ranges synced here are treated as transferred in every later
    /// epoch that still carries them untransferred only through selection
    /// (see `select_*`), so no state is rewritten forward.
    pub fn sync_complete(&mut self, node: NodeId, epoch: u64) -> Result<(), TopologyError> {
        let faulty = self.faulty.clone();
        let state = self
            .state_mut(epoch)
            .ok_or(TopologyError::UnknownEpoch(epoch))?;
        state.sync_reporters.insert(node);
        state.recompute_synced(&faulty);
        if state.is_sync_complete() {
            tracing::debug!(epoch, "epoch sync complete");
        }
        Ok(())
    }

    /// No new transactions may be proposed in `epoch` for `ranges`.
    pub fn epoch_closed(&mut self, ranges: Ranges, epoch: u64) -> Result<(), TopologyError> {
        let state = self
            .state_mut(epoch)
            .ok_or(TopologyError::UnknownEpoch(epoch))?;
        state.closed = state.closed.union(&ranges);
        Ok(())
    }

    /// Every proposable transaction of `epoch` on `ranges` is globally
    /// applied; the epoch may be truncated once fully redundant.
    pub fn epoch_redundant(&mut self, ranges: Ranges, epoch: u64) -> Result<(), TopologyError> {
        let state = self
            .state_mut(epoch)
            .ok_or(TopologyError::UnknownEpoch(epoch))?;
        state.redundant = state.redundant.union(&ranges);
        // redundant implies closed
        state.closed = state.closed.union(&state.redundant.clone());
        Ok(())
    }

    /// Drop epochs older than `epoch`. Requires their sync completed.
    pub fn truncate_until(&mut self, epoch: u64) -> Result<(), TopologyError> {
        while self.min_epoch() < epoch && self.epochs.len() > 1 {
            let front = self.epochs.front().expect("non-empty");
            if !front.is_sync_complete() {
                return Err(TopologyError::SyncIncomplete(front.epoch()));
            }
            self.epochs.pop_front();
        }
        Ok(())
    }

    pub fn mark_faulty(&mut self, node: NodeId) {
        self.faulty.insert(node);
        let faulty = self.faulty.clone();
        for state in &mut self.epochs {
            state.recompute_synced(&faulty);
        }
    }

    pub fn mark_healthy(&mut self, node: NodeId) {
        self.faulty.remove(&node);
    }

    pub fn faulty(&self) -> &BTreeSet<NodeId> {
        &self.faulty
    }

    /// Exactly the epochs `[min_epoch, max_epoch]`.
    pub fn precise_epochs(
        &self,
        _scope: &Participants,
        min_epoch: u64,
        max_epoch: u64,
    ) -> Result<Topologies, TopologyError> {
        let mut out = Vec::new();
        for epoch in min_epoch..=max_epoch {
            let state = self.state(epoch).ok_or(TopologyError::UnknownEpoch(epoch))?;
            out.push(state.topology.clone());
        }
        Ok(Topologies::new(out))
    }

    /// `[min_epoch, max_epoch]`, extended downward through any epoch whose
    /// synced ranges do not fully cover the selection's scope.
    pub fn with_unsynced_epochs(
        &self,
        scope: &Participants,
        min_epoch: u64,
        max_epoch: u64,
    ) -> Result<Topologies, TopologyError> {
        self.extend_down(scope, min_epoch, max_epoch, Watermark::Synced)
    }

    /// As `with_unsynced_epochs`, but at the `closed` watermark: include older
    /// epochs whose ranges are still open to proposals.
    pub fn with_open_epochs(
        &self,
        scope: &Participants,
        min_epoch: u64,
        max_epoch: u64,
    ) -> Result<Topologies, TopologyError> {
        self.extend_down(scope, min_epoch, max_epoch, Watermark::Closed)
    }

    /// As `with_unsynced_epochs`, but at the `redundant` watermark.
    pub fn with_uncompleted_epochs(
        &self,
        scope: &Participants,
        min_epoch: u64,
        max_epoch: u64,
    ) -> Result<Topologies, TopologyError> {
        self.extend_down(scope, min_epoch, max_epoch, Watermark::Complete)
    }

    fn extend_down(
        &self,
        scope: &Participants,
        min_epoch: u64,
        max_epoch: u64,
        watermark: Watermark,
    ) -> Result<Topologies, TopologyError> {
        let mut out = Vec::new();
        for epoch in min_epoch..=max_epoch {
            let state = self.state(epoch).ok_or(TopologyError::UnknownEpoch(epoch))?;
            out.push(state.topology.clone());
        }

        // An older epoch is needed only while part of the scope has not been
        // settled by an epoch already in the selection.
        let scope_ranges = scope.as_ranges();
        let mut epoch = min_epoch;
        match watermark {
            Watermark::Synced => {
                // synced(e) records what was transferred INTO e from e-1, so
                // the child epoch's watermark decides whether the parent is
                // still needed.
                let state = self.state(epoch).ok_or(TopologyError::UnknownEpoch(epoch))?;
                let mut pending = scope_ranges
                    .slice(&state.topology.ranges())
                    .without(&state.synced);
                while !pending.is_empty() && epoch > self.min_epoch() {
                    epoch -= 1;
                    let state = self.state(epoch).ok_or(TopologyError::UnknownEpoch(epoch))?;
                    out.push(state.topology.clone());
                    pending = pending
                        .slice(&state.topology.ranges())
                        .without(&state.synced);
                }
            }
            Watermark::Closed | Watermark::Complete => {
                // closed/redundant are properties of the epoch itself: an
                // older epoch joins only for scope it still leaves open.
                let mut pending = scope_ranges;
                while !pending.is_empty() && epoch > self.min_epoch() {
                    let older = self
                        .state(epoch - 1)
                        .ok_or(TopologyError::UnknownEpoch(epoch - 1))?;
                    let still_open = pending
                        .slice(&older.topology.ranges())
                        .without(self.watermark_of(older, watermark));
                    if still_open.is_empty() {
                        break;
                    }
                    out.push(older.topology.clone());
                    pending = still_open;
                    epoch -= 1;
                }
            }
        }
        Ok(Topologies::new(out))
    }

    fn watermark_of<'a>(&self, state: &'a EpochState, watermark: Watermark) -> &'a Ranges {
        match watermark {
            Watermark::Synced => &state.synced,
            Watermark::Closed => &state.closed,
            Watermark::Complete => &state.redundant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Key, KeyRange, Keys};
    use crate::topology::Shard;

    fn topo(epoch: u64, shards: Vec<(KeyRange, Vec<NodeId>)>) -> Topology {
        Topology::new(
            epoch,
            shards
                .into_iter()
                .map(|(range, nodes)| Shard::new(range, nodes))
                .collect(),
        )
    }

    fn key_scope(keys: &[&str]) -> Participants {
        Participants::Keys(Keys::of(keys.iter().map(|k| Key::from(*k)).collect()))
    }

    fn manager_with_two_epochs() -> TopologyManager {
        let mut mgr = TopologyManager::new(1);
        mgr.receive(topo(1, vec![(KeyRange::new("a", "z"), vec![1, 2, 3])]))
            .expect("epoch 1");
        mgr.receive(topo(2, vec![(KeyRange::new("a", "z"), vec![2, 3, 4])]))
            .expect("epoch 2");
        mgr
    }

    #[test]
    fn receive_rejects_gaps() {
        let mut mgr = TopologyManager::new(1);
        mgr.receive(topo(3, vec![(KeyRange::new("a", "z"), vec![1, 2, 3])]))
            .expect("first epoch may be any");
        let err = mgr
            .receive(topo(5, vec![(KeyRange::new("a", "z"), vec![1, 2, 3])]))
            .expect_err("gap must be rejected");
        assert_eq!(err, TopologyError::EpochOutOfOrder { expected: 4, got: 5 });
    }

    #[test]
    fn added_ranges_start_synced() {
        let mut mgr = TopologyManager::new(1);
        mgr.receive(topo(1, vec![(KeyRange::new("a", "m"), vec![1, 2, 3])]))
            .expect("epoch 1");
        mgr.receive(topo(
            2,
            vec![
                (KeyRange::new("a", "m"), vec![1, 2, 3]),
                (KeyRange::new("m", "z"), vec![1, 2, 3]),
            ],
        ))
        .expect("epoch 2");
        let state = mgr.state(2).expect("state");
        assert!(state.synced.contains_all(&Ranges::single(KeyRange::new("m", "z"))));
        assert!(!state.is_sync_complete());
    }

    #[test]
    fn unsynced_selection_includes_prior_epoch_until_transfer() {
        let mgr = manager_with_two_epochs();
        let scope = key_scope(&["k"]);
        let selected = mgr.with_unsynced_epochs(&scope, 2, 2).expect("selection");
        assert_eq!(selected.min_epoch(), 1);
        assert_eq!(selected.max_epoch(), 2);
    }

    #[test]
    fn sync_complete_trims_selection() {
        let mut mgr = manager_with_two_epochs();
        for node in [2, 3, 4] {
            mgr.sync_complete(node, 2).expect("sync report");
        }
        assert!(mgr.state(2).expect("state").is_sync_complete());
        let scope = key_scope(&["k"]);
        let selected = mgr.with_unsynced_epochs(&scope, 2, 2).expect("selection");
        assert_eq!(selected.min_epoch(), 2);
    }

    #[test]
    fn faulty_nodes_do_not_count_toward_sync() {
        let mut mgr = manager_with_two_epochs();
        mgr.mark_faulty(3);
        mgr.sync_complete(2, 2).expect("sync report");
        mgr.sync_complete(3, 2).expect("sync report");
        // only node 2 counts; quorum of {2,3,4} needs 2 reporters
        assert!(!mgr.state(2).expect("state").is_sync_complete());
        mgr.sync_complete(4, 2).expect("sync report");
        assert!(mgr.state(2).expect("state").is_sync_complete());
    }

    #[test]
    fn acknowledge_in_order_and_await() {
        let mut mgr = manager_with_two_epochs();
        assert!(mgr.await_epoch(1).is_some());
        mgr.acknowledge(1).expect("ack 1");
        assert!(mgr.await_epoch(1).is_none());
        let rx = mgr.await_epoch(2).expect("pending");
        mgr.acknowledge(2).expect("ack 2");
        assert!(rx.blocking_recv().is_ok());
    }

    #[test]
    fn truncate_requires_sync() {
        let mut mgr = manager_with_two_epochs();
        // epoch 1 sync never completes (no reporters for its only shard)
        // epoch 1 is the front; truncation to 2 must fail until it syncs
        let err = mgr.truncate_until(2).expect_err("sync incomplete");
        assert_eq!(err, TopologyError::SyncIncomplete(1));
        for node in [1, 2, 3] {
            mgr.sync_complete(node, 1).expect("sync report");
        }
        mgr.truncate_until(2).expect("truncate");
        assert_eq!(mgr.min_epoch(), 2);
    }

    #[test]
    fn open_epoch_selection_stops_at_closed_ranges() {
        let mut mgr = manager_with_two_epochs();
        let scope = key_scope(&["k"]);
        let selected = mgr.with_open_epochs(&scope, 2, 2).expect("selection");
        assert_eq!(selected.min_epoch(), 1);
        // closing epoch 1 for the whole keyspace means no proposal can land
        // there any more, so the selection no longer reaches back
        mgr.epoch_closed(Ranges::single(KeyRange::new("a", "z")), 1)
            .expect("close");
        let selected = mgr.with_open_epochs(&scope, 2, 2).expect("selection");
        assert_eq!(selected.min_epoch(), 2);
    }
}
