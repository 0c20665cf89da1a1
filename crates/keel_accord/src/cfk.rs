//! Per-key transaction summaries.
//!
//! Each routing key keeps a sorted array of `(TxnId, SummaryStatus)` entries:
//! enough to compute preaccept-time dependencies and the max conflict
//! timestamp without loading full commands, and to prune aggressively once
//! the redundant watermark passes.

use std::fmt;

use crate::keys::Key;
use crate::status::SummaryStatus;
use crate::txn::{Kind, Timestamp, TxnId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfkEntry {
    pub id: TxnId,
    pub status: SummaryStatus,
    /// Set once the execution timestamp is decided (>= PreCommitted).
    pub execute_at: Option<Timestamp>,
}

impl CfkEntry {
    fn execute_at_or_id(&self) -> Timestamp {
        self.execute_at.unwrap_or_else(|| self.id.as_timestamp())
    }
}

/// Ordered summary of every transaction referencing one routing key.
#[derive(Clone)]
pub struct CommandsForKey {
    key: Key,
    /// Sorted by TxnId.
    entries: Vec<CfkEntry>,
    /// Everything below this id has been pruned away.
    prune_before: TxnId,
    /// Synthetic stand-in for the highest pruned applied transaction, kept
    /// while pending sync points still need something to order after.
    floor: Option<TxnId>,
}

impl CommandsForKey {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            entries: Vec::new(),
            prune_before: TxnId::NONE,
            floor: None,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: TxnId) -> Option<&CfkEntry> {
        self.entries
            .binary_search_by(|e| e.id.cmp(&id))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Record or advance a transaction's summary. Regressions are ignored:
    /// the index only ever learns more.
    pub fn update(&mut self, id: TxnId, status: SummaryStatus, execute_at: Option<Timestamp>) {
        if id < self.prune_before {
            return;
        }
        match self.entries.binary_search_by(|e| e.id.cmp(&id)) {
            Ok(index) => {
                let entry = &mut self.entries[index];
                if status > entry.status {
                    entry.status = status;
                }
                if execute_at.is_some() {
                    entry.execute_at = execute_at;
                }
            }
            Err(index) => self.entries.insert(
                index,
                CfkEntry {
                    id,
                    status,
                    execute_at,
                },
            ),
        }
    }

    pub fn remove(&mut self, id: TxnId) {
        if let Ok(index) = self.entries.binary_search_by(|e| e.id.cmp(&id)) {
            self.entries.remove(index);
        }
    }

    /// Dependencies a new transaction `(id, kind)` must order after on this
    /// key: every prior conflicting transaction not already ruled out.
    pub fn deps_for(&self, id: TxnId, kind: Kind) -> Vec<TxnId> {
        let mut out: Vec<TxnId> = Vec::new();
        if let Some(floor) = self.floor {
            if floor < id && kind.is_sync_point() {
                out.push(floor);
            }
        }
        for entry in &self.entries {
            if entry.id >= id {
                break;
            }
            if entry.status == SummaryStatus::Invalidated {
                continue;
            }
            if kind.witnesses(entry.id.kind()) {
                out.push(entry.id);
            }
        }
        out
    }

    /// The highest decided-or-proposed timestamp among conflicting entries;
    /// preaccept proposes `max(txn_id, max_conflict + 1)`.
    pub fn max_conflict(&self, kind: Kind) -> Timestamp {
        let mut max = Timestamp::NONE;
        for entry in &self.entries {
            if entry.status == SummaryStatus::Invalidated {
                continue;
            }
            if kind.conflicts_with(entry.id.kind()) {
                max = max.max(entry.execute_at_or_id());
            }
        }
        max
    }

    /// Whether any entry would have blocked a fast-path decision for `id`:
    /// a conflicting transaction with a lower id that `id`'s preaccept did
    /// not witness as applied.
    pub fn has_undecided_conflict_before(&self, id: TxnId) -> bool {
        self.entries.iter().any(|entry| {
            entry.id < id
                && entry.id.kind().conflicts_with(id.kind())
                && entry.status < SummaryStatus::Committed
        })
    }

    /// Drop entries below the watermark that can no longer influence
    /// ordering. A pending sync point above the watermark still needs a
    /// predecessor to order after, so the highest pruned applied entry is
    /// retained as a synthetic floor.
    pub fn prune(&mut self, before: TxnId) {
        if before <= self.prune_before {
            return;
        }
        self.prune_before = before;
        let pending_sync_point = self
            .entries
            .iter()
            .any(|e| e.id >= before && e.id.kind().is_sync_point() && e.status < SummaryStatus::Applied);

        let mut highest_pruned: Option<TxnId> = None;
        self.entries.retain(|entry| {
            let prunable = entry.id < before
                && matches!(
                    entry.status,
                    SummaryStatus::Applied | SummaryStatus::Invalidated
                );
            if prunable && entry.status == SummaryStatus::Applied {
                highest_pruned = Some(highest_pruned.map_or(entry.id, |h| h.max(entry.id)));
            }
            !prunable
        });

        if pending_sync_point {
            self.floor = self.floor.max(highest_pruned);
        } else {
            self.floor = None;
        }
    }

    pub fn prune_before(&self) -> TxnId {
        self.prune_before
    }

    pub fn entries(&self) -> impl Iterator<Item = &CfkEntry> {
        self.entries.iter()
    }
}

impl fmt::Debug for CommandsForKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cfk({:?}, {} entries, prune<{:?})",
            self.key,
            self.entries.len(),
            self.prune_before
        )
    }
}
