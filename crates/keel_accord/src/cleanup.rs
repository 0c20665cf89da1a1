//! Garbage-collection decisions.
//!
//! `RedundantBefore` tracks, per range, the watermarks below which
//! transactions are locally applied, shard-applied, or GC-eligible.
//! `DurableBefore` tracks how widely outcomes below a watermark are durable.
//! `Cleanup::should_cleanup` combines them into a per-command decision,
//! filtered so a command's status never regresses.

use std::fmt;

use crate::command::StoreParticipants;
use crate::keys::{KeyRange, Participants, Ranges};
use crate::status::{Durability, SaveStatus};
use crate::txn::{Kind, TxnId};

/// How a transaction relates to a range's redundancy watermarks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RedundantStatus {
    NotOwned,
    Live,
    /// Below the bootstrap watermark: this store never needs to execute it.
    PreBootstrapOrStale,
    /// Applied (or invalidated) locally.
    LocallyRedundant,
    /// The range is no longer owned here.
    WasOwned,
    /// The range is no longer owned and everything proposable has retired.
    WasOwnedRetired,
    /// Applied at every healthy replica of the shard.
    ShardRedundant,
    /// Below the GC line: state may be reclaimed.
    GcBefore,
}

/// Watermarks for one range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedundantBounds {
    /// Everything below is applied or invalidated locally.
    pub locally_applied_before: TxnId,
    /// Everything below is applied at all healthy shard replicas.
    pub shard_applied_before: TxnId,
    /// Everything below may be garbage collected.
    pub gc_before: TxnId,
    /// Transactions below this id predate our bootstrap of the range.
    pub bootstrapped_at: TxnId,
    /// The range has been handed off and is no longer owned here.
    pub retired: bool,
}

impl RedundantBounds {
    fn merge(a: &RedundantBounds, b: &RedundantBounds) -> RedundantBounds {
        RedundantBounds {
            locally_applied_before: a.locally_applied_before.max(b.locally_applied_before),
            shard_applied_before: a.shard_applied_before.max(b.shard_applied_before),
            gc_before: a.gc_before.max(b.gc_before),
            bootstrapped_at: a.bootstrapped_at.max(b.bootstrapped_at),
            retired: a.retired || b.retired,
        }
    }

    fn status(&self, txn_id: TxnId) -> RedundantStatus {
        if self.retired {
            return if txn_id < self.shard_applied_before {
                RedundantStatus::WasOwnedRetired
            } else {
                RedundantStatus::WasOwned
            };
        }
        if txn_id < self.gc_before {
            return RedundantStatus::GcBefore;
        }
        if txn_id < self.shard_applied_before {
            return RedundantStatus::ShardRedundant;
        }
        if txn_id < self.locally_applied_before {
            return RedundantStatus::LocallyRedundant;
        }
        if txn_id < self.bootstrapped_at {
            return RedundantStatus::PreBootstrapOrStale;
        }
        RedundantStatus::Live
    }
}

/// Interval map of redundancy watermarks, merged commutatively and
/// idempotently (per-range field-wise max).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RedundantBefore {
    entries: Vec<(KeyRange, RedundantBounds)>,
}

impl RedundantBefore {
    pub const EMPTY: RedundantBefore = RedundantBefore {
        entries: Vec::new(),
    };

    pub fn of(range: KeyRange, bounds: RedundantBounds) -> RedundantBefore {
        RedundantBefore {
            entries: vec![(range, bounds)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyRange, &RedundantBounds)> {
        self.entries.iter().map(|(r, b)| (r, b))
    }

    pub fn merge(a: &RedundantBefore, b: &RedundantBefore) -> RedundantBefore {
        if a.is_empty() {
            return b.clone();
        }
        if b.is_empty() {
            return a.clone();
        }
        let mut cuts: Vec<crate::keys::Key> = Vec::new();
        for (range, _) in a.entries.iter().chain(b.entries.iter()) {
            cuts.push(range.start.clone());
            if !range.end.is_empty() {
                cuts.push(range.end.clone());
            }
        }
        cuts.sort();
        cuts.dedup();
        let mut out = Vec::new();
        for i in 0..cuts.len() {
            let piece = KeyRange {
                start: cuts[i].clone(),
                end: cuts
                    .get(i + 1)
                    .cloned()
                    .unwrap_or_else(|| crate::keys::Key::new(Vec::new())),
            };
            let in_a = a.bounds_covering(&piece);
            let in_b = b.bounds_covering(&piece);
            let merged = match (in_a, in_b) {
                (Some(x), Some(y)) => Some(RedundantBounds::merge(x, y)),
                (Some(x), None) => Some(x.clone()),
                (None, Some(y)) => Some(y.clone()),
                (None, None) => None,
            };
            if let Some(bounds) = merged {
                out.push((piece, bounds));
            }
        }
        RedundantBefore { entries: out }
    }

    fn bounds_covering(&self, piece: &KeyRange) -> Option<&RedundantBounds> {
        self.entries
            .iter()
            .find(|(range, _)| range.intersect(piece).as_ref() == Some(piece))
            .map(|(_, bounds)| bounds)
    }

    /// The transaction's status across every range of `scope` this store
    /// tracks: the weakest status over owned coverage, `NotOwned` if none.
    pub fn status(&self, txn_id: TxnId, scope: &Participants) -> RedundantStatus {
        let mut min: Option<RedundantStatus> = None;
        for (range, bounds) in &self.entries {
            if !scope.intersects(&Ranges::single(range.clone())) {
                continue;
            }
            let status = bounds.status(txn_id);
            min = Some(match min {
                None => status,
                Some(current) => current.min(status),
            });
        }
        min.unwrap_or(RedundantStatus::NotOwned)
    }

    /// The weakest status across all tracked ranges.
    pub fn shard_status(&self, txn_id: TxnId) -> RedundantStatus {
        let mut min: Option<RedundantStatus> = None;
        for (_, bounds) in &self.entries {
            let status = bounds.status(txn_id);
            min = Some(match min {
                None => status,
                Some(current) => current.min(status),
            });
        }
        min.unwrap_or(RedundantStatus::NotOwned)
    }

    /// Whether any range of `scope` has reached `at_least` for `txn_id`.
    pub fn is_any_at_least(
        &self,
        txn_id: TxnId,
        scope: &Participants,
        at_least: RedundantStatus,
    ) -> bool {
        self.entries.iter().any(|(range, bounds)| {
            scope.intersects(&Ranges::single(range.clone()))
                && bounds.status(txn_id) >= at_least
        })
    }

    /// The smallest shard-redundant watermark across tracked ranges.
    pub fn min_shard_redundant_before(&self) -> TxnId {
        self.entries
            .iter()
            .map(|(_, b)| b.shard_applied_before)
            .min()
            .unwrap_or(TxnId::NONE)
    }

    /// The highest GC watermark applying to `key`'s range, for CFK pruning.
    pub fn gc_before_for(&self, key: &crate::keys::Key) -> TxnId {
        self.entries
            .iter()
            .filter(|(range, _)| range.contains(key))
            .map(|(_, bounds)| bounds.gc_before)
            .max()
            .unwrap_or(TxnId::NONE)
    }
}

impl fmt::Debug for RedundantBefore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(r, b)| (r, b)))
            .finish()
    }
}

/// Durability watermarks for one range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DurableBounds {
    /// Below this id, outcomes are durable at a majority of each shard.
    pub majority_before: TxnId,
    /// Below this id, outcomes are durable at every healthy replica.
    pub universal_before: TxnId,
}

impl DurableBounds {
    fn merge(a: &DurableBounds, b: &DurableBounds) -> DurableBounds {
        DurableBounds {
            majority_before: a.majority_before.max(b.majority_before),
            universal_before: a.universal_before.max(b.universal_before),
        }
    }

    fn durability(&self, txn_id: TxnId) -> Durability {
        if txn_id < self.universal_before {
            Durability::UniversalOrInvalidated
        } else if txn_id < self.majority_before {
            Durability::MajorityOrInvalidated
        } else {
            Durability::NotDurable
        }
    }
}

/// Interval map of durability watermarks.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DurableBefore {
    entries: Vec<(KeyRange, DurableBounds)>,
}

impl DurableBefore {
    pub const EMPTY: DurableBefore = DurableBefore {
        entries: Vec::new(),
    };

    pub fn of(range: KeyRange, bounds: DurableBounds) -> DurableBefore {
        DurableBefore {
            entries: vec![(range, bounds)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(a: &DurableBefore, b: &DurableBefore) -> DurableBefore {
        if a.is_empty() {
            return b.clone();
        }
        if b.is_empty() {
            return a.clone();
        }
        let mut cuts: Vec<crate::keys::Key> = Vec::new();
        for (range, _) in a.entries.iter().chain(b.entries.iter()) {
            cuts.push(range.start.clone());
            if !range.end.is_empty() {
                cuts.push(range.end.clone());
            }
        }
        cuts.sort();
        cuts.dedup();
        let mut out = Vec::new();
        for i in 0..cuts.len() {
            let piece = KeyRange {
                start: cuts[i].clone(),
                end: cuts
                    .get(i + 1)
                    .cloned()
                    .unwrap_or_else(|| crate::keys::Key::new(Vec::new())),
            };
            let in_a = a.bounds_covering(&piece);
            let in_b = b.bounds_covering(&piece);
            let merged = match (in_a, in_b) {
                (Some(x), Some(y)) => Some(DurableBounds::merge(x, y)),
                (Some(x), None) => Some(x.clone()),
                (None, Some(y)) => Some(y.clone()),
                (None, None) => None,
            };
            if let Some(bounds) = merged {
                out.push((piece, bounds));
            }
        }
        DurableBefore { entries: out }
    }

    fn bounds_covering(&self, piece: &KeyRange) -> Option<&DurableBounds> {
        self.entries
            .iter()
            .find(|(range, _)| range.intersect(piece).as_ref() == Some(piece))
            .map(|(_, bounds)| bounds)
    }

    /// The weakest durability of `txn_id` across the whole map. An empty or
    /// partial map yields `NotDurable`.
    pub fn min(&self, txn_id: TxnId) -> Durability {
        if self.entries.is_empty() {
            return Durability::NotDurable;
        }
        self.entries
            .iter()
            .map(|(_, bounds)| bounds.durability(txn_id))
            .min()
            .unwrap_or(Durability::NotDurable)
    }

    /// The weakest durability over the ranges `scope` covers.
    pub fn min_over(&self, txn_id: TxnId, scope: &Participants) -> Durability {
        let mut min: Option<Durability> = None;
        for (range, bounds) in &self.entries {
            if !scope.intersects(&Ranges::single(range.clone())) {
                continue;
            }
            let durability = bounds.durability(txn_id);
            min = Some(match min {
                None => durability,
                Some(current) => current.min(durability),
            });
        }
        min.unwrap_or(Durability::NotDurable)
    }
}

impl fmt::Debug for DurableBefore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(r, b)| (r, b)))
            .finish()
    }
}

/// What may be discarded for a command, ordered weakest to strongest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cleanup {
    No,
    /// Incomplete information: keep only what future decisions need.
    ExpungePartial,
    TruncateWithOutcome,
    Truncate,
    Invalidate,
    Vestigial,
    Erase,
    /// The record may be dropped entirely.
    Expunge,
}

impl Cleanup {
    /// The save status this decision would establish; the decision applies
    /// only if the command has not already reached it.
    pub fn applies_if_not(self) -> SaveStatus {
        match self {
            Cleanup::No => SaveStatus::NotDefined,
            Cleanup::ExpungePartial | Cleanup::TruncateWithOutcome => {
                SaveStatus::TruncatedWithOutcome
            }
            Cleanup::Truncate => SaveStatus::Truncated,
            Cleanup::Invalidate => SaveStatus::Invalidated,
            Cleanup::Vestigial => SaveStatus::Vestigial,
            Cleanup::Erase | Cleanup::Expunge => SaveStatus::Erased,
        }
    }

    /// A decision may not regress the command.
    pub fn filter(self, status: SaveStatus) -> Cleanup {
        if self != Cleanup::No && status >= self.applies_if_not() {
            Cleanup::No
        } else {
            self
        }
    }

    /// Decide what to discard for a command, given the current watermarks.
    /// Rules apply in order; the first match wins, then `filter` guards
    /// against regressing the status.
    pub fn should_cleanup(
        txn_id: TxnId,
        status: SaveStatus,
        durability: Durability,
        participants: &StoreParticipants,
        redundant_before: &RedundantBefore,
        durable_before: &DurableBefore,
    ) -> Cleanup {
        Self::decide(
            txn_id,
            status,
            durability,
            participants,
            redundant_before,
            durable_before,
        )
        .filter(status)
    }

    fn decide(
        txn_id: TxnId,
        status: SaveStatus,
        durability: Durability,
        participants: &StoreParticipants,
        redundant_before: &RedundantBefore,
        durable_before: &DurableBefore,
    ) -> Cleanup {
        // ephemeral reads are erased by their own expiry timeout
        if txn_id.kind() == Kind::EphemeralRead {
            return Cleanup::No;
        }

        if Self::expunge(txn_id, status, redundant_before, durable_before) {
            return Cleanup::Expunge;
        }

        if !participants.has_full_route() {
            let owns = participants
                .owns
                .clone()
                .unwrap_or_else(Participants::empty_keys);
            if !redundant_before.is_any_at_least(txn_id, &owns, RedundantStatus::GcBefore) {
                return Self::cleanup_if_undecided(txn_id, status, &owns, redundant_before);
            }
            // past the GC line without a route: keep only the outcome if we
            // have it, else nothing worth keeping
            return match status {
                SaveStatus::PreApplied | SaveStatus::Applied => Cleanup::TruncateWithOutcome,
                SaveStatus::TruncatedWithOutcome
                | SaveStatus::Truncated
                | SaveStatus::Invalidated => Cleanup::No,
                _ => Cleanup::ExpungePartial,
            };
        }

        let route = participants.route.as_ref().expect("full route checked");
        let result = Self::cleanup_with_route(
            txn_id,
            status,
            durability,
            participants,
            route,
            redundant_before,
            durable_before,
        );
        if result == Cleanup::No {
            let owns = participants
                .owns
                .clone()
                .unwrap_or_else(|| route.participants.clone());
            return Self::cleanup_if_undecided(txn_id, status, &owns, redundant_before);
        }
        result
    }

    fn cleanup_with_route(
        txn_id: TxnId,
        status: SaveStatus,
        durability: Durability,
        participants: &StoreParticipants,
        route: &crate::keys::Route,
        redundant_before: &RedundantBefore,
        durable_before: &DurableBefore,
    ) -> Cleanup {
        let redundant = redundant_before.status(txn_id, &route.participants);
        match redundant {
            RedundantStatus::NotOwned
            | RedundantStatus::Live
            | RedundantStatus::PreBootstrapOrStale
            | RedundantStatus::LocallyRedundant
            | RedundantStatus::WasOwned => Cleanup::No,

            RedundantStatus::WasOwnedRetired => Cleanup::Vestigial,

            RedundantStatus::ShardRedundant => {
                if status.has_been(SaveStatus::PreCommitted) {
                    // coordination-only commands with nothing left to execute
                    // may drop early once durably decided elsewhere
                    let executes_empty = participants
                        .executes
                        .as_ref()
                        .is_some_and(Participants::is_empty);
                    if executes_empty && status >= SaveStatus::Stable {
                        let durable = Durability::merge_at_least(
                            durability,
                            durable_before.min_over(txn_id, &route.participants),
                        );
                        if durable >= Durability::MajorityOrInvalidated {
                            return Cleanup::Truncate;
                        }
                    }
                    return Cleanup::No;
                }
                Cleanup::Invalidate
            }

            RedundantStatus::GcBefore => {
                if !status.has_been(SaveStatus::PreCommitted) {
                    return Cleanup::Invalidate;
                }
                let durable = Durability::merge_at_least(
                    durability,
                    durable_before.min_over(txn_id, &route.participants),
                );
                match durable {
                    Durability::NotDurable | Durability::Local | Durability::ShardUniversal => {
                        Cleanup::TruncateWithOutcome
                    }
                    Durability::MajorityOrInvalidated | Durability::Majority => Cleanup::Truncate,
                    Durability::UniversalOrInvalidated | Durability::Universal => Cleanup::Erase,
                }
            }
        }
    }

    fn cleanup_if_undecided(
        txn_id: TxnId,
        status: SaveStatus,
        owns: &Participants,
        redundant_before: &RedundantBefore,
    ) -> Cleanup {
        if status.has_been(SaveStatus::PreCommitted) {
            return Cleanup::No;
        }
        if redundant_before.is_any_at_least(txn_id, owns, RedundantStatus::ShardRedundant) {
            return Cleanup::Invalidate;
        }
        if status == SaveStatus::NotDefined
            && txn_id < redundant_before.min_shard_redundant_before()
        {
            return Cleanup::Vestigial;
        }
        Cleanup::No
    }

    fn expunge(
        txn_id: TxnId,
        status: SaveStatus,
        redundant_before: &RedundantBefore,
        durable_before: &DurableBefore,
    ) -> bool {
        if durable_before.min(txn_id) < Durability::UniversalOrInvalidated {
            return false;
        }
        if status == SaveStatus::Invalidated {
            return true;
        }
        redundant_before.shard_status(txn_id) == RedundantStatus::GcBefore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Key, Keys, Route};
    use crate::txn::Domain;

    fn id(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, Kind::Write, Domain::Key, 1)
    }

    fn whole() -> KeyRange {
        KeyRange::new("a", "z")
    }

    fn participants_with_route(key: &str) -> StoreParticipants {
        let parts = Participants::Keys(Keys::of(vec![Key::from(key)]));
        StoreParticipants {
            route: Some(Route::full(Key::from(key), parts.clone())),
            owns: Some(parts.clone()),
            touches: Some(parts.clone()),
            executes: Some(parts),
        }
    }

    fn redundant(gc: u64, shard: u64, local: u64) -> RedundantBefore {
        RedundantBefore::of(
            whole(),
            RedundantBounds {
                locally_applied_before: id(local),
                shard_applied_before: id(shard),
                gc_before: id(gc),
                bootstrapped_at: TxnId::NONE,
                retired: false,
            },
        )
    }

    fn durable(majority: u64, universal: u64) -> DurableBefore {
        DurableBefore::of(
            whole(),
            DurableBounds {
                majority_before: id(majority),
                universal_before: id(universal),
            },
        )
    }

    #[test]
    fn redundant_before_merge_is_commutative_and_idempotent() {
        let a = redundant(5, 10, 20);
        let b = RedundantBefore::of(KeyRange::new("m", "z"), RedundantBounds {
            gc_before: id(8),
            shard_applied_before: id(8),
            locally_applied_before: id(8),
            bootstrapped_at: TxnId::NONE,
            retired: false,
        });
        let ab = RedundantBefore::merge(&a, &b);
        let ba = RedundantBefore::merge(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(RedundantBefore::merge(&ab, &b), ab);
        assert_eq!(RedundantBefore::merge(&ab, &RedundantBefore::EMPTY), ab);
    }

    #[test]
    fn status_uses_watermarks_in_order() {
        let map = redundant(5, 10, 20);
        let scope = Participants::Keys(Keys::of(vec![Key::from("k")]));
        assert_eq!(map.status(id(1), &scope), RedundantStatus::GcBefore);
        assert_eq!(map.status(id(7), &scope), RedundantStatus::ShardRedundant);
        assert_eq!(map.status(id(15), &scope), RedundantStatus::LocallyRedundant);
        assert_eq!(map.status(id(25), &scope), RedundantStatus::Live);
    }

    #[test]
    fn mixed_coverage_takes_weakest_status() {
        let strict = RedundantBefore::of(KeyRange::new("a", "m"), RedundantBounds {
            gc_before: id(100),
            shard_applied_before: id(100),
            locally_applied_before: id(100),
            bootstrapped_at: TxnId::NONE,
            retired: false,
        });
        let lax = RedundantBefore::of(KeyRange::new("m", "z"), RedundantBounds::default());
        let map = RedundantBefore::merge(&strict, &lax);
        let both = Participants::Keys(Keys::of(vec![Key::from("b"), Key::from("q")]));
        assert_eq!(map.status(id(5), &both), RedundantStatus::Live);
        let left = Participants::Keys(Keys::of(vec![Key::from("b")]));
        assert_eq!(map.status(id(5), &left), RedundantStatus::GcBefore);
    }

    #[test]
    fn expunge_needs_universal_durability_and_gc() {
        let participants = participants_with_route("k");
        // universal + GC_BEFORE => EXPUNGE
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::Applied,
            Durability::NotDurable,
            &participants,
            &redundant(5, 5, 5),
            &durable(5, 5),
        );
        assert_eq!(decision, Cleanup::Expunge);
        // universal durability alone is insufficient
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::Applied,
            Durability::NotDurable,
            &participants,
            &redundant(0, 5, 5),
            &durable(5, 5),
        );
        assert_ne!(decision, Cleanup::Expunge);
    }

    #[test]
    fn gc_before_truncation_depends_on_durability() {
        let participants = participants_with_route("k");
        let map = redundant(5, 5, 5);
        // not durable: outcome must be retained
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::Applied,
            Durability::NotDurable,
            &participants,
            &map,
            &DurableBefore::EMPTY,
        );
        assert_eq!(decision, Cleanup::TruncateWithOutcome);
        // majority durable: outcome recoverable from peers
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::Applied,
            Durability::Majority,
            &participants,
            &map,
            &DurableBefore::EMPTY,
        );
        assert_eq!(decision, Cleanup::Truncate);
        // universally durable: nothing needed
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::Applied,
            Durability::Universal,
            &participants,
            &map,
            &DurableBefore::EMPTY,
        );
        assert_eq!(decision, Cleanup::Erase);
    }

    #[test]
    fn undecided_below_shard_redundant_invalidates() {
        let participants = participants_with_route("k");
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::PreAccepted,
            Durability::NotDurable,
            &participants,
            &redundant(0, 5, 5),
            &DurableBefore::EMPTY,
        );
        assert_eq!(decision, Cleanup::Invalidate);
    }

    #[test]
    fn live_commands_are_kept() {
        let participants = participants_with_route("k");
        let decision = Cleanup::should_cleanup(
            id(50),
            SaveStatus::Stable,
            Durability::NotDurable,
            &participants,
            &redundant(5, 10, 20),
            &DurableBefore::EMPTY,
        );
        assert_eq!(decision, Cleanup::No);
    }

    #[test]
    fn retired_range_yields_vestigial() {
        let participants = participants_with_route("k");
        let map = RedundantBefore::of(whole(), RedundantBounds {
            locally_applied_before: id(10),
            shard_applied_before: id(10),
            gc_before: TxnId::NONE,
            bootstrapped_at: TxnId::NONE,
            retired: true,
        });
        let decision = Cleanup::should_cleanup(
            id(1),
            SaveStatus::PreAccepted,
            Durability::NotDurable,
            &participants,
            &map,
            &DurableBefore::EMPTY,
        );
        assert_eq!(decision, Cleanup::Vestigial);
    }

    #[test]
    fn filter_never_regresses_status() {
        assert_eq!(Cleanup::Truncate.filter(SaveStatus::Erased), Cleanup::No);
        assert_eq!(
            Cleanup::TruncateWithOutcome.filter(SaveStatus::Applied),
            Cleanup::TruncateWithOutcome
        );
        assert_eq!(
            Cleanup::Invalidate.filter(SaveStatus::Invalidated),
            Cleanup::No
        );
    }

    #[test]
    fn ephemeral_reads_are_never_cleaned_here() {
        let ephemeral = TxnId::new(1, 3, Kind::EphemeralRead, Domain::Key, 1);
        let decision = Cleanup::should_cleanup(
            ephemeral,
            SaveStatus::PreAccepted,
            Durability::NotDurable,
            &participants_with_route("k"),
            &redundant(100, 100, 100),
            &durable(100, 100),
        );
        assert_eq!(decision, Cleanup::No);
    }

    #[test]
    fn durable_before_min_is_conservative() {
        let map = durable(10, 5);
        assert_eq!(map.min(id(1)), Durability::UniversalOrInvalidated);
        assert_eq!(map.min(id(7)), Durability::MajorityOrInvalidated);
        assert_eq!(map.min(id(50)), Durability::NotDurable);
        assert_eq!(DurableBefore::EMPTY.min(id(1)), Durability::NotDurable);
    }
}
