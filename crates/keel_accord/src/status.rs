//! Transaction status lattice.
//!
//! Status is monotone under the partial order defined by `Phase`; within the
//! Accept and Commit phases, competing records for the same phase tie-break
//! by ballot. The durability lattice tracks how widely an outcome has been
//! persisted.

use serde::{Deserialize, Serialize};

use crate::txn::Ballot;

/// Coordination phase of a transaction. Phase never regresses.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Phase {
    None,
    PreAccept,
    Accept,
    Commit,
    Execute,
    Persist,
    Cleanup,
    Invalidate,
}

impl Phase {
    /// Within these phases, records at equal phase are ordered by the ballot
    /// that produced them.
    pub fn tie_break_with_ballot(self) -> bool {
        matches!(self, Phase::Accept | Phase::Commit)
    }
}

/// The per-replica record status. Ordering is the save order: later variants
/// carry strictly more (or terminally less) information.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SaveStatus {
    NotDefined,
    PreAccepted,
    /// A recovery coordinator found a quorum of preaccept-only state; any
    /// in-flight Accept from the original coordinator is defunct once this
    /// is recorded, but the knowledge itself is not yet durable.
    PreNotAccepted,
    /// As above, recorded to a quorum.
    NotAccepted,
    AcceptedInvalidate,
    /// Accept with coordinator-fixed deps (medium path).
    AcceptedMedium,
    /// Accept where replicas may still extend deps (slow path).
    AcceptedSlow,
    /// executeAt is known without deps: enough to exclude this txn from
    /// others' dependency sets, not enough to execute it.
    PreCommitted,
    Committed,
    /// Deps are final; the transaction is waiting to execute.
    Stable,
    /// Executed locally, outcome not yet durable.
    PreApplied,
    Applied,
    /// Truncated but the outcome is retained.
    TruncatedWithOutcome,
    Truncated,
    /// Nothing useful was ever recorded here; the transaction was ruled out
    /// without participating.
    Vestigial,
    Erased,
    Invalidated,
}

impl SaveStatus {
    pub fn phase(self) -> Phase {
        use SaveStatus::*;
        match self {
            NotDefined => Phase::None,
            PreAccepted => Phase::PreAccept,
            PreNotAccepted | NotAccepted | AcceptedInvalidate | AcceptedMedium | AcceptedSlow
            | PreCommitted => Phase::Accept,
            Committed => Phase::Commit,
            Stable => Phase::Execute,
            PreApplied | Applied => Phase::Persist,
            TruncatedWithOutcome | Truncated | Vestigial | Erased => Phase::Cleanup,
            Invalidated => Phase::Invalidate,
        }
    }

    pub fn has_been(self, at_least: SaveStatus) -> bool {
        self >= at_least
    }

    pub fn is_decided(self) -> bool {
        self.has_been(SaveStatus::PreCommitted)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SaveStatus::Erased | SaveStatus::Invalidated
        )
    }

    pub fn is_truncated(self) -> bool {
        self.phase() == Phase::Cleanup
    }

    /// The summary recorded in per-key indexes.
    pub fn summary(self) -> SummaryStatus {
        use SaveStatus::*;
        match self {
            NotDefined => SummaryStatus::NotWitnessed,
            // PreCommitted is summarized as preaccepted: its timestamp
            // excludes it from later deps, but its deps are unknown.
            PreAccepted | PreCommitted => SummaryStatus::PreAccepted,
            PreNotAccepted | NotAccepted | AcceptedInvalidate => SummaryStatus::NotAccepted,
            AcceptedMedium | AcceptedSlow => SummaryStatus::Accepted,
            Committed => SummaryStatus::Committed,
            Stable | PreApplied => SummaryStatus::Stable,
            Applied | TruncatedWithOutcome | Truncated | Vestigial | Erased => {
                SummaryStatus::Applied
            }
            Invalidated => SummaryStatus::Invalidated,
        }
    }
}

/// Compressed status kept per key in the CommandsForKey index.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SummaryStatus {
    NotWitnessed,
    PreAccepted,
    NotAccepted,
    Accepted,
    Committed,
    Stable,
    Applied,
    Invalidated,
}

/// `true` when `(a, ballot_a)` supersedes `(b, ballot_b)` under the phase
/// order with ballot tie-breaks.
pub fn supersedes(a: SaveStatus, ballot_a: Ballot, b: SaveStatus, ballot_b: Ballot) -> bool {
    let phase_a = a.phase();
    let phase_b = b.phase();
    if phase_a != phase_b {
        return phase_a > phase_b;
    }
    if phase_a.tie_break_with_ballot() && ballot_a != ballot_b {
        return ballot_a > ballot_b;
    }
    a > b
}

/// How widely a transaction's outcome is durably recorded.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Durability {
    NotDurable,
    Local,
    /// Durable at every healthy replica of the local shard.
    ShardUniversal,
    MajorityOrInvalidated,
    Majority,
    UniversalOrInvalidated,
    Universal,
}

impl Durability {
    pub fn is_durable(self) -> bool {
        matches!(self, Durability::Majority | Durability::Universal)
    }

    pub fn is_durable_or_invalidated(self) -> bool {
        self >= Durability::MajorityOrInvalidated
    }

    /// Combine two observations of the same transaction's durability.
    pub fn merge(a: Durability, b: Durability) -> Durability {
        let (mut hi, lo) = if a >= b { (a, b) } else { (b, a) };
        // a positively-applied observation removes the OrInvalidated qualifier
        if hi == Durability::UniversalOrInvalidated
            && matches!(
                lo,
                Durability::Majority | Durability::ShardUniversal | Durability::Local
            )
        {
            hi = Durability::Universal;
        }
        if hi == Durability::ShardUniversal
            && matches!(lo, Durability::Local | Durability::NotDurable)
        {
            hi = Durability::Local;
        }
        if lo == Durability::NotDurable && hi < Durability::MajorityOrInvalidated {
            hi = Durability::NotDurable;
        }
        hi
    }

    /// Like `merge`, but never decreases the higher operand.
    pub fn merge_at_least(a: Durability, b: Durability) -> Durability {
        let (mut hi, lo) = if a >= b { (a, b) } else { (b, a) };
        if hi == Durability::UniversalOrInvalidated
            && matches!(
                lo,
                Durability::Majority | Durability::ShardUniversal | Durability::Local
            )
        {
            hi = Durability::Universal;
        }
        hi
    }
}
