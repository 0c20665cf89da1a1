//! Recovery-side dependency merge.
//!
//! Each `BeginRecovery` reply carries, per range, the strongest dependency
//! knowledge the replica holds: how well the deps are known, under which
//! ballot, the coordinator-proposed deps (if fixed), and locally-computed
//! deps. The recovery coordinator merges replies into one interval map; the
//! merge is commutative and associative so the outcome is independent of
//! reply order.

use std::fmt;

use crate::deps::Deps;
use crate::keys::{KeyRange, Ranges};
use crate::txn::Ballot;

/// How much of a transaction's dependency set a replica knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KnownDeps {
    /// Nothing beyond local preaccept-time observations.
    Unknown,
    /// A slow-path Accept proposal the replica may still extend.
    Proposed,
    /// A medium-path Accept proposal, fixed by the coordinator.
    ProposedFixed,
    /// Deps committed, possibly still incomplete for execution.
    Committed,
    /// Deps stable: the execution set is final.
    Known,
    /// Deps discarded by cleanup.
    Erased,
}

impl KnownDeps {
    /// Coarse phase used for merge precedence. Both Accept-phase variants
    /// share a phase and tie-break by ballot.
    fn phase(self) -> u8 {
        match self {
            KnownDeps::Unknown => 0,
            KnownDeps::Proposed | KnownDeps::ProposedFixed => 1,
            KnownDeps::Committed => 2,
            KnownDeps::Known => 3,
            KnownDeps::Erased => 4,
        }
    }

    fn tie_break_with_ballot(self) -> bool {
        self.phase() == 1
    }
}

/// Dependency knowledge for one range, from one or more merged replies.
#[derive(Clone, PartialEq, Eq)]
pub struct LatestEntry {
    pub known: KnownDeps,
    pub ballot: Ballot,
    /// Set when `known >= ProposedFixed`.
    pub coordinated: Option<Deps>,
    /// Set when `known <= Proposed`; the union of local observations.
    pub local: Option<Deps>,
}

impl LatestEntry {
    fn slice(&self, range: &KeyRange) -> LatestEntry {
        let ranges = Ranges::single(range.clone());
        LatestEntry {
            known: self.known,
            ballot: self.ballot,
            coordinated: self.coordinated.as_ref().map(|d| d.slice(&ranges)),
            local: self.local.as_ref().map(|d| d.slice(&ranges)),
        }
    }

    /// Merge two entries for the same range. The winner is the higher
    /// `(phase, ballot)`; local deps union while the winner is still at or
    /// below `Proposed`. Stable deps are propagated verbatim: two stable
    /// replies need not be byte-equal, only execution-equivalent, so no
    /// equality check is made.
    fn reduce(a: &LatestEntry, b: &LatestEntry) -> LatestEntry {
        if a.known == KnownDeps::Erased || b.known == KnownDeps::Erased {
            return if a.known >= b.known { a.clone() } else { b.clone() };
        }

        let mut ord = a.known.phase().cmp(&b.known.phase());
        if ord == std::cmp::Ordering::Equal && a.known.tie_break_with_ballot() {
            ord = a.ballot.cmp(&b.ballot);
        }
        if ord == std::cmp::Ordering::Equal {
            ord = a.known.cmp(&b.known);
        }
        let (winner, loser) = if ord == std::cmp::Ordering::Less {
            (b, a)
        } else {
            (a, b)
        };

        // Local observations union unconditionally: they are only consulted
        // while the outcome is undecided, and carrying them keeps the merge
        // associative when entries of different strengths interleave.
        let local = match (&winner.local, &loser.local) {
            (Some(x), Some(y)) => Some(x.with(y)),
            (Some(x), None) | (None, Some(x)) => Some(x.clone()),
            (None, None) => None,
        };
        LatestEntry {
            known: winner.known,
            ballot: winner.ballot,
            coordinated: winner.coordinated.clone(),
            local,
        }
    }
}

impl fmt::Debug for LatestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:?}", self.known, self.ballot)
    }
}

/// Interval map `range -> LatestEntry` with disjoint, sorted ranges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct LatestDeps {
    entries: Vec<(KeyRange, LatestEntry)>,
}

impl LatestDeps {
    pub const EMPTY: LatestDeps = LatestDeps {
        entries: Vec::new(),
    };

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyRange, &LatestEntry)> {
        self.entries.iter().map(|(r, e)| (r, e))
    }

    /// Build an entry map covering `scope` with uniform knowledge.
    pub fn create(
        scope: &Ranges,
        known: KnownDeps,
        ballot: Ballot,
        coordinated: Option<Deps>,
        local: Option<Deps>,
    ) -> LatestDeps {
        let entries = scope
            .iter()
            .map(|range| {
                let entry = LatestEntry {
                    known,
                    ballot,
                    coordinated: coordinated.clone(),
                    local: local.clone(),
                };
                (range.clone(), entry.slice(range))
            })
            .collect();
        LatestDeps { entries }
    }

    pub fn merge(a: &LatestDeps, b: &LatestDeps) -> LatestDeps {
        if a.is_empty() {
            return b.clone();
        }
        if b.is_empty() {
            return a.clone();
        }

        // Elementary-interval sweep: cut both maps at every boundary of
        // either, then reduce overlapping pieces.
        let mut cuts: Vec<crate::keys::Key> = Vec::new();
        for (range, _) in a.entries.iter().chain(b.entries.iter()) {
            cuts.push(range.start.clone());
            if !range.end.is_empty() {
                cuts.push(range.end.clone());
            }
        }
        cuts.sort();
        cuts.dedup();

        let mut out: Vec<(KeyRange, LatestEntry)> = Vec::new();
        for i in 0..cuts.len() {
            let start = cuts[i].clone();
            let end = cuts
                .get(i + 1)
                .cloned()
                .unwrap_or_else(|| crate::keys::Key::new(Vec::new()));
            let piece = KeyRange { start, end };
            let in_a = a.entry_covering(&piece);
            let in_b = b.entry_covering(&piece);
            let merged = match (in_a, in_b) {
                (Some(x), Some(y)) => {
                    Some(LatestEntry::reduce(&x.slice(&piece), &y.slice(&piece)))
                }
                (Some(x), None) => Some(x.slice(&piece)),
                (None, Some(y)) => Some(y.slice(&piece)),
                (None, None) => None,
            };
            if let Some(entry) = merged {
                out.push((piece, entry));
            }
        }
        LatestDeps { entries: out }
    }

    fn entry_covering(&self, piece: &KeyRange) -> Option<&LatestEntry> {
        self.entries
            .iter()
            .find(|(range, _)| range.intersect(piece).as_ref() == Some(piece))
            .map(|(_, entry)| entry)
    }

    /// The strongest knowledge level anywhere in the map.
    pub fn max_known(&self) -> KnownDeps {
        self.entries
            .iter()
            .map(|(_, e)| e.known)
            .max()
            .unwrap_or(KnownDeps::Unknown)
    }

    /// The weakest knowledge level across `scope`; `Unknown` when any part
    /// of `scope` is uncovered.
    pub fn min_known_over(&self, scope: &Ranges) -> KnownDeps {
        let covered: Ranges = self
            .entries
            .iter()
            .map(|(range, _)| range.clone())
            .collect();
        if !covered.contains_all(scope) {
            return KnownDeps::Unknown;
        }
        self.entries
            .iter()
            .filter(|(range, _)| scope.intersects(range))
            .map(|(_, entry)| entry.known)
            .min()
            .unwrap_or(KnownDeps::Unknown)
    }

    /// Union everything usable as an Accept proposal: coordinated deps taken
    /// verbatim where the proposal was fixed or decided, local observations
    /// where it was not.
    pub fn merge_proposal(&self) -> Deps {
        let mut out = Deps::new();
        for (_, entry) in &self.entries {
            if entry.known >= KnownDeps::ProposedFixed {
                if let Some(coordinated) = &entry.coordinated {
                    out = out.with(coordinated);
                }
            } else if let Some(local) = &entry.local {
                out = out.with(local);
            }
        }
        out
    }

    /// Deps already decided (committed or stable), with the ranges for which
    /// the decision is sufficient.
    pub fn merge_decided(&self) -> (Deps, Ranges) {
        let mut deps = Deps::new();
        let mut sufficient = Vec::new();
        for (range, entry) in &self.entries {
            if entry.known >= KnownDeps::Committed {
                if let Some(coordinated) = &entry.coordinated {
                    deps = deps.with(coordinated);
                }
                sufficient.push(range.clone());
            }
        }
        (deps, Ranges::of(sufficient))
    }
}

impl fmt::Debug for LatestDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(r, e)| (r, e)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;
    use crate::txn::{Domain, Kind, TxnId};

    fn id(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, Kind::Write, Domain::Key, 1)
    }

    fn deps_of(key: &str, hlc: u64) -> Deps {
        let mut deps = Deps::new();
        deps.insert_key(Key::from(key), id(hlc));
        deps
    }

    fn scope(start: &str, end: &str) -> Ranges {
        Ranges::single(KeyRange::new(start, end))
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let x = LatestDeps::create(
            &scope("a", "m"),
            KnownDeps::Proposed,
            Ballot::ZERO,
            None,
            Some(deps_of("b", 1)),
        );
        assert_eq!(LatestDeps::merge(&x, &LatestDeps::EMPTY), x);
        assert_eq!(LatestDeps::merge(&LatestDeps::EMPTY, &x), x);
    }

    #[test]
    fn merge_is_commutative() {
        let a = LatestDeps::create(
            &scope("a", "m"),
            KnownDeps::Proposed,
            Ballot::initial(1, 1),
            None,
            Some(deps_of("b", 1)),
        );
        let b = LatestDeps::create(
            &scope("g", "z"),
            KnownDeps::Committed,
            Ballot::initial(1, 2),
            Some(deps_of("h", 2)),
            None,
        );
        assert_eq!(LatestDeps::merge(&a, &b), LatestDeps::merge(&b, &a));
    }

    #[test]
    fn merge_is_associative() {
        let a = LatestDeps::create(
            &scope("a", "m"),
            KnownDeps::Proposed,
            Ballot::initial(1, 1),
            None,
            Some(deps_of("b", 1)),
        );
        let b = LatestDeps::create(
            &scope("g", "z"),
            KnownDeps::ProposedFixed,
            Ballot::initial(1, 2),
            Some(deps_of("h", 2)),
            None,
        );
        let c = LatestDeps::create(
            &scope("c", "t"),
            KnownDeps::Proposed,
            Ballot::initial(1, 3),
            None,
            Some(deps_of("d", 3)),
        );
        let left = LatestDeps::merge(&LatestDeps::merge(&a, &b), &c);
        let right = LatestDeps::merge(&a, &LatestDeps::merge(&b, &c));
        assert_eq!(left, right);
    }

    #[test]
    fn higher_phase_wins_and_locals_union_below_fixed() {
        let a = LatestDeps::create(
            &scope("a", "z"),
            KnownDeps::Proposed,
            Ballot::initial(1, 1),
            None,
            Some(deps_of("b", 1)),
        );
        let b = LatestDeps::create(
            &scope("a", "z"),
            KnownDeps::Proposed,
            Ballot::initial(1, 2),
            None,
            Some(deps_of("c", 2)),
        );
        let merged = LatestDeps::merge(&a, &b);
        let proposal = merged.merge_proposal();
        // both locals survive under the winning ballot
        assert!(proposal.contains(id(1)));
        assert!(proposal.contains(id(2)));

        let fixed = LatestDeps::create(
            &scope("a", "z"),
            KnownDeps::ProposedFixed,
            Ballot::initial(1, 3),
            Some(deps_of("d", 3)),
            None,
        );
        let merged = LatestDeps::merge(&merged, &fixed);
        assert_eq!(merged.max_known(), KnownDeps::ProposedFixed);
    }

    #[test]
    fn decided_ranges_report_sufficiency() {
        let committed = LatestDeps::create(
            &scope("a", "m"),
            KnownDeps::Committed,
            Ballot::ZERO,
            Some(deps_of("b", 7)),
            None,
        );
        let unknown = LatestDeps::create(
            &scope("m", "z"),
            KnownDeps::Proposed,
            Ballot::ZERO,
            None,
            Some(deps_of("q", 8)),
        );
        let merged = LatestDeps::merge(&committed, &unknown);
        let (deps, sufficient) = merged.merge_decided();
        assert!(deps.contains(id(7)));
        assert!(sufficient.contains_all(&scope("a", "m")));
        assert!(!sufficient.contains_all(&scope("a", "n")));
        assert_eq!(merged.min_known_over(&scope("a", "z")), KnownDeps::Proposed);
        assert_eq!(merged.min_known_over(&scope("a", "m")), KnownDeps::Committed);
    }
}
