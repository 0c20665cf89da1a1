//! Per-transaction, per-replica state machine.
//!
//! Every transition is idempotent for equal payloads and rejected, without
//! mutating state, for a strictly lower phase or ballot. Messages may always
//! supplement route/participant knowledge even when they cannot advance the
//! status.

use std::fmt;

use crate::deps::Deps;
use crate::keys::{Participants, Ranges, Route};
use crate::status::{Durability, Phase, SaveStatus};
use crate::txn::{Ballot, Kind, PartialTxn, Timestamp, TxnId};

/// How a replica relates to one transaction across epochs.
#[derive(Clone, Debug, Default)]
pub struct StoreParticipants {
    /// The full route if known, else the widest partial route seen.
    pub route: Option<Route>,
    /// What this replica owns of the transaction in `txn_id.epoch`.
    pub owns: Option<Participants>,
    /// Union over every epoch this replica has seen the transaction in.
    pub touches: Option<Participants>,
    /// What this replica executes in `execute_at.epoch`; set at commit time.
    pub executes: Option<Participants>,
}

impl StoreParticipants {
    pub fn has_full_route(&self) -> bool {
        self.route.as_ref().is_some_and(Route::is_full)
    }

    pub fn supplement_route(&mut self, route: &Route) {
        match &mut self.route {
            Some(existing) => existing.supplement(route),
            None => self.route = Some(route.clone()),
        }
    }

    pub fn set_owns(&mut self, owns: Participants) {
        let touches = match &self.touches {
            Some(existing) => existing.union(&owns),
            None => owns.clone(),
        };
        self.touches = Some(touches);
        self.owns = Some(owns);
    }

    pub fn set_executes(&mut self, executes: Participants) {
        let touches = match &self.touches {
            Some(existing) => existing.union(&executes),
            None => executes.clone(),
        };
        self.touches = Some(touches);
        self.executes = Some(executes);
    }

    /// Executes restricted to ranges this store still serves.
    pub fn still_executes(&self, serving: &Ranges) -> Option<Participants> {
        self.executes.as_ref().map(|e| e.slice(serving))
    }
}

/// Why a transition was refused. The command is unchanged in either case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refusal {
    /// A higher ballot has been promised; the caller must re-propose above it.
    Superseded(Ballot),
    /// The command is already at or beyond what the message would establish.
    Redundant,
    /// The command's state has been truncated; nothing can be recorded.
    Truncated,
}

/// Bitset over a command's stable dependencies, tracking which still block
/// execution. The id list is fixed at stable time; bits clear as deps apply.
#[derive(Clone, PartialEq, Eq)]
pub struct WaitingOn {
    deps: Vec<TxnId>,
    words: Vec<u64>,
    waiting: usize,
}

impl WaitingOn {
    pub fn new(mut deps: Vec<TxnId>) -> Self {
        deps.sort_unstable();
        deps.dedup();
        let words = vec![u64::MAX; (deps.len() + 63) / 64];
        let waiting = deps.len();
        Self {
            deps,
            words,
            waiting,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_done(&self) -> bool {
        self.waiting == 0
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_waiting_on(&self, id: TxnId) -> bool {
        match self.deps.binary_search(&id) {
            Ok(index) => self.words[index / 64] & (1 << (index % 64)) != 0,
            Err(_) => false,
        }
    }

    /// Mark a dependency satisfied. Returns true when this call cleared the
    /// final outstanding bit.
    pub fn satisfy(&mut self, id: TxnId) -> bool {
        if let Ok(index) = self.deps.binary_search(&id) {
            let mask = 1 << (index % 64);
            if self.words[index / 64] & mask != 0 {
                self.words[index / 64] &= !mask;
                self.waiting -= 1;
            }
        }
        self.waiting == 0
    }

    pub fn waiting_ids(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.deps
            .iter()
            .enumerate()
            .filter(|(index, _)| self.words[index / 64] & (1 << (index % 64)) != 0)
            .map(|(_, id)| *id)
    }
}

impl fmt::Debug for WaitingOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaitingOn({}/{})", self.waiting, self.deps.len())
    }
}

/// The accept flavor recorded by a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptKind {
    /// Deps fixed by the coordinator.
    Medium,
    /// Replicas may add late-witnessed conflicts.
    Slow,
    /// Proposal to invalidate.
    Invalidate,
}

/// Per-replica record of one transaction.
#[derive(Clone, Debug)]
pub struct Command {
    pub txn_id: TxnId,
    pub save_status: SaveStatus,
    pub durability: Durability,
    /// Highest ballot promised; never decreases.
    pub promised: Ballot,
    /// Ballot of the highest accepted/committed proposal.
    pub accepted: Ballot,
    pub execute_at: Option<Timestamp>,
    pub partial_txn: Option<PartialTxn>,
    pub partial_deps: Option<Deps>,
    pub participants: StoreParticipants,
    pub waiting_on: Option<WaitingOn>,
    /// Opaque outcome bytes once applied.
    pub result: Option<Vec<u8>>,
    /// EphemeralReads only: local erase deadline (HLC micros).
    pub expires_at: Option<u64>,
}

impl Command {
    pub fn uninitialised(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            save_status: SaveStatus::NotDefined,
            durability: Durability::NotDurable,
            promised: Ballot::ZERO,
            accepted: Ballot::ZERO,
            execute_at: None,
            partial_txn: None,
            partial_deps: None,
            participants: StoreParticipants::default(),
            waiting_on: None,
            result: None,
            expires_at: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.save_status.phase()
    }

    pub fn is_decided(&self) -> bool {
        self.save_status.is_decided()
    }

    /// The timestamp other transactions must order around, once decided.
    pub fn execute_at_or_txn_id(&self) -> Timestamp {
        self.execute_at.unwrap_or_else(|| self.txn_id.as_timestamp())
    }

    fn check_promised(&self, ballot: Ballot) -> Result<(), Refusal> {
        if ballot < self.promised {
            return Err(Refusal::Superseded(self.promised));
        }
        Ok(())
    }

    /// Promise a ballot without recording anything else (recovery's first
    /// round). Rejects strictly lower ballots.
    pub fn promise(&mut self, ballot: Ballot) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        self.check_promised(ballot)?;
        self.promised = ballot;
        Ok(())
    }

    pub fn preaccept(
        &mut self,
        ballot: Ballot,
        txn: PartialTxn,
        route: &Route,
        execute_at: Timestamp,
        deps: Deps,
    ) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        self.check_promised(ballot)?;
        self.participants.supplement_route(route);
        if self.phase() > Phase::PreAccept {
            // late or duplicate preaccept: knowledge supplemented, status kept
            self.supplement_txn(&txn);
            return Err(Refusal::Redundant);
        }
        self.promised = ballot;
        self.supplement_txn(&txn);
        self.partial_deps = Some(match self.partial_deps.take() {
            Some(existing) => existing.with(&deps),
            None => deps,
        });
        if self.execute_at.is_none() {
            self.execute_at = Some(execute_at);
        }
        self.save_status = self.save_status.max(SaveStatus::PreAccepted);
        Ok(())
    }

    pub fn accept(
        &mut self,
        kind: AcceptKind,
        ballot: Ballot,
        execute_at: Timestamp,
        deps: Deps,
    ) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        self.check_promised(ballot)?;
        if self.phase() > Phase::Accept
            || (self.phase() == Phase::Accept && self.save_status >= SaveStatus::PreCommitted)
        {
            return Err(Refusal::Redundant);
        }
        let status = match kind {
            AcceptKind::Medium => SaveStatus::AcceptedMedium,
            AcceptKind::Slow => SaveStatus::AcceptedSlow,
            AcceptKind::Invalidate => SaveStatus::AcceptedInvalidate,
        };
        if self.phase() == Phase::Accept && ballot == self.accepted && status < self.save_status {
            // same-ballot reordering must not move the record backwards
            return Err(Refusal::Redundant);
        }
        self.promised = ballot;
        self.accepted = ballot;
        if kind != AcceptKind::Invalidate {
            self.execute_at = Some(execute_at);
            self.partial_deps = Some(deps);
        }
        self.save_status = status;
        Ok(())
    }

    /// Record that a quorum of preaccept-only state was witnessed, defusing
    /// any in-flight Accept from the original coordinator.
    pub fn not_accept(&mut self, ballot: Ballot, durable: bool) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        self.check_promised(ballot)?;
        let status = if durable {
            SaveStatus::NotAccepted
        } else {
            SaveStatus::PreNotAccepted
        };
        if self.phase() > Phase::Accept
            || (self.phase() == Phase::Accept
                && ballot == self.accepted
                && status < self.save_status)
        {
            return Err(Refusal::Redundant);
        }
        self.promised = ballot;
        self.save_status = self.save_status.max(status);
        Ok(())
    }

    /// Learn executeAt without deps: sufficient to exclude this transaction
    /// from later dependency sets, not to execute it.
    pub fn pre_commit(&mut self, execute_at: Timestamp) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        if self.save_status >= SaveStatus::PreCommitted {
            return Err(Refusal::Redundant);
        }
        self.execute_at = Some(execute_at);
        self.save_status = SaveStatus::PreCommitted;
        Ok(())
    }

    pub fn commit(
        &mut self,
        ballot: Ballot,
        execute_at: Timestamp,
        deps: Deps,
    ) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        if self.save_status >= SaveStatus::Committed {
            return Err(Refusal::Redundant);
        }
        // A commit is a decision: even if we promised a higher ballot to a
        // concurrent recovery, that recovery can only re-derive this same
        // decision, so refusing would just strand the replica.
        self.promised = self.promised.max(ballot);
        self.accepted = self.accepted.max(ballot);
        self.execute_at = Some(execute_at);
        self.partial_deps = Some(deps);
        self.save_status = SaveStatus::Committed;
        Ok(())
    }

    /// Deps are final; `waiting_on` is the filtered execution precondition.
    pub fn stable(
        &mut self,
        ballot: Ballot,
        execute_at: Timestamp,
        deps: Deps,
        waiting_on: WaitingOn,
    ) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        if self.save_status >= SaveStatus::Stable {
            return Err(Refusal::Redundant);
        }
        self.promised = self.promised.max(ballot);
        self.accepted = self.accepted.max(ballot);
        self.execute_at = Some(execute_at);
        self.partial_deps = Some(deps);
        self.waiting_on = Some(waiting_on);
        self.save_status = SaveStatus::Stable;
        Ok(())
    }

    /// Record the outcome. Precondition (enforced by the store): every
    /// member of `waiting_on` is satisfied.
    pub fn apply(&mut self, result: Vec<u8>) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        if self.save_status >= SaveStatus::PreApplied {
            return Err(Refusal::Redundant);
        }
        debug_assert!(
            self.waiting_on.as_ref().is_none_or(WaitingOn::is_done),
            "apply with outstanding dependencies"
        );
        self.result = Some(result);
        self.save_status = SaveStatus::PreApplied;
        Ok(())
    }

    /// Outcome locally persisted.
    pub fn applied(&mut self) -> Result<(), Refusal> {
        if self.save_status >= SaveStatus::Applied {
            return Err(Refusal::Redundant);
        }
        if self.save_status < SaveStatus::PreApplied {
            return Err(Refusal::Redundant);
        }
        self.durability = Durability::merge_at_least(self.durability, Durability::Local);
        self.save_status = SaveStatus::Applied;
        Ok(())
    }

    /// Terminal negative outcome.
    pub fn invalidate(&mut self) -> Result<(), Refusal> {
        if self.save_status.is_truncated() {
            return Err(Refusal::Truncated);
        }
        if self.save_status == SaveStatus::Invalidated {
            return Err(Refusal::Redundant);
        }
        debug_assert!(
            !self.save_status.has_been(SaveStatus::PreApplied),
            "invalidate after apply"
        );
        self.save_status = SaveStatus::Invalidated;
        Ok(())
    }

    /// Cleanup transition: force the status to the cleanup target, dropping
    /// whatever state the target no longer retains.
    pub fn truncate_to(&mut self, target: SaveStatus) {
        debug_assert!(target.is_truncated() || target == SaveStatus::Invalidated);
        if target >= SaveStatus::Truncated {
            self.result = None;
        }
        if target >= SaveStatus::Vestigial {
            self.partial_deps = None;
            self.partial_txn = None;
            self.execute_at = None;
        }
        self.waiting_on = None;
        self.save_status = target;
    }

    pub fn merge_durability(&mut self, durability: Durability) {
        self.durability = Durability::merge(self.durability, durability);
    }

    fn supplement_txn(&mut self, txn: &PartialTxn) {
        match &mut self.partial_txn {
            Some(existing) => existing.supplement(txn),
            None => self.partial_txn = Some(txn.clone()),
        }
    }

    pub fn is_ephemeral_read(&self) -> bool {
        self.txn_id.kind() == Kind::EphemeralRead
    }
}
