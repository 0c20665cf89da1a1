//! Protocol messages.
//!
//! One struct per request/reply pair, wrapped in `Request`/`Reply` sums for
//! dispatch. Every request carries the transaction id and the epoch the
//! receiving replica must have acknowledged before processing. Replies are
//! `Ok(payload)` or a `Nack`.

use std::collections::BTreeMap;

use crate::command::AcceptKind;
use crate::deps::Deps;
use crate::keys::{Key, Participants, Route};
use crate::latest_deps::LatestDeps;
use crate::status::{Durability, SaveStatus};
use crate::cleanup::DurableBefore;
use crate::txn::{Ballot, PartialTxn, Timestamp, TxnId};

/// Negative replies. Everything else rides in the per-message Ok payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nack {
    /// The replica lacks data to act (e.g. a commit without the txn body);
    /// retry with a superset.
    Insufficient,
    /// The transaction is already beyond the phase of this request.
    Redundant,
    /// A higher ballot has been promised.
    Rejected { promised: Ballot },
    /// The request is malformed for this replica (wrong shard, bad scope).
    Invalid,
}

pub type ReplyResult<T> = Result<T, Nack>;

#[derive(Clone, Debug)]
pub struct PreAcceptReq {
    pub txn_id: TxnId,
    pub txn: PartialTxn,
    pub route: Route,
    /// Coordination ballot; zero for the original coordinator.
    pub ballot: Ballot,
}

#[derive(Clone, Debug)]
pub struct PreAcceptOk {
    /// The replica's proposed execution timestamp; equal to the txn id iff
    /// the replica votes for the fast path.
    pub execute_at: Timestamp,
    pub deps: Deps,
}

#[derive(Clone, Debug)]
pub struct AcceptReq {
    pub txn_id: TxnId,
    pub kind: AcceptKind,
    pub ballot: Ballot,
    pub execute_at: Timestamp,
    pub deps: Deps,
    pub route: Route,
}

#[derive(Clone, Debug)]
pub struct AcceptOk {
    /// Slow path: conflicts the replica witnessed after preaccept.
    pub additional_deps: Deps,
}

/// Flavors of the commit/stabilise message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitKind {
    /// Commit on the slow path; deps may still grow before Stable.
    CommitSlowPath,
    /// Stabilise directly after a fast-path preaccept round.
    StableFastPath,
    /// Stabilise after an Accept round.
    StableSlowPath,
    /// Stabilise carrying the full txn body and deps for a replica that
    /// answered `Insufficient`.
    StableWithTxnAndDeps,
    /// Commit carrying the txn body.
    CommitWithTxn,
    /// Record a terminal negative outcome (recovery decided the transaction
    /// can never commit).
    Invalidate,
}

impl CommitKind {
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            CommitKind::StableFastPath | CommitKind::StableSlowPath | CommitKind::StableWithTxnAndDeps
        )
    }
}

#[derive(Clone, Debug)]
pub struct CommitReq {
    pub txn_id: TxnId,
    pub kind: CommitKind,
    pub ballot: Ballot,
    pub execute_at: Timestamp,
    pub deps: Deps,
    pub route: Route,
    /// Body digest; replicas answer `Insufficient` when they hold neither a
    /// matching body nor one carried here.
    pub txn_digest: [u8; 32],
    /// Present for the `*WithTxn*` kinds.
    pub txn: Option<PartialTxn>,
}

#[derive(Clone, Debug)]
pub struct CommitOk;

#[derive(Clone, Debug)]
pub struct ReadReq {
    pub txn_id: TxnId,
    pub execute_at: Timestamp,
    /// Keys/ranges this replica should read.
    pub scope: Participants,
}

#[derive(Clone, Debug)]
pub struct ReadOk {
    pub data: BTreeMap<Key, Option<Vec<u8>>>,
}

#[derive(Clone, Debug)]
pub struct ApplyReq {
    pub txn_id: TxnId,
    pub execute_at: Timestamp,
    pub deps: Deps,
    pub route: Route,
    pub result: Vec<u8>,
    pub durability: Durability,
}

#[derive(Clone, Debug)]
pub struct ApplyOk;

#[derive(Clone, Debug)]
pub struct BeginRecoveryReq {
    pub txn_id: TxnId,
    pub ballot: Ballot,
    pub route: Route,
}

#[derive(Clone, Debug)]
pub struct BeginRecoveryOk {
    pub status: SaveStatus,
    pub accepted: Ballot,
    pub execute_at: Option<Timestamp>,
    /// Per-range dependency knowledge for the recovery merge.
    pub latest: LatestDeps,
    /// The replica preaccepted with `executeAt == txnId`.
    pub voted_fast_path: bool,
    /// The replica witnessed an earlier conflicting transaction that had not
    /// itself witnessed the one being recovered; a fast-path re-commit would
    /// be unsafe.
    pub blocking_conflict: bool,
    /// Outcome bytes, when the replica already applied.
    pub result: Option<Vec<u8>>,
    /// Route knowledge supplement.
    pub route: Option<Route>,
    /// Body supplement for the take-over coordinator.
    pub txn: Option<PartialTxn>,
}

#[derive(Clone, Debug)]
pub struct CheckStatusReq {
    pub txn_id: TxnId,
    pub scope: Participants,
    /// Also return the body and deps, not just the status.
    pub include_info: bool,
}

#[derive(Clone, Debug)]
pub struct CheckStatusOk {
    pub status: SaveStatus,
    pub promised: Ballot,
    pub accepted: Ballot,
    pub execute_at: Option<Timestamp>,
    pub durability: Durability,
    pub route: Option<Route>,
    pub txn: Option<PartialTxn>,
    pub deps: Option<Deps>,
    pub result: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct FetchDataReq {
    pub txn_id: TxnId,
    pub scope: Participants,
}

#[derive(Clone, Debug)]
pub struct FetchDataOk {
    pub txn: Option<PartialTxn>,
    pub deps: Option<Deps>,
    pub execute_at: Option<Timestamp>,
    pub status: SaveStatus,
}

#[derive(Clone, Debug)]
pub struct SetShardDurableReq {
    pub txn_id: TxnId,
    pub scope: Participants,
    pub durability: Durability,
}

#[derive(Clone, Debug)]
pub struct SetGloballyDurableReq {
    pub durable_before: DurableBefore,
}

#[derive(Clone, Debug)]
pub struct QueryDurableBeforeReq;

#[derive(Clone, Debug)]
pub struct QueryDurableBeforeOk {
    pub durable_before: DurableBefore,
}

/// All requests a replica can receive.
#[derive(Clone, Debug)]
pub enum Request {
    PreAccept(PreAcceptReq),
    Accept(AcceptReq),
    Commit(CommitReq),
    Read(ReadReq),
    Apply(ApplyReq),
    BeginRecovery(BeginRecoveryReq),
    CheckStatus(CheckStatusReq),
    FetchData(FetchDataReq),
    SetShardDurable(SetShardDurableReq),
    SetGloballyDurable(SetGloballyDurableReq),
    QueryDurableBefore(QueryDurableBeforeReq),
}

impl Request {
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            Request::PreAccept(r) => Some(r.txn_id),
            Request::Accept(r) => Some(r.txn_id),
            Request::Commit(r) => Some(r.txn_id),
            Request::Read(r) => Some(r.txn_id),
            Request::Apply(r) => Some(r.txn_id),
            Request::BeginRecovery(r) => Some(r.txn_id),
            Request::CheckStatus(r) => Some(r.txn_id),
            Request::FetchData(r) => Some(r.txn_id),
            Request::SetShardDurable(r) => Some(r.txn_id),
            Request::SetGloballyDurable(_) | Request::QueryDurableBefore(_) => None,
        }
    }

    /// The epoch the receiving replica must have acknowledged first.
    pub fn wait_for_epoch(&self) -> u64 {
        match self {
            Request::PreAccept(r) => r.txn_id.epoch(),
            Request::Accept(r) => r.execute_at.epoch,
            Request::Commit(r) => r.execute_at.epoch,
            Request::Read(r) => r.execute_at.epoch,
            Request::Apply(r) => r.execute_at.epoch,
            Request::BeginRecovery(r) => r.txn_id.epoch(),
            Request::CheckStatus(r) => r.txn_id.epoch(),
            Request::FetchData(r) => r.txn_id.epoch(),
            Request::SetShardDurable(r) => r.txn_id.epoch(),
            Request::SetGloballyDurable(_) | Request::QueryDurableBefore(_) => 0,
        }
    }
}

/// All replies, mirroring `Request`.
#[derive(Clone, Debug)]
pub enum Reply {
    PreAccept(ReplyResult<PreAcceptOk>),
    Accept(ReplyResult<AcceptOk>),
    Commit(ReplyResult<CommitOk>),
    Read(ReplyResult<ReadOk>),
    Apply(ReplyResult<ApplyOk>),
    BeginRecovery(ReplyResult<BeginRecoveryOk>),
    CheckStatus(ReplyResult<CheckStatusOk>),
    FetchData(ReplyResult<FetchDataOk>),
    SetShardDurable(ReplyResult<()>),
    SetGloballyDurable(ReplyResult<()>),
    QueryDurableBefore(ReplyResult<QueryDurableBeforeOk>),
}
