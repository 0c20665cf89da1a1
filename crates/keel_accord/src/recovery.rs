//! Take-over coordination.
//!
//! When a transaction stalls past its progress deadline, any replica may
//! recover it: promise a higher ballot at a slow quorum, merge what that
//! quorum knows, and drive the transaction to the same outcome the original
//! coordinator would have produced. Fast-path re-commit is only permitted
//! when the quorum proves no Accept round could have completed and the
//! electorate voted `executeAt == txnId` unanimously enough.

use std::sync::Arc;

use crate::command::AcceptKind;
use crate::coordinate;
use crate::error::{CoordinateError, CoordinateResult};
use crate::keys::Route;
use crate::messages::*;
use crate::node::Node;
use crate::status::SaveStatus;
use crate::trackers::{FastPathTracker, RequestStatus};
use crate::txn::{Ballot, Timestamp, TxnId};

const MAX_BALLOT_ATTEMPTS: u32 = 3;

/// Recover `txn_id`, driving it to a terminal state.
pub async fn recover(node: &Arc<Node>, txn_id: TxnId, route: Route) -> CoordinateResult<()> {
    let mut ballot = Ballot {
        epoch: txn_id.epoch(),
        counter: 1,
        node: node.id,
    };
    for _ in 0..MAX_BALLOT_ATTEMPTS {
        match attempt(node, txn_id, &route, ballot).await {
            Err(CoordinateError::Preempted { by, .. }) if by.node != node.id => {
                // another recoverer is ahead; out-ballot them once, then yield
                ballot = by.next(txn_id.epoch(), node.id);
            }
            other => return other,
        }
    }
    Err(CoordinateError::Preempted {
        txn_id,
        by: ballot,
    })
}

async fn attempt(
    node: &Arc<Node>,
    txn_id: TxnId,
    route: &Route,
    ballot: Ballot,
) -> CoordinateResult<()> {
    let topologies = node
        .select_unsynced(&route.participants, txn_id.epoch(), txn_id.epoch())
        .await
        .map_err(|_| CoordinateError::Exhausted { txn_id })?;
    let mut tracker = FastPathTracker::new(&topologies);
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let request = Request::BeginRecovery(BeginRecoveryReq {
        txn_id,
        ballot,
        route: route.clone(),
    });

    let mut replies = node.broadcast(targets, request);
    let mut merged: Option<BeginRecoveryOk> = None;
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        match reply {
            Ok(Reply::BeginRecovery(Ok(ok))) => {
                let fast_vote = ok.voted_fast_path;
                merged = Some(match merged {
                    None => ok,
                    Some(previous) => crate::store::merge_recovery(previous, ok),
                });
                match tracker.record_success(from, fast_vote) {
                    RequestStatus::Success => break,
                    RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
                    RequestStatus::NoChange => {}
                }
            }
            Ok(Reply::BeginRecovery(Err(Nack::Rejected { promised }))) => {
                return Err(CoordinateError::Preempted {
                    txn_id,
                    by: promised,
                });
            }
            _ => {
                if tracker.record_failure(from) == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
            }
        }
    }
    let merged = merged.expect("quorum implies at least one reply");

    // a route learned from replies supersedes what the progress log held
    let mut route = route.clone();
    if let Some(known) = &merged.route {
        route.supplement(known);
    }

    // 1. an outcome already exists somewhere: propagate it. Truncation with
    //    the outcome retained is still an applied transaction.
    if merged.status >= SaveStatus::PreApplied
        && merged.status <= SaveStatus::TruncatedWithOutcome
    {
        if let (Some(execute_at), Some(result)) = (merged.execute_at, merged.result.clone()) {
            let (deps, _) = merged.latest.merge_decided();
            return propagate_apply(node, txn_id, &route, execute_at, deps, result).await;
        }
        // the outcome exists but its details were reclaimed before we could
        // learn them; the transaction needs no further driving
        return Ok(());
    }
    if merged.status == SaveStatus::Invalidated {
        propagate_invalidate(node, txn_id, &route, ballot).await?;
        // the take-over succeeded, but the transaction itself will never
        // commit; surface that outcome
        return Err(CoordinateError::Invalidated { txn_id });
    }
    if merged.status.is_truncated() {
        // deeper truncation only happens after the outcome was applied (or
        // the record ruled vestigial) and reclaimed; re-deciding it would
        // contradict a settled outcome, so there is nothing left to drive
        return Ok(());
    }

    let body = merged.txn.clone().ok_or(CoordinateError::Truncated { txn_id })?;

    // 2. the decision exists: re-disseminate it
    if merged.status >= SaveStatus::Committed {
        let execute_at = merged.execute_at.expect("committed implies executeAt");
        let (decided, _) = merged.latest.merge_decided();
        coordinate::stabilise(node, txn_id, &body, &route, ballot, execute_at, decided.clone())
            .await?;
        return coordinate::persist(node, txn_id, &body.txn, &route, execute_at, decided).await;
    }

    // 3. nothing decided. If no Accept was ever witnessed, the fast path may
    //    be re-taken when the electorate voted for it and nobody witnessed a
    //    conflicting transaction that could have blocked it. A PreCommitted
    //    witness carries an executeAt decided elsewhere and rules it out too.
    let accept_witnessed = matches!(
        merged.status,
        SaveStatus::AcceptedInvalidate
            | SaveStatus::AcceptedMedium
            | SaveStatus::AcceptedSlow
            | SaveStatus::PreCommitted
    );
    if !accept_witnessed && tracker.has_fast_path_accepted() && !merged.blocking_conflict {
        tracing::debug!(?txn_id, "recovery re-commits on the fast path");
        let execute_at = txn_id.as_timestamp();
        let deps = merged.latest.merge_proposal();
        coordinate::stabilise(node, txn_id, &body, &route, ballot, execute_at, deps.clone())
            .await?;
        return coordinate::persist(node, txn_id, &body.txn, &route, execute_at, deps).await;
    }

    // 4. slow recovery: re-propose with the merged knowledge at our ballot
    let execute_at: Timestamp = merged
        .execute_at
        .unwrap_or_else(|| txn_id.as_timestamp());
    let proposal = merged.latest.merge_proposal();
    tracing::debug!(?txn_id, ?execute_at, "recovery re-proposes via accept");
    let deps = coordinate::accept(
        node,
        txn_id,
        &route,
        ballot,
        AcceptKind::Slow,
        execute_at,
        proposal,
    )
    .await?;
    coordinate::stabilise(node, txn_id, &body, &route, ballot, execute_at, deps.clone()).await?;
    coordinate::persist(node, txn_id, &body.txn, &route, execute_at, deps).await
}

async fn propagate_apply(
    node: &Arc<Node>,
    txn_id: TxnId,
    route: &Route,
    execute_at: Timestamp,
    deps: crate::deps::Deps,
    result: Vec<u8>,
) -> CoordinateResult<()> {
    let topologies = node
        .select_unsynced(&route.participants, execute_at.epoch, execute_at.epoch)
        .await
        .map_err(|_| CoordinateError::Exhausted { txn_id })?;
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let request = Request::Apply(ApplyReq {
        txn_id,
        execute_at,
        deps,
        route: route.clone(),
        result,
        durability: crate::status::Durability::NotDurable,
    });
    let mut replies = node.broadcast(targets, request);
    let mut tracker = crate::trackers::QuorumTracker::new(&topologies);
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        let ok = matches!(reply, Ok(Reply::Apply(Ok(_))));
        let status = if ok {
            tracker.record_success(from)
        } else {
            tracker.record_failure(from)
        };
        match status {
            RequestStatus::Success => return Ok(()),
            RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
            RequestStatus::NoChange => {}
        }
    }
}

async fn propagate_invalidate(
    node: &Arc<Node>,
    txn_id: TxnId,
    route: &Route,
    ballot: Ballot,
) -> CoordinateResult<()> {
    let topologies = node
        .select_unsynced(&route.participants, txn_id.epoch(), txn_id.epoch())
        .await
        .map_err(|_| CoordinateError::Exhausted { txn_id })?;
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let request = Request::Commit(CommitReq {
        txn_id,
        kind: CommitKind::Invalidate,
        ballot,
        execute_at: txn_id.as_timestamp(),
        deps: crate::deps::Deps::new(),
        route: route.clone(),
        txn_digest: [0; 32],
        txn: None,
    });
    let mut replies = node.broadcast(targets, request);
    let mut tracker = crate::trackers::QuorumTracker::new(&topologies);
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        let ok = matches!(reply, Ok(Reply::Commit(Ok(_))));
        let status = if ok {
            tracker.record_success(from)
        } else {
            tracker.record_failure(from)
        };
        match status {
            RequestStatus::Success => return Ok(()),
            RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
            RequestStatus::NoChange => {}
        }
    }
}
