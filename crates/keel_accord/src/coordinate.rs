//! Coordinator pipeline.
//!
//! Drives a client submission through PreAccept, an Accept round when the
//! fast path fails, Stabilise, Execute (the read round), and Persist. Any
//! node may coordinate any transaction; the recovery coordinator reuses the
//! tail of this pipeline once it has re-derived the decision.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::command::AcceptKind;
use crate::deps::Deps;
use crate::error::{CoordinateError, CoordinateResult, MismatchReason};
use crate::keys::{Key, Route};
use crate::messages::*;
use crate::node::Node;
use crate::status::Durability;
use crate::topology::Topologies;
use crate::trackers::{FastPathTracker, QuorumTracker, ReadTracker, RequestStatus};
use crate::txn::{Ballot, PartialTxn, Timestamp, Txn, TxnId};

/// What a successful coordination returns to the client.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub txn_id: TxnId,
    pub execute_at: Timestamp,
    /// Values read during the Execute phase (empty for pure writes).
    pub data: BTreeMap<Key, Option<Vec<u8>>>,
}

/// Coordinate a transaction end to end, bounded by the configured
/// client-facing deadline.
pub async fn coordinate(
    node: &Arc<Node>,
    txn_id: TxnId,
    txn: Txn,
    route: Route,
) -> CoordinateResult<Outcome> {
    let expires_at = node.config.local_expires_at;
    match tokio::time::timeout(expires_at, coordinate_inner(node, txn_id, txn, route)).await {
        Ok(result) => result,
        Err(_) => Err(CoordinateError::Timeout { txn_id }),
    }
}

async fn coordinate_inner(
    node: &Arc<Node>,
    txn_id: TxnId,
    txn: Txn,
    route: Route,
) -> CoordinateResult<Outcome> {
    // the body every message carries: the full txn tagged with its coverage
    let body = txn.slice(&route.participants.as_ranges());
    let preaccepted = preaccept(node, txn_id, &body, &route).await?;

    let (ballot, execute_at, deps) = match preaccepted {
        PreAccepted::Fast { deps } => {
            tracing::debug!(?txn_id, "fast path accepted");
            (Ballot::ZERO, txn_id.as_timestamp(), deps)
        }
        PreAccepted::Slow { execute_at, deps } => {
            tracing::debug!(?txn_id, ?execute_at, "fast path missed, proposing");
            let deps = accept(
                node,
                txn_id,
                &route,
                Ballot::ZERO,
                AcceptKind::Medium,
                execute_at,
                deps,
            )
            .await?;
            (Ballot::ZERO, execute_at, deps)
        }
    };

    stabilise(node, txn_id, &body, &route, ballot, execute_at, deps.clone()).await?;
    let data = execute_reads(node, txn_id, &txn, &route, execute_at).await?;
    persist(node, txn_id, &txn, &route, execute_at, deps).await?;
    Ok(Outcome {
        txn_id,
        execute_at,
        data,
    })
}

enum PreAccepted {
    Fast { deps: Deps },
    Slow { execute_at: Timestamp, deps: Deps },
}

async fn preaccept(
    node: &Arc<Node>,
    txn_id: TxnId,
    body: &PartialTxn,
    route: &Route,
) -> CoordinateResult<PreAccepted> {
    let topologies = select(node, txn_id, txn_id.epoch(), txn_id.epoch(), route).await?;
    let mut tracker = FastPathTracker::new(&topologies);
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let request = Request::PreAccept(PreAcceptReq {
        txn_id,
        txn: body.clone(),
        route: route.clone(),
        ballot: Ballot::ZERO,
    });

    let mut replies = node.broadcast(targets, request);
    let mut max_execute_at = txn_id.as_timestamp();
    let mut deps = Deps::new();
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        match reply {
            Ok(Reply::PreAccept(Ok(ok))) => {
                node.clock.observe(ok.execute_at.hlc);
                let fast_vote = ok.execute_at == txn_id.as_timestamp();
                max_execute_at = max_execute_at.max(ok.execute_at);
                deps = deps.with(&ok.deps);
                match tracker.record_success(from, fast_vote) {
                    RequestStatus::Success => break,
                    RequestStatus::Failed => {
                        return Err(CoordinateError::Exhausted { txn_id })
                    }
                    RequestStatus::NoChange => {}
                }
            }
            Ok(Reply::PreAccept(Err(Nack::Rejected { promised }))) => {
                return Err(CoordinateError::Preempted {
                    txn_id,
                    by: promised,
                });
            }
            Ok(Reply::PreAccept(Err(Nack::Redundant))) => {
                return Err(CoordinateError::Redundant { txn_id });
            }
            _ => {
                if tracker.record_failure(from) == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
            }
        }
    }

    if tracker.has_fast_path_accepted() {
        Ok(PreAccepted::Fast { deps })
    } else {
        Ok(PreAccepted::Slow {
            execute_at: max_execute_at,
            deps,
        })
    }
}

/// Run an Accept round, returning the deps to stabilise (the proposal plus
/// any late-witnessed conflicts from slow-path replies).
pub(crate) async fn accept(
    node: &Arc<Node>,
    txn_id: TxnId,
    route: &Route,
    ballot: Ballot,
    kind: AcceptKind,
    execute_at: Timestamp,
    proposed: Deps,
) -> CoordinateResult<Deps> {
    let topologies = select(node, txn_id, txn_id.epoch(), execute_at.epoch, route).await?;
    let mut tracker = QuorumTracker::new(&topologies);
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let request = Request::Accept(AcceptReq {
        txn_id,
        kind,
        ballot,
        execute_at,
        deps: proposed.clone(),
        route: route.clone(),
    });

    let mut replies = node.broadcast(targets, request);
    let mut merged = proposed;
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        match reply {
            Ok(Reply::Accept(Ok(ok))) => {
                merged = merged.with(&ok.additional_deps);
                match tracker.record_success(from) {
                    RequestStatus::Success => return Ok(merged),
                    RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
                    RequestStatus::NoChange => {}
                }
            }
            Ok(Reply::Accept(Err(Nack::Rejected { promised }))) => {
                return Err(CoordinateError::Preempted {
                    txn_id,
                    by: promised,
                });
            }
            Ok(Reply::Accept(Err(Nack::Redundant))) => {
                return Err(CoordinateError::Redundant { txn_id });
            }
            _ => {
                if tracker.record_failure(from) == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
            }
        }
    }
}

/// Disseminate the stable decision to the coordination topologies. Replicas
/// lacking the body answer `Insufficient` and are resent the full form.
pub(crate) async fn stabilise(
    node: &Arc<Node>,
    txn_id: TxnId,
    body: &PartialTxn,
    route: &Route,
    ballot: Ballot,
    execute_at: Timestamp,
    deps: Deps,
) -> CoordinateResult<()> {
    let topologies = select(node, txn_id, txn_id.epoch(), execute_at.epoch, route).await?;
    let mut tracker = QuorumTracker::new(&topologies);
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let kind = if execute_at == txn_id.as_timestamp() {
        CommitKind::StableFastPath
    } else {
        CommitKind::StableSlowPath
    };
    let digest = body.txn.digest();
    let request = Request::Commit(CommitReq {
        txn_id,
        kind,
        ballot,
        execute_at,
        deps: deps.clone(),
        route: route.clone(),
        txn_digest: digest,
        txn: None,
    });

    let mut replies = node.broadcast(targets, request);
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        match reply {
            Ok(Reply::Commit(Ok(_))) => match tracker.record_success(from) {
                RequestStatus::Success => return Ok(()),
                RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
                RequestStatus::NoChange => {}
            },
            Ok(Reply::Commit(Err(Nack::Insufficient))) => {
                // this replica never saw the body: resend carrying it
                let resend = Request::Commit(CommitReq {
                    txn_id,
                    kind: CommitKind::StableWithTxnAndDeps,
                    ballot,
                    execute_at,
                    deps: deps.clone(),
                    route: route.clone(),
                    txn_digest: digest,
                    txn: Some(body.clone()),
                });
                let node = node.clone();
                let tx_origin = from;
                let mut retry = node.broadcast(vec![tx_origin], resend);
                if let Some((_, Ok(Reply::Commit(Ok(_))))) = retry.recv().await {
                    match tracker.record_success(tx_origin) {
                        RequestStatus::Success => return Ok(()),
                        RequestStatus::Failed => {
                            return Err(CoordinateError::Exhausted { txn_id })
                        }
                        RequestStatus::NoChange => {}
                    }
                } else if tracker.record_failure(tx_origin) == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
            }
            Ok(Reply::Commit(Err(Nack::Rejected { promised }))) => {
                return Err(CoordinateError::Preempted {
                    txn_id,
                    by: promised,
                });
            }
            Ok(Reply::Commit(Err(Nack::Redundant))) => {
                return Err(CoordinateError::Redundant { txn_id });
            }
            _ => {
                if tracker.record_failure(from) == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
            }
        }
    }
}

/// The read round: one successful read per shard of the read scope.
async fn execute_reads(
    node: &Arc<Node>,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
    execute_at: Timestamp,
) -> CoordinateResult<BTreeMap<Key, Option<Vec<u8>>>> {
    if txn.read_scope.is_empty() {
        return Ok(BTreeMap::new());
    }
    let topologies = select(node, txn_id, execute_at.epoch, execute_at.epoch, route).await?;
    let mut tracker = ReadTracker::new(&topologies);
    let request = Request::Read(ReadReq {
        txn_id,
        execute_at,
        scope: txn.read_scope.clone(),
    });

    let (tx, mut replies) = tokio::sync::mpsc::unbounded_channel();
    let contacts = tracker.initial_contacts();
    node.broadcast_into(contacts, request.clone(), &tx);
    let mut data = BTreeMap::new();
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        match reply {
            Ok(Reply::Read(Ok(ok))) => {
                data.extend(ok.data);
                match tracker.record_success(from) {
                    RequestStatus::Success => return Ok(data),
                    RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
                    RequestStatus::NoChange => {}
                }
            }
            _ => {
                let (status, redispatch) = tracker.record_failure(from);
                if status == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
                if !redispatch.is_empty() {
                    node.broadcast_into(redispatch, request.clone(), &tx);
                }
            }
        }
    }
}

/// Persist the outcome: apply everywhere, acknowledge at a majority, then
/// keep disseminating durability in the background.
pub(crate) async fn persist(
    node: &Arc<Node>,
    txn_id: TxnId,
    txn: &Txn,
    route: &Route,
    execute_at: Timestamp,
    deps: Deps,
) -> CoordinateResult<()> {
    let topologies = select(node, txn_id, execute_at.epoch, execute_at.epoch, route).await?;
    let mut tracker = QuorumTracker::new(&topologies);
    let targets: Vec<_> = topologies.nodes().into_iter().collect();
    let result = txn.update.clone().unwrap_or_default();
    let request = Request::Apply(ApplyReq {
        txn_id,
        execute_at,
        deps,
        route: route.clone(),
        result,
        durability: Durability::NotDurable,
    });

    let mut replies = node.broadcast(targets.clone(), request);
    loop {
        let Some((from, reply)) = replies.recv().await else {
            return Err(CoordinateError::Timeout { txn_id });
        };
        match reply {
            Ok(Reply::Apply(Ok(_))) => match tracker.record_success(from) {
                RequestStatus::Success => break,
                RequestStatus::Failed => return Err(CoordinateError::Exhausted { txn_id }),
                RequestStatus::NoChange => {}
            },
            _ => {
                if tracker.record_failure(from) == RequestStatus::Failed {
                    return Err(CoordinateError::Exhausted { txn_id });
                }
            }
        }
    }

    // majority-durable: surface success now, spread durability behind
    let node = node.clone();
    let scope = route.participants.clone();
    tokio::spawn(async move {
        let request = Request::SetShardDurable(SetShardDurableReq {
            txn_id,
            scope,
            durability: Durability::Majority,
        });
        let mut replies = node.broadcast(targets, request);
        while replies.recv().await.is_some() {}
    });
    Ok(())
}

async fn select(
    node: &Arc<Node>,
    txn_id: TxnId,
    min_epoch: u64,
    max_epoch: u64,
    route: &Route,
) -> CoordinateResult<Topologies> {
    node.select_unsynced(&route.participants, min_epoch, max_epoch)
        .await
        .map_err(|err| {
            tracing::warn!(?txn_id, error = %err, "topology selection failed");
            CoordinateError::TopologyMismatch {
                txn_id,
                reason: MismatchReason::KeysOrRanges,
            }
        })
}
