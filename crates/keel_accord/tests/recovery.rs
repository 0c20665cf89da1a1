//! Take-over recovery tests: a stalled coordination is finished by another
//! replica with the same outcome the original coordinator would have
//! produced.

mod common;

use std::time::Duration;

use common::{wait_until, write_txn, Cluster};
use keel_accord::messages::{PreAcceptReq, Request};
use keel_accord::{recover, Ballot, Domain, Key, Kind, NodeConfig, SaveStatus, Transport};

fn fast_recovery_config() -> NodeConfig {
    NodeConfig {
        retry_await_timeout: Duration::from_millis(200),
        attempt_coordination_delay: Duration::from_millis(100),
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn crashed_coordinator_is_recovered_after_preaccept() {
    let cluster = Cluster::with_config(3, fast_recovery_config()).await;
    cluster.start_progress();

    // a coordinator that preaccepts everywhere and then halts
    let node1 = cluster.node(1);
    let txn_id = node1.next_txn_id(Kind::Write, Domain::Key).await;
    let (txn, route) = write_txn("k7", b"ghost");
    let body = txn.slice(&route.participants.as_ranges());
    let preaccept = Request::PreAccept(PreAcceptReq {
        txn_id,
        txn: body,
        route: route.clone(),
        ballot: Ballot::ZERO,
    });
    for peer in 1..=3u64 {
        cluster
            .transport
            .send(peer, preaccept.clone())
            .await
            .expect("preaccept delivered");
    }

    // progress timers on the replicas notice the stall and take over
    wait_until(
        || async {
            for id in 1..=3u64 {
                match cluster.command_state(id, txn_id).await {
                    Some((status, _)) if status >= SaveStatus::Applied => {}
                    _ => return false,
                }
            }
            true
        },
        "recovery drove the stalled write to Applied",
    )
    .await;

    // the outcome matches what the original coordinator would have decided:
    // an uncontended preaccept quorum recovers on the fast path
    for id in 1..=3u64 {
        let (_, at) = cluster.command_state(id, txn_id).await.expect("applied");
        assert_eq!(at, Some(txn_id.as_timestamp()), "node {id} executeAt");
    }
    for data in cluster.data.values() {
        assert_eq!(data.latest(&Key::from("k7")), Some(b"ghost".to_vec()));
    }
    cluster.assert_no_violations();
}

#[tokio::test]
async fn recovery_of_completed_txn_propagates_outcome() {
    let cluster = Cluster::new(3).await;
    let outcome = cluster
        .submit_write(1, "done", b"final")
        .await
        .expect("write commits");

    // explicit take-over of an already-applied transaction is a no-op that
    // re-disseminates the outcome
    let node2 = cluster.node(2);
    let (_, route) = write_txn("done", b"final");
    recover(&node2, outcome.txn_id, route)
        .await
        .expect("recovery propagates the existing outcome");

    for id in 1..=3u64 {
        let (status, at) = cluster
            .command_state(id, outcome.txn_id)
            .await
            .expect("known");
        assert!(status >= SaveStatus::Applied);
        assert_eq!(at, Some(outcome.execute_at));
    }
    for data in cluster.data.values() {
        assert_eq!(data.latest(&Key::from("done")), Some(b"final".to_vec()));
    }
    cluster.assert_no_violations();
}

#[tokio::test]
async fn recovery_of_truncated_txn_never_invalidates() {
    let cluster = Cluster::new(3).await;
    let outcome = cluster
        .submit_write(1, "gone", b"kept")
        .await
        .expect("write commits");
    let txn_id = outcome.txn_id;

    wait_until(
        || async {
            for id in 1..=3u64 {
                match cluster.command_state(id, txn_id).await {
                    Some((status, _)) if status >= SaveStatus::Applied => {}
                    _ => return false,
                }
            }
            true
        },
        "write applied everywhere",
    )
    .await;

    // GC truncates the applied command on every replica
    let horizon = keel_accord::TxnId::new(
        txn_id.epoch(),
        txn_id.hlc() + 1,
        txn_id.kind(),
        txn_id.domain(),
        txn_id.node(),
    );
    for id in 1..=3u64 {
        let node = cluster.node(id);
        let store = node.stores()[0].clone();
        store
            .execute(move |inner| {
                inner.advance_redundant_before(
                    keel_accord::KeyRange::all(),
                    keel_accord::cleanup::RedundantBounds {
                        locally_applied_before: horizon,
                        shard_applied_before: horizon,
                        gc_before: horizon,
                        bootstrapped_at: keel_accord::TxnId::NONE,
                        retired: false,
                    },
                );
            })
            .await;
        let (status, _) = cluster.command_state(id, txn_id).await.expect("retained");
        assert!(status.is_truncated(), "node {id} not truncated: {status:?}");
    }

    // a take-over of the truncated transaction completes without trying to
    // re-decide it
    let node2 = cluster.node(2);
    let (_, route) = write_txn("gone", b"kept");
    recover(&node2, txn_id, route)
        .await
        .expect("recovery treats truncation as settled");

    // nothing regressed toward Invalidated, and the outcome data survives
    for id in 1..=3u64 {
        let (status, _) = cluster.command_state(id, txn_id).await.expect("retained");
        assert_ne!(status, SaveStatus::Invalidated, "node {id} invalidated");
    }
    for data in cluster.data.values() {
        assert_eq!(data.latest(&Key::from("gone")), Some(b"kept".to_vec()));
    }
    cluster.assert_no_violations();
}

#[tokio::test]
async fn recovery_preempts_stale_coordinator_accept() {
    let cluster = Cluster::with_config(3, fast_recovery_config()).await;

    // preaccept only, as a halted coordinator would
    let node1 = cluster.node(1);
    let txn_id = node1.next_txn_id(Kind::Write, Domain::Key).await;
    let (txn, route) = write_txn("k9", b"stale");
    let body = txn.slice(&route.participants.as_ranges());
    for peer in 1..=3u64 {
        cluster
            .transport
            .send(
                peer,
                Request::PreAccept(PreAcceptReq {
                    txn_id,
                    txn: body.clone(),
                    route: route.clone(),
                    ballot: Ballot::ZERO,
                }),
            )
            .await
            .expect("preaccept delivered");
    }

    // a replica recovers explicitly
    let node2 = cluster.node(2);
    recover(&node2, txn_id, route.clone())
        .await
        .expect("recovery completes");

    // the original coordinator's late accept at ballot zero is now defunct
    let accept = Request::Accept(keel_accord::messages::AcceptReq {
        txn_id,
        kind: keel_accord::command::AcceptKind::Medium,
        ballot: Ballot::ZERO,
        execute_at: txn_id.as_timestamp(),
        deps: keel_accord::Deps::new(),
        route,
    });
    let reply = cluster
        .transport
        .send(3, accept)
        .await
        .expect("transport delivers");
    match reply {
        keel_accord::Reply::Accept(Err(_)) => {}
        other => panic!("stale accept should be refused, got {other:?}"),
    }
    cluster.assert_no_violations();
}
