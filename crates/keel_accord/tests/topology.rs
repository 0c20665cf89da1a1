//! Epoch-change and cleanup behavior over the in-memory cluster.

mod common;

use common::{wait_until, Cluster};
use keel_accord::cleanup::{DurableBounds, RedundantBounds};
use keel_accord::{DurableBefore, Key, KeyRange, SaveStatus, Shard, Topology, TxnId};

#[tokio::test]
async fn coordination_spans_old_and_new_epochs() {
    // epoch 1 owned by {1,2,3}; node 4 joins (and 1 leaves) in epoch 2
    let cluster = Cluster::with_members(4, vec![1, 2, 3]).await;
    let epoch2 = Topology::new(2, vec![Shard::new(KeyRange::all(), vec![2, 3, 4])]);
    cluster.install_topology(epoch2).await;

    // epoch 2 is not yet synced from epoch 1, so the coordination must win
    // quorums in both electorates
    let outcome = cluster
        .submit_write(2, "moving", b"x")
        .await
        .expect("write spanning epochs commits");
    assert_eq!(outcome.txn_id.epoch(), 2);

    // replicas of the new epoch converge
    wait_until(
        || async {
            for id in [2u64, 3] {
                match cluster.command_state(id, outcome.txn_id).await {
                    Some((status, _)) if status >= SaveStatus::Applied => {}
                    _ => return false,
                }
            }
            true
        },
        "new-epoch replicas applied the write",
    )
    .await;

    // the departing owner participated too: it witnessed the transaction
    let state = cluster.command_state(1, outcome.txn_id).await;
    assert!(state.is_some(), "old owner never witnessed the txn");
    cluster.assert_no_violations();
}

#[tokio::test]
async fn sync_complete_releases_old_epoch() {
    let cluster = Cluster::with_members(4, vec![1, 2, 3]).await;
    let epoch2 = Topology::new(2, vec![Shard::new(KeyRange::all(), vec![2, 3, 4])]);
    cluster.install_topology(epoch2).await;

    // all new-epoch replicas report sync completion to node 2
    let node2 = cluster.node(2);
    {
        let mut manager = node2.topology.write().await;
        for reporter in [2u64, 3, 4] {
            manager.sync_complete(reporter, 2).expect("sync report");
        }
    }

    // selections no longer reach into epoch 1
    let scope = common::whole_range();
    let selected = node2
        .select_unsynced(&scope, 2, 2)
        .await
        .expect("selection");
    assert_eq!(selected.min_epoch(), 2);

    // a write now only needs the new electorate, even with node 1 dead
    cluster.transport.kill(1);
    cluster
        .submit_write(2, "post-sync", b"y")
        .await
        .expect("write after sync ignores the old epoch");
    cluster.assert_no_violations();
}

#[tokio::test]
async fn cleanup_past_watermarks_expunges_state() {
    let cluster = Cluster::new(3).await;
    let outcome = cluster
        .submit_write(1, "old", b"z")
        .await
        .expect("write commits");
    let txn_id = outcome.txn_id;

    // wait for local apply on node 1
    wait_until(
        || async {
            matches!(
                cluster.command_state(1, txn_id).await,
                Some((status, _)) if status >= SaveStatus::Applied
            )
        },
        "write applied locally",
    )
    .await;

    // advance both watermarks beyond the transaction: universally durable
    // and GC-eligible state is expunged entirely
    let node1 = cluster.node(1);
    let store = node1.stores()[0].clone();
    let horizon = TxnId::new(
        txn_id.epoch(),
        txn_id.hlc() + 1,
        txn_id.kind(),
        txn_id.domain(),
        txn_id.node(),
    );
    store
        .execute(move |inner| {
            inner.durable_before = DurableBefore::merge(
                &inner.durable_before,
                &DurableBefore::of(
                    KeyRange::all(),
                    DurableBounds {
                        majority_before: horizon,
                        universal_before: horizon,
                    },
                ),
            );
            inner.advance_redundant_before(
                KeyRange::all(),
                RedundantBounds {
                    locally_applied_before: horizon,
                    shard_applied_before: horizon,
                    gc_before: horizon,
                    bootstrapped_at: TxnId::NONE,
                    retired: false,
                },
            );
        })
        .await;

    let state = cluster.command_state(1, txn_id).await;
    assert!(state.is_none(), "expunged command still present: {state:?}");

    // the data itself is untouched by protocol GC
    assert_eq!(
        cluster.data[&1].latest(&Key::from("old")),
        Some(b"z".to_vec())
    );
    cluster.assert_no_violations();
}

#[tokio::test]
async fn retired_range_truncates_undecided_state() {
    let cluster = Cluster::new(3).await;
    let outcome = cluster
        .submit_write(1, "handoff", b"w")
        .await
        .expect("write commits");

    wait_until(
        || async {
            matches!(
                cluster.command_state(1, outcome.txn_id).await,
                Some((status, _)) if status >= SaveStatus::Applied
            )
        },
        "write applied locally",
    )
    .await;

    // retiring the range marks lingering state vestigial-or-better
    let node1 = cluster.node(1);
    let store = node1.stores()[0].clone();
    store
        .execute(|inner| {
            let all = keel_accord::Ranges::single(KeyRange::all());
            inner.retire_ranges(&all);
        })
        .await;

    // applied state is not regressed by retirement
    let (status, _) = cluster
        .command_state(1, outcome.txn_id)
        .await
        .expect("still known");
    assert!(status >= SaveStatus::Applied);
    cluster.assert_no_violations();
}
