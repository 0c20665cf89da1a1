//! Coordination pipeline tests over an in-memory cluster.

mod common;

use common::{wait_until, Cluster};
use keel_accord::{Key, SaveStatus};

#[tokio::test]
async fn fast_path_uncontended_write() {
    let cluster = Cluster::new(3).await;
    let outcome = cluster
        .submit_write(1, "k5", b"42")
        .await
        .expect("uncontended write commits");

    // no contention: fast path, executeAt is the txn id itself
    assert_eq!(outcome.execute_at, outcome.txn_id.as_timestamp());

    // every replica converges to Applied with the same executeAt
    let txn_id = outcome.txn_id;
    wait_until(
        || async {
            for id in 1..=3u64 {
                match cluster.command_state(id, txn_id).await {
                    Some((status, at)) => {
                        if status < SaveStatus::Applied || at != Some(outcome.execute_at) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            true
        },
        "all replicas applied the write",
    )
    .await;

    for data in cluster.data.values() {
        assert_eq!(data.latest(&Key::from("k5")), Some(b"42".to_vec()));
    }
    cluster.assert_no_violations();
}

#[tokio::test]
async fn read_observes_prior_write() {
    let cluster = Cluster::new(3).await;
    cluster
        .submit_write(1, "acct", b"100")
        .await
        .expect("write commits");

    // a read coordinated by a different node reflects the write
    let read = cluster.submit_read(2, "acct").await.expect("read commits");
    assert_eq!(
        read.data.get(&Key::from("acct")),
        Some(&Some(b"100".to_vec()))
    );
    cluster.assert_no_violations();
}

#[tokio::test]
async fn sequential_writes_order_by_execute_at() {
    let cluster = Cluster::new(3).await;
    let first = cluster.submit_write(1, "k", b"one").await.expect("first");
    let second = cluster.submit_write(2, "k", b"two").await.expect("second");
    assert!(second.execute_at > first.execute_at);

    let read = cluster.submit_read(3, "k").await.expect("read");
    assert_eq!(read.data.get(&Key::from("k")), Some(&Some(b"two".to_vec())));
    cluster.assert_no_violations();
}

#[tokio::test]
async fn conflicting_writes_agree_on_one_order() {
    let cluster = Cluster::new(3).await;
    let (a, b) = tokio::join!(
        cluster.submit_write(1, "hot", b"A"),
        cluster.submit_write(2, "hot", b"B"),
    );
    let a = a.expect("first conflicting write commits");
    let b = b.expect("second conflicting write commits");

    // conflicting transactions never share an execution timestamp
    assert_ne!(a.execute_at, b.execute_at);
    let winner: &[u8] = if a.execute_at > b.execute_at { b"A" } else { b"B" };

    // all replicas apply both, and agree on the final value
    wait_until(
        || async {
            for id in 1..=3u64 {
                for txn_id in [a.txn_id, b.txn_id] {
                    match cluster.command_state(id, txn_id).await {
                        Some((status, _)) if status >= SaveStatus::Applied => {}
                        _ => return false,
                    }
                }
            }
            true
        },
        "both conflicting writes applied everywhere",
    )
    .await;

    for (id, data) in &cluster.data {
        assert_eq!(
            data.latest(&Key::from("hot")),
            Some(winner.to_vec()),
            "node {id} disagrees on the final value"
        );
        // both versions exist, ordered identically by executeAt
        let history = data.history(&Key::from("hot"));
        assert_eq!(history.len(), 2, "node {id} missing a version");
    }

    // executeAt agreement across replicas, per transaction
    for txn_id in [a.txn_id, b.txn_id] {
        let mut seen = None;
        for id in 1..=3u64 {
            let (_, at) = cluster.command_state(id, txn_id).await.expect("applied");
            match seen {
                None => seen = at,
                Some(prev) => assert_eq!(Some(prev), at, "executeAt mismatch on node {id}"),
            }
        }
    }
    cluster.assert_no_violations();
}

#[tokio::test]
async fn many_interleaved_writers_converge() {
    let cluster = Cluster::new(3).await;
    let writers = (0..12u64).map(|i| {
        let cluster = &cluster;
        async move {
            let via = (i % 3) + 1;
            let value = format!("v{i}").into_bytes();
            cluster
                .submit_write(via, "contended", &value)
                .await
                .expect("write commits")
        }
    });
    let outcomes = futures_util::future::join_all(writers).await;

    // a total order: all executeAt values distinct
    let mut ats: Vec<_> = outcomes.iter().map(|o| o.execute_at).collect();
    ats.sort();
    ats.dedup();
    assert_eq!(ats.len(), outcomes.len());

    // the write with the greatest executeAt is the final value everywhere
    let winner = outcomes
        .iter()
        .max_by_key(|o| o.execute_at)
        .expect("non-empty");
    let winner_id = winner.txn_id;
    wait_until(
        || async {
            for id in 1..=3u64 {
                match cluster.command_state(id, winner_id).await {
                    Some((status, _)) if status >= SaveStatus::Applied => {}
                    _ => return false,
                }
            }
            true
        },
        "winning write applied everywhere",
    )
    .await;
    let expected = cluster.data[&1].latest(&Key::from("contended"));
    assert!(expected.is_some());
    for data in cluster.data.values() {
        assert_eq!(data.latest(&Key::from("contended")), expected);
    }
    cluster.assert_no_violations();
}
