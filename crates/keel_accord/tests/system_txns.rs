//! Sync points, data fetch, and journal replay.

mod common;

use std::sync::{Arc, Mutex};

use common::{wait_until, Cluster, MemoryStore, TestAgent};
use keel_accord::messages::{FetchDataReq, Request};
use keel_accord::{
    coordinate, empty_system_txn, Command, CommandStore, Domain, Journal, Key, KeyRange, Kind,
    NodeConfig, Participants, Ranges, Reply, Route, SaveStatus, Transport,
};

#[tokio::test]
async fn sync_point_barriers_after_prior_writes() {
    let cluster = Cluster::new(3).await;
    let write = cluster
        .submit_write(1, "before-barrier", b"w")
        .await
        .expect("write commits");

    // a range-domain sync point over the whole keyspace
    let node2 = cluster.node(2);
    let txn_id = node2.next_txn_id(Kind::SyncPoint, Domain::Range).await;
    let scope = common::whole_range();
    let txn = empty_system_txn(Kind::SyncPoint, Domain::Range, scope.clone());
    let route = Route::full(Key::from(""), scope);
    let barrier = coordinate(&node2, txn_id, txn, route)
        .await
        .expect("sync point commits");

    // the barrier orders after the prior write
    assert!(barrier.execute_at > write.execute_at);
    wait_until(
        || async {
            for id in 1..=3u64 {
                match cluster.command_state(id, barrier.txn_id).await {
                    Some((status, _)) if status >= SaveStatus::Applied => {}
                    _ => return false,
                }
            }
            true
        },
        "sync point applied everywhere",
    )
    .await;
    cluster.assert_no_violations();
}

#[tokio::test]
async fn fetch_data_returns_command_knowledge() {
    let cluster = Cluster::new(3).await;
    let outcome = cluster
        .submit_write(1, "fetchable", b"v")
        .await
        .expect("write commits");

    let reply = cluster
        .transport
        .send(
            3,
            Request::FetchData(FetchDataReq {
                txn_id: outcome.txn_id,
                scope: Participants::Keys(keel_accord::Keys::of(vec![Key::from("fetchable")])),
            }),
        )
        .await
        .expect("fetch delivered");
    match reply {
        Reply::FetchData(Ok(ok)) => {
            assert!(ok.status >= SaveStatus::Committed);
            assert_eq!(ok.execute_at, Some(outcome.execute_at));
            assert!(ok.txn.is_some());
        }
        other => panic!("unexpected reply {other:?}"),
    }
    cluster.assert_no_violations();
}

/// Journal retaining every saved command, newest save last.
#[derive(Default)]
struct MemJournal {
    saved: Mutex<Vec<Command>>,
}

impl Journal for MemJournal {
    fn save_command(&self, _store_id: u32, command: &Command) -> anyhow::Result<()> {
        self.saved.lock().expect("journal lock").push(command.clone());
        Ok(())
    }

    fn replay(&self, _store_id: u32) -> anyhow::Result<Vec<Command>> {
        Ok(self.saved.lock().expect("journal lock").clone())
    }
}

#[tokio::test]
async fn journal_replay_restores_command_registers() {
    let journal = Arc::new(MemJournal::default());
    let data = MemoryStore::new();
    let agent = TestAgent::new();

    // a store that records one applied command into the journal
    let store = CommandStore::new(
        0,
        1,
        NodeConfig::default(),
        data.clone(),
        agent.clone(),
        journal.clone(),
    );
    store
        .install_ranges(1, Ranges::single(KeyRange::all()))
        .await;
    let txn_id = keel_accord::TxnId::new(1, 42, Kind::Write, Domain::Key, 1);
    let (txn, route) = common::write_txn("replayed", b"v");
    let body = txn.slice(&route.participants.as_ranges());
    let slice = Ranges::single(KeyRange::all());
    store
        .execute(move |inner| {
            let preaccept = keel_accord::messages::PreAcceptReq {
                txn_id,
                txn: body.clone(),
                route: route.clone(),
                ballot: keel_accord::Ballot::ZERO,
            };
            inner
                .handle_preaccept(preaccept, &slice)
                .expect("preaccept");
            let apply = keel_accord::messages::ApplyReq {
                txn_id,
                execute_at: txn_id.as_timestamp(),
                deps: keel_accord::Deps::new(),
                route,
                result: b"v".to_vec(),
                durability: keel_accord::Durability::NotDurable,
            };
            inner.handle_apply(apply, &slice).expect("apply");
        })
        .await;

    // a fresh store over the same journal sees the command again
    let revived = CommandStore::new(
        0,
        1,
        NodeConfig::default(),
        data,
        agent.clone(),
        journal,
    );
    let state = revived
        .execute(move |inner| {
            inner
                .command(txn_id)
                .map(|c| (c.save_status, c.execute_at))
        })
        .await;
    match state {
        Some((status, at)) => {
            assert!(status >= SaveStatus::Applied);
            assert_eq!(at, Some(txn_id.as_timestamp()));
        }
        None => panic!("replay lost the command"),
    }
    assert!(agent.violations().is_empty());
}
