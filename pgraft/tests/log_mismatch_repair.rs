mod fixtures;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use memstore::MemStore;
use pgraft::membership::Membership;
use pgraft::raft::AppendEntriesRequest;
use pgraft::raft::Entry;
use pgraft::raft::EntryConfigChange;
use pgraft::raft::EntryNormal;
use pgraft::raft::EntryPayload;
use pgraft::storage::HardState;
use pgraft::Config;
use pgraft::LogId;
use pgraft::RaftStorage;
use fixtures::RaftRouter;

fn command(term: u64, index: u64, status: &str) -> Entry<ClientRequest> {
    Entry {
        log_id: LogId { term, index },
        payload: EntryPayload::Normal(EntryNormal {
            data: ClientRequest {
                client: "c1".into(),
                serial: index,
                status: status.into(),
            },
        }),
    }
}

/// Log mismatch repair test.
///
/// What does this test do?
///
/// - seeds a follower whose log tail was written by a deposed leader: `[t1:cfg, t1:b, t2:bad]`.
/// - a new leader at term 3 sends AppendEntries with `prev_log_id = (1, 2)` and one entry at
///   term 3; the follower truncates the conflicting tail and appends the new entry.
/// - a duplicate of the same request is a no-op success.
/// - a term conflict at or below the commit index shuts the node down.
///
/// RUST_LOG=pgraft,memstore,log_mismatch_repair=trace cargo test -p pgraft --test log_mismatch_repair
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_mismatch_repair() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    // Seed the follower's log: a config entry for {1, 2}, a command from term 1, and a command
    // from a deposed term-2 leader which the real leader never committed.
    let membership = Membership::new_voters(btreeset![1, 2])?;
    let mut log = BTreeMap::new();
    log.insert(1, Entry {
        log_id: LogId { term: 1, index: 1 },
        payload: EntryPayload::ConfigChange(EntryConfigChange {
            membership: membership.clone(),
        }),
    });
    log.insert(2, command(1, 2, "b"));
    log.insert(3, command(2, 3, "bad"));

    let sto = Arc::new(MemStore::new_with_state(
        1,
        log,
        Default::default(),
        Some(HardState {
            current_term: 2,
            voted_for: None,
        }),
        None,
    ));
    router.new_raft_node_with_sto(1, sto.clone()).await;
    router.new_raft_node(2).await;

    tracing::info!("--- a probe beyond the follower's log is rejected with the probed index");

    let node = router.get_raft_handle(&1).await?;
    let res = node
        .append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: 2,
            prev_log_id: LogId { term: 3, index: 4 },
            entries: vec![],
            leader_commit: 0,
            pgrep: false,
        })
        .await?;
    assert!(!res.is_success());
    assert_eq!(res.conflict.as_ref().map(|c| c.rejected), Some(4));
    assert_eq!(res.last_log_index, 3);

    tracing::info!("--- a mismatched prev_log_id is rejected");

    let res = node
        .append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: 2,
            prev_log_id: LogId { term: 2, index: 2 },
            entries: vec![],
            leader_commit: 0,
            pgrep: false,
        })
        .await?;
    assert!(!res.is_success());
    assert_eq!(res.conflict.as_ref().map(|c| c.rejected), Some(2));

    tracing::info!("--- a matching request truncates the conflicting tail and appends");

    let repair = AppendEntriesRequest {
        term: 3,
        leader_id: 2,
        prev_log_id: LogId { term: 1, index: 2 },
        entries: vec![command(3, 3, "c")],
        leader_commit: 2,
        pgrep: false,
    };
    let res = node.append_entries(repair).await?;
    assert!(res.is_success(), "expected the repair to be accepted: {:?}", res.conflict);
    assert_eq!(res.last_log_index, 3);

    let entries = sto.get_log_entries(3..4).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].log_id, LogId { term: 3, index: 3 });
    match &entries[0].payload {
        EntryPayload::Normal(inner) => assert_eq!(inner.data.status, "c"),
        other => panic!("expected a command entry at index 3, got {:?}", other),
    }

    tracing::info!("--- replaying the same request is a no-op success");

    let res = node
        .append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: 2,
            prev_log_id: LogId { term: 1, index: 2 },
            entries: vec![command(3, 3, "c")],
            leader_commit: 2,
            pgrep: false,
        })
        .await?;
    assert!(res.is_success());
    assert_eq!(res.last_log_index, 3);
    let entries = sto.get_log_entries(..).await?;
    assert_eq!(entries.len(), 3);

    tracing::info!("--- a term conflict at or below the commit index is fatal");

    let res = node
        .append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: 2,
            prev_log_id: LogId { term: 1, index: 1 },
            entries: vec![command(9, 2, "corrupt")],
            leader_commit: 2,
            pgrep: false,
        })
        .await;
    assert!(res.is_err(), "a conflict below the commit index must shut the node down");

    Ok(())
}
