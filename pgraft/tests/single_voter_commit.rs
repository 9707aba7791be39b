mod fixtures;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use pgraft::raft::ClientWriteRequest;
use pgraft::Config;
use pgraft::LogId;
use pgraft::RaftStorage;
use pgraft::SnapshotPolicy;
use pgraft::State;
use fixtures::RaftRouter;

/// Single-voter cluster commit test.
///
/// What does this test do?
///
/// - brings one single-voter node online; it commits on local append alone.
/// - a client write commits and applies immediately, and a barrier resolves behind it.
/// - once enough entries accrue past the snapshot threshold, a snapshot is taken at the
///   applied index.
///
/// RUST_LOG=pgraft,memstore,single_voter_commit=trace cargo test -p pgraft --test single_voter_commit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_voter_commit() -> Result<()> {
    fixtures::init_tracing();

    let snapshot_threshold: u64 = 10;
    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(snapshot_threshold))
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    let mut want = 0;

    router.wait_for_log(&btreeset![0], want, None, "empty").await?;
    router.wait_for_state(&btreeset![0], State::NonVoter, None, "empty").await?;

    tracing::info!("--- initializing single node cluster");

    router.initialize_from_single_node(0).await?;
    want += 1;

    router.wait_for_log(&btreeset![0], want, None, "init").await?;
    router.wait_for_state(&btreeset![0], State::Leader, None, "init").await?;

    tracing::info!("--- write one command, expect it to commit and apply immediately");

    let node = router.get_raft_handle(&0).await?;
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c1".into(),
            serial: 0,
            status: "x".into(),
        }))
        .await
        .expect("write on a single voter must succeed");
    want += 1;
    assert_eq!(res.index, want, "expected the command at index {}", want);

    router.wait_for_log(&btreeset![0], want, None, "one command").await?;
    let metrics = router.latest_metrics().await.into_iter().next().expect("node 0 metrics");
    assert_eq!(metrics.last_applied, want);

    tracing::info!("--- a barrier resolves once everything before it is applied");

    let barrier_index = node.barrier().await.expect("barrier on a single voter must succeed");
    want += 1;
    assert_eq!(barrier_index, want);
    router.wait_for_log(&btreeset![0], want, None, "barrier").await?;

    tracing::info!("--- write past the snapshot threshold, expect a snapshot at last_applied");

    let remaining = snapshot_threshold - want;
    router.client_request_many(0, "c2", remaining as usize).await;
    want = snapshot_threshold;

    router.wait_for_log(&btreeset![0], want, None, "past threshold").await?;
    router
        .wait_for_snapshot(
            &btreeset![0],
            LogId { term: 1, index: want },
            Some(Duration::from_millis(1000)),
            "snapshot at threshold",
        )
        .await?;

    let sto = router.get_storage_handle(&0).await?;
    let snap = sto.get_current_snapshot().await?.expect("expected a snapshot to exist");
    assert_eq!(snap.meta.last_log_id, LogId { term: 1, index: want });
    let members: BTreeSet<_> = snap.meta.membership.all_nodes();
    assert_eq!(members, btreeset![0]);

    Ok(())
}
