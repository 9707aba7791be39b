mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pgraft::Config;
use pgraft::LogId;
use pgraft::RaftStorage;
use pgraft::RaftStorageDebug;
use pgraft::SnapshotPolicy;
use fixtures::RaftRouter;

/// Snapshot installation test.
///
/// What does this test do?
///
/// - brings up a single-voter leader with a small snapshot threshold and no trailing window,
///   and writes past the threshold so the log prefix is compacted away.
/// - adds a new server; the entries it needs are gone from the log, so the leader streams its
///   snapshot over and the newcomer adopts the snapshot boundary, then replicates the tail.
/// - asserts the installed snapshot matches the leader's, and both state machines converge.
///
/// RUST_LOG=pgraft,memstore,snapshot_install=trace cargo test -p pgraft --test snapshot_install
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn snapshot_install() -> Result<()> {
    fixtures::init_tracing();

    let snapshot_threshold: u64 = 10;
    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(snapshot_threshold))
            .snapshot_trailing(0)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    router.initialize_from_single_node(0).await?;
    let mut want = 1;
    router.wait_for_log(&btreeset![0], want, None, "init").await?;

    tracing::info!("--- write past the snapshot threshold");

    router.client_request_many(0, "c1", 13).await;
    want += 13;
    router
        .wait_for_snapshot(
            &btreeset![0],
            LogId { term: 1, index: snapshot_threshold },
            Some(Duration::from_millis(2000)),
            "leader snapshot",
        )
        .await?;

    tracing::info!("--- add a new server whose needed entries are compacted away");

    router.new_raft_node(1).await;
    router.add_server(0, 1).await?;
    want += 1;

    router
        .wait_for_metrics(
            &1,
            |m| m.last_applied == want,
            Some(Duration::from_millis(5000)),
            "newcomer caught up through the snapshot",
        )
        .await?;

    tracing::info!("--- the installed snapshot matches the leader's");

    let leader_sto = router.get_storage_handle(&0).await?;
    let follower_sto = router.get_storage_handle(&1).await?;

    let leader_snap = leader_sto.get_current_snapshot().await?.expect("leader snapshot");
    let follower_snap = follower_sto.get_current_snapshot().await?.expect("installed snapshot");
    assert_eq!(follower_snap.meta.last_log_id, leader_snap.meta.last_log_id);
    assert_eq!(follower_snap.meta.membership, leader_snap.meta.membership);

    let metrics = router.latest_metrics().await.into_iter().find(|m| m.id == 1).expect("node 1 metrics");
    assert_eq!(metrics.snapshot, leader_snap.meta.last_log_id);

    tracing::info!("--- both state machines converge");

    let leader_sm = leader_sto.get_state_machine().await;
    let follower_sm = follower_sto.get_state_machine().await;
    assert_eq!(follower_sm.last_applied_log.index, want);
    assert_eq!(follower_sm.client_status, leader_sm.client_status);

    Ok(())
}
