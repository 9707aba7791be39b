mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use pgraft::raft::ClientWriteRequest;
use pgraft::Config;
use pgraft::RaftStorageDebug;
use fixtures::RaftRouter;

/// Three-voter replication test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online with node 0 as leader.
/// - writes three commands through the leader.
/// - asserts that every node stored and applied all three, that each state machine saw them in
///   submission order, and that the leader observed every follower matching its head.
///
/// RUST_LOG=pgraft,memstore,three_voter_replication=trace cargo test -p pgraft --test three_voter_replication
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_voter_replication() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_cluster(btreeset![0, 1, 2], btreeset![]).await?;

    tracing::info!("--- write three commands through the leader");

    let node = router.get_raft_handle(&0).await?;
    for status in &["a", "b", "c"] {
        node.client_write(ClientWriteRequest::new(ClientRequest {
            client: "c1".into(),
            serial: want,
            status: (*status).into(),
        }))
        .await
        .expect("write through the leader must succeed");
        want += 1;
    }

    tracing::info!("--- wait for all nodes to store and apply all three");

    router
        .wait_for_log(&btreeset![0, 1, 2], want, Some(Duration::from_millis(2000)), "replicated")
        .await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    tracing::info!("--- every state machine applied the commands in submission order");

    for id in 0..3 {
        let sto = router.get_storage_handle(&id).await?;
        let sm = sto.get_state_machine().await;
        let statuses: Vec<_> = sm.applied_commands.iter().map(|req| req.status.as_str()).collect();
        assert_eq!(statuses, vec!["a", "b", "c"], "node {} applied out of order", id);
        assert_eq!(sm.last_applied_log.index, want, "node {} applied index", id);
    }

    tracing::info!("--- the leader observed every follower matching its head");

    let leader_metrics = router
        .wait_for_metrics(
            &0,
            |m| {
                m.leader_metrics
                    .as_ref()
                    .map(|lm| lm.replication.values().all(|repl| repl.matched.index == want))
                    .unwrap_or(false)
            },
            Some(Duration::from_millis(2000)),
            "followers matched",
        )
        .await?;
    let lm = leader_metrics.leader_metrics.expect("leader metrics present");
    assert_eq!(lm.replication.len(), 2);

    Ok(())
}
