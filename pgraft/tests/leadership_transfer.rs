mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pgraft::Config;
use pgraft::State;
use fixtures::RaftRouter;

/// Leadership transfer test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online with node 0 as leader.
/// - transfers leadership to node 2; once node 2's log has caught up, the leader sends it a
///   TimeoutNow frame and node 2 campaigns immediately, deposing node 0.
///
/// RUST_LOG=pgraft,memstore,leadership_transfer=trace cargo test -p pgraft --test leadership_transfer
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leadership_transfer() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let want = router.new_cluster(btreeset![0, 1, 2], btreeset![]).await?;

    tracing::info!("--- transfer leadership to node 2");

    router.transfer_leadership(0, Some(2)).await?;

    tracing::info!("--- wait for node 2 to take over");

    router
        .wait_for_metrics(
            &2,
            |m| m.state == State::Leader,
            Some(Duration::from_millis(3000)),
            "node 2 becomes leader",
        )
        .await?;
    router
        .wait_for_metrics(
            &0,
            |m| m.state == State::Follower && m.current_leader == Some(2),
            Some(Duration::from_millis(3000)),
            "node 0 steps down behind node 2",
        )
        .await?;

    tracing::info!("--- the new leader accepts writes");

    router.client_request_many(2, "c1", 2).await;
    router.wait_for_log(&btreeset![0, 1, 2], want + 3, Some(Duration::from_millis(3000)), "writes after transfer").await?;

    Ok(())
}
