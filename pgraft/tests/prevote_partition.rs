mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pgraft::Config;
use pgraft::State;
use fixtures::RaftRouter;

/// Pre-vote partition test.
///
/// What does this test do?
///
/// - brings a four-voter cluster online with node 0 as leader, then partitions node 3 away.
/// - node 3's election timer fires repeatedly while it is cut off, but every campaign stays in
///   the pre-vote phase: its own term never climbs and the healthy majority never observes a
///   disturbed term.
/// - when the partition heals, node 3 rejoins as a follower without deposing the leader.
///
/// RUST_LOG=pgraft,memstore,prevote_partition=trace cargo test -p pgraft --test prevote_partition
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn prevote_partition() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let want = router.new_cluster(btreeset![0, 1, 2, 3], btreeset![]).await?;
    let stable_term = router.latest_metrics().await.into_iter().next().map(|m| m.current_term).unwrap_or(1);

    tracing::info!("--- partitioning node 3 away from the cluster");

    router.isolate_node(3).await;

    // Give node 3 several election timeouts worth of time to campaign into the void.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    tracing::info!("--- the healthy majority is undisturbed");

    for metrics in router.latest_metrics().await {
        if metrics.id == 3 {
            assert_eq!(
                metrics.current_term, stable_term,
                "node 3's term must not climb during pre-vote campaigns"
            );
            assert_eq!(metrics.state, State::Candidate, "node 3 should be campaigning");
        } else {
            assert_eq!(
                metrics.current_term, stable_term,
                "node {} observed a disturbed term",
                metrics.id
            );
            assert_eq!(metrics.current_leader, Some(0), "node {} lost its leader", metrics.id);
        }
    }
    assert_eq!(router.leader().await, Some(0), "leadership must not move");

    tracing::info!("--- healing the partition, node 3 rejoins as follower");

    router.restore_node(3).await;
    router
        .wait_for_metrics(
            &3,
            |m| m.state == State::Follower && m.current_leader == Some(0),
            Some(Duration::from_millis(3000)),
            "node 3 rejoined",
        )
        .await?;

    router.wait_for_log(&btreeset![0, 1, 2, 3], want, Some(Duration::from_millis(3000)), "healed").await?;
    router.assert_stable_cluster(Some(stable_term), Some(want)).await;

    Ok(())
}
