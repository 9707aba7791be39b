mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pgraft::membership::ServerRole;
use pgraft::Config;
use pgraft::State;
use fixtures::RaftRouter;

/// Role assignment test.
///
/// What does this test do?
///
/// - brings a two-voter cluster online plus one standby.
/// - promotes the standby to voter; the promotion is proposed once the target has caught up
///   with the leader's log, and the target transitions from passive replication to follower.
/// - demotes it back to standby; it leaves the voting set again.
///
/// RUST_LOG=pgraft,memstore,assign_role_promotion=trace cargo test -p pgraft --test assign_role_promotion
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn assign_role_promotion() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_cluster(btreeset![0, 1], btreeset![2]).await?;

    tracing::info!("--- write some history so a fresh promotee has to catch up");

    router.client_request_many(0, "c1", 10).await;
    want += 10;
    router.wait_for_log(&btreeset![0, 1], want, Some(Duration::from_millis(2000)), "history").await?;

    tracing::info!("--- promote the standby to voter");

    router.assign_role(0, 2, ServerRole::Voter).await?;
    want += 1;

    router
        .wait_for_metrics(
            &0,
            |m| m.membership_config.server(&2).map(|s| s.role == ServerRole::Voter).unwrap_or(false),
            Some(Duration::from_millis(3000)),
            "node 2 promoted",
        )
        .await?;
    router
        .wait_for_metrics(
            &2,
            |m| m.state == State::Follower,
            Some(Duration::from_millis(3000)),
            "node 2 votes as a follower",
        )
        .await?;
    router.wait_for_log(&btreeset![0, 1, 2], want, Some(Duration::from_millis(3000)), "promotion applied").await?;

    tracing::info!("--- a no-op assignment is refused");

    let res = router.assign_role(0, 2, ServerRole::Voter).await;
    assert!(res.is_err(), "assigning the current role must be a no-op error");

    tracing::info!("--- demote the voter back to standby");

    router.assign_role(0, 2, ServerRole::Standby).await?;
    want += 1;

    router
        .wait_for_metrics(
            &2,
            |m| m.state == State::NonVoter && !m.removed,
            Some(Duration::from_millis(3000)),
            "node 2 back to passive replication",
        )
        .await?;
    router.wait_for_log(&btreeset![0, 1, 2], want, Some(Duration::from_millis(3000)), "demotion applied").await?;

    Ok(())
}
