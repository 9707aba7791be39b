mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use pgraft::error::ClientWriteError;
use pgraft::raft::ClientWriteRequest;
use pgraft::Config;
use pgraft::State;
use fixtures::RaftRouter;

/// Leader step-down on self-removal test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online with node 0 as leader.
/// - the leader removes itself from the configuration.
/// - once the config entry commits, node 0 observes its own removal and steps down; further
///   client writes against it are refused with a forward-to-leader error, and the survivors
///   elect a new leader among themselves.
///
/// RUST_LOG=pgraft,memstore,leader_stepdown_on_removal=trace cargo test -p pgraft --test leader_stepdown_on_removal
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_stepdown_on_removal() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset![0, 1, 2], btreeset![]).await?;

    tracing::info!("--- leader removes itself from the configuration");

    router.remove_server(0, 0).await?;

    tracing::info!("--- wait for node 0 to observe its own removal and step down");

    let metrics = router
        .wait_for_metrics(
            &0,
            |m| m.removed,
            Some(Duration::from_millis(3000)),
            "node 0 removed flag",
        )
        .await?;
    assert_eq!(metrics.state, State::NonVoter);

    tracing::info!("--- client writes against the removed node are refused");

    let node = router.get_raft_handle(&0).await?;
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c1".into(),
            serial: 0,
            status: "x".into(),
        }))
        .await;
    match res {
        Err(ClientWriteError::ForwardToLeader(..)) => {}
        other => panic!("expected ForwardToLeader from a removed node, got {:?}", other),
    }

    tracing::info!("--- the survivors elect a new leader among themselves");

    router
        .wait_for_metrics(
            &1,
            |m| matches!(m.current_leader, Some(id) if id == 1 || id == 2),
            Some(Duration::from_millis(5000)),
            "survivors elected a new leader",
        )
        .await?;

    Ok(())
}
