mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::MemStore;
use pgraft::Config;
use pgraft::RaftStorageDebug;
use fixtures::RaftRouter;

/// Pgrep boundary resync test.
///
/// What does this test do?
///
/// - brings up a single-voter leader and writes a handful of commands.
/// - adds a standby whose storage confirms pgrep boundary offers, emulating an external
///   catch-up process which has delivered the state machine out-of-band.
/// - the standby adopts the leader's `prev_log_id` as its snapshot boundary instead of
///   replicating the history, and only entries after the boundary reach its state machine.
///
/// RUST_LOG=pgraft,memstore,pgrep_boundary_resync=trace cargo test -p pgraft --test pgrep_boundary_resync
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn pgrep_boundary_resync() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    router.initialize_from_single_node(0).await?;
    let mut want = 1;
    router.wait_for_log(&btreeset![0], want, None, "init").await?;

    tracing::info!("--- write some history before the standby joins");

    router.client_request_many(0, "c1", 5).await;
    want += 5;
    router.wait_for_log(&btreeset![0], want, None, "history").await?;

    tracing::info!("--- add a standby which confirms pgrep boundary offers");

    let standby_sto = Arc::new(MemStore::new(1));
    standby_sto.set_pgrep_boundary_confirm(true);
    router.new_raft_node_with_sto(1, standby_sto.clone()).await;
    router.add_server(0, 1).await?;
    want += 1;

    tracing::info!("--- the standby fast-forwards to the leader's boundary");

    router
        .wait_for_metrics(
            &1,
            |m| m.last_applied >= want,
            Some(Duration::from_millis(3000)),
            "standby at the boundary",
        )
        .await?;

    let boundary = standby_sto
        .pgrep_stats()
        .boundary
        .lock()
        .ok()
        .and_then(|b| *b)
        .expect("a boundary resync should have been recorded");
    assert!(boundary.index >= want - 1, "the boundary should cover the history: {:?}", boundary);

    // The history never reached the standby's state machine; the external process is presumed
    // to have delivered it.
    let sm = standby_sto.get_state_machine().await;
    assert!(
        sm.applied_commands.is_empty(),
        "the resynced standby must not re-apply history: {:?}",
        sm.applied_commands
    );

    tracing::info!("--- entries after the boundary replicate normally");

    router.client_request_many(0, "c2", 2).await;
    want += 2;
    router
        .wait_for_metrics(&1, |m| m.last_applied >= want, Some(Duration::from_millis(3000)), "standby caught up")
        .await?;
    let sm = standby_sto.get_state_machine().await;
    assert_eq!(sm.applied_commands.len(), 2, "only post-boundary commands reach the state machine");

    tracing::info!("--- the standby's snapshot boundary moved to the resynced position");

    let metrics = router.latest_metrics().await.into_iter().find(|m| m.id == 1).expect("node 1 metrics");
    assert_eq!(metrics.snapshot, boundary);

    Ok(())
}
