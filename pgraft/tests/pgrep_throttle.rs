mod fixtures;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pgraft::Config;
use pgraft::RaftStorageDebug;
use fixtures::RaftRouter;

/// Pgrep throttle test.
///
/// What does this test do?
///
/// - brings up a single-voter leader plus one standby, with pgrep permits denied on the
///   leader's storage: catch-up payloads to the standby are withheld while heartbeats and
///   quorum commit keep flowing.
/// - once permits are granted again, the standby catches up.
///
/// RUST_LOG=pgraft,memstore,pgrep_throttle=trace cargo test -p pgraft --test pgrep_throttle
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn pgrep_throttle() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    router.initialize_from_single_node(0).await?;
    let mut want = 1;
    router.wait_for_log(&btreeset![0], want, None, "init").await?;

    let leader_sto = router.get_storage_handle(&0).await?;

    tracing::info!("--- deny pgrep permits, then add a standby");

    leader_sto.set_pgrep_deny(true);
    router.new_raft_node(1).await;
    router.add_server(0, 1).await?;
    want += 1;

    tracing::info!("--- writes commit on the voter quorum while the standby is fenced");

    router.client_request_many(0, "c1", 5).await;
    want += 5;
    router.wait_for_log(&btreeset![0], want, Some(Duration::from_millis(2000)), "committed on leader").await?;

    // Catch-up payloads were asked for and withheld; the standby's state machine stays empty.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = leader_sto.pgrep_stats();
    assert!(
        stats.replicate_permits.load(Ordering::SeqCst) > 0,
        "the stream should have asked for replication permits"
    );
    let standby_sto = router.get_storage_handle(&1).await?;
    let sm = standby_sto.get_state_machine().await;
    assert_eq!(sm.last_applied_log.index, 0, "the fenced standby must not have applied anything");

    tracing::info!("--- grant permits, the standby catches up");

    leader_sto.set_pgrep_deny(false);
    router
        .wait_for_metrics(
            &1,
            |m| m.last_applied == want,
            Some(Duration::from_millis(3000)),
            "standby caught up",
        )
        .await?;

    let sm = standby_sto.get_state_machine().await;
    assert_eq!(sm.applied_commands.len(), 5, "the standby applied the fenced commands");

    Ok(())
}
