use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use pgraft::{Config, RaftStorageDebug, State};
use fixtures::RaftRouter;

mod fixtures;

/// Cluster total_order_apply test.
///
/// What does this test do?
///
/// - brings 2 nodes online: one leader and one standby.
/// - writes a stream of logs to the leader.
/// - asserts that the standby's state machine applied-log position never goes backwards while
///   the stream is replicated.
///
/// RUST_LOG=pgraft,memstore,total_order_apply=trace cargo test -p pgraft --test total_order_apply
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn total_order_apply() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;

    tracing::info!("--- initializing single node cluster");

    router.initialize_with(0, btreeset![0]).await?;
    router
        .wait_for_metrics(&0u64, |x| x.state == State::Leader, Some(Duration::from_millis(1000)), "n0.state -> Leader")
        .await?;

    tracing::info!("--- add one standby");
    router.new_raft_node(1).await;
    router.add_server(0, 1).await?;

    let (tx, rx) = tokio::sync::watch::channel(false);

    let sto = router.get_storage_handle(&1).await?;

    let mut prev = 0;
    let h = tokio::spawn(async move {
        loop {
            if *rx.borrow() {
                break;
            }

            let last;
            {
                let sm = sto.get_state_machine().await;
                last = sm.last_applied_log.index;
            }

            if last < prev {
                panic!("out of order apply");
            }
            prev = last;

            tokio::task::yield_now().await;
        }
    });

    let n = 10_000;
    router.client_request_many(0, "foo", n).await;

    // Two config entries precede the client stream.
    let want = n as u64 + 2;
    router
        .wait_for_metrics(
            &1u64,
            |x| x.last_applied >= want,
            Some(Duration::from_millis(10_000)),
            &format!("n{}.last_applied -> {}", 1, want),
        )
        .await?;

    tx.send(true)?;
    h.await?;

    Ok(())
}
