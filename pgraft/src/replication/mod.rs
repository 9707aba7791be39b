//! Replication stream.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::log::RaftLog;
use crate::pgrep::PgrepHooks;
use crate::pgrep::PgrepScope;
use crate::progress::Progress;
use crate::progress::ProgressState;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft::RaftNetwork;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftStorage;

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        pgrep: bool,
        config: Arc<Config>,
        log: Arc<RwLock<RaftLog<D>>>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        replication_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            pgrep,
            config,
            log,
            last_log,
            commit_index,
            network,
            storage,
            replication_tx,
        )
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could result in
/// out-of-order delivery. We always buffer until we receive a success response, then send the
/// next payload from the buffer.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,
    /// Whether this target's catch-up traffic is fenced by the pgrep permits.
    ///
    /// Set for standbys and promotees; their payloads carry the pgrep flag and every dispatch
    /// first asks the storage hooks for a replication permit.
    pgrep: bool,

    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,

    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent<D>, Span)>,

    /// The `RaftNetwork` interface.
    network: Arc<N>,

    /// The `RaftStorage` interface.
    storage: Arc<S>,

    /// The in-memory log window shared with the Raft core.
    log: Arc<RwLock<RaftLog<D>>>,

    /// The Raft's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The replication progress of the target.
    progress: Progress,
    /// Whether this stream has been asked to shut down.
    terminated: bool,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,

    /// A buffer of entries to replicate, hot off the Raft core's append path.
    ///
    /// Payloads are filled from this buffer first; when the buffer does not line up with
    /// `next_index` the payload is acquired from the shared log window instead.
    replication_buffer: Vec<Arc<Entry<D>>>,
    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,

    /// The timeout duration for heartbeats.
    heartbeat_timeout: Duration,

    /// The timeout for sending snapshot segment.
    install_snapshot_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        pgrep: bool,
        config: Arc<Config>,
        log: Arc<RwLock<RaftLog<D>>>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);

        let max_payload_entries = config.max_payload_entries as usize;
        let mut progress = Progress::new(last_log);
        progress.pgreplicating = pgrep;
        let this = Self {
            id,
            target,
            term,
            pgrep,
            network,
            storage,
            log,
            config,
            max_payload_entries,
            marker_r: std::marker::PhantomData,
            progress,
            terminated: false,
            last_log_index: last_log.index,
            commit_index,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
            replication_buffer: Vec::new(),
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial probe to establish the match point.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            if self.terminated {
                return;
            }
            match self.progress.state {
                ProgressState::Probe => self.probe_loop().await,
                ProgressState::Pipeline => self.pipeline_loop().await,
                ProgressState::Snapshot => SnapshottingState::new(&mut self).run().await,
            }
        }
    }

    /// Dispatch one AppendEntries payload to the target, if the progress allows one now.
    ///
    /// This request will timeout if no response is received within the
    /// configured heartbeat interval.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        let now = Instant::now();
        if !self.progress.should_replicate(
            now,
            self.heartbeat_timeout,
            self.install_snapshot_timeout,
            self.config.inflight_log_threshold,
            self.last_log_index,
        ) {
            return;
        }

        // Assemble the payload. While installing a snapshot only empty heartbeats flow, keyed
        // off the matched position; otherwise the payload starts at `next_index`.
        let (prev_log_id, entries, acquired) = if self.progress.state == ProgressState::Snapshot {
            (self.progress.matched, Vec::new(), None)
        } else {
            let next = self.progress.next_index;
            let prev_index = next - 1;
            let mut log = self.log.write().await;

            let prev_term = match log.term_of(prev_index) {
                Some(term) => term,
                None => {
                    if log.is_compacted(prev_index) || prev_index <= log.snapshot_last_log_id().index {
                        // The entries this follower needs are gone from the window.
                        self.progress.become_snapshot(log.snapshot_last_log_id().index);
                        return;
                    }
                    tracing::error!(prev_index, "next_index is ahead of the leader's own log");
                    let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                    self.terminated = true;
                    return;
                }
            };
            let prev_log_id = LogId::new(prev_term, prev_index);

            // Serve from the hot buffer when it lines up with next_index, else acquire the
            // range from the shared window.
            self.replication_buffer.retain(|e| e.log_id.index >= next);
            let buffered = self.replication_buffer.first().map(|e| e.log_id.index);
            if self.progress.state == ProgressState::Pipeline && buffered == Some(next) {
                let chunk = self.replication_buffer.len().min(self.max_payload_entries);
                let entries: Vec<_> = self.replication_buffer.drain(..chunk).collect();
                (prev_log_id, entries, None)
            } else if next > log.last_index() {
                (prev_log_id, Vec::new(), None)
            } else {
                let to = log.last_index().min(next + self.max_payload_entries as u64 - 1);
                match log.acquire(next..=to) {
                    Ok(entries) => (prev_log_id, entries, Some(next..=to)),
                    Err(err) => {
                        tracing::debug!(error=%err, "log window can not serve the payload, switching to snapshot");
                        self.progress.become_snapshot(log.snapshot_last_log_id().index);
                        return;
                    }
                }
            }
        };

        let last_sent = entries.last().map(|e| e.log_id);
        let sent_commit = self.commit_index;
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            leader_commit: sent_commit,
            entries: entries.iter().map(|entry| entry.as_ref().clone()).collect(),
            pgrep: self.pgrep,
        };

        // Catch-up traffic to a fenced target needs a permit from the external process first.
        // Denial drops to probe mode so retries happen once per heartbeat instead of spinning.
        if self.pgrep && !payload.entries.is_empty() {
            if !self.storage.pgrep_permit(PgrepScope::Replicate).await {
                tracing::debug!(target = self.target, "pgrep permit denied, deferring catch-up payload");
                if let Some(range) = acquired {
                    self.log.write().await.release(range);
                }
                if self.progress.state == ProgressState::Pipeline {
                    self.progress.become_probe();
                }
                self.progress.mark_sent(now);
                return;
            }
        }

        self.progress.mark_sent(now);
        if self.progress.state == ProgressState::Pipeline {
            if let Some(log_id) = last_sent {
                self.progress.optimistic_next(log_id.index + 1);
            }
        }

        tracing::debug!("start sending append_entries, timeout: {:?}", self.heartbeat_timeout);
        let res = timeout(
            self.heartbeat_timeout,
            self.network.send_append_entries(self.target, payload),
        )
        .await;

        if self.pgrep {
            self.storage.pgrep_unpermit(PgrepScope::Replicate).await;
        }
        if let Some(range) = acquired {
            self.log.write().await.release(range);
        }

        let res = match res {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    self.handle_dispatch_failure();
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                self.handle_dispatch_failure();
                return;
            }
        };

        // Replication was not successful, if a newer term has been returned, revert to follower.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.terminated = true;
            return;
        }

        // The follower rejected the log-matching check; rewind per the progress rules.
        if let Some(conflict) = res.conflict {
            tracing::debug!(?conflict, res.term, "append entries failed, handling conflict");
            self.progress.recent_recv = true;
            self.progress.maybe_decrement(conflict.rejected, res.last_log_index);
            return;
        }

        // Success path. The event is sent even when the match did not advance: the core uses
        // the acknowledged `leader_commit` to decide when a removed follower has learned of
        // its own removal and its stream can be dropped.
        let matched = last_sent.unwrap_or(prev_log_id);
        tracing::debug!("append entries succeeded to {:?}", matched);
        self.progress.maybe_update(matched);
        let _ = self.raft_core_tx.send((
            ReplicaEvent::UpdateMatchIndex {
                target: self.target,
                matched: self.progress.matched,
                acked_commit: sent_commit,
            },
            tracing::debug_span!("CH"),
        ));
        if self.progress.state == ProgressState::Probe {
            self.progress.become_pipeline();
        }
    }

    /// A dispatch error or timeout: probe conservatively until the target answers again.
    fn handle_dispatch_failure(&mut self) {
        self.progress.recent_recv = false;
        if self.progress.state == ProgressState::Pipeline {
            self.progress.become_probe();
        }
    }

    /// Perform a check to see if this replication stream is lagging behind far enough that a
    /// snapshot is warranted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn needs_snapshot(&self) -> bool {
        match &self.config.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => {
                let needs_snap =
                    self.commit_index.checked_sub(self.progress.matched.index).map(|diff| diff >= *threshold).unwrap_or(false);
                if needs_snap {
                    tracing::trace!("snapshot needed");
                    true
                } else {
                    tracing::trace!("snapshot not needed");
                    false
                }
            }
        }
    }

    /// Fully drain the channel coming in from the Raft node.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent<D>, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            // Unpack the event opt, else return if we don't have one to process.
            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            let _ent = span.enter();

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }

                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.progress.state == ProgressState::Pipeline {
                        self.replication_buffer.push(entry);
                    }
                }

                RaftEvent::Terminate => {
                    self.terminated = true;
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "probe"))]
    pub async fn probe_loop(&mut self) {
        loop {
            if self.terminated || self.progress.state != ProgressState::Probe {
                return;
            }
            if self.needs_snapshot() {
                let boundary = self.log.read().await.snapshot_last_log_id().index;
                self.progress.become_snapshot(boundary);
                return;
            }

            let span = tracing::debug_span!("CHrx:Probe");
            let _en = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.terminated = true,
                    }
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "pipeline"))]
    pub async fn pipeline_loop(&mut self) {
        loop {
            if self.terminated || self.progress.state != ProgressState::Pipeline {
                return;
            }
            if self.needs_snapshot() {
                let boundary = self.log.read().await.snapshot_last_log_id().index;
                self.progress.become_snapshot(boundary);
                return;
            }

            // Stream eagerly while the target is behind and the inflight window is open;
            // entries come from the hot buffer when it lines up and are frontloaded from the
            // shared window after a gap. A closed window falls through to the select below,
            // where the heartbeat paces the retries.
            if self.progress.next_index <= self.last_log_index
                && self.progress.inflight() < self.config.inflight_log_threshold
            {
                self.send_append_entries().await;

                // Check raft channel to ensure we are staying up-to-date, then loop.
                if let Some(Some((event, span))) = self.repl_rx.recv().now_or_never() {
                    self.drain_raft_rx(event, span);
                }
                continue;
            }

            let span = tracing::debug_span!("CHrx:Pipeline");
            let _en = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.terminated = true,
                    }
                }
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An event from the Raft node.
pub(crate) enum RaftEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the log, so its
        /// index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The id of the most recent log known to have been successfully replicated on the target.
        matched: LogId,
        /// The `leader_commit` carried by the request the target acknowledged.
        acked_commit: u64,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// An event from a replication stream requesting snapshot info.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex {
                ref target,
                ref matched,
                ref acked_commit,
            } => {
                format!(
                    "UpdateMatchIndex: target: {}, matched: {}, acked_commit: {}",
                    target, matched, acked_commit
                )
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { ref target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Snapshotting specific state.
struct SnapshottingState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// An exclusive handle to the replication core.
    replication_core: &'a mut ReplicationCore<D, R, N, S>,
    snapshot: Option<Snapshot<S::SnapshotData>>,
    snapshot_fetch_rx: Option<oneshot::Receiver<Snapshot<S::SnapshotData>>>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> SnapshottingState<'a, D, R, N, S> {
    /// Create a new instance.
    pub fn new(replication_core: &'a mut ReplicationCore<D, R, N, S>) -> Self {
        Self {
            replication_core,
            snapshot: None,
            snapshot_fetch_rx: None,
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    pub async fn run(mut self) {
        self.replication_core.replication_buffer.clear();

        loop {
            if self.replication_core.terminated
                || self.replication_core.progress.state != ProgressState::Snapshot
            {
                return;
            }

            // If we don't have any of the components we need, fetch the current snapshot.
            if self.snapshot.is_none() && self.snapshot_fetch_rx.is_none() {
                let (tx, rx) = oneshot::channel();
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::NeedsSnapshot {
                        target: self.replication_core.target,
                        tx,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.snapshot_fetch_rx = Some(rx);
            }

            // If we are waiting for a snapshot response from the storage layer, then wait for
            // it and send heartbeats in the meantime.
            if let Some(snapshot_fetch_rx) = self.snapshot_fetch_rx.take() {
                self.wait_for_snapshot(snapshot_fetch_rx).await;
                continue;
            }

            // If we have a snapshot to work with, then stream it.
            if let Some(snapshot) = self.snapshot.take() {
                if let Err(err) = self.stream_snapshot(snapshot).await {
                    tracing::warn!(error=%err, "error streaming snapshot to target");
                    self.replication_core.progress.abort_snapshot();
                }
                continue;
            }
        }
    }

    /// Wait for a response from the storage layer for the current snapshot.
    ///
    /// If an error comes up during processing, this routine should simple be called again after
    /// issuing a new request to the storage layer.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot<S::SnapshotData>>) {
        loop {
            let span = tracing::debug_span!("CHrx:wait_for_snapshot");
            let _ent = span.enter();

            tokio::select! {
                _ = self.replication_core.heartbeat.tick() => self.replication_core.send_append_entries().await,

                event_span = self.replication_core.repl_rx.recv() =>  {
                    match event_span {
                        Some((event, span)) => self.replication_core.drain_raft_rx(event, span),
                        None => {
                            self.replication_core.terminated = true;
                            return;
                        }
                    }
                },

                res = &mut rx => {
                    match res {
                        Ok(snapshot) => {
                            // Track the boundary of the snapshot actually being installed.
                            self.replication_core.progress.become_snapshot(snapshot.meta.last_log_id.index);
                            self.snapshot = Some(snapshot);
                            return;
                        }
                        Err(_) => return, // Channels may close for various acceptable reasons.
                    }
                },
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<S::SnapshotData>) -> anyhow::Result<()> {
        let end = snapshot.snapshot.seek(SeekFrom::End(0)).await?;

        let mut offset = 0;
        let mut buf = Vec::with_capacity(self.replication_core.config.snapshot_max_chunk_size as usize);

        loop {
            // Build the RPC.
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let n_read = snapshot.snapshot.read_buf(&mut buf).await?;

            let done = (offset + n_read as u64) == end; // If bytes read == 0, then we're done.
            let req = InstallSnapshotRequest {
                term: self.replication_core.term,
                leader_id: self.replication_core.id,
                meta: snapshot.meta.clone(),
                offset,
                data: Vec::from(&buf[..n_read]),
                done,
            };
            buf.clear();

            // Send the RPC over to the target.
            tracing::debug!(
                snapshot_size = req.data.len(),
                req.offset,
                end,
                req.done,
                "sending snapshot chunk"
            );

            self.replication_core.progress.mark_snapshot_sent(Instant::now());

            let res = timeout(
                self.replication_core.install_snapshot_timeout,
                self.replication_core.network.send_install_snapshot(self.replication_core.target, req),
            )
            .await;

            let res = match res {
                Ok(outer_res) => match outer_res {
                    Ok(res) => res,
                    Err(err) => {
                        tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                        self.replication_core.progress.abort_snapshot();
                        return Ok(());
                    }
                },
                Err(err) => {
                    // The install timed out; fall back to probing per the progress rules.
                    tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                    self.replication_core.progress.abort_snapshot();
                    return Ok(());
                }
            };

            // Handle response conditions.
            if res.term > self.replication_core.term {
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::RevertToFollower {
                        target: self.replication_core.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.replication_core.terminated = true;
                return Ok(());
            }

            // If we just sent the final chunk of the snapshot, then probe from its boundary.
            if done {
                let boundary = snapshot.meta.last_log_id;
                if self.replication_core.progress.maybe_update(boundary) {
                    let _ = self.replication_core.raft_core_tx.send((
                        ReplicaEvent::UpdateMatchIndex {
                            target: self.replication_core.target,
                            matched: boundary,
                            acked_commit: boundary.index,
                        },
                        tracing::debug_span!("CH"),
                    ));
                }
                self.replication_core.progress.become_probe();
                return Ok(());
            }

            // Everything is good, so update offset for sending the next chunk.
            offset += n_read as u64;

            // Check raft channel to ensure we are staying up-to-date, then loop.
            if let Some(Some((event, span))) = self.replication_core.repl_rx.recv().now_or_never() {
                self.replication_core.drain_raft_rx(event, span);
            }
        }
    }
}
