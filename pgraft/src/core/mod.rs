//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::client::ClientRequestEntry;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::RaftLog;
use crate::membership::EffectiveMembership;
use crate::membership::Group;
use crate::membership::ServerRole;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::pgrep::PgrepHooks;
use crate::pgrep::PgrepScope;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::EntryPayload;
use crate::raft::RaftMsg;
use crate::raft::RaftNetwork;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftStorage;
use crate::Update;

/// The core type implementing the Raft protocol.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's effective membership configuration.
    ///
    /// Effective means the most recent config entry seen in the log, committed or not; a
    /// conflicting leader may truncate an uncommitted one away, rolling this back to
    /// `committed_membership`.
    membership: EffectiveMembership,
    /// The most recent membership configuration known to be committed.
    committed_membership: EffectiveMembership,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,
    /// The in-memory log window, shared with this node's replication streams while it leads.
    log: Arc<RwLock<RaftLog<D>>>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// The definition of a committed log is that the leader which has created the log has
    /// successfully replicated the log to a majority of the cluster. This value is updated via
    /// AppendEntries RPC from the leader, or if a node is the leader, it will update this value
    /// as new entries have been successfully replicated to a majority of the cluster.
    ///
    /// Is initialized to 0, and increases monotonically. This is always based on the leader's
    /// commit index which is communicated to other members via the AppendEntries protocol.
    commit_index: u64,

    /// The log id of the highest log entry which has been applied to the local state machine.
    last_applied: LogId,
    /// The index of the highest log entry submitted to the state machine, applied or not.
    ///
    /// `last_applied.index <= last_applying <= commit_index` always holds; the two applied
    /// markers are equal whenever no apply chunk is in flight.
    last_applying: u64,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is normally based on
    /// the leader's term which is communicated to other members via the AppendEntries protocol,
    /// but this may also be incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The last entry to be appended to the log.
    last_log_id: LogId,

    /// Whether a committed config change has removed this node from the cluster.
    removed: bool,
    /// Set by a TimeoutNow frame: campaign immediately, skipping the pre-vote phase once.
    campaign_now: bool,

    /// The node's current snapshot state.
    snapshot_state: Option<SnapshotState<S::SnapshotData>>,

    /// The log id upto which the current snapshot includes, inclusive, if a snapshot exists.
    ///
    /// This is primarily used in making a determination on when a compaction job needs to be triggered.
    snapshot_last_log_id: LogId,

    /// The stream of join handles from state machine apply tasks. There will only ever be
    /// a maximum of 1 element at a time.
    ///
    /// This abstraction is needed to ensure that applying entries to the state machine does not
    /// block the AppendEntries RPC flow, and to ensure that we have a smooth transition to
    /// becoming leader without concern over duplicate application of entries to the state
    /// machine.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let membership = EffectiveMembership::new(0, crate::membership::Membership::new_initial(id)); // This is updated from storage in the main loop.
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            membership: membership.clone(),
            committed_membership: membership,
            network,
            storage,
            log: Arc::new(RwLock::new(RaftLog::new(LogId::default()))),
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId { term: 0, index: 0 },
            last_applying: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId { term: 0, index: 0 },
            removed: false,
            campaign_now: false,
            snapshot_state: None,
            snapshot_last_log_id: LogId { term: 0, index: 0 },
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership.clone();
        self.committed_membership = state.membership;
        self.last_applied = state.last_applied_log;
        self.last_applying = state.last_applied_log.index;
        // NOTE: this is repeated here for clarity. It is unsafe to initialize the node's commit
        // index to any other value. The commit index must be determined by a leader after
        // successfully committing a new log to the cluster.
        self.commit_index = 0;

        // Fetch the most recent snapshot in the system.
        if let Some(snapshot) =
            self.storage.get_current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.snapshot_last_log_id = snapshot.meta.last_log_id;
            self.report_metrics(Update::Ignore);
        }

        // Load the unsnapshotted suffix of the durable log into the in-memory window.
        let entries = if self.last_log_id.index > self.snapshot_last_log_id.index {
            Some(
                self.storage
                    .get_log_entries(self.snapshot_last_log_id.index + 1..self.last_log_id.index + 1)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?,
            )
        } else {
            None
        };
        {
            let mut log = self.log.write().await;
            *log = RaftLog::new(self.snapshot_last_log_id);
            if let Some(entries) = entries {
                log.append_many(entries);
            }
        }

        let has_log = self.last_log_id.index != u64::MIN;
        let single = self.membership.membership.voter_count(Group::BOTH) == 1;
        let is_voter = self.membership.membership.is_voter(&self.id);

        self.target_state = match (has_log, single, is_voter) {
            // A restarted raft that already received some logs but was not yet granted a vote.
            // It should remain in NonVoter state, not Follower.
            (true, true, false) => State::NonVoter,
            (true, false, false) => State::NonVoter,

            (false, true, false) => State::NonVoter,
            (false, false, false) => State::NonVoter,

            // If this is the only configured voter and there is live state, then this is
            // a single-node cluster. Become leader.
            (true, true, true) => State::Leader,

            // The initial state when a raft is created from empty store.
            (false, true, true) => State::NonVoter,

            // Otherwise it is Follower.
            (true, false, true) => State::Follower,

            (false, false, true) => State::Follower, // impossible: no logs but there are other members.
        };

        if self.target_state == State::Follower {
            // Here we use a 30 second overhead on the initial next_election_timeout. This is because we need
            // to ensure that restarted nodes don't disrupt a stable cluster by timing out and driving up their
            // term before network communication is established.
            let inst = Instant::now()
                + Duration::from_secs(2)
                + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        // This is central loop of the system. The Raft core assumes a few different roles based
        // on cluster state. The Raft core will delegate control to the different state
        // controllers and simply awaits the delegated loop to return, which will only take place
        // if some error has been encountered, or if a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.membership.clone(),
            snapshot: self.snapshot_last_log_id,
            removed: self.removed,
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    ///
    /// The returned future resolves only once the state is durable; no RPC carrying the new
    /// term leaves this node before that, and the single-threaded core dispatches no other
    /// message while the write is in flight.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.membership.is_voter(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();

        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!("update election timeout after: {:?}", t);

        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Check whether a heartbeat from a live leader arrived within the election timeout.
    ///
    /// Used to refuse pre-votes and votes which would disturb a healthy leader.
    fn has_live_leader(&self) -> bool {
        match self.last_heartbeat {
            Some(inst) => {
                Instant::now().saturating_duration_since(inst)
                    <= Duration::from_millis(self.config.election_timeout_min)
            }
            None => false,
        }
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such, the
    /// Raft node will be instructed to stop. If such behavior is not needed, then don't use this
    /// interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Record the most recent membership config observed in the log, committed or not.
    ///
    /// No state transition happens here; those are driven by [`update_membership`] once the
    /// entry commits.
    fn set_effective_membership(&mut self, membership: EffectiveMembership) {
        self.membership = membership;
    }

    /// Install a committed membership config & transition per this node's place in it.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_membership(&mut self, membership: EffectiveMembership) -> RaftResult<()> {
        self.membership = membership.clone();
        self.committed_membership = membership;

        match self.membership.membership.server(&self.id) {
            None => {
                // This node has been removed from the cluster. The parent application can
                // observe the `removed` flag as a signal for when it is safe to shut the node
                // down.
                self.removed = true;
                self.set_target_state(State::NonVoter);
            }
            Some(_) => {
                self.removed = false;
                let is_voter = self.membership.membership.is_voter(&self.id);
                if !is_voter && (self.target_state == State::Follower || self.target_state == State::Candidate) {
                    self.set_target_state(State::NonVoter);
                } else if is_voter && self.target_state == State::NonVoter {
                    // This node has been granted a vote; start tracking the leader's liveness.
                    self.set_target_state(State::Follower);
                }
            }
        }
        Ok(())
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            self.snapshot_last_log_id = log_id;
            self.log.write().await.compact(log_id, self.config.snapshot_trailing);
            self.report_metrics(Update::Ignore);
        }
        // If snapshot state is anything other than streaming, then drop it.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state);
        }
    }

    /// Trigger a log compaction (snapshot) job if needed.
    /// If force is True, it will skip the threshold check and start creating snapshot as demanded.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        // Check to ensure we have actual entries for compaction.
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshot_last_log_id.index {
            return;
        }
        // Never snapshot beneath an in-flight apply chunk.
        if self.last_applying != self.last_applied.index {
            return;
        }

        if !force {
            // If we are below the threshold, then there is nothing to do.
            if self.last_applied.index < self.snapshot_last_log_id.index + *threshold {
                return;
            }
        }

        // At this point, we are clear to begin a new compaction process.
        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let f = storage.do_log_compaction();
                let res = Abortable::new(f, reg).await;
                match res {
                    Ok(res) => match res {
                        Ok(snapshot) => {
                            let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(snapshot.meta.last_log_id));
                            let _ = chan_tx.send(snapshot.meta.last_log_id.index); // This will always succeed.
                        }
                        Err(err) => {
                            tracing::error!({error=%err}, "error while generating snapshot");
                            let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                        }
                    },
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("beginning new log compaction process")),
        );
    }

    /// Submit the next chunk of committed entries to the state machine, if any are due.
    ///
    /// At most one chunk is in flight at a time and each chunk is bounded by
    /// `Config::apply_batch_size`, so control returns to the event loop between chunks. The
    /// apply permit is asked for before every chunk; denial defers the work until the next
    /// event or tick retries it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) async fn replicate_to_state_machine_if_needed(&mut self) {
        if self.last_applying >= self.commit_index {
            return;
        }
        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }
        if !self.storage.pgrep_permit(PgrepScope::Apply).await {
            tracing::debug!("pgrep apply permit denied, deferring apply chunk");
            return;
        }

        let from = self.last_applying + 1;
        let to = self.commit_index.min(self.last_applying + self.config.apply_batch_size);
        let entries = {
            let log = self.log.read().await;
            (from..=to).filter_map(|i| log.get(i)).collect::<Vec<_>>()
        };
        if entries.len() as u64 != to - from + 1 {
            // The window can not serve a committed range; this means local state is corrupt.
            let _ = self.map_fatal_storage_error(anyhow::anyhow!(
                "committed entries {}..={} missing from the log window",
                from,
                to
            ));
            self.storage.pgrep_unpermit(PgrepScope::Apply).await;
            return;
        }

        // Committed config changes become the installed configuration as they are applied.
        for entry in entries.iter() {
            if let EntryPayload::ConfigChange(ref change) = entry.payload {
                let membership = EffectiveMembership::new(entry.log_id.index, change.membership.clone());
                let _ = self.update_membership(membership);
            }
        }

        self.last_applying = to;
        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            let data_entries: Vec<_> = entries.iter().map(|entry| entry.as_ref()).collect();
            let res = storage.apply_to_state_machine(&data_entries).await;
            storage.pgrep_unpermit(PgrepScope::Apply).await;
            res?;
            Ok(entries.last().map(|entry| entry.log_id))
        });
        self.replicate_to_sm_handle.push(handle);
    }

    /// Handle the output of an async task replicating entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) async fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<LogId>>) -> RaftResult<()> {
        let last_applied_opt = res.map_err(|err| self.map_fatal_storage_error(err))?;

        tracing::debug!("last_applied:{:?}", last_applied_opt);

        if let Some(last_applied) = last_applied_opt {
            self.last_applied = last_applied;
        }

        self.report_metrics(Update::Ignore);
        self.trigger_log_compaction_if_needed(false);

        // Keep draining towards the commit index, one chunk per completion.
        self.replicate_to_state_machine_if_needed().await;
        Ok(())
    }

    /// Reject an init config request due to the Raft node being in a state which prohibits the request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), crate::error::InitializeError>>) {
        let _ = tx.send(Err(crate::error::InitializeError::NotAllowed));
    }

    /// Reject a proposed config change request due to the Raft node being in a state which prohibits the request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: ResponseTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.current_leader).into()));
    }

    /// Forward the given client write request to the leader.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write_request(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        match req.entry {
            EntryPayload::Normal(entry) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data, self.current_leader)));
            }
            _ => {
                // This is unreachable, and well controlled by the type system, but let's log an
                // error for good measure.
                tracing::error!("unreachable branch hit within pgraft, attempting to forward a Raft internal entry");
            }
        }
    }

    /// Forward the given client read request to the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_read_request(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(crate::error::ClientReadError::ForwardToLeader(self.current_leader)));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The current snapshot state of the Raft node.
pub(self) enum SnapshotState<S> {
    /// The Raft node is compacting itself.
    Snapshotting {
        /// A handle to abort the compaction process early if needed.
        handle: AbortHandle,
        /// A sender for notifiying any other tasks of the completion of this compaction.
        sender: broadcast::Sender<u64>,
    },
    /// The Raft node is streaming in a snapshot from the leader.
    Streaming {
        /// The offset of the last byte written to the snapshot.
        offset: u64,
        /// The ID of the snapshot being written.
        id: String,
        /// A handle to the snapshot writer.
        snapshot: Box<S>,
    },
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot creation has finished successfully and covers the given index.
    SnapshotComplete(LogId),
    /// Snapshot creation failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is completely passive; replicating entries, but neither voting nor timing out.
    ///
    /// Servers whose role carries no vote (standbys, spares, loggers) and servers removed from
    /// the configuration run in this state.
    NonVoter,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down; every further input is dropped.
    Shutdown,
}

impl State {
    /// Check if currently in non-voter state.
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership action to take once a catch-up round completes.
#[derive(Debug)]
pub(self) enum PostCatchUp {
    /// Append the single-step role assignment.
    Assign,
    /// Append the joint config promoting the target and removing `remove`.
    JointPromote { remove: Option<NodeId> },
}

/// A bounded round bringing a promotee up-to-date before its promotion is proposed.
pub(self) struct CatchUpRound {
    /// The server being promoted.
    pub target: NodeId,
    /// The role it is being promoted to.
    pub role: ServerRole,
    /// The leader's last log index when the round opened; the round completes when the
    /// target's match index reaches it.
    pub round_index: u64,
    /// When the round opened; rounds which outlive the configured timeout fail.
    pub started_at: Instant,
    pub action: PostCatchUp,
    pub tx: Option<ResponseTx>,
}

/// The state of a leadership transfer in flight.
pub(self) struct TransferState {
    /// The node leadership is being handed to.
    pub target: NodeId,
    /// Whether the TimeoutNow frame has been dispatched.
    pub dispatched: bool,
    pub tx: Option<ResponseTx>,
}

/// Volatile state specific to the Raft leader.
pub(self) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,
    /// A bool indicating if this node will be stepping down after committing the current config change.
    pub(super) is_stepping_down: bool,

    /// The metrics about a leader
    pub leader_metrics: LeaderMetrics,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent<S::SnapshotData>, Span)>,

    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,

    /// The registry of client requests which have been appended locally and are awaiting to be
    /// committed to the cluster, keyed by the log index of their last entry.
    pub(super) awaiting_committed: BTreeMap<u64, ClientRequestEntry<D, R>>,

    /// A field tracking the cluster's current consensus state, which is used for dynamic membership.
    pub(super) consensus_state: ConsensusState,

    /// The catch-up round in flight for a pending promotion, if any.
    pub(super) catch_up: Option<CatchUpRound>,
    /// The leadership transfer in flight, if any. Client writes are refused while it is.
    pub(super) transfer: Option<TransferState>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let consensus_state = if core.membership.membership.is_joint() {
            ConsensusState::Joint {
                is_committed: false,
                tx: None,
            }
        } else {
            ConsensusState::Uniform
        };
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            is_stepping_down: false,
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
            consensus_state,
            awaiting_committed: BTreeMap::new(),
            catch_up: None,
            transfer: None,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams for every server which receives the log.
        let targets = self
            .core
            .membership
            .membership
            .replication_targets()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();

        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        // The leader's own tick: drives the pgrep hooks, catch-up round timeouts and deferred
        // apply chunks.
        let mut tick = interval(Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);

                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                self.drain_pending_requests();
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                _ = tick.tick() => {
                    self.handle_tick().await;
                }
                Some((msg,span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: AppendEntries, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: RequestVote, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: InstallSnapshot, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: TimeoutNow, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            tracing::info!("leader recv from rx_api: ClientReadRequest");
                            self.handle_client_read_request(tx).await;
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: ClientWriteRequest, {}", rpc.summary());
                            self.handle_client_write_request(rpc, tx).await;
                        }
                        RaftMsg::ClientWriteMany{rpcs, tx} => {
                            tracing::info!("leader recv from rx_api: ClientWriteMany, n={}", rpcs.len());
                            self.handle_client_write_many(rpcs, tx).await;
                        }
                        RaftMsg::Barrier{tx} => {
                            tracing::info!("leader recv from rx_api: Barrier");
                            self.handle_barrier_request(tx).await;
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            tracing::info!("leader recv from rx_api: Initialize");
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddServer{id, tx} => {
                            tracing::info!("leader recv from rx_api: AddServer, {}", id);
                            self.add_server(id, tx).await;
                        }
                        RaftMsg::AssignRole{id, role, tx} => {
                            tracing::info!("leader recv from rx_api: AssignRole, {} -> {:?}", id, role);
                            self.assign_role(id, role, tx).await;
                        }
                        RaftMsg::JointPromote{id, role, remove, tx} => {
                            tracing::info!("leader recv from rx_api: JointPromote, {} -> {:?}, remove {:?}", id, role, remove);
                            self.joint_promote(id, role, remove, tx).await;
                        }
                        RaftMsg::RemoveServer{id, tx} => {
                            tracing::info!("leader recv from rx_api: RemoveServer, {}", id);
                            self.remove_server(id, tx).await;
                        }
                        RaftMsg::TransferLeadership{target, tx} => {
                            tracing::info!("leader recv from rx_api: TransferLeadership, {:?}", target);
                            self.transfer_leadership(target, tx).await;
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    tracing::info!("leader recv from rx_compaction: {:?}", update);
                    self.core.update_snapshot_state(update).await;
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    tracing::info!("leader recv from replication_rx: {:?}", event.summary());
                    let _ent = span.enter();
                    self.handle_replica_event(event).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    tracing::info!("leader recv from replicate_to_sm_handle: {:?}", repl_sm_result);

                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shudown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// The leader's periodic tick.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_tick(&mut self) {
        self.core.storage.pgrep_tick().await;
        self.check_catch_up_round().await;
        // An apply chunk deferred by a denied permit is retried here.
        self.core.replicate_to_state_machine_if_needed().await;
    }

    /// Fail every pending client request with a forward-to-leader error on step-down.
    #[tracing::instrument(level = "trace", skip(self))]
    fn drain_pending_requests(&mut self) {
        let leader = self.core.current_leader.filter(|id| id != &self.core.id);
        for (_, req) in std::mem::take(&mut self.awaiting_committed) {
            req.fail_not_leader(leader);
        }
        if let Some(round) = self.catch_up.take() {
            if let Some(tx) = round.tx {
                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader).into()));
            }
        }
        if let Some(transfer) = self.transfer.take() {
            if let Some(tx) = transfer.tx {
                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader).into()));
            }
        }
        if let ConsensusState::Joint { tx: Some(tx), .. } =
            std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform)
        {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader).into()));
        }
    }

    /// Report metrics with leader specific states.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
pub(self) struct ReplicationState<D: AppData> {
    pub matched: LogId,
    pub remove_after_commit: Option<u64>,
    /// Whether this target's catch-up traffic is fenced by the pgrep permits.
    pub pgrep: bool,
    pub replstream: ReplicationStream<D>,
}

/// A state enum used by Raft leaders to navigate the joint consensus protocol.
pub(self) enum ConsensusState {
    /// The cluster is in a joint consensus state and is syncing new nodes.
    Joint {
        /// A bool indicating if the associated joint config has yet been committed.
        ///
        /// NOTE: when a new leader is elected, it will initialize this value to false, and then
        /// update this value to true once the new leader's blank payload has been committed.
        is_committed: bool,
        /// The response channel waiting for the final uniform config to commit.
        tx: Option<ResponseTx>,
    },
    /// The cluster consensus is uniform; not in a joint consensus state.
    Uniform,
}

impl ConsensusState {
    /// Check the current state to determine if it is in joint consensus, and if it is safe to finalize the joint
    /// consensus.
    ///
    /// The return value will be true if:
    /// 1. this object currently represents a joint consensus state.
    /// 2. the corresponding config for this consensus state has been committed to the cluster.
    pub fn is_joint_consensus_safe_to_finalize(&self) -> bool {
        match self {
            ConsensusState::Joint { is_committed, .. } => *is_committed,
            _ => false,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(self) struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// Whether the current round is the non-disruptive pre-vote probe.
    ///
    /// A real election follows only after a quorum of pre-vote grants; a TimeoutNow frame from
    /// a transferring leader skips the probe entirely.
    pre_vote: bool,
    /// Whether this candidacy was started by a transferring leader's TimeoutNow frame; such a
    /// campaign may depose the live leader.
    from_transfer: bool,
    /// The number of votes which have been granted by peer nodes of the old config group.
    votes_granted_old: u64,
    /// The number of votes needed from the old config group in order to become the Raft leader.
    votes_needed_old: u64,
    /// The number of votes which have been granted by peer nodes of the new config group (if applicable).
    votes_granted_new: u64,
    /// The number of votes needed from the new config group in order to become the Raft leader (if applicable).
    votes_needed_new: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let from_transfer = core.campaign_now;
        core.campaign_now = false;
        Self {
            core,
            pre_vote: !from_transfer,
            from_transfer,
            votes_granted_old: 0,
            votes_needed_old: 0,
            votes_granted_new: 0,
            votes_needed_new: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new vote round: a pre-vote probe, then
        // on its quorum the real election of a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup initial state per round; we count our own vote in every group we vote in.
            let membership = &self.core.membership.membership;
            self.votes_needed_old = crate::quorum::majority_of(membership.voter_count(Group::OLD)) as u64;
            self.votes_granted_old = if membership.server(&self.core.id).map(|s| s.is_voter_in(Group::OLD)).unwrap_or(false) {
                1
            } else {
                0
            };
            if membership.is_joint() {
                self.votes_needed_new = crate::quorum::majority_of(membership.voter_count(Group::NEW)) as u64;
                self.votes_granted_new =
                    if membership.server(&self.core.id).map(|s| s.is_voter_in(Group::NEW)).unwrap_or(false) {
                        1
                    } else {
                        0
                    };
            } else {
                self.votes_needed_new = 0;
                self.votes_granted_new = 0;
            }

            // Setup the new round. A pre-vote probe campaigns at current_term + 1 without
            // bumping or persisting anything; the real election does both.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            if !self.pre_vote {
                self.core.current_term += 1;
                self.core.voted_for = Some(self.core.id);
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.save_hard_state().await?;
                self.core.report_metrics(Update::Update(None));
            }

            // Send RPCs to all voters in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    // This round has timed-out. Break to outer loop, which starts a new round
                    // with a fresh pre-vote probe.
                    _ = timeout_fut => {
                        self.pre_vote = true;
                        self.from_transfer = false;
                        break;
                    }
                    Some((res, peer)) = pending_votes.recv() => {
                        let outcome = self.handle_vote_response(res, peer).await?;
                        if outcome == VoteOutcome::StartRealElection {
                            self.pre_vote = false;
                            break;
                        }
                    }
                    Some((msg,span)) = self.core.rx_api.recv() => {

                        let _ent = span.enter();

                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot{rpc, tx} => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::TimeoutNow{rpc, tx} => {
                                let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                            }
                            RaftMsg::ClientReadRequest{tx} => {
                                self.core.forward_client_read_request(tx);
                            }
                            RaftMsg::ClientWriteRequest{rpc, tx} => {
                                self.core.forward_client_write_request(rpc, tx);
                            }
                            RaftMsg::ClientWriteMany{rpcs, tx} => {
                                let _ = tx.send(Err(ClientWriteError::ForwardToLeaderMany(rpcs, self.core.current_leader)));
                            }
                            RaftMsg::Barrier{tx} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::Initialize{tx, ..} => {
                                self.core.reject_init_with_config(tx);
                            }
                            RaftMsg::AddServer{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::AssignRole{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::JointPromote{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::RemoveServer{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::TransferLeadership{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        // Errors herein will trigger shutdown, so no need to process error.
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

/// The outcome of processing a single vote response.
#[derive(Debug, PartialEq, Eq)]
pub(self) enum VoteOutcome {
    Pending,
    /// The pre-vote probe reached quorum; start the real election.
    StartRealElection,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(self) struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout()); // Value is updated as heartbeats are received.

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg,span)) = self.core.rx_api.recv() => {

                    let _ent = span.enter();

                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::ClientWriteMany{rpcs, tx} => {
                            let _ = tx.send(Err(ClientWriteError::ForwardToLeaderMany(rpcs, self.core.current_leader)));
                        }
                        RaftMsg::Barrier{tx} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddServer{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::AssignRole{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::JointPromote{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::RemoveServer{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::TransferLeadership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in non-voter state.
pub(self) struct NonVoterState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> NonVoterState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the non-voter loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:NonVoterState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg,span)) = self.core.rx_api.recv() => {

                    let _ent = span.enter();

                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::ClientWriteMany{rpcs, tx} => {
                            let _ = tx.send(Err(ClientWriteError::ForwardToLeaderMany(rpcs, self.core.current_leader)));
                        }
                        RaftMsg::Barrier{tx} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::Initialize{members, tx} => {
                            let _ = tx.send(self.handle_init_with_config(members).await);
                        }
                        RaftMsg::AddServer{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::AssignRole{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::JointPromote{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::RemoveServer{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::TransferLeadership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
