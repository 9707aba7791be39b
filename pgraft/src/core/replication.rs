use tokio::sync::oneshot;

use crate::config::SnapshotPolicy;
use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::membership::Group;
use crate::quorum;
use crate::raft::RaftNetwork;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let pgrep = self
            .core
            .membership
            .membership
            .server(&target)
            .map(|server| server.role == crate::membership::ServerRole::Standby)
            .unwrap_or(false);
        self.spawn_replication_stream_pgrep(target, pgrep)
    }

    /// Spawn a new replication stream with an explicit pgrep fencing flag.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream_pgrep(&self, target: NodeId, pgrep: bool) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            pgrep,
            self.core.config.clone(),
            self.core.log.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            pgrep,
            replstream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        let res = match event {
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::UpdateMatchIndex {
                target,
                matched,
                acked_commit,
            } => self.handle_update_match_index(target, matched, acked_commit).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "trace", skip(self, term))]
    async fn handle_revert_to_follower(&mut self, _: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId, acked_commit: u64) -> RaftResult<()> {
        // Update target's match index & check if it is awaiting removal. A removed node's
        // stream only goes away once the node has both stored the config entry removing it and
        // acknowledged a commit index covering it, so it knows it has been removed.
        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(state) => {
                state.matched = matched;
                if let Some(threshold) = &state.remove_after_commit {
                    if &matched.index >= threshold && &acked_commit >= threshold {
                        needs_removal = true;
                    }
                }
            }
            // No longer a replication target.
            None => return Ok(()),
        }

        self.update_leader_metrics(target, matched);

        // A promotee reaching its round boundary completes the catch-up round; a transfer
        // target reaching the leader's head receives the TimeoutNow frame.
        self.check_catch_up_round().await;
        if self.transfer.as_ref().map(|t| t.target == target).unwrap_or(false) && self.is_up_to_date(&target) {
            self.dispatch_timeout_now().await;
        }

        // Drop replication stream if needed.
        if needs_removal {
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));

                // remove metrics entry
                self.leader_metrics.replication.remove(&target);
            }
        }

        self.advance_commit_index().await;
        Ok(())
    }

    /// Recompute the commit index from the quorum of every active group, and process the
    /// registry of pending requests it uncovers.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn advance_commit_index(&mut self) {
        let commit_index = self.calc_commit_index();

        // Determine if we have a new commit index, accounting for joint consensus.
        // If a new commit index has been established, then update a few needed elements.
        let has_new_commit_index = commit_index > self.core.commit_index;

        if has_new_commit_index {
            self.core.commit_index = commit_index;

            // Update all replication streams based on new commit index.
            for node in self.nodes.values() {
                let _ = node.replstream.repl_tx.send((
                    RaftEvent::UpdateCommitIndex {
                        commit_index: self.core.commit_index,
                    },
                    tracing::debug_span!("CH"),
                ));
            }

            // Check if there are any pending requests which need to be processed.
            let uncovered: Vec<u64> = self
                .awaiting_committed
                .range(..=self.core.commit_index)
                .map(|(index, _)| *index)
                .collect();
            for index in uncovered {
                if let Some(request) = self.awaiting_committed.remove(&index) {
                    self.client_request_post_commit(request).await;
                }
            }
        }

        self.leader_report_metrics();
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn update_leader_metrics(&mut self, target: NodeId, matched: LogId) {
        self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
    }

    /// Calculate the largest index which has a quorum of matched voters in every active group.
    ///
    /// In a Joint-phase configuration the outgoing and the incoming group each form their own
    /// quorum; an entry only commits once both have covered it.
    #[tracing::instrument(level = "trace", skip(self))]
    fn calc_commit_index(&self) -> u64 {
        let mut commit = self.group_commit_index(Group::OLD);
        if self.core.membership.membership.is_joint() {
            commit = commit.min(self.group_commit_index(Group::NEW));
        }
        commit
    }

    /// The commit index as seen by one group's voters.
    fn group_commit_index(&self, group: Group) -> u64 {
        let matched = self.group_matched(group);
        let commit = commit_candidate(matched, self.core.commit_index, self.core.current_term);
        tracing::debug!(?group, commit, "group commit index");
        commit
    }

    /// Collect the matched position of every voter of the given group.
    ///
    /// The leader stands in with its own log head. A voter without a replication stream counts
    /// as fully unmatched; it still occupies a quorum slot.
    fn group_matched(&self, group: Group) -> Vec<LogId> {
        self.core
            .membership
            .membership
            .voter_ids(group)
            .map(|id| {
                if id == self.core.id {
                    self.core.last_log_id
                } else if let Some(state) = self.nodes.get(&id) {
                    state.matched
                } else {
                    tracing::error!(id, "voter has no replication stream, counting it as unmatched");
                    LogId::default()
                }
            })
            .collect()
    }

    /// Handle events from replication streams requesting for snapshot info.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        _: NodeId,
        tx: oneshot::Sender<Snapshot<S::SnapshotData>>,
    ) -> RaftResult<()> {
        // Ensure snapshotting is configured, else do nothing.
        let threshold = match &self.core.config.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => *threshold,
        };

        // Check for existence of current snapshot.
        let current_snapshot_opt = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        if let Some(snapshot) = current_snapshot_opt {
            // Hand over the stored snapshot while it is still close to the head of the log,
            // else build a new one first.
            if snapshot_is_fresh(snapshot.meta.last_log_id.index, self.core.last_log_id.index, threshold) {
                let _ = tx.send(snapshot);
                return Ok(());
            }
        }

        // Check if snapshot creation is already in progress. If so, we spawn a task to await its
        // completion (or cancellation), and respond to the replication stream. The repl stream
        // will wait for the completion and will then send another request to fetch the finished snapshot.
        // Else we just drop any other state and continue. Leaders never enter `Streaming` state.
        if let Some(SnapshotState::Snapshotting { handle, sender }) = self.core.snapshot_state.take() {
            let mut chan = sender.subscribe();
            tokio::spawn(async move {
                let _ = chan.recv().await;
                drop(tx);
            });
            self.core.snapshot_state = Some(SnapshotState::Snapshotting { handle, sender });
            return Ok(());
        }

        // At this point, we just attempt to request a snapshot. Under normal circumstances, the
        // leader will always be keeping up-to-date with its snapshotting, and the latest snapshot
        // will always be found and this block will never even be executed.
        //
        // If this block is executed, and a snapshot is needed, the repl stream will submit another
        // request here shortly, and will hit the above logic where it will await the snapshot completion.
        //
        // If snapshot is too old, i.e., the distance from last_log_index is greater than half of snapshot threshold,
        // always force a snapshot creation.
        self.core.trigger_log_compaction_if_needed(true);
        Ok(())
    }
}

/// The highest log position a strict majority of a group's voters have replicated.
///
/// With the positions sorted ascending, the slot `len - majority` holds the largest id that at
/// least `majority` voters have reached. Returns `None` for a group with no voters at all;
/// such a group can never make progress and must not widen the commit index.
fn majority_matched(mut matched: Vec<LogId>) -> Option<LogId> {
    if matched.is_empty() {
        return None;
    }
    matched.sort_unstable_by_key(|log_id| log_id.index);
    let majority = quorum::majority_of(matched.len());
    Some(matched[matched.len() - majority])
}

/// Turn one group's matched positions into its commit index.
///
/// The majority-covered position only commits when its entry was created in the leader's own
/// term (§5.4.2); a quorum over an older-term entry is not proof against a deposed leader's
/// ghost writes, so those entries commit transitively once a current-term entry is covered.
/// The result never falls below the already committed index.
fn commit_candidate(matched: Vec<LogId>, committed: u64, leader_term: u64) -> u64 {
    match majority_matched(matched) {
        Some(candidate) if candidate.index > committed && candidate.term == leader_term => candidate.index,
        _ => committed,
    }
}

/// Whether a stored snapshot is still close enough to the head of the log to hand to a
/// replication stream. Beyond half the compaction threshold a fresh one is built instead, so
/// an installed snapshot does not leave its receiver immediately lagging again.
fn snapshot_is_fresh(snapshot_last_index: u64, last_log_index: u64, threshold: u64) -> bool {
    last_log_index.saturating_sub(snapshot_last_index) <= threshold / 2
}

//////////////////////////////////////////////////////////////////////////////////////////////////
