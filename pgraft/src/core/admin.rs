use std::collections::BTreeSet;

use tokio::time::Instant;

use crate::core::CatchUpRound;
use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::NonVoterState;
use crate::core::PostCatchUp;
use crate::core::State;
use crate::core::TransferState;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::membership::Group;
use crate::membership::Membership;
use crate::membership::Server;
use crate::membership::ServerRole;
use crate::pgrep::PgrepHooks;
use crate::raft::ClientWriteRequest;
use crate::raft::RaftNetwork;
use crate::raft::ResponseTx;
use crate::raft::TimeoutNowRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftError;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> NonVoterState<'a, D, R, N, S> {
    /// Handle the admin `init_with_config` command.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        mut members: BTreeSet<NodeId>,
    ) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({self.core.last_log_id.index, self.core.current_term}, "rejecting init_with_config request as last_log_index or current_term is 0");
            return Err(InitializeError::NotAllowed);
        }

        // Ensure given config contains this nodes ID as well.
        if !members.contains(&self.core.id) {
            members.insert(self.core.id);
        }

        // Build a new membership config from given init data & assign it as the new cluster
        // membership config in memory only. Every initial member is a voter.
        let single = members.len() == 1;
        let membership = Membership::new_voters(members).map_err(|err| {
            tracing::error!(error=%err, "invalid initial membership");
            InitializeError::NotAllowed
        })?;
        self.core.membership = crate::membership::EffectiveMembership::new(0, membership.clone());
        self.core.committed_membership = crate::membership::EffectiveMembership::new(0, membership);

        // Become a candidate and start campaigning for leadership. If this node is the only node
        // in the cluster, then become leader without holding an election. If members len == 1, we
        // know it is our ID due to the above code where we ensure our own ID is present.
        if single {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else {
            // Initial elections skip the pre-vote probe: there is no settled leader to disturb.
            self.core.campaign_now = true;
            self.core.set_target_state(State::Candidate);
        }

        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Add a new server to the cluster as a standby, and begin syncing it from the log.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn add_server(&mut self, target: NodeId, tx: ResponseTx) {
        if target == 0 {
            let _ = tx.send(Err(ChangeConfigError::DuplicateId(target).into()));
            return;
        }
        if self.core.membership.membership.contains(&target) {
            tracing::debug!("target node is already a cluster member");
            let _ = tx.send(Err(ChangeConfigError::DuplicateId(target).into()));
            return;
        }
        if self.core.membership.membership.is_joint() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }

        let mut membership = self.core.membership.membership.clone();
        if let Err(err) = membership.add(Server::new(target, ServerRole::Standby)) {
            tracing::error!(error=%err, "rejecting add_server");
            let _ = tx.send(Err(ChangeConfigError::DuplicateId(target).into()));
            return;
        }

        // Spawn a replication stream for the new member before its config entry commits so it
        // starts catching up immediately; standby traffic is fenced by the pgrep permits.
        if !self.nodes.contains_key(&target) {
            let state = self.spawn_replication_stream_pgrep(target, true);
            self.nodes.insert(target, state);
        }

        let res = self.append_membership_log(membership, Some(tx)).await;
        if let Err(err) = res {
            tracing::error!("append add-server log error: {:?}", err);
        }
    }

    /// Assign a new role to an existing server.
    ///
    /// A promotion to a voting role while the target is behind the leader's log opens a bounded
    /// catch-up round; the config entry is appended when the round completes.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn assign_role(&mut self, target: NodeId, role: ServerRole, tx: ResponseTx) {
        if self.core.membership.membership.is_joint() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }
        let current_role = match self.core.membership.membership.server(&target) {
            Some(server) => server.role,
            None => {
                let _ = tx.send(Err(ChangeConfigError::NotFound(target).into()));
                return;
            }
        };
        if current_role == role {
            let _ = tx.send(Err(ChangeConfigError::Noop.into()));
            return;
        }
        if target == self.core.id && role != ServerRole::Voter {
            // Demoting the sitting leader is done by removing or transferring instead.
            let _ = tx.send(Err(ChangeConfigError::BadRole(target, role).into()));
            return;
        }

        let needs_catch_up = matches!(role, ServerRole::Voter | ServerRole::Logger)
            && !matches!(current_role, ServerRole::Voter | ServerRole::Logger)
            && !self.is_up_to_date(&target);
        if !needs_catch_up {
            let mut membership = self.core.membership.membership.clone();
            if let Some(server) = membership.server_mut(&target) {
                server.role = role;
                server.role_new = role;
            }
            if membership.voter_count(Group::OLD) == 0 {
                let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
                return;
            }
            let res = self.append_membership_log(membership, Some(tx)).await;
            if let Err(err) = res {
                tracing::error!("append assign-role log error: {:?}", err);
            }
            return;
        }

        self.open_catch_up_round(target, role, PostCatchUp::Assign, tx);
    }

    /// Promote a server and optionally remove another through joint consensus.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn joint_promote(
        &mut self,
        target: NodeId,
        role: ServerRole,
        remove: Option<NodeId>,
        tx: ResponseTx,
    ) {
        if self.core.membership.membership.is_joint() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }
        if !self.core.membership.membership.contains(&target) {
            let _ = tx.send(Err(ChangeConfigError::NotFound(target).into()));
            return;
        }
        if let Some(removed) = remove {
            if !self.core.membership.membership.contains(&removed) {
                let _ = tx.send(Err(ChangeConfigError::NotFound(removed).into()));
                return;
            }
            if removed == target {
                let _ = tx.send(Err(ChangeConfigError::Noop.into()));
                return;
            }
        }

        // The incoming group must still be able to reach quorum.
        let joint = match self.core.membership.membership.to_joint(target, role, remove) {
            Ok(joint) => joint,
            Err(err) => {
                tracing::error!(error=%err, "rejecting joint_promote");
                let _ = tx.send(Err(ChangeConfigError::NotFound(target).into()));
                return;
            }
        };
        if joint.voter_count(Group::NEW) == 0 {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        // A promotee which is behind catches up before the joint config is proposed.
        if matches!(role, ServerRole::Voter | ServerRole::Logger) && !self.is_up_to_date(&target) {
            self.open_catch_up_round(target, role, PostCatchUp::JointPromote { remove }, tx);
            return;
        }

        self.propose_joint_config(joint, remove, tx).await;
    }

    /// Append the joint config entry and arm the joint consensus state machine.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn propose_joint_config(&mut self, joint: Membership, remove: Option<NodeId>, tx: ResponseTx) {
        if let Some(removed) = remove {
            if removed == self.core.id {
                self.is_stepping_down = true;
            }
        }
        self.consensus_state = ConsensusState::Joint {
            is_committed: false,
            tx: Some(tx),
        };

        let res = self.append_membership_log(joint, None).await;
        if let Err(err) = res {
            tracing::error!("append joint log error: {:?}", err);
        }
    }

    /// Remove a server from the cluster in a single-step config change.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn remove_server(&mut self, target: NodeId, tx: ResponseTx) {
        if self.core.membership.membership.is_joint() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }
        if !self.core.membership.membership.contains(&target) {
            let _ = tx.send(Err(ChangeConfigError::NotFound(target).into()));
            return;
        }

        let mut membership = self.core.membership.membership.clone();
        if membership.remove(target).is_err() {
            let _ = tx.send(Err(ChangeConfigError::NotFound(target).into()));
            return;
        }
        if membership.voter_count(Group::OLD) == 0 {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        if target == self.core.id {
            self.is_stepping_down = true;
        }

        let res = self.append_membership_log(membership, Some(tx)).await;
        if let Err(err) = res {
            tracing::error!("append remove-server log error: {:?}", err);
        }
    }

    /// Hand leadership over to the given target, or the most up-to-date voter.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn transfer_leadership(&mut self, target: Option<NodeId>, tx: ResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }

        let target = match target {
            Some(id) => {
                if id == self.core.id {
                    let _ = tx.send(Err(ChangeConfigError::Noop.into()));
                    return;
                }
                if !self.core.membership.membership.is_voter(&id) {
                    let _ = tx.send(Err(ChangeConfigError::BadRole(id, ServerRole::Voter).into()));
                    return;
                }
                id
            }
            None => {
                // Pick the voter with the highest match index.
                let candidate = self
                    .nodes
                    .iter()
                    .filter(|(id, _)| self.core.membership.membership.is_voter(id))
                    .max_by_key(|(_, state)| state.matched.index)
                    .map(|(id, _)| *id);
                match candidate {
                    Some(id) => id,
                    None => {
                        let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
                        return;
                    }
                }
            }
        };

        self.transfer = Some(TransferState {
            target,
            dispatched: false,
            tx: Some(tx),
        });

        if self.is_up_to_date(&target) {
            self.dispatch_timeout_now().await;
        }
    }

    /// Send the TimeoutNow frame concluding a leadership transfer.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn dispatch_timeout_now(&mut self) {
        let transfer = match self.transfer.as_mut() {
            Some(transfer) if !transfer.dispatched => transfer,
            _ => return,
        };
        transfer.dispatched = true;
        let target = transfer.target;
        let tx = transfer.tx.take();

        let rpc = TimeoutNowRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
        };
        let network = self.core.network.clone();
        tokio::spawn(async move {
            if let Err(err) = network.send_timeout_now(target, rpc).await {
                tracing::warn!(target, error=%err, "error sending TimeoutNow RPC to transfer target");
            }
        });
        if let Some(tx) = tx {
            let _ = tx.send(Ok(self.core.last_log_id.index));
        }
    }

    /// Check if the target's replicated log has caught up with the leader's head.
    pub(super) fn is_up_to_date(&self, target: &NodeId) -> bool {
        self.nodes
            .get(target)
            .map(|state| state.matched.index >= self.core.last_log_id.index)
            .unwrap_or(false)
    }

    /// Open a bounded catch-up round for a pending promotion.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) fn open_catch_up_round(&mut self, target: NodeId, role: ServerRole, action: PostCatchUp, tx: ResponseTx) {
        if self.catch_up.is_some() {
            let _ = tx.send(Err(ChangeConfigError::Busy.into()));
            return;
        }

        // A spare has no replication stream until its promotion starts.
        if !self.nodes.contains_key(&target) {
            let state = self.spawn_replication_stream_pgrep(target, true);
            self.nodes.insert(target, state);
        }
        if let Some(state) = self.nodes.get_mut(&target) {
            state.pgrep = true;
        }

        tracing::info!(target, ?role, round_index = self.core.last_log_id.index, "opening catch-up round");
        self.catch_up = Some(CatchUpRound {
            target,
            role,
            round_index: self.core.last_log_id.index,
            started_at: Instant::now(),
            action,
            tx: Some(tx),
        });
    }

    /// Drive the in-flight catch-up round: promote when the boundary is reached, fail it when
    /// the timeout lapses. Called from the match-index update path and from the leader tick.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn check_catch_up_round(&mut self) {
        let (target, round_index, started_at) = match self.catch_up.as_ref() {
            Some(round) => (round.target, round.round_index, round.started_at),
            None => return,
        };

        let elapsed = Instant::now().saturating_duration_since(started_at);
        self.core.storage.pgrep_update_catchup_time(elapsed.as_millis() as u64).await;

        let matched = self.nodes.get(&target).map(|state| state.matched.index).unwrap_or(0);
        if matched >= round_index {
            let round = match self.catch_up.take() {
                Some(round) => round,
                None => return,
            };
            tracing::info!(target, "catch-up round complete, proposing promotion");
            self.finish_catch_up_round(round).await;
            return;
        }

        if elapsed.as_millis() as u64 >= self.core.config.catch_up_timeout {
            let round = match self.catch_up.take() {
                Some(round) => round,
                None => return,
            };
            tracing::warn!(target, "catch-up round timed out");
            self.core.storage.pgrep_reset_checkpoint().await;
            if let Some(tx) = round.tx {
                let _ = tx.send(Err(ChangeConfigError::NoConnection(target).into()));
            }
        }
    }

    /// The promotee has caught up; append the membership change its round was opened for.
    #[tracing::instrument(level = "trace", skip(self, round))]
    async fn finish_catch_up_round(&mut self, round: CatchUpRound) {
        let tx = match round.tx {
            Some(tx) => tx,
            None => return,
        };
        match round.action {
            PostCatchUp::Assign => {
                let mut membership = self.core.membership.membership.clone();
                match membership.server_mut(&round.target) {
                    Some(server) => {
                        server.role = round.role;
                        server.role_new = round.role;
                    }
                    None => {
                        let _ = tx.send(Err(ChangeConfigError::NotFound(round.target).into()));
                        return;
                    }
                }
                let res = self.append_membership_log(membership, Some(tx)).await;
                if let Err(err) = res {
                    tracing::error!("append promotion log error: {:?}", err);
                }
            }
            PostCatchUp::JointPromote { remove } => {
                let joint = match self.core.membership.membership.to_joint(round.target, round.role, remove) {
                    Ok(joint) => joint,
                    Err(err) => {
                        tracing::error!(error=%err, "promotion target vanished during catch-up");
                        let _ = tx.send(Err(ChangeConfigError::NotFound(round.target).into()));
                        return;
                    }
                };
                self.propose_joint_config(joint, remove, tx).await;
            }
        }
    }

    /// Append a membership config entry to the log and start replicating it.
    #[tracing::instrument(level = "trace", skip(self, resp_tx), fields(id=self.core.id))]
    pub async fn append_membership_log(
        &mut self,
        mem: Membership,
        resp_tx: Option<ResponseTx>,
    ) -> Result<(), RaftError> {
        let payload = ClientWriteRequest::<D>::new_config(mem);
        let res = self.append_payload_to_log(payload.entry).await;
        let entry = match res {
            Ok(entry) => entry,
            Err(err) => {
                let err_str = err.to_string();
                if let Some(tx) = resp_tx {
                    let send_res = tx.send(Err(err.into()));
                    if send_res.is_err() {
                        tracing::error!("send response res error");
                    }
                }
                return Err(RaftError::RaftStorage(anyhow::anyhow!(err_str)));
            }
        };

        // The effective config may have grown or shrunk the replication set.
        self.update_replication_state();

        let cr_entry = crate::core::client::ClientRequestEntry::from_entry(entry, resp_tx);
        Box::pin(self.replicate_client_request(cr_entry)).await;

        Ok(())
    }

    /// Reconcile the replication streams with the effective membership config.
    ///
    /// Streams are spawned for newly added servers which receive the log. Streams for removed
    /// servers are kept until the config entry which removes them has committed; see
    /// `handle_uniform_consensus_committed`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn update_replication_state(&mut self) {
        tracing::debug!("update_replication_state");

        let membership = self.core.membership.membership.clone();
        for server in membership.servers() {
            if server.id == self.core.id || !server.receives_log() {
                continue;
            }
            if !self.nodes.contains_key(&server.id) {
                let pgrep = server.role == ServerRole::Standby || server.role_new == ServerRole::Standby;
                let state = self.spawn_replication_stream_pgrep(server.id, pgrep);
                self.nodes.insert(server.id, state);
            }
        }
    }

    /// Handle the commitment of a joint consensus cluster configuration: append the final
    /// uniform config computed from the incoming group.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_joint_consensus_committed(&mut self) {
        if let ConsensusState::Joint { is_committed, .. } = &mut self.consensus_state {
            *is_committed = true; // Mark as committed.
        }
        // Only proceed to finalize this joint consensus if it is safe to do so.
        if self.consensus_state.is_joint_consensus_safe_to_finalize() {
            self.finalize_joint_consensus().await;
        }
    }

    /// Finalize the committed joint consensus.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn finalize_joint_consensus(&mut self) {
        // Only proceed if it is safe to do so.
        if !self.consensus_state.is_joint_consensus_safe_to_finalize() {
            tracing::error!("attempted to finalize joint consensus when it was not safe to do so");
            return;
        }

        let tx = match std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
            ConsensusState::Joint { tx, .. } => tx,
            _ => None,
        };

        // Cut the cluster config over to the incoming group.
        let final_config = self.core.membership.membership.joint_to_normal(Group::NEW);
        let res = self.append_membership_log(final_config, tx).await;
        if let Err(err) = res {
            tracing::error!("append final config log error: {:?}", err);
        }

        // Servers leaving the cluster keep their replication stream until they have stored
        // this final config entry and acknowledged a commit index covering it, at which point
        // they observe their own removal and go passive. Should leadership change before that
        // handshake completes, the departing server never hears it was removed and its
        // election timer eventually fires; the pre-vote probe and the leader-stickiness check
        // on votes absorb exactly that disruption (Raft dissertation, chapter 4, on servers
        // outside the current configuration).
    }

    /// Handle the commitment of a uniform consensus cluster configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_uniform_consensus_committed(&mut self, index: u64) {
        // A committed uniform config settles any joint consensus, including one this leader
        // inherited and completed on behalf of a predecessor.
        self.consensus_state = ConsensusState::Uniform;

        // Step down if needed.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::NonVoter);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Replication streams for servers which are no longer cluster members are marked for
        // removal; the stream is dropped once the removed server has stored this config entry
        // AND acknowledged a commit index covering it, so it learns of its own removal first.
        let membership = &self.core.membership.membership;
        for (id, replstate) in self.nodes.iter_mut() {
            if !membership.contains(id) {
                replstate.remove_after_commit = Some(index);
            }
        }

        let follower_ids: Vec<u64> = self.nodes.keys().cloned().collect();
        tracing::debug!("nodes: {:?}", follower_ids);
        tracing::debug!("membership: {:?}", self.core.membership.membership);

        self.leader_report_metrics();
    }
}
