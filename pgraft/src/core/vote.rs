use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::core::VoteOutcome;
use crate::error::RaftResult;
use crate::membership::Group;
use crate::raft::RaftNetwork;
use crate::raft::TimeoutNowRequest;
use crate::raft::TimeoutNowResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2), and by pre-vote probes.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if req.term < self.current_term {
            tracing::debug!({candidate=req.candidate_id, self.current_term, rpc_term=req.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat within the election timeout
        // minimum: a campaign which can not have observed our live leader must not disturb it.
        // A campaign started by the leader's own TimeoutNow frame is exempt.
        if self.has_live_leader() && !req.leadership_transfer {
            tracing::debug!(
                {candidate = req.candidate_id},
                "rejecting vote request received within election timeout of a heartbeat"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        let client_is_uptodate = (req.last_log_term >= self.last_log_id.term)
            && (req.last_log_index >= self.last_log_id.index)
            || req.last_log_term > self.last_log_id.term;

        // A pre-vote probe never mutates term, voted_for or timers: the answer is purely
        // whether this node would grant a vote at that term right now.
        if req.pre_vote {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: client_is_uptodate,
            });
        }

        // Per spec, if we observe a term greater than our own outside of the election timeout
        // minimum, then we must update term & immediately become follower. We still need to do
        // vote checking after this.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_next_election_timeout(false);
            self.save_hard_state().await?;
            if self.target_state.is_leader() || self.target_state.is_candidate() {
                self.update_current_leader(UpdateCurrentLeader::Unknown);
                self.set_target_state(State::Follower);
            }
            self.report_metrics(Update::Ignore);
        }

        if !client_is_uptodate {
            tracing::debug!(
                { candidate = req.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date so handle voting conditions: we can vote for this
        // candidate if we have not voted this term, or have already voted for it.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &req.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(req.candidate_id);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                self.report_metrics(Update::Ignore);
                tracing::debug!({candidate=req.candidate_id, self.current_term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    /// An RPC invoked by a transferring leader: start campaigning immediately (§3.10).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_timeout_now_request(&mut self, req: TimeoutNowRequest) -> RaftResult<TimeoutNowResponse> {
        if req.term < self.current_term {
            return Ok(TimeoutNowResponse {
                term: self.current_term,
            });
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }

        // Only a voter can campaign; the transfer frame also clears the leader-stickiness
        // window which would otherwise make the target refuse its own election.
        if self.membership.membership.is_voter(&self.id) {
            tracing::info!({leader=req.leader_id}, "received TimeoutNow, campaigning immediately");
            self.last_heartbeat = None;
            self.campaign_now = true;
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Candidate);
        }

        Ok(TimeoutNowResponse {
            term: self.current_term,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Spawn parallel vote requests to all cluster voters.
    ///
    /// During a pre-vote round the requests probe at `current_term + 1` without the local term
    /// ever having changed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let mut all_voters: Vec<NodeId> = self.core.membership.membership.voter_ids(Group::OLD).collect();
        for id in self.core.membership.membership.voter_ids(Group::NEW) {
            if !all_voters.contains(&id) {
                all_voters.push(id);
            }
        }

        let term = if self.pre_vote {
            self.core.current_term + 1
        } else {
            self.core.current_term
        };
        let (tx, rx) = mpsc::channel(all_voters.len().max(1));
        for member in all_voters.into_iter().filter(|member| member != &self.core.id) {
            let mut rpc = VoteRequest::new(
                term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
                self.pre_vote,
            );
            rpc.leadership_transfer = self.from_transfer;
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::error!({error=%err, peer=member}, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }

    /// Handle a vote response from a peer, tallying it in every group the peer votes in.
    #[tracing::instrument(level = "debug", skip(self, res, target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<VoteOutcome> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(VoteOutcome::Pending);
        }

        if !res.vote_granted {
            return Ok(VoteOutcome::Pending);
        }

        let membership = &self.core.membership.membership;
        if membership.server(&target).map(|s| s.is_voter_in(Group::OLD)).unwrap_or(false) {
            self.votes_granted_old += 1;
        }
        if membership.server(&target).map(|s| s.is_voter_in(Group::NEW)).unwrap_or(false) {
            self.votes_granted_new += 1;
        }

        // Quorum requires a majority in *both* groups of a joint config.
        if self.votes_granted_old >= self.votes_needed_old && self.votes_granted_new >= self.votes_needed_new {
            if self.pre_vote {
                tracing::debug!("pre-vote quorum reached, starting a real election");
                return Ok(VoteOutcome::StartRealElection);
            }
            tracing::debug!("transitioning to leader state as minimum number of votes have been received");
            self.core.set_target_state(State::Leader);
        }
        Ok(VoteOutcome::Pending)
    }
}
