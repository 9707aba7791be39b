use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::EffectiveMembership;
use crate::pgrep::PgrepHooks;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::RaftNetwork;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=req.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                last_log_index: self.last_log_id.index,
                conflict: Some(ConflictOpt {
                    rejected: req.prev_log_id.index,
                }),
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        // Transition to follower state if needed.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // A pgrep-flagged request may be running ahead of this node's durable log because the
        // external copy process has already delivered the state machine contents through
        // `prev_log_id`; if the storage hooks confirm that, adopt the position as the local
        // snapshot boundary. Otherwise the request falls through to the log-matching check and
        // is walked back like any other probe.
        if req.pgrep
            && req.prev_log_id.index > self.last_log_id.index
            && self.storage.pgrep_boundary(req.prev_log_id).await
        {
            self.pgrep_resync_boundary(req.prev_log_id).await?;
        }

        // The log-matching check (§5.3): the entry at `prev_log_id` must exist with the same
        // term. Anything at or below the snapshot boundary is committed and matches implicitly.
        let prev = req.prev_log_id;
        if prev.index > 0 {
            let (term_of_prev, compacted) = {
                let log = self.log.read().await;
                (log.term_of(prev.index), log.is_compacted(prev.index))
            };
            match term_of_prev {
                Some(term) if term == prev.term => {}
                Some(_) => {
                    if prev.index <= self.commit_index {
                        // A term conflict at or below the commit index means the local state
                        // can no longer be trusted.
                        tracing::error!({prev_index=prev.index, commit_index=self.commit_index}, "term conflict at or below the commit index");
                        self.set_target_state(State::Shutdown);
                        return Err(RaftError::CorruptLog);
                    }
                    tracing::debug!(rejected = prev.index, "AppendEntries failed the log-matching check");
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        last_log_index: self.last_log_id.index,
                        conflict: Some(ConflictOpt { rejected: prev.index }),
                    });
                }
                None => {
                    if !compacted {
                        // The entry is missing entirely; the leader needs to walk back.
                        tracing::debug!(rejected = prev.index, "AppendEntries prev_log_id is beyond this node's log");
                        return Ok(AppendEntriesResponse {
                            term: self.current_term,
                            last_log_index: self.last_log_id.index,
                            conflict: Some(ConflictOpt { rejected: prev.index }),
                        });
                    }
                }
            }
        }

        // Walk the incoming entries: skip duplicates already stored, and find the first index
        // whose local term conflicts with the incoming one.
        let mut conflict_at: Option<u64> = None;
        let mut to_append: Vec<Entry<D>> = Vec::new();
        {
            let log = self.log.read().await;
            for (pos, entry) in req.entries.iter().enumerate() {
                let index = entry.log_id.index;
                if log.is_compacted(index) {
                    continue;
                }
                match log.term_of(index) {
                    Some(term) if term == entry.log_id.term => continue,
                    Some(_) => {
                        conflict_at = Some(index);
                        to_append = req.entries[pos..].to_vec();
                        break;
                    }
                    None => {
                        to_append = req.entries[pos..].to_vec();
                        break;
                    }
                }
            }
        }

        // Conflict deletion: drop the conflicting suffix from durable storage and from the
        // window, and roll back an uncommitted config change living in the dropped range.
        if let Some(conflict_index) = conflict_at {
            if conflict_index <= self.commit_index {
                tracing::error!({conflict_index, commit_index=self.commit_index}, "entry term conflict at or below the commit index");
                self.set_target_state(State::Shutdown);
                return Err(RaftError::CorruptLog);
            }
            tracing::debug!(conflict_index, "truncating conflicting log suffix");
            self.storage
                .delete_logs_from(conflict_index..)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let truncated = {
                let mut log = self.log.write().await;
                let res = log.truncate(conflict_index);
                if res.is_ok() {
                    self.last_log_id = log.last_log_id();
                }
                res
            };
            if let Err(err) = truncated {
                return Err(self.map_fatal_storage_error(anyhow::anyhow!(err)));
            }
            if self.membership.log_index >= conflict_index {
                let committed = self.committed_membership.clone();
                tracing::debug!("rolling back uncommitted membership config to index {}", committed.log_index);
                self.set_effective_membership(committed);
                report_metrics = true;
            }
            self.storage.pgrep_reset_checkpoint().await;
        }

        // The remaining suffix connects to the head of the log; copy it into the window and
        // submit it to storage.
        if !to_append.is_empty() {
            let handles = self.log.write().await.append_many(to_append);
            let first_index = handles[0].log_id.index;
            let data_entries: Vec<_> = handles.iter().map(|entry| entry.as_ref()).collect();
            if let Err(err) = self.storage.append_to_log(&data_entries).await {
                self.log.write().await.discard(first_index);
                return Err(self.map_fatal_storage_error(err));
            }
            self.last_log_id = handles.last().map(|entry| entry.log_id).unwrap_or(self.last_log_id);

            // A config entry is effective the moment it is stored, committed or not.
            for entry in handles.iter() {
                if let EntryPayload::ConfigChange(ref change) = entry.payload {
                    self.set_effective_membership(EffectiveMembership::new(
                        entry.log_id.index,
                        change.membership.clone(),
                    ));
                    report_metrics = true;
                }
            }
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // Everything the leader has committed and we have stored is ready to apply.
        let new_commit = std::cmp::min(req.leader_commit, self.last_log_id.index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        if req.pgrep {
            // A pgrep reply is withheld until the apply loop has drained, so the leader knows
            // apply has caught up before sending the next window.
            self.apply_committed_inline().await?;
        } else {
            self.replicate_to_state_machine_if_needed().await;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            last_log_index: self.last_log_id.index,
            conflict: None,
        })
    }

    /// Adopt the leader's `prev_log_id` as the local snapshot boundary.
    ///
    /// Only reachable through pgrep-flagged traffic whose boundary the storage hooks have
    /// confirmed: the external catch-up process has copied the state machine through this
    /// position out-of-band, so the log before it is not needed and everything after it is
    /// stale.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn pgrep_resync_boundary(&mut self, boundary: LogId) -> RaftResult<()> {
        tracing::info!(%boundary, "resynchronizing snapshot boundary to the leader's prev_log_id");

        self.storage.delete_logs_from(..).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.log.write().await.restore(boundary);

        self.last_log_id = boundary;
        self.snapshot_last_log_id = boundary;
        self.commit_index = boundary.index;
        self.last_applied = boundary;
        self.last_applying = boundary.index;
        self.report_metrics(Update::Ignore);
        Ok(())
    }

    /// Drain the apply loop up to the commit index, inline.
    ///
    /// The regular apply path hands chunks to a background task so the RPC flow is never
    /// blocked; pgrep traffic instead wants the reply to certify that apply has finished.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn apply_committed_inline(&mut self) -> RaftResult<()> {
        use futures::stream::StreamExt;

        loop {
            // Wait out the chunk in flight, if any.
            if !self.replicate_to_sm_handle.is_empty() {
                if let Some(Ok(res)) = self.replicate_to_sm_handle.next().await {
                    self.handle_replicate_to_sm_result(res).await?;
                }
                continue;
            }
            if self.last_applying >= self.commit_index {
                return Ok(());
            }
            self.replicate_to_state_machine_if_needed().await;
            if self.replicate_to_sm_handle.is_empty() {
                // The apply permit was denied; the next tick retries, and the reply certifies
                // only what has been applied so far.
                return Ok(());
            }
        }
    }
}
