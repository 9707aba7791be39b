use std::sync::Arc;

use anyhow::anyhow;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::membership::Group;
use crate::membership::Membership;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteManyResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryConfigChange;
use crate::raft::EntryPayload;
use crate::raft::RaftNetwork;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftStorage;

/// A wrapper around one or more client-originated entries, along with the response channel
/// which fires once the last of them has been committed and applied.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entries of the request, in log order.
    ///
    /// The entries are Arc'd so that they may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entries: Vec<Arc<Entry<D>>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<D, R>>>(entry: Arc<Entry<D>>, tx: T) -> Self {
        Self {
            entries: vec![entry],
            tx: tx.into(),
        }
    }

    /// The log index this request is keyed by: the index of its last entry.
    pub(crate) fn last_index(&self) -> u64 {
        self.entries.last().map(|entry| entry.log_id.index).unwrap_or(0)
    }

    /// Fail this request with a forward-to-leader error, on leader step-down.
    pub(crate) fn fail_not_leader(self, leader: Option<NodeId>) {
        match self.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                let mut data = self.entries.iter().filter_map(|entry| match &entry.payload {
                    EntryPayload::Normal(inner) => Some(inner.data.clone()),
                    _ => None,
                });
                if let Some(data) = data.next() {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(data, leader)));
                }
            }
            ClientOrInternalResponseTx::ClientMany(tx) => {
                let data = self
                    .entries
                    .iter()
                    .filter_map(|entry| match &entry.payload {
                        EntryPayload::Normal(inner) => Some(inner.data.clone()),
                        _ => None,
                    })
                    .collect();
                let _ = tx.send(Err(ClientWriteError::ForwardToLeaderMany(data, leader)));
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader).into()));
                }
            }
        }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    ClientMany(ClientWriteManyResponseTx<D, R>),
    Internal(Option<ResponseTx>),
}

/// A per-group tally of leadership confirmations gathered during a read barrier.
struct GroupConfirmation {
    group: Group,
    confirmed: usize,
    needed: usize,
}

impl GroupConfirmation {
    fn new(membership: &Membership, group: Group) -> Self {
        Self {
            group,
            confirmed: 0,
            needed: quorum::majority_of(membership.voter_count(group)),
        }
    }

    /// Count the given server's answer, if it votes in this group.
    fn record(&mut self, membership: &Membership, id: NodeId) {
        if membership.server(&id).map(|server| server.is_voter_in(self.group)).unwrap_or(false) {
            self.confirmed += 1;
        }
    }

    fn satisfied(&self) -> bool {
        self.confirmed >= self.needed
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Append the entry a fresh leader must propose before serving anything else, per §8.
    ///
    /// A cluster which has never written a log gets its configuration as the very first entry.
    /// An established cluster gets a blank entry — unless the head of the log is a Joint-phase
    /// config, which means a predecessor died mid-change; this leader then proposes the final
    /// Normal-phase config so the stalled membership change can finish.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let head = self.core.last_log_id.index;
        let payload = if head == 0 {
            EntryPayload::ConfigChange(EntryConfigChange {
                membership: self.core.membership.membership.clone(),
            })
        } else {
            let stalled_final = match self.core.log.read().await.get(head) {
                Some(entry) => match &entry.payload {
                    EntryPayload::ConfigChange(change) if change.membership.is_joint() => {
                        Some(change.membership.joint_to_normal(Group::NEW))
                    }
                    _ => None,
                },
                None => None,
            };
            match stalled_final {
                Some(membership) => EntryPayload::ConfigChange(EntryConfigChange { membership }),
                None => EntryPayload::Blank,
            }
        };

        let entry = self.append_payload_to_log(payload).await?;
        // The head's term column only moves once per leadership.
        self.core.last_log_id.term = self.core.current_term;

        self.replicate_client_request(ClientRequestEntry::from_entry(entry, None)).await;

        Ok(())
    }

    /// The read barrier guarding against stale reads (§8): before the caller may serve a
    /// read, this leader proves it has not been deposed by exchanging empty AppendEntries
    /// with a majority of every active group.
    ///
    /// Confirmations are tallied per group; a Joint-phase config needs both the outgoing and
    /// the incoming majority. The leader counts itself wherever it holds a vote, so a
    /// single-voter cluster resolves without touching the network.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        let membership = self.core.membership.membership.clone();

        let mut tallies = vec![GroupConfirmation::new(&membership, Group::OLD)];
        if membership.is_joint() {
            tallies.push(GroupConfirmation::new(&membership, Group::NEW));
        }
        for tally in tallies.iter_mut() {
            tally.record(&membership, self.core.id);
        }
        if tallies.iter().all(|tally| tally.satisfied()) {
            let _ = tx.send(Ok(()));
            return;
        }

        // Ping every voting peer at its matched position, bounded by the heartbeat window.
        let mut pending = FuturesUnordered::new();
        for (id, node) in self.nodes.iter().filter(|(id, _)| membership.is_voter(id)) {
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: node.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
                pgrep: false,
            };
            let peer = *id;
            let network = self.core.network.clone();
            let window = Duration::from_millis(self.core.config.heartbeat_interval);
            pending.push(tokio::spawn(
                async move {
                    match timeout(window, network.send_append_entries(peer, rpc)).await {
                        Ok(res) => (peer, res),
                        Err(_elapsed) => (peer, Err(anyhow!("no answer within the heartbeat window"))),
                    }
                }
                .instrument(tracing::debug_span!("confirm leadership", target = peer)),
            ));
        }

        while let Some(joined) = pending.next().await {
            let (peer, answer) = match joined {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::error!(error=%err, "leadership confirmation task failed");
                    continue;
                }
            };
            let answer = match answer {
                Ok(answer) => answer,
                Err(err) => {
                    tracing::warn!(peer, error=%err, "could not confirm leadership with peer");
                    continue;
                }
            };

            // Any answer carrying a newer term means this node has been deposed; the read
            // must not be served from here.
            if answer.term > self.core.current_term {
                self.core.update_current_term(answer.term, None);
                self.core.set_target_state(State::Follower);
                let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.core.current_leader)));
                return;
            }

            for tally in tallies.iter_mut() {
                tally.record(&membership, peer);
            }
            if tallies.iter().all(|tally| tally.satisfied()) {
                let _ = tx.send(Ok(()));
                return;
            }
        }

        // Every outstanding ping has come back or timed out without reaching quorum.
        let _ = tx.send(Err(ClientReadError::RaftError(RaftError::RaftNetwork(anyhow!(
            "leadership not confirmed: too many voters unreachable"
        )))));
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        // Refuse new writes for the duration of a leadership transfer.
        if self.transfer.is_some() {
            self.core.forward_client_write_request(rpc, tx);
            return;
        }
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Handle a batch of client write requests as one contiguous log batch.
    #[tracing::instrument(level = "trace", skip(self, rpcs, tx))]
    pub(super) async fn handle_client_write_many(&mut self, rpcs: Vec<D>, tx: ClientWriteManyResponseTx<D, R>) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ClientWriteError::ForwardToLeaderMany(rpcs, self.core.current_leader)));
            return;
        }
        if rpcs.is_empty() {
            let _ = tx.send(Ok(Vec::new()));
            return;
        }

        let first_index = self.core.last_log_id.index + 1;
        let entries: Vec<_> = rpcs
            .into_iter()
            .enumerate()
            .map(|(i, data)| Entry {
                log_id: LogId::new(self.core.current_term, first_index + i as u64),
                payload: EntryPayload::Normal(crate::raft::EntryNormal { data }),
            })
            .collect();

        let handles = self.core.log.write().await.append_many(entries);
        let refs: Vec<_> = handles.iter().map(|entry| entry.as_ref()).collect();
        if let Err(err) = self.core.storage.append_to_log(&refs).await {
            // The suffix was never durably appended; drop it from the window again.
            self.core.log.write().await.discard(first_index);
            let err = self.core.map_fatal_storage_error(err);
            let _ = tx.send(Err(ClientWriteError::RaftError(err)));
            return;
        }
        self.core.last_log_id = handles.last().map(|entry| entry.log_id).unwrap_or(self.core.last_log_id);
        self.leader_report_metrics();

        let req = ClientRequestEntry {
            entries: handles,
            tx: ClientOrInternalResponseTx::ClientMany(tx),
        };
        self.replicate_client_request(req).await;
    }

    /// Handle a barrier request: an empty fence entry which resolves once applied.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_barrier_request(&mut self, tx: ResponseTx) {
        if self.transfer.is_some() {
            self.core.reject_config_change_not_leader(tx);
            return;
        }
        let entry = match self.append_payload_to_log(EntryPayload::Barrier).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(ResponseError::Raft(err)));
                return;
            }
        };
        let cr_entry = ClientRequestEntry::from_entry(entry, Some(tx));
        self.replicate_client_request(cr_entry).await;
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Arc<Entry<D>>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        let index = entry.log_id.index;
        let handle = self.core.log.write().await.append(entry);
        let res = self.core.storage.append_to_log(&[handle.as_ref()]).await;
        if let Err(err) = res {
            self.core.log.write().await.discard(index);
            return Err(self.core.map_fatal_storage_error(err));
        }
        self.core.last_log_id.index = handle.log_id.index;

        // A config entry is effective the moment it is appended.
        if let EntryPayload::ConfigChange(ref change) = handle.payload {
            self.core.set_effective_membership(crate::membership::EffectiveMembership::new(
                handle.log_id.index,
                change.membership.clone(),
            ));
        }

        self.leader_report_metrics();

        Ok(handle)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely beings the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        let last_index = req.last_index();
        let entries = req.entries.clone();
        self.awaiting_committed.insert(last_index, req);
        for node in self.nodes.values() {
            for entry in entries.iter() {
                let _ = node.replstream.repl_tx.send((
                    RaftEvent::Replicate {
                        entry: entry.clone(),
                        commit_index: self.core.commit_index,
                    },
                    tracing::debug_span!("CH"),
                ));
            }
        }

        // A single-voter cluster commits on local append alone; recompute the quorum in any
        // case, which also drives the post-commit processing.
        self.advance_commit_index().await;
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                let entry = match req.entries.last() {
                    Some(entry) => entry,
                    None => return,
                };
                match &entry.payload {
                    EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(entry).await {
                        Ok(data) => {
                            let _ = tx.send(Ok(ClientWriteResponse {
                                index: entry.log_id.index,
                                data,
                            }));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                        }
                    },
                    _ => {
                        // Why is this a bug, and why are we shutting down? This is because we can not easily
                        // encode these constraints in the type system, and client requests should be the only
                        // log entry types for which a `ClientOrInternalResponseTx::Client` type is used. This
                        // error should never be hit unless we've done a poor job in code review.
                        tracing::error!("critical error in pgraft, this is a programming bug, please open an issue");
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
            ClientOrInternalResponseTx::ClientMany(tx) => {
                let mut responses = Vec::with_capacity(req.entries.len());
                let mut failed = None;
                for entry in req.entries.iter() {
                    match self.apply_entry_to_state_machine(entry).await {
                        Ok(data) => responses.push(ClientWriteResponse {
                            index: entry.log_id.index,
                            data,
                        }),
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
                let _ = match failed {
                    Some(err) => tx.send(Err(ClientWriteError::RaftError(err))),
                    None => tx.send(Ok(responses)),
                };
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                let entry = match req.entries.last() {
                    Some(entry) => entry.clone(),
                    None => return,
                };
                self.handle_special_log(&entry).await;

                let res = self.apply_entry_to_state_machine(&entry).await;
                let res = match res {
                    Ok(_data) => Ok(entry.log_id.index),
                    Err(err) => {
                        tracing::error!("res of applying to state machine: {:?}", err);
                        Err(err)
                    }
                };

                self.leader_report_metrics();

                match tx {
                    None => {
                        tracing::debug!("no response tx to send res");
                    }

                    Some(tx) => {
                        let send_res = tx.send(res.map_err(ResponseError::from));
                        tracing::debug!("send internal response through tx, res: {:?}", send_res.is_ok());
                    }
                }
            }
        }

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false);
    }

    /// Act on internal entries as they commit: config changes drive the joint consensus state
    /// machine and the committed membership.
    pub(super) async fn handle_special_log(&mut self, entry: &Arc<Entry<D>>) {
        match &entry.payload {
            EntryPayload::ConfigChange(ref mem) => {
                let m = &mem.membership;
                let effective = crate::membership::EffectiveMembership::new(entry.log_id.index, m.clone());
                let _ = self.core.update_membership(effective);
                if m.is_joint() {
                    self.handle_joint_consensus_committed().await;
                } else {
                    self.handle_uniform_consensus_committed(entry.log_id.index);
                }
            }
            EntryPayload::Blank => {}
            EntryPayload::Normal(_) => {}
            EntryPayload::Barrier => {}
            EntryPayload::PurgedMarker => {}
        }
    }

    /// Apply one committed entry through the state machine and return its response.
    ///
    /// The state machine always advances in log order, so two kinds of backlog are drained
    /// first: a chunked apply task still in flight from before this node led, and entries
    /// between the applied position and this one — both only ever non-empty very early in a
    /// new leader's term, when it inherits commits it never saw acknowledged.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Arc<Entry<D>>) -> RaftResult<R> {
        if !self.core.replicate_to_sm_handle.is_empty() {
            if let Some(Ok(pending_chunk)) = self.core.replicate_to_sm_handle.next().await {
                self.core.handle_replicate_to_sm_result(pending_chunk).await?;
            }
        }

        let target = entry.log_id;
        let backlog_range = self.core.last_applied.index + 1..target.index;
        if !backlog_range.is_empty() {
            let backlog = self
                .core
                .storage
                .get_log_entries(backlog_range)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            if let Some(last) = backlog.last() {
                let last_id = last.log_id;
                let refs: Vec<_> = backlog.iter().collect();
                self.core
                    .storage
                    .apply_to_state_machine(&refs)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                self.core.last_applied = last_id;
                self.core.last_applying = last_id.index;
            }
        }

        self.core.last_applying = target.index;
        let applied = self.core.storage.apply_to_state_machine(&[entry.as_ref()]).await.map_err(|err| {
            // Only a storage-declared shutdown error poisons the node; anything else surfaces
            // to the caller as an ordinary storage failure.
            if err.downcast_ref::<S::ShutdownError>().is_some() {
                self.core.map_fatal_storage_error(err)
            } else {
                RaftError::RaftStorage(err)
            }
        });
        self.core.last_applied = target;
        self.leader_report_metrics();

        applied?
            .into_iter()
            .next()
            .ok_or_else(|| RaftError::RaftStorage(anyhow!("state machine produced no response for an applied entry")))
    }
}
