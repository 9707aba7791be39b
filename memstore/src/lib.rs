//! An in-memory storage engine implementing the `pgraft::RaftStorage` trait, for demo and
//! testing purposes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use pgraft::async_trait::async_trait;
use pgraft::membership::EffectiveMembership;
use pgraft::membership::Membership;
use pgraft::pgrep::PgrepHooks;
use pgraft::pgrep::PgrepScope;
use pgraft::raft::Entry;
use pgraft::raft::EntryPayload;
use pgraft::storage::HardState;
use pgraft::storage::InitialState;
use pgraft::storage::Snapshot;
use pgraft::AppData;
use pgraft::AppDataResponse;
use pgraft::LogId;
use pgraft::NodeId;
use pgraft::RaftStorage;
use pgraft::RaftStorageDebug;
use pgraft::SnapshotMeta;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should probably
    /// be an enum representing all of the various types of requests / operations which a client
    /// can perform.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` works with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// The errors of the `MemStore` which cause Raft to shut down.
#[derive(Clone, Debug, Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// The application snapshot type which the `MemStore` works with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemStoreSnapshot {
    pub meta: SnapshotMeta,

    /// The data of the state machine at the time of this snapshot.
    pub data: Vec<u8>,
}

/// The state machine of the `MemStore`.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,

    /// The latest membership config applied by the state machine.
    pub last_membership: Option<EffectiveMembership>,

    /// A mapping of client IDs to their state info: the serial of their latest request and the
    /// previous status recorded for them.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
    /// Every applied command payload, in apply order; tests assert ordering against this.
    pub applied_commands: Vec<ClientRequest>,
}

/// A record of the pgrep hook traffic, so tests can observe the throttle.
#[derive(Debug, Default)]
pub struct PgrepStats {
    pub replicate_permits: AtomicU64,
    pub replicate_unpermits: AtomicU64,
    pub apply_permits: AtomicU64,
    pub apply_unpermits: AtomicU64,
    pub ticks: AtomicU64,
    pub boundary: Mutex<Option<LogId>>,
    pub checkpoint_resets: AtomicU64,
}

/// An in-memory storage system implementing the `pgraft::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this memory storage instances is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// A counter to distinguish snapshots built over the same boundary.
    snapshot_idx: Arc<Mutex<u64>>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,

    /// When set, pgrep permits are denied; replication and apply of fenced traffic pause.
    pgrep_deny: AtomicBool,
    /// When set, this store confirms pgrep boundary resyncs, emulating an external catch-up
    /// process which has delivered the state machine out-of-band.
    pgrep_boundary_confirm: AtomicBool,
    /// Counters recording the pgrep hook traffic.
    pgrep_stats: PgrepStats,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(MemStoreStateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);

        Self {
            id,
            log,
            sm,
            hs,
            snapshot_idx: Arc::new(Mutex::new(0)),
            current_snapshot,
            pgrep_deny: AtomicBool::new(false),
            pgrep_boundary_confirm: AtomicBool::new(false),
            pgrep_stats: PgrepStats::default(),
        }
    }

    /// Create a new `MemStore` instance with some existing state (for testing).
    pub fn new_with_state(
        id: NodeId,
        log: BTreeMap<u64, Entry<ClientRequest>>,
        sm: MemStoreStateMachine,
        hs: Option<HardState>,
        current_snapshot: Option<MemStoreSnapshot>,
    ) -> Self {
        Self {
            id,
            log: RwLock::new(log),
            sm: RwLock::new(sm),
            hs: RwLock::new(hs),
            snapshot_idx: Arc::new(Mutex::new(0)),
            current_snapshot: RwLock::new(current_snapshot),
            pgrep_deny: AtomicBool::new(false),
            pgrep_boundary_confirm: AtomicBool::new(false),
            pgrep_stats: PgrepStats::default(),
        }
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> tokio::sync::RwLockWriteGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.write().await
    }

    /// Deny or grant pgrep permits from here on; denial pauses fenced traffic.
    pub fn set_pgrep_deny(&self, deny: bool) {
        self.pgrep_deny.store(deny, Ordering::SeqCst);
    }

    /// Emulate an external catch-up process having delivered the state machine out-of-band:
    /// boundary resyncs offered by pgrep-flagged traffic will be confirmed.
    pub fn set_pgrep_boundary_confirm(&self, confirm: bool) {
        self.pgrep_boundary_confirm.store(confirm, Ordering::SeqCst);
    }

    /// The record of pgrep hook traffic.
    pub fn pgrep_stats(&self) -> &PgrepStats {
        &self.pgrep_stats
    }

    /// Find the most recent membership config in the log suffix, else in the snapshot.
    async fn membership_from_log(&self) -> Option<EffectiveMembership> {
        let log = self.log.read().await;
        for (index, entry) in log.iter().rev() {
            if let EntryPayload::ConfigChange(ref change) = entry.payload {
                return Some(EffectiveMembership::new(*index, change.membership.clone()));
            }
        }
        drop(log);

        let snapshot = self.current_snapshot.read().await;
        snapshot
            .as_ref()
            .map(|snap| EffectiveMembership::new(snap.meta.membership_log_index, snap.meta.membership.clone()))
    }
}

#[async_trait]
impl PgrepHooks for MemStore {
    async fn pgrep_permit(&self, scope: PgrepScope) -> bool {
        match scope {
            PgrepScope::Replicate => self.pgrep_stats.replicate_permits.fetch_add(1, Ordering::SeqCst),
            PgrepScope::Apply => self.pgrep_stats.apply_permits.fetch_add(1, Ordering::SeqCst),
        };
        !self.pgrep_deny.load(Ordering::SeqCst)
    }

    async fn pgrep_unpermit(&self, scope: PgrepScope) {
        match scope {
            PgrepScope::Replicate => self.pgrep_stats.replicate_unpermits.fetch_add(1, Ordering::SeqCst),
            PgrepScope::Apply => self.pgrep_stats.apply_unpermits.fetch_add(1, Ordering::SeqCst),
        };
    }

    async fn pgrep_tick(&self) {
        self.pgrep_stats.ticks.fetch_add(1, Ordering::SeqCst);
    }

    async fn pgrep_boundary(&self, log_id: LogId) -> bool {
        if !self.pgrep_boundary_confirm.load(Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut boundary) = self.pgrep_stats.boundary.lock() {
            *boundary = Some(log_id);
        }
        true
    }

    async fn pgrep_reset_checkpoint(&self) {
        self.pgrep_stats.checkpoint_resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    async fn get_membership_config(&self) -> Result<EffectiveMembership> {
        match self.membership_from_log().await {
            Some(membership) => Ok(membership),
            None => Ok(EffectiveMembership::new(0, Membership::new_initial(self.id))),
        }
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = match log.values().rev().next() {
                    Some(entry) => entry.log_id,
                    None => sm.last_applied_log,
                };
                let last_applied_log = sm.last_applied_log;
                Ok(InitialState {
                    last_log_id,
                    last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial(self.id);
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(index, _)| *index).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(inner) => {
                    let data = &inner.data;
                    if let Some((serial, prev)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(prev.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    sm.applied_commands.push(data.clone());
                    res.push(ClientResponse(previous));
                }
                EntryPayload::ConfigChange(change) => {
                    sm.last_membership = Some(EffectiveMembership::new(entry.log_id.index, change.membership.clone()));
                    res.push(ClientResponse(None));
                }
                // Blank, Barrier and PurgedMarker entries advance the applied position only.
                _ => res.push(ClientResponse(None)),
            }
        }
        Ok(res)
    }

    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log, membership);
        {
            // Serialize the data of the state machine.
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
            membership = sm.last_membership.clone();
        }
        let membership = match membership {
            Some(membership) => membership,
            None => self.get_membership_config().await?,
        };

        let snapshot_idx = {
            let mut snapshot_idx = match self.snapshot_idx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *snapshot_idx += 1;
            *snapshot_idx
        };

        let meta;
        {
            let mut log = self.log.write().await;
            let mut current_snapshot = self.current_snapshot.write().await;

            // Leaves at least one log or the replication of the snapshot will not complete.
            let keys: Vec<u64> = log.range(..last_applied_log.index).map(|(index, _)| *index).collect();
            for key in keys {
                log.remove(&key);
            }

            let snapshot_id = format!("{}-{}-{}", last_applied_log.term, last_applied_log.index, snapshot_idx);

            meta = SnapshotMeta {
                last_log_id: last_applied_log,
                snapshot_id,
                membership: membership.membership.clone(),
                membership_log_index: membership.log_index,
            };

            let snapshot = MemStoreSnapshot {
                meta: meta.clone(),
                data: data.clone(),
            };

            *current_snapshot = Some(snapshot);
        }

        tracing::info!({ snapshot_size = data.len() }, "log compaction complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        tracing::info!(
            { snapshot_size = snapshot.get_ref().len() },
            "decoding snapshot for installation"
        );

        let new_snapshot = MemStoreSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        {
            // Replace the log with the snapshot boundary marker.
            let mut log = self.log.write().await;
            let keys: Vec<u64> = log.range(..=meta.last_log_id.index).map(|(index, _)| *index).collect();
            for key in keys {
                log.remove(&key);
            }
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));

            // Replace the state machine with the contents of the snapshot.
            let new_sm: MemStoreStateMachine = serde_json::from_slice(&new_snapshot.data)?;
            let mut sm = self.sm.write().await;
            *sm = new_sm;
        }

        // Update current snapshot.
        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(new_snapshot);
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}
