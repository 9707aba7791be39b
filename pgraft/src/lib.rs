#![doc = include_str!("../README.md")]

pub mod config;
mod core;
pub mod error;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod pgrep;
mod progress;
mod quorum;
pub mod raft;
mod replication;
pub mod storage;

use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::ChangeConfigError;
pub use crate::error::ClientReadError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::InitializeError;
pub use crate::error::RaftError;
pub use crate::error::ResponseError;
pub use crate::membership::EffectiveMembership;
pub use crate::membership::Group;
pub use crate::membership::Membership;
pub use crate::membership::MembershipPhase;
pub use crate::membership::Server;
pub use crate::membership::ServerRole;
pub use crate::metrics::RaftMetrics;
pub use crate::pgrep::PgrepHooks;
pub use crate::pgrep::PgrepScope;
pub use crate::raft::Raft;
pub use crate::replication::ReplicationMetrics;
pub use crate::storage::RaftStorage;
pub use crate::storage::RaftStorageDebug;
pub use crate::storage::SnapshotMeta;

/// A Raft node's ID.
///
/// `0` is reserved as the "none" sentinel and never identifies a real server.
pub type NodeId = u64;

/// The identity of a snapshot.
pub type SnapshotId = String;

/// The identity of a segment of a snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl<D: ToString> From<(D, u64)> for SnapshotSegmentId {
    fn from(v: (D, u64)) -> Self {
        SnapshotSegmentId {
            id: v.0.to_string(),
            offset: v.1,
        }
    }
}

impl Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

/// The id of a log entry: the term it was created in and its 1-based position in the log.
///
/// `(0, 0)` identifies the empty log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl From<(u64, u64)> for LogId {
    fn from(v: (u64, u64)) -> Self {
        LogId::new(v.0, v.1)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through Raft. Instead, applications can present their data
/// models as-is to Raft, Raft will present it to the application's `RaftStorage` impl when ready,
/// and the application may then deal with the data directly in the storage engine without having
/// to do a preliminary deserialization.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types for returning response data from the storage layer when an
/// entry is applied to the state machine as part of a client request (this is not used during
/// replication). This allows applications to seamlessly return application specific data from
/// their storage layer, up through Raft, and back into their application for returning data to
/// clients.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A short, concise summary of a message suitable for logging.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

impl<T: MessageSummary> MessageSummary for Option<T> {
    fn summary(&self) -> String {
        match self {
            None => "None".to_string(),
            Some(x) => format!("Some({})", x.summary()),
        }
    }
}

/// An update action with option to update with some value or just leave it as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
