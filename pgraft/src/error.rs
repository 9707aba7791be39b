//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::membership::ServerRole;
use crate::AppData;
use crate::NodeId;
use crate::SnapshotSegmentId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
    /// The node entered a state in which its data can no longer be trusted.
    ///
    /// This is raised when an AppendEntries request carries a term conflicting with an entry at
    /// or below the local commit index, which indicates on-disk corruption or a protocol
    /// violation. The node becomes unavailable and only an external teardown can recover it.
    #[error("the log conflicts with already committed entries")]
    CorruptLog,
    /// Received an out-of-order snapshot segment.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError<D: AppData> {
    /// An error related to the processing of the client write request.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeader(D, Option<NodeId>),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeaderMany(Vec<D>, Option<NodeId>),
}

/// An error related to a client read request.
#[derive(Debug, Error)]
pub enum ClientReadError {
    /// An error related to the processing of the client read request.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client read request must be forwarded to the cluster leader.
    #[error("the client read request must be forwarded to the cluster leader")]
    ForwardToLeader(Option<NodeId>),
}

/// An error related to an init with config request.
#[derive(Debug, Error)]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the Raft node's current state")]
    NotAllowed,
}

/// An error related to a change membership request.
#[derive(Debug, Error)]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The cluster is already undergoing a configuration change.
    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,
    /// A membership catch-up round for another server is already in flight.
    #[error("a membership catch-up round is already in flight")]
    Busy,
    /// The given config would leave the cluster in an inoperable state.
    ///
    /// This error will be returned if the full set of changes, once fully applied, would leave
    /// the cluster with less than one voter in any active group.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The node the config change proposal was sent to was not the leader of the cluster.
    ///
    /// The optional field will contain the ID of the current leader if known.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// The requested server id is the "none" sentinel or already exists in the configuration.
    #[error("the given server id is reserved or already a cluster member")]
    DuplicateId(NodeId),
    /// The requested server is not part of the configuration.
    #[error("the given server id is not a cluster member")]
    NotFound(NodeId),
    /// The requested role assignment is not meaningful for the target server.
    #[error("role {1:?} can not be assigned to server {0}")]
    BadRole(NodeId, ServerRole),
    /// The promotee could not be brought up-to-date within the catch-up round timeout.
    #[error("server {0} could not catch up with the leader's log in time")]
    NoConnection(NodeId),
    /// The proposed config change would have no effect, this is a no-op.
    #[error("the proposed config change would have no effect, this is a no-op")]
    Noop,
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("{0}")]
    ChangeConfig(#[from] ChangeConfigError),
    #[error("{0}")]
    Raft(#[from] RaftError),
}

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid. Max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The election timeout must be greater than the heartbeat interval.
    #[error("election timeout must be greater than heartbeat interval")]
    ElectionTimeoutLessThanHeartBeatInterval,
    /// The value for max_payload_entries must be greater than 0.
    #[error("the value for max_payload_entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}

/// Error variants raised by the in-memory log.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LogError {
    /// The range can not be truncated while part of it is acquired for IO.
    #[error("the log range starting at {0} is acquired and can not be truncated")]
    LogBusy(u64),
    /// The requested range starts at or below the snapshot boundary.
    #[error("the log range starting at {0} has been compacted into a snapshot")]
    Compacted(u64),
    /// The requested range is beyond the end of the log.
    #[error("index {0} is beyond the last log index")]
    OutOfRange(u64),
}

/// Error variants raised while encoding or decoding a membership configuration.
#[derive(Debug, Error, Eq, PartialEq, Serialize, Deserialize)]
pub enum MembershipError {
    /// The server id is the reserved "none" sentinel.
    #[error("server id 0 is reserved")]
    BadId,
    /// A server with the same id already exists in the configuration.
    #[error("server {0} already exists in the configuration")]
    DuplicateId(NodeId),
    /// The role code does not name a known role.
    #[error("unknown role code {0}")]
    BadRole(u8),
    /// The encoded configuration blob is malformed.
    #[error("malformed configuration blob")]
    Malformed,
}
