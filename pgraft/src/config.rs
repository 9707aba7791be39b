//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default timeout for sending a snapshot segment, in milliseconds.
const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;
/// Default maximum number of entries per replication payload.
const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default cap on dispatched-but-unacknowledged entries per pipelined stream.
const DEFAULT_INFLIGHT_LOG_THRESHOLD: u64 = 1000;
/// Default maximum number of entries submitted to the state machine per apply chunk.
const DEFAULT_APPLY_BATCH_SIZE: u64 = 8;
/// Default snapshot chunk size, 3MiB.
const DEFAULT_SNAPSHOT_MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 3;
/// Default number of logs to keep before compaction.
const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default number of compacted entries kept in memory behind the snapshot boundary.
const DEFAULT_SNAPSHOT_TRAILING: u64 = 128;
/// Default timeout for a membership catch-up round, in milliseconds.
const DEFAULT_CATCH_UP_TIMEOUT: u64 = 2000;

/// Log compaction and snapshot policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft clusters which will
/// be running with nodes in multiple datacenter availability zones with low intra-zone latency.
/// These values should typically be made configurable from the perspective of the application
/// which is being built on top of Raft.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    ///
    /// Defaults to 50 milliseconds.
    ///
    /// **NOTE WELL:** it is very important that this value be greater than the amount of time
    /// it will take on average for heartbeat frames to be sent between nodes. No data processing
    /// is performed for heartbeats, so the main item of concern here is network latency. This
    /// value is also used as the default timeout for sending heartbeats.
    pub heartbeat_interval: u64,
    /// The timeout for sending then waiting on a response for a single snapshot segment.
    pub install_snapshot_timeout: u64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The maximum number of dispatched-but-unacknowledged entries a pipelined replication
    /// stream may run ahead of its target's acknowledged position.
    ///
    /// Once a stream's optimistic `next_index` is this far past the matched index it stops
    /// issuing new payloads until acknowledgements catch up or a heartbeat interval elapses.
    pub inflight_log_threshold: u64,
    /// The maximum number of committed entries submitted to the state machine per apply chunk.
    ///
    /// Applying in chunks gives control back to the event loop between chunks, which matters
    /// when an external catch-up process is throttling apply through the pgrep permits.
    pub apply_batch_size: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The number of log entries kept in memory behind the snapshot boundary after compaction,
    /// so that slightly lagging followers can still be served from memory.
    pub snapshot_trailing: u64,
    /// The maximum snapshot chunk size allowed when transmitting snapshots (in bytes).
    pub snapshot_max_chunk_size: u64,
    /// The timeout for a single membership catch-up round, in milliseconds.
    ///
    /// Promoting a server to a voting role first brings it up-to-date in rounds; a promotion
    /// whose round does not complete within this window is rejected.
    pub catch_up_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            install_snapshot_timeout: None,
            max_payload_entries: None,
            inflight_log_threshold: None,
            apply_batch_size: None,
            snapshot_policy: None,
            snapshot_trailing: None,
            snapshot_max_chunk_size: None,
            catch_up_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
///
/// For API documentation, see the corresponding fields of the [`Config`] type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    pub cluster_name: String,
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub install_snapshot_timeout: Option<u64>,
    pub max_payload_entries: Option<u64>,
    pub inflight_log_threshold: Option<u64>,
    pub apply_batch_size: Option<u64>,
    pub snapshot_policy: Option<SnapshotPolicy>,
    pub snapshot_trailing: Option<u64>,
    pub snapshot_max_chunk_size: Option<u64>,
    pub catch_up_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `inflight_log_threshold`.
    pub fn inflight_log_threshold(mut self, val: u64) -> Self {
        self.inflight_log_threshold = Some(val);
        self
    }

    /// Set the desired value for `apply_batch_size`.
    pub fn apply_batch_size(mut self, val: u64) -> Self {
        self.apply_batch_size = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_trailing`.
    pub fn snapshot_trailing(mut self, val: u64) -> Self {
        self.snapshot_trailing = Some(val);
        self
    }

    /// Set the desired value for `snapshot_max_chunk_size`.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the desired value for `catch_up_timeout`.
    pub fn catch_up_timeout(mut self, val: u64) -> Self {
        self.catch_up_timeout = Some(val);
        self
    }

    /// Validate the state of this builder, returning a new `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        // Roll a random election time out based on the configured min & max or their respective defaults.
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutLessThanHeartBeatInterval);
        }
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let inflight_log_threshold = self.inflight_log_threshold.unwrap_or(DEFAULT_INFLIGHT_LOG_THRESHOLD).max(1);
        let apply_batch_size = self.apply_batch_size.unwrap_or(DEFAULT_APPLY_BATCH_SIZE).max(1);
        let snapshot_policy = self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
        let snapshot_trailing = self.snapshot_trailing.unwrap_or(DEFAULT_SNAPSHOT_TRAILING);
        let snapshot_max_chunk_size = self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_MAX_CHUNK_SIZE);
        let catch_up_timeout = self.catch_up_timeout.unwrap_or(DEFAULT_CATCH_UP_TIMEOUT);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            install_snapshot_timeout,
            max_payload_entries,
            inflight_log_threshold,
            apply_batch_size,
            snapshot_policy,
            snapshot_trailing,
            snapshot_max_chunk_size,
            catch_up_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().expect("valid config");
        assert_eq!(cfg.cluster_name, "cluster0");
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.max_payload_entries, DEFAULT_MAX_PAYLOAD_ENTRIES);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build("cluster0".into()).election_timeout_min(300).election_timeout_max(100).validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn test_rand_election_timeout_is_within_bounds() {
        let cfg = Config::build("cluster0".into()).validate().expect("valid config");
        for _ in 0..100 {
            let timeout = cfg.new_rand_election_timeout();
            assert!(timeout >= cfg.election_timeout_min);
            assert!(timeout < cfg.election_timeout_max);
        }
    }
}
