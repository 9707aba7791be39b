//! Partial-replication (pgrep) throttling hooks.
//!
//! An external catch-up process may copy state machine data to a lagging standby out-of-band,
//! faster than entry-by-entry replication could. While it runs, the core must not race it: the
//! leader asks for a permit before dispatching catch-up AppendEntries and before running the
//! apply loop, and a follower accepting pgrep-flagged traffic resynchronizes its snapshot
//! boundary to the leader's `prev_log_id` when the copy process has already carried it past its
//! own durable log.
//!
//! The hooks are part of the storage contract; every method defaults to a no-op that always
//! grants, so storage implementations without an external catch-up process need nothing extra.

use async_trait::async_trait;

use crate::LogId;

/// What a pgrep permit is being requested for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgrepScope {
    /// Dispatching a catch-up AppendEntries payload to a fenced target.
    Replicate,
    /// Running the apply loop against the local state machine.
    Apply,
}

/// Hooks through which the consensus core coordinates with an external catch-up process.
#[async_trait]
pub trait PgrepHooks: Send + Sync + 'static {
    /// Ask for a permit for the given scope. Denial defers the work to the next tick.
    async fn pgrep_permit(&self, _scope: PgrepScope) -> bool {
        true
    }

    /// Release a permit previously granted for the given scope.
    async fn pgrep_unpermit(&self, _scope: PgrepScope) {}

    /// Periodic notification from the leader's heartbeat tick.
    async fn pgrep_tick(&self) {}

    /// A pgrep-flagged AppendEntries wants to move this node's snapshot boundary to `log_id`.
    ///
    /// Return true only when the external catch-up process has delivered the state machine
    /// contents through `log_id`; the core then adopts it as the local snapshot boundary and
    /// truncates everything after. The default refuses, which makes the leader walk back and
    /// replicate the history entry by entry instead.
    async fn pgrep_boundary(&self, _log_id: LogId) -> bool {
        false
    }

    /// Reset the external process's checkpoint position after a truncation or restore.
    async fn pgrep_reset_checkpoint(&self) {}

    /// Report how long the most recent catch-up round has been running, in milliseconds.
    async fn pgrep_update_catchup_time(&self, _elapsed_ms: u64) {}
}
