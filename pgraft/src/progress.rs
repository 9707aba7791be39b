//! Per-follower replication progress.
//!
//! A `Progress` tracks what the leader knows about one follower's log and which replication
//! mode the follower is in:
//!
//! - `Probe`: conservative one-payload-at-a-time matching, at most one send per heartbeat
//!   interval, used until the follower's log position is known.
//! - `Pipeline`: the follower is matched; entries stream ahead with `next_index` advanced
//!   optimistically per dispatched payload.
//! - `Snapshot`: the follower is too far behind to be served from the log window and is being
//!   sent a snapshot; entry replication is paused until the install finishes or times out.
//!
//! Every transition between the three modes goes through the methods here; callers never write
//! the fields directly.

use tokio::time::Duration;
use tokio::time::Instant;

use crate::LogId;

/// The replication mode of a single follower.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProgressState {
    Probe,
    Pipeline,
    Snapshot,
}

/// The leader's view of one follower's replication state.
#[derive(Clone, Debug)]
pub(crate) struct Progress {
    pub state: ProgressState,
    /// The index of the next log entry to send.
    pub next_index: u64,
    /// The id of the most recent entry known to be replicated on the target.
    pub matched: LogId,
    /// The last index of the snapshot being installed; meaningful only in `Snapshot` state.
    pub snapshot_index: u64,
    /// When the last replication payload was dispatched.
    pub last_send: Option<Instant>,
    /// When the last snapshot segment was dispatched.
    pub snapshot_last_send: Option<Instant>,
    /// Whether anything was heard back from the target since the last probe reset.
    pub recent_recv: bool,
    /// Whether this target is being fenced by the pgrep catch-up throttle.
    pub pgreplicating: bool,
}

impl Progress {
    /// A fresh progress for a newly observed follower: probing from the leader's head.
    pub fn new(last_log_id: LogId) -> Self {
        Self {
            state: ProgressState::Probe,
            next_index: last_log_id.index + 1,
            matched: LogId::default(),
            snapshot_index: 0,
            last_send: None,
            snapshot_last_send: None,
            recent_recv: false,
            pgreplicating: false,
        }
    }

    pub fn become_probe(&mut self) {
        // Leaving Snapshot state means the pending snapshot made it over; probe from just after
        // its boundary. Otherwise probe from the last matched position.
        if self.state == ProgressState::Snapshot {
            self.next_index = (self.matched.index + 1).max(self.snapshot_index + 1);
        } else {
            self.next_index = self.matched.index + 1;
        }
        self.state = ProgressState::Probe;
        self.snapshot_index = 0;
        self.last_send = None;
        self.snapshot_last_send = None;
    }

    pub fn become_pipeline(&mut self) {
        self.state = ProgressState::Pipeline;
        self.snapshot_index = 0;
        self.next_index = self.next_index.max(self.matched.index + 1);
    }

    pub fn become_snapshot(&mut self, snapshot_index: u64) {
        self.state = ProgressState::Snapshot;
        self.snapshot_index = snapshot_index;
        self.snapshot_last_send = None;
    }

    /// Give up on the in-flight snapshot and fall back to probing.
    pub fn abort_snapshot(&mut self) {
        self.snapshot_index = 0;
        self.state = ProgressState::Probe;
        self.next_index = self.matched.index + 1;
        self.last_send = None;
    }

    /// Record a successful replication up to `log_id`. Returns true if the match advanced.
    pub fn maybe_update(&mut self, log_id: LogId) -> bool {
        self.recent_recv = true;
        if log_id.index <= self.matched.index {
            return false;
        }
        self.matched = log_id;
        if self.next_index < log_id.index + 1 {
            self.next_index = log_id.index + 1;
        }
        true
    }

    /// Advance `next_index` past a payload that was dispatched but not yet acknowledged.
    pub fn optimistic_next(&mut self, next_index: u64) {
        if next_index > self.next_index {
            self.next_index = next_index;
        }
    }

    /// Process a rejection for `rejected` from a follower whose log ends at `last_log_index`.
    ///
    /// Returns true when the rejection was accepted and `next_index` (or the snapshot) was
    /// adjusted; stale rejections are ignored.
    pub fn maybe_decrement(&mut self, rejected: u64, last_log_index: u64) -> bool {
        match self.state {
            ProgressState::Snapshot => {
                // Only a rejection of the snapshot boundary itself can fail the install.
                if rejected == self.snapshot_index {
                    self.abort_snapshot();
                    return true;
                }
                false
            }
            ProgressState::Pipeline => {
                if rejected <= self.matched.index {
                    if last_log_index == 1 {
                        // The follower restarted with an almost empty log; everything we
                        // believed about it is stale.
                        self.matched = LogId::default();
                        self.next_index = 1;
                        self.become_probe();
                        return true;
                    }
                    return false;
                }
                self.next_index = rejected.min(self.matched.index + 1).max(1);
                self.become_probe();
                true
            }
            ProgressState::Probe => {
                if rejected != self.next_index.saturating_sub(1) {
                    return false;
                }
                self.next_index = rejected.min(last_log_index + 1).max(1);
                true
            }
        }
    }

    /// Check if the target has replicated everything up to the leader's head.
    pub fn is_up_to_date(&self, last_log_index: u64) -> bool {
        self.matched.index >= last_log_index
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    pub fn mark_snapshot_sent(&mut self, now: Instant) {
        self.snapshot_last_send = Some(now);
    }

    /// The number of entries dispatched ahead of the target's acknowledged position.
    pub fn inflight(&self) -> u64 {
        self.next_index.saturating_sub(self.matched.index + 1)
    }

    /// Decide whether another payload should be dispatched to this target now.
    ///
    /// A pipelined target is only streamed to while the optimistic window stays under
    /// `inflight_threshold`; a closed window reopens on acknowledgements or, failing that, on
    /// the heartbeat. In `Snapshot` state an elapsed install timeout aborts the snapshot as a
    /// side effect, so the caller falls back to probing on the next pass.
    pub fn should_replicate(
        &mut self,
        now: Instant,
        heartbeat: Duration,
        snapshot_timeout: Duration,
        inflight_threshold: u64,
        last_log_index: u64,
    ) -> bool {
        let heartbeat_elapsed = match self.last_send {
            Some(at) => now.saturating_duration_since(at) >= heartbeat,
            None => true,
        };
        match self.state {
            ProgressState::Probe => heartbeat_elapsed,
            ProgressState::Pipeline => {
                (!self.is_up_to_date(last_log_index) && self.inflight() < inflight_threshold) || heartbeat_elapsed
            }
            ProgressState::Snapshot => {
                if let Some(at) = self.snapshot_last_send {
                    if now.saturating_duration_since(at) >= snapshot_timeout {
                        self.abort_snapshot();
                        return true;
                    }
                }
                heartbeat_elapsed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_at(matched: u64, next: u64) -> Progress {
        let mut p = Progress::new(LogId::new(1, matched));
        p.matched = LogId::new(1, matched);
        p.next_index = next;
        p.state = ProgressState::Pipeline;
        p
    }

    #[test]
    fn test_new_progress_probes_from_leader_head() {
        let p = Progress::new(LogId::new(3, 7));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 8);
        assert_eq!(p.matched, LogId::default());
    }

    #[test]
    fn test_maybe_update_is_monotonic() {
        let mut p = Progress::new(LogId::new(1, 5));
        assert!(p.maybe_update(LogId::new(1, 3)));
        assert!(!p.maybe_update(LogId::new(1, 2)));
        assert_eq!(p.matched, LogId::new(1, 3));
        assert_eq!(p.next_index, 6);
        assert!(p.maybe_update(LogId::new(1, 9)));
        assert_eq!(p.next_index, 10);
    }

    #[test]
    fn test_probe_ignores_stale_rejections() {
        let mut p = Progress::new(LogId::new(1, 10));
        // next_index is 11, so only a rejection of 10 is current.
        assert!(!p.maybe_decrement(7, 9));
        assert!(p.maybe_decrement(10, 4));
        assert_eq!(p.next_index, 5);
    }

    #[test]
    fn test_pipeline_rejection_falls_back_to_probe() {
        let mut p = pipeline_at(4, 9);
        assert!(p.maybe_decrement(7, 6));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 5);
    }

    #[test]
    fn test_pipeline_stale_rejection_reinitializes_on_restarted_follower() {
        let mut p = pipeline_at(4, 9);
        assert!(!p.maybe_decrement(3, 8));
        // last_log_index of 1 means the follower holds nothing we believed it had.
        assert!(p.maybe_decrement(3, 1));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 1);
        assert_eq!(p.matched, LogId::default());
    }

    #[test]
    fn test_snapshot_rejection_only_aborts_on_boundary() {
        let mut p = Progress::new(LogId::new(1, 20));
        p.matched = LogId::new(1, 2);
        p.become_snapshot(15);
        assert!(!p.maybe_decrement(10, 2));
        assert_eq!(p.state, ProgressState::Snapshot);
        assert!(p.maybe_decrement(15, 2));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.snapshot_index, 0);
    }

    #[test]
    fn test_probe_after_snapshot_starts_past_boundary() {
        let mut p = Progress::new(LogId::new(1, 20));
        p.become_snapshot(15);
        p.maybe_update(LogId::new(1, 15));
        p.become_probe();
        assert_eq!(p.next_index, 16);
        assert_eq!(p.snapshot_index, 0);
    }

    #[test]
    fn test_should_replicate_per_state() {
        let heartbeat = Duration::from_millis(50);
        let snap_timeout = Duration::from_millis(200);
        let inflight_max = 8;
        let now = Instant::now();

        let mut p = Progress::new(LogId::new(1, 5));
        assert!(p.should_replicate(now, heartbeat, snap_timeout, inflight_max, 5));
        p.mark_sent(now);
        assert!(!p.should_replicate(now, heartbeat, snap_timeout, inflight_max, 5));
        assert!(p.should_replicate(now + heartbeat, heartbeat, snap_timeout, inflight_max, 5));

        p.become_pipeline();
        p.mark_sent(now);
        // Not up-to-date: pipeline keeps streaming regardless of the heartbeat.
        assert!(p.should_replicate(now, heartbeat, snap_timeout, inflight_max, 5));
        p.matched = LogId::new(1, 5);
        assert!(!p.should_replicate(now, heartbeat, snap_timeout, inflight_max, 5));

        p.become_snapshot(9);
        p.mark_snapshot_sent(now);
        p.mark_sent(now);
        assert!(!p.should_replicate(now, heartbeat, snap_timeout, inflight_max, 5));
        // An elapsed install timeout aborts the snapshot.
        assert!(p.should_replicate(now + snap_timeout, heartbeat, snap_timeout, inflight_max, 5));
        assert_eq!(p.state, ProgressState::Probe);
    }

    #[test]
    fn test_pipeline_pauses_on_a_full_inflight_window() {
        let heartbeat = Duration::from_millis(50);
        let snap_timeout = Duration::from_millis(200);
        let now = Instant::now();

        let mut p = pipeline_at(4, 5);
        p.mark_sent(now);
        // Optimistically run 8 entries ahead of the matched position.
        p.optimistic_next(13);
        assert_eq!(p.inflight(), 8);

        // Behind the head but the window is closed: wait for acknowledgements.
        assert!(!p.should_replicate(now, heartbeat, snap_timeout, 8, 20));
        // An acknowledgement reopens the window.
        assert!(p.maybe_update(LogId::new(1, 12)));
        assert_eq!(p.inflight(), 0);
        assert!(p.should_replicate(now, heartbeat, snap_timeout, 8, 20));

        // A closed window still yields to the heartbeat so the target is never starved.
        p.optimistic_next(21);
        assert!(p.should_replicate(now + heartbeat, heartbeat, snap_timeout, 8, 30));
    }
}
