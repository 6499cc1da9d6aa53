//! Raft configuration (timeouts, limits, tuning parameters).

use std::time::Duration;

/// Raft configuration.
///
/// Controls election timeouts, replication pacing, snapshot triggers, and
/// membership-change behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Follower inactivity bound.
    ///
    /// If a follower hears nothing from a leader within a randomized
    /// interval in `[heartbeat_timeout, 2 * heartbeat_timeout)`, it starts
    /// an election.
    ///
    /// Default: 200ms
    pub heartbeat_timeout: Duration,

    /// Candidate patience bound.
    ///
    /// A candidate that cannot assemble a majority within a randomized
    /// interval in `[election_timeout, 2 * election_timeout)` restarts the
    /// election in a new term.
    ///
    /// Default: 200ms
    pub election_timeout: Duration,

    /// Replicator heartbeat pacing.
    ///
    /// Each follower replicator wakes at least this often to send an
    /// AppendEntries (possibly empty), keeping followers from timing out.
    /// Must be well below `heartbeat_timeout`.
    ///
    /// Default: 80ms
    pub commit_timeout: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Limits message size and processing time per RPC.
    ///
    /// Default: 64 entries
    pub max_append_entries: usize,

    /// Base interval between snapshot checks (randomized to `[i, 2i)` so a
    /// cluster does not snapshot in lockstep).
    ///
    /// Default: 2 minutes
    pub snapshot_interval: Duration,

    /// Log delta (last index - first index) that triggers a snapshot.
    ///
    /// Default: 8192 entries
    pub snapshot_threshold: u64,

    /// Entries retained past a snapshot during compaction, so slow
    /// followers can catch up via appends rather than a full snapshot
    /// install.
    ///
    /// Default: 10240 entries
    pub trailing_logs: u64,

    /// Whether the node shuts itself down after applying a RemovePeer
    /// entry that excludes it. When false it steps down to follower and
    /// idles instead.
    ///
    /// Default: true
    pub shutdown_on_remove: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(200),
            election_timeout: Duration::from_millis(200),
            commit_timeout: Duration::from_millis(80),
            max_append_entries: 64,
            snapshot_interval: Duration::from_secs(120),
            snapshot_threshold: 8192,
            trailing_logs: 10240,
            shutdown_on_remove: true,
        }
    }
}

impl Config {
    /// Validate configuration (ensure invariants hold).
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_timeout < Duration::from_millis(5) {
            return Err(format!(
                "heartbeat_timeout ({:?}) is too low",
                self.heartbeat_timeout
            ));
        }

        if self.election_timeout < Duration::from_millis(5) {
            return Err(format!(
                "election_timeout ({:?}) is too low",
                self.election_timeout
            ));
        }

        // Replicators must beat the follower inactivity bound.
        if self.commit_timeout >= self.heartbeat_timeout {
            return Err(format!(
                "commit_timeout ({:?}) must be < heartbeat_timeout ({:?})",
                self.commit_timeout, self.heartbeat_timeout
            ));
        }

        if self.max_append_entries == 0 {
            return Err("max_append_entries must be > 0".to_string());
        }

        Ok(())
    }
}

/// Randomized timeout uniform in `[d, 2d)`.
///
/// Randomization prevents split votes and synchronized snapshotting.
pub(crate) fn random_timeout(d: Duration) -> Duration {
    use rand::Rng;
    let base = d.as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..base.max(1));
    Duration::from_millis(base + extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_commit_timeout() {
        let config = Config {
            commit_timeout: Duration::from_millis(500),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_max_append_entries() {
        let config = Config {
            max_append_entries: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_timeout_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let t = random_timeout(base);
            assert!(t >= base);
            assert!(t < base * 2);
        }
    }
}
