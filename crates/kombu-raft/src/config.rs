//! Server configuration (timeouts, limits, tuning parameters).

use std::time::Duration;

/// Leader-side configuration.
///
/// Controls the heartbeat cadence, the staleness window after which a
/// partitioned leader abdicates, and session liveness.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Heartbeat interval (leader → followers).
    ///
    /// The leader sends AppendEntries (empty or catch-up) at this interval.
    /// Must be < election_timeout to keep followers from starting elections.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Election timeout.
    ///
    /// If the leader cannot reach a quorum for this long, it steps down to
    /// follower rather than continuing to serve possibly-stale reads.
    ///
    /// Default: 500ms
    pub election_timeout: Duration,

    /// Session timeout.
    ///
    /// A session with no committed keep-alive for this long is marked
    /// unstable by the state machine and expired by the leader.
    ///
    /// Default: 5000ms
    pub session_timeout: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Limits message size and per-RPC processing time.
    ///
    /// Default: 1000 entries
    pub max_entries_per_append: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout: Duration::from_millis(500),
            session_timeout: Duration::from_millis(5000),
            max_entries_per_append: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate configuration (ensure invariants hold).
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout ({:?})",
                self.heartbeat_interval, self.election_timeout
            ));
        }

        if self.session_timeout < self.election_timeout {
            return Err(format!(
                "session_timeout ({:?}) must be >= election_timeout ({:?})",
                self.session_timeout, self.election_timeout
            ));
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_heartbeat_too_long() {
        let mut config = ServerConfig::default();
        config.heartbeat_interval = Duration::from_millis(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_session_timeout() {
        let mut config = ServerConfig::default();
        config.session_timeout = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }
}
