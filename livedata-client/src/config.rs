//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::SUPPORTED_DDP_VERSIONS;

/// Options recognized by [`Connection`](crate::connection::Connection).
///
/// Durations are plain millisecond counts so the struct can be loaded from
/// JSON as-is; a zero heartbeat interval disables the heartbeat and a zero
/// buffered-writes interval flushes every data message immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Whether the transport should keep reconnecting after a drop.
    pub retry: bool,
    /// Delay between transport reconnect attempts.
    pub retry_delay_ms: u64,
    pub respond_to_pings: bool,
    /// Batch document writes arriving within this gap.
    pub buffered_writes_interval_ms: u64,
    /// Flush anyway once a batch has been open this long.
    pub buffered_writes_max_age_ms: u64,
    /// Allow a reload/migration while methods are still outstanding.
    pub reload_with_outstanding: bool,
    pub supported_ddp_versions: Vec<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 17_500,
            heartbeat_timeout_ms: 15_000,
            retry: true,
            retry_delay_ms: 1_000,
            respond_to_pings: true,
            buffered_writes_interval_ms: 5,
            buffered_writes_max_age_ms: 500,
            reload_with_outstanding: false,
            supported_ddp_versions: SUPPORTED_DDP_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl ConnectionOptions {
    /// Parse options from a JSON object; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn buffered_writes_interval(&self) -> Duration {
        Duration::from_millis(self.buffered_writes_interval_ms)
    }

    pub fn buffered_writes_max_age(&self) -> Duration {
        Duration::from_millis(self.buffered_writes_max_age_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Options suited to deterministic tests: no heartbeat, no write batching.
    pub fn unbuffered() -> Self {
        Self {
            heartbeat_interval_ms: 0,
            buffered_writes_interval_ms: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.heartbeat_interval(), Duration::from_millis(17_500));
        assert_eq!(opts.buffered_writes_max_age(), Duration::from_millis(500));
        assert_eq!(opts.supported_ddp_versions, vec!["1", "pre2", "pre1"]);
        assert!(opts.respond_to_pings);
        assert!(!opts.reload_with_outstanding);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts = ConnectionOptions::from_json(
            r#"{"buffered_writes_interval_ms": 0, "supported_ddp_versions": ["1"]}"#,
        )
        .unwrap();
        assert_eq!(opts.buffered_writes_interval_ms, 0);
        assert_eq!(opts.supported_ddp_versions, vec!["1"]);
        assert_eq!(opts.heartbeat_timeout_ms, 15_000);
    }
}
