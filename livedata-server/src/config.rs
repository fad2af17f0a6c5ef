//! View configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Memory bounds for a [`SessionCollectionView`](crate::SessionCollectionView).
///
/// Durations are millisecond counts so the struct loads from JSON as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewOptions {
    /// LRU capacity; the least recently touched document is evicted past it.
    pub max_documents: usize,
    /// Documents untouched for longer than this are dropped by the sweeper.
    pub document_ttl_ms: u64,
    /// Period of the background sweep. Zero disables it.
    pub cleanup_interval_ms: u64,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            max_documents: 10_000,
            document_ttl_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl ViewOptions {
    /// Parse options from a JSON object; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn document_ttl(&self) -> Duration {
        Duration::from_millis(self.document_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ViewOptions::default();
        assert_eq!(options.max_documents, 10_000);
        assert_eq!(options.document_ttl(), Duration::from_secs(3600));
        assert_eq!(options.cleanup_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options = ViewOptions::from_json(r#"{"max_documents": 5}"#).unwrap();
        assert_eq!(options.max_documents, 5);
        assert_eq!(options.document_ttl_ms, 3_600_000);
    }
}
