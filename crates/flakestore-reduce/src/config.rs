//! Configuration of the deduplication manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the deduplication manager and its background tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Period of the tree analysis task in milliseconds.
    pub analysis_interval_ms: u64,
    /// Pause of the deduplication task between two files in milliseconds.
    pub dedup_interval_ms: u64,
    /// Files at this level or above are no longer candidates.
    pub max_level: i8,
    /// Opening an open manager or closing a closed one is an error.
    pub strict: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: 60_000,
            dedup_interval_ms: 1_000,
            max_level: 1,
            strict: false,
        }
    }
}

impl DedupConfig {
    /// Period of the analysis task.
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms.max(1))
    }

    /// Pause between two deduplicated files.
    pub fn dedup_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.max_level, 1);
        assert!(!config.strict);
        assert_eq!(config.analysis_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DedupConfig =
            serde_json::from_str(r#"{"strict": true, "dedup_interval_ms": 5}"#).unwrap();
        assert!(config.strict);
        assert_eq!(config.dedup_interval(), Duration::from_millis(5));
        assert_eq!(config.max_level, 1);
    }

    #[test]
    fn test_zero_analysis_interval_is_clamped() {
        let config = DedupConfig {
            analysis_interval_ms: 0,
            ..DedupConfig::default()
        };
        assert_eq!(config.analysis_interval(), Duration::from_millis(1));
    }
}
