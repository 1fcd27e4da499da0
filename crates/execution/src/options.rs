//! Per-run execution options

use config::ExecutionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for one `execute()` run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    /// Keep going after a failed or cancelled item
    pub continue_on_error: bool,
    /// Group consecutive extrinsics of one signer into `batch_all`
    pub allow_batching: bool,
    /// Finality timeout per broadcast
    pub timeout_seconds: u64,
    /// Process items one at a time in index order
    pub sequential: bool,
    /// Skip approval prompts
    pub auto_approve: bool,
    pub max_batch_size: usize,
}

impl ExecutionOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            allow_batching: true,
            timeout_seconds: 300,
            sequential: true,
            auto_approve: false,
            max_batch_size: 100,
        }
    }
}

impl From<&ExecutionConfig> for ExecutionOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            continue_on_error: config.continue_on_error,
            allow_batching: config.allow_batching,
            timeout_seconds: config.timeout_seconds,
            sequential: config.sequential,
            auto_approve: config.auto_approve,
            max_batch_size: config.max_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ExecutionOptions::default();
        assert!(options.sequential);
        assert!(options.allow_batching);
        assert!(!options.auto_approve);
        assert_eq!(options.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: ExecutionOptions =
            serde_json::from_str(r#"{ "continueOnError": true, "autoApprove": true }"#).unwrap();
        assert!(options.continue_on_error);
        assert!(options.auto_approve);
        assert_eq!(options.max_batch_size, 100);
    }

    #[test]
    fn test_from_config() {
        let config = ExecutionConfig {
            timeout_seconds: 5,
            sequential: false,
            ..ExecutionConfig::default()
        };
        let options = ExecutionOptions::from(&config);
        assert_eq!(options.timeout_seconds, 5);
        assert!(!options.sequential);
    }
}
