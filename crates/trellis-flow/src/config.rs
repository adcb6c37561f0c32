//! Configuration for the flow service.

use serde::{Deserialize, Serialize};

/// Tunables for the flow service and its orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowServiceConfig {
    /// Number of worker partitions. Flow ids are consistently hashed
    /// across workers, which is what enforces one live operation per
    /// flow id without a lock service.
    pub workers: usize,
    /// Retries allowed per speaker command before it fails terminally.
    pub command_retry_limit: u32,
    /// Deadline for one speaker command attempt, in milliseconds.
    pub command_timeout_ms: u64,
    /// Interval between timeout-scan ticks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Retries for persistence transactions on recoverable conflicts.
    pub transaction_retries: u32,
    /// Fixed delay between transaction retries, in milliseconds.
    pub transaction_retry_delay_ms: u64,
    /// Bound of the history channel; overflow drops entries.
    pub history_buffer: usize,
}

impl Default for FlowServiceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            command_retry_limit: 3,
            command_timeout_ms: 10_000,
            tick_interval_ms: 500,
            transaction_retries: 3,
            transaction_retry_delay_ms: 0,
            history_buffer: 1024,
        }
    }
}

impl FlowServiceConfig {
    /// Per-attempt command deadline.
    #[must_use]
    pub fn command_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.command_timeout_ms).unwrap_or(i64::MAX))
    }

    /// Tick interval as a std duration.
    #[must_use]
    pub const fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }

    /// Transaction retry delay as a std duration.
    #[must_use]
    pub const fn transaction_retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.transaction_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FlowServiceConfig::default();
        assert!(config.workers >= 1);
        assert!(config.command_retry_limit > 0);
        assert!(config.tick_interval_ms < config.command_timeout_ms);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: FlowServiceConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(
            config.command_retry_limit,
            FlowServiceConfig::default().command_retry_limit
        );
    }
}
