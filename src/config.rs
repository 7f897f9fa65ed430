/// Runtime configuration for the sync layer, passed in as JSON by the JS glue
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

pub const QUEUE_STORAGE_KEY: &str = "wordstream_pending_operations";
pub const BROADCAST_KEY_PREFIX: &str = "wordstream_broadcast_";
pub const MAX_BROADCAST_ENTRIES: usize = 20;
pub const REPLAY_INTERVAL_MS: u32 = 60_000;
pub const STORAGE_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub queue_key: String,
    pub broadcast_prefix: String,
    pub max_broadcast_entries: usize,
    pub replay_interval_ms: u32,
    pub storage_timeout_ms: u32,
    pub readiness: RetryPolicy,
    pub auth_retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_key: QUEUE_STORAGE_KEY.to_string(),
            broadcast_prefix: BROADCAST_KEY_PREFIX.to_string(),
            max_broadcast_entries: MAX_BROADCAST_ENTRIES,
            replay_interval_ms: REPLAY_INTERVAL_MS,
            storage_timeout_ms: STORAGE_TIMEOUT_MS,
            readiness: RetryPolicy::readiness(),
            auth_retry: RetryPolicy::auth_state(),
        }
    }
}

impl SyncConfig {
    /// Parse from the JSON handed over by the extension glue. An empty string
    /// means "all defaults".
    pub fn from_json(json: &str) -> SyncResult<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.queue_key.is_empty() {
            return Err(SyncError::Config("queueKey must not be empty".to_string()));
        }
        if self.broadcast_prefix.is_empty() {
            return Err(SyncError::Config("broadcastPrefix must not be empty".to_string()));
        }
        if self.queue_key.starts_with(&self.broadcast_prefix) {
            return Err(SyncError::Config(
                "queueKey must not share the broadcast prefix".to_string(),
            ));
        }
        if self.max_broadcast_entries == 0 {
            return Err(SyncError::Config("maxBroadcastEntries must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Exponential backoff settings: `base_delay_ms * 2^attempt`, capped at `max_delay_ms`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u32,
    pub max_delay_ms: u32,
}

impl RetryPolicy {
    pub fn readiness() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    pub fn auth_state() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> u32 {
        backoff_delay(attempt, self.base_delay_ms, self.max_delay_ms)
    }
}

pub fn backoff_delay(attempt: u32, base_ms: u32, cap_ms: u32) -> u32 {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();

        assert_eq!(config.max_broadcast_entries, 20);
        assert_eq!(config.replay_interval_ms, 60_000);
        assert_eq!(config.storage_timeout_ms, 5_000);
        assert_eq!(config.readiness.max_attempts, 5);
        assert_eq!(config.auth_retry.max_attempts, 3);
    }

    #[test]
    fn test_from_json_partial() {
        let config = SyncConfig::from_json(r#"{"maxBroadcastEntries": 5}"#).unwrap();

        assert_eq!(config.max_broadcast_entries, 5);
        assert_eq!(config.queue_key, QUEUE_STORAGE_KEY);
    }

    #[test]
    fn test_from_json_empty() {
        assert_eq!(SyncConfig::from_json("  ").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(SyncConfig::from_json(r#"{"maxBroadcastEntries": 0}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"queueKey": ""}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"queueKey": "wordstream_broadcast_q"}"#).is_err());
        assert!(SyncConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(0, 100, 2_000), 100);
        assert_eq!(backoff_delay(1, 100, 2_000), 200);
        assert_eq!(backoff_delay(4, 100, 2_000), 1_600);
        assert_eq!(backoff_delay(5, 100, 2_000), 2_000);
        assert_eq!(backoff_delay(40, 100, 2_000), 2_000);
    }
}
