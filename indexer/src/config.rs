use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::redis_canvas::DEFAULT_CANVAS_KEY;

const DEFAULT_EVENT_BUFFER: usize = 1_024;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_UPDATES_BROADCAST_BUFFER: usize = 1_024;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const DEFAULT_HISTORY_MAX_LIMIT: usize = 1_000;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 256 * 1024;
const DEFAULT_FANOUT_CHANNEL: &str = "pixelchain.pixels";

/// What to do with an extra-pixel consumption that exceeds the recorded allowance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowancePolicy {
    /// Reject the event and leave the allowance untouched.
    #[default]
    Strict,
    /// Apply it anyway; `available` may go negative.
    Permissive,
}

impl std::str::FromStr for AllowancePolicy {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            _ => Err("valid values: strict, permissive"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct IndexerConfig {
    pub allowance_policy: AllowancePolicy,
    pub event_buffer: Option<usize>,
    /// `None` disables the periodic sweep.
    pub reconcile_interval_ms: Option<u64>,
    pub updates_broadcast_buffer: Option<usize>,
    pub history_default_limit: Option<usize>,
    pub history_max_limit: Option<usize>,
    pub http_body_limit_bytes: Option<usize>,
    pub canvas_redis_url: Option<String>,
    pub canvas_key: Option<String>,
    pub ledger_path: Option<PathBuf>,
    pub ledger_url: Option<String>,
    pub fanout_redis_url: Option<String>,
    pub fanout_channel: Option<String>,
    pub fanout_origin: Option<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            allowance_policy: AllowancePolicy::Strict,
            event_buffer: Some(DEFAULT_EVENT_BUFFER),
            reconcile_interval_ms: Some(DEFAULT_RECONCILE_INTERVAL_MS),
            updates_broadcast_buffer: Some(DEFAULT_UPDATES_BROADCAST_BUFFER),
            history_default_limit: Some(DEFAULT_HISTORY_LIMIT),
            history_max_limit: Some(DEFAULT_HISTORY_MAX_LIMIT),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            canvas_redis_url: None,
            canvas_key: Some(DEFAULT_CANVAS_KEY.to_string()),
            ledger_path: None,
            ledger_url: None,
            fanout_redis_url: None,
            fanout_channel: Some(DEFAULT_FANOUT_CHANNEL.to_string()),
            fanout_origin: None,
        }
    }
}

impl IndexerConfig {
    pub fn event_buffer_capacity(&self) -> usize {
        self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER).max(1)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn updates_broadcast_capacity(&self) -> usize {
        self.updates_broadcast_buffer
            .unwrap_or(DEFAULT_UPDATES_BROADCAST_BUFFER)
            .max(1)
    }

    pub fn http_body_limit(&self) -> usize {
        self.http_body_limit_bytes
            .unwrap_or(DEFAULT_HTTP_BODY_LIMIT_BYTES)
            .max(1)
    }

    pub fn canvas_key(&self) -> &str {
        self.canvas_key.as_deref().unwrap_or(DEFAULT_CANVAS_KEY)
    }

    pub fn fanout_channel(&self) -> &str {
        self.fanout_channel
            .as_deref()
            .unwrap_or(DEFAULT_FANOUT_CHANNEL)
    }

    /// Clamp a requested history page size; an absent or zero request takes the default.
    pub fn history_limit(&self, requested: Option<usize>) -> usize {
        let max = self.history_max_limit.unwrap_or(usize::MAX).max(1);
        let default = self
            .history_default_limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .max(1);
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(default)
            .min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowance_policy_from_str() {
        assert_eq!("strict".parse::<AllowancePolicy>(), Ok(AllowancePolicy::Strict));
        assert_eq!("PERMISSIVE".parse::<AllowancePolicy>(), Ok(AllowancePolicy::Permissive));
        assert!("lenient".parse::<AllowancePolicy>().is_err());
        assert_eq!(AllowancePolicy::default(), AllowancePolicy::Strict);
    }

    #[test]
    fn test_history_limit_clamps() {
        let config = IndexerConfig::default();
        assert_eq!(config.history_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.history_limit(Some(0)), DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.history_limit(Some(5)), 5);
        assert_eq!(config.history_limit(Some(50_000)), DEFAULT_HISTORY_MAX_LIMIT);

        let unbounded = IndexerConfig {
            history_max_limit: None,
            ..IndexerConfig::default()
        };
        assert_eq!(unbounded.history_limit(Some(50_000)), 50_000);
    }

    #[test]
    fn test_zero_reconcile_interval_disables_sweep() {
        let config = IndexerConfig {
            reconcile_interval_ms: Some(0),
            ..IndexerConfig::default()
        };
        assert_eq!(config.reconcile_interval(), None);
        assert_eq!(
            IndexerConfig::default().reconcile_interval(),
            Some(Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS))
        );
    }
}
