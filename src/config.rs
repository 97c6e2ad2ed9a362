use crate::errors::{SyncError, SyncResult};
use crate::models::EntityType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::time::Duration;

const MIN_FETCH_TIMEOUT_MS: u64 = 100;
const MAX_FETCH_TIMEOUT_MS: u64 = 120_000;
const MAX_INITIAL_LOAD_ATTEMPTS: u32 = 10;
const MIN_DEDUPE_WINDOW: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub cache_ttl_ms: u64,
    pub fetch_timeout_ms: u64,
    pub initial_load_attempts: u32,
    pub initial_backoff_step_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub dedupe_window: usize,
    pub watched: Vec<EntityType>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5 * 60 * 1_000,
            fetch_timeout_ms: 10_000,
            initial_load_attempts: 3,
            initial_backoff_step_ms: 1_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            dedupe_window: 4_096,
            watched: EntityType::ALL.to_vec(),
        }
    }
}

impl SyncSettings {
    pub fn from_yaml_str(raw: &str) -> SyncResult<Self> {
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.cache_ttl_ms == 0 {
            return Err(SyncError::Config("cacheTtlMs must be positive".to_string()));
        }
        if !(MIN_FETCH_TIMEOUT_MS..=MAX_FETCH_TIMEOUT_MS).contains(&self.fetch_timeout_ms) {
            return Err(SyncError::Config(format!(
                "fetchTimeoutMs {} is out of allowed range ({}..={})",
                self.fetch_timeout_ms, MIN_FETCH_TIMEOUT_MS, MAX_FETCH_TIMEOUT_MS
            )));
        }
        if !(1..=MAX_INITIAL_LOAD_ATTEMPTS).contains(&self.initial_load_attempts) {
            return Err(SyncError::Config(format!(
                "initialLoadAttempts {} is out of allowed range (1..={})",
                self.initial_load_attempts, MAX_INITIAL_LOAD_ATTEMPTS
            )));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(SyncError::Config(format!(
                "reconnect backoff base {}ms must be positive and not exceed cap {}ms",
                self.reconnect_base_ms, self.reconnect_cap_ms
            )));
        }
        if self.dedupe_window < MIN_DEDUPE_WINDOW {
            return Err(SyncError::Config(format!(
                "dedupeWindow {} is below minimum {}",
                self.dedupe_window, MIN_DEDUPE_WINDOW
            )));
        }
        if self.watched.is_empty() {
            return Err(SyncError::Config("at least one entity type must be watched".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.cache_ttl_ms).unwrap_or(i64::MAX / 2))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Linear: attempt 1 waits one step, attempt 2 two steps.
    pub fn initial_backoff(&self, failed_attempt: u32) -> Duration {
        Duration::from_millis(self.initial_backoff_step_ms.saturating_mul(u64::from(failed_attempt)))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        SyncSettings::default().reconnect_policy()
    }
}

impl ReconnectPolicy {
    /// Exponential in the number of consecutive failures, clamped to the cap.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let shift = consecutive_failures.saturating_sub(1);
        let multiplier: u32 = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = SyncSettings::default();
        settings.validate().expect("defaults are valid");
        assert_eq!(settings.cache_ttl(), chrono::Duration::minutes(5));
        assert_eq!(settings.fetch_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn initial_backoff_is_linear() {
        let settings = SyncSettings::default();
        assert_eq!(settings.initial_backoff(1), Duration::from_secs(1));
        assert_eq!(settings.initial_backoff(2), Duration::from_secs(2));
        assert_eq!(settings.initial_backoff(3), Duration::from_secs(3));
    }

    #[test]
    fn reconnect_backoff_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        let delays = (1..=7).map(|n| policy.delay(n).as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay(64), Duration::from_secs(30));
    }

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let settings = SyncSettings::from_yaml_str("fetchTimeoutMs: 2500\nwatched: [deal]\n")
            .expect("parse settings");
        assert_eq!(settings.fetch_timeout_ms, 2_500);
        assert_eq!(settings.watched, vec![EntityType::Deal]);
        assert_eq!(settings.initial_load_attempts, 3);
    }

    #[test]
    fn rejects_out_of_bounds_values() {
        let err = SyncSettings::from_yaml_str("fetchTimeoutMs: 5\n").expect_err("timeout too small");
        assert!(matches!(err, SyncError::Config(_)));

        let err = SyncSettings::from_yaml_str("watched: []\n").expect_err("nothing watched");
        assert!(err.to_string().starts_with("CONFIG_INVALID"));

        let err = SyncSettings::from_yaml_str("reconnectBaseMs: 5000\nreconnectCapMs: 1000\n")
            .expect_err("base above cap");
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sync.yaml");
        std::fs::write(&path, "cacheTtlMs: 60000\n").expect("write settings");
        let settings = SyncSettings::load(&path).expect("load settings");
        assert_eq!(settings.cache_ttl(), chrono::Duration::minutes(1));
    }
}
