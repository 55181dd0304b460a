//! Engine configuration.

use crate::merge::{ConflictStrategy, DEFAULT_LINE_ITEMS_FIELD};
use crate::retry::RetryPolicy;
use std::env;
use std::time::Duration;

/// Default prefix of local storage keys.
pub const DEFAULT_STORAGE_PREFIX: &str = "tandem_collection_";

/// Default user key when nobody is signed in.
pub const DEFAULT_ANONYMOUS_KEY: &str = "anonymous";

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Retry policy for remote operations
    pub retry: RetryPolicy,
    /// Initial conflict strategy
    pub conflict_strategy: ConflictStrategy,
    /// Prefix of local storage keys
    pub storage_prefix: String,
    /// User key used when nobody is signed in
    pub anonymous_key: String,
    /// Pause before a queued upload runs
    pub queue_drain_delay: Duration,
    /// Sync automatically when connectivity returns
    pub auto_sync: bool,
    /// Name of the nested line-items field used by field-level merge
    pub line_items_field: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            conflict_strategy: ConflictStrategy::default(),
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            anonymous_key: DEFAULT_ANONYMOUS_KEY.to_string(),
            queue_drain_delay: Duration::from_millis(100),
            auto_sync: true,
            line_items_field: DEFAULT_LINE_ITEMS_FIELD.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a `.env` file if one exists, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_retries = parse_or(&lookup, "SYNC_MAX_RETRIES", defaults.retry.max_retries)?;
        let base_delay = millis_or(&lookup, "SYNC_BASE_DELAY_MS", defaults.retry.base_delay)?;
        let max_delay = millis_or(&lookup, "SYNC_MAX_DELAY_MS", defaults.retry.max_delay)?;
        let conflict_strategy = match lookup("SYNC_CONFLICT_STRATEGY") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("SYNC_CONFLICT_STRATEGY", &raw))?,
            None => defaults.conflict_strategy,
        };
        let queue_drain_delay = millis_or(
            &lookup,
            "SYNC_QUEUE_DRAIN_DELAY_MS",
            defaults.queue_drain_delay,
        )?;
        let auto_sync = match lookup("SYNC_AUTO_SYNC") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::invalid("SYNC_AUTO_SYNC", &raw))?,
            None => defaults.auto_sync,
        };

        Ok(Self {
            retry: RetryPolicy {
                max_retries,
                base_delay,
                max_delay,
            },
            conflict_strategy,
            storage_prefix: lookup("SYNC_STORAGE_PREFIX").unwrap_or(defaults.storage_prefix),
            anonymous_key: lookup("SYNC_ANONYMOUS_KEY")
                .filter(|key| !key.is_empty())
                .unwrap_or(defaults.anonymous_key),
            queue_drain_delay,
            auto_sync,
            line_items_field: lookup("SYNC_LINE_ITEMS_FIELD")
                .filter(|field| !field.is_empty())
                .unwrap_or(defaults.line_items_field),
        })
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the initial conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the local storage key prefix.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Sets the anonymous user key.
    pub fn with_anonymous_key(mut self, key: impl Into<String>) -> Self {
        self.anonymous_key = key.into();
        self
    }

    /// Sets the pause before a queued upload runs.
    pub fn with_queue_drain_delay(mut self, delay: Duration) -> Self {
        self.queue_drain_delay = delay;
        self
    }

    /// Enables or disables auto sync.
    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    /// Sets the line-items field name.
    pub fn with_line_items_field(mut self, field: impl Into<String>) -> Self {
        self.line_items_field = field.into();
        self
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(name, &raw)),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, name, default_ms).map(Duration::from_millis)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {name} value: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.retry.max_delay, Duration::from_millis(10_000));
        assert_eq!(config.conflict_strategy, ConflictStrategy::LatestWins);
        assert_eq!(config.storage_prefix, "tandem_collection_");
        assert_eq!(config.anonymous_key, "anonymous");
        assert_eq!(config.queue_drain_delay, Duration::from_millis(100));
        assert!(config.auto_sync);
        assert_eq!(config.line_items_field, "items");
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from_pairs(&[]).unwrap(), EngineConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("SYNC_MAX_RETRIES", "5"),
            ("SYNC_BASE_DELAY_MS", "250"),
            ("SYNC_MAX_DELAY_MS", "4000"),
            ("SYNC_CONFLICT_STRATEGY", "manual"),
            ("SYNC_STORAGE_PREFIX", "app_"),
            ("SYNC_ANONYMOUS_KEY", "guest"),
            ("SYNC_QUEUE_DRAIN_DELAY_MS", "0"),
            ("SYNC_AUTO_SYNC", "off"),
            ("SYNC_LINE_ITEMS_FIELD", "lines"),
        ])
        .unwrap();

        assert_eq!(
            config.retry,
            RetryPolicy::new(5)
                .with_base_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_millis(4000))
        );
        assert_eq!(config.conflict_strategy, ConflictStrategy::Manual);
        assert_eq!(config.storage_prefix, "app_");
        assert_eq!(config.anonymous_key, "guest");
        assert_eq!(config.queue_drain_delay, Duration::ZERO);
        assert!(!config.auto_sync);
        assert_eq!(config.line_items_field, "lines");
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = from_pairs(&[("SYNC_MAX_RETRIES", "many")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "SYNC_MAX_RETRIES",
                value: "many".into()
            }
        );

        assert!(from_pairs(&[("SYNC_CONFLICT_STRATEGY", "coin_flip")]).is_err());
        assert!(from_pairs(&[("SYNC_AUTO_SYNC", "maybe")]).is_err());
        assert!(from_pairs(&[("SYNC_BASE_DELAY_MS", "-1")]).is_err());
    }

    #[test]
    fn builders() {
        let config = EngineConfig::default()
            .with_retry(RetryPolicy::no_retry())
            .with_conflict_strategy(ConflictStrategy::Merge)
            .with_storage_prefix("p_")
            .with_anonymous_key("anon")
            .with_queue_drain_delay(Duration::from_millis(5))
            .with_auto_sync(false)
            .with_line_items_field("entries");

        assert_eq!(config.retry, RetryPolicy::no_retry());
        assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
        assert_eq!(config.storage_prefix, "p_");
        assert_eq!(config.anonymous_key, "anon");
        assert_eq!(config.queue_drain_delay, Duration::from_millis(5));
        assert!(!config.auto_sync);
        assert_eq!(config.line_items_field, "entries");
    }
}
