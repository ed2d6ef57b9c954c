//! Reference cache configuration.
//!
//! Loaded from environment variables with defaults suited to an interactive
//! console. Every field can also be set through the builder methods.

use std::time::Duration;

use crate::error::ConfigError;

/// Configuration shared by every repository created from one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceConfig {
    /// Coalescing window before a flush runs. Zero means "next scheduler tick".
    pub flush_delay: Duration,
    /// Global cap on concurrently running fetches. `None` means unbounded.
    pub max_concurrent_fetches: Option<usize>,
    /// How long an id omitted from a successful fetch stays unrequestable.
    /// `None` means until the reference query is refreshed.
    pub missing_retry_after: Option<Duration>,
    /// Freshness window of a full preload.
    pub preload_ttl: Duration,
    /// Upper bound on ids per fetch call.
    pub max_batch_size: usize,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::ZERO,
            max_concurrent_fetches: None,
            missing_retry_after: None,
            preload_ttl: Duration::from_secs(3 * 3600), // 3 hours
            max_batch_size: 100,
        }
    }
}

impl ReferenceConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the coalescing window.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Cap concurrent fetches across all repositories.
    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = Some(max);
        self
    }

    /// Allow ids reported missing to be requested again after `after`.
    pub fn with_missing_retry_after(mut self, after: Duration) -> Self {
        self.missing_retry_after = Some(after);
        self
    }

    /// Set the preload freshness window.
    pub fn with_preload_ttl(mut self, ttl: Duration) -> Self {
        self.preload_ttl = ttl;
        self
    }

    /// Set the maximum ids per fetch.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `REFSCOPE_FLUSH_DELAY_MS`: coalescing window in ms (default: 0)
    /// - `REFSCOPE_MAX_CONCURRENT_FETCHES`: global fetch cap (default: unbounded)
    /// - `REFSCOPE_MISSING_RETRY_AFTER_SECS`: not-found retry window (default: never)
    /// - `REFSCOPE_PRELOAD_TTL_SECS`: preload freshness window (default: 10800)
    /// - `REFSCOPE_MAX_BATCH_SIZE`: ids per fetch (default: 100)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create a config from an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_u64 = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            flush_delay: parse_u64("REFSCOPE_FLUSH_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_delay),
            max_concurrent_fetches: parse_u64("REFSCOPE_MAX_CONCURRENT_FETCHES")
                .map(|n| n as usize)
                .or(defaults.max_concurrent_fetches),
            missing_retry_after: parse_u64("REFSCOPE_MISSING_RETRY_AFTER_SECS")
                .map(Duration::from_secs)
                .or(defaults.missing_retry_after),
            preload_ttl: parse_u64("REFSCOPE_PRELOAD_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.preload_ttl),
            max_batch_size: parse_u64("REFSCOPE_MAX_BATCH_SIZE")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_batch_size),
        }
    }

    /// Reject values that would stall every fetch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_fetches == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_fetches".to_string(),
                value: "0".to_string(),
                reason: "must allow at least one fetch".to_string(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_batch_size".to_string(),
                value: "0".to_string(),
                reason: "must allow at least one id per fetch".to_string(),
            });
        }
        Ok(())
    }
}
