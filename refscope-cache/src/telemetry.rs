//! Tracing subscriber setup for binaries embedding the cache.

use refscope_core::ConfigError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "refscope_cache=info,refscope_events=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines.
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `refscope_cache=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Read `REFSCOPE_LOG` and `REFSCOPE_LOG_FORMAT` (`json` or `pretty`).
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Append an `EnvFilter` directive, e.g. to enable a binary's own target.
    pub fn with_directive(mut self, directive: &str) -> Self {
        self.filter = format!("{},{}", self.filter, directive);
        self
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            filter: lookup("REFSCOPE_LOG")
                .filter(|f| !f.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: match lookup("REFSCOPE_LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => defaults.format,
            },
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. Fails if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "REFSCOPE_LOG".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| ConfigError::TelemetryInit {
        reason: e.to_string(),
    })?;

    tracing::info!(filter = %config.filter, format = ?config.format, "Telemetry initialized");
    Ok(())
}
