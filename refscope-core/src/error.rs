//! Error types for refscope operations

use crate::ScopeTier;
use thiserror::Error;

/// Transport layer errors raised by fetch functions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request for {resource_key} failed: {reason}")]
    RequestFailed { resource_key: String, reason: String },

    #[error("Request for {resource_key} timed out")]
    Timeout { resource_key: String },

    #[error("Response for {resource_key} could not be decoded: {reason}")]
    Decode { resource_key: String, reason: String },
}

/// Scope resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Scope unresolved for {resource_key}: missing {missing:?} value")]
    Unresolved {
        resource_key: String,
        missing: ScopeTier,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Telemetry initialization failed: {reason}")]
    TelemetryInit { reason: String },
}

/// Errors produced while synchronizing a mutation result into the cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Mutation result for {resource_key} carries no `{id_key}` field")]
    MissingId { resource_key: String, id_key: String },

    #[error("Mutation result could not be serialized: {reason}")]
    Serialize { reason: String },
}

/// Master error type for all refscope errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),
}

impl RefError {
    /// Shorthand for a failed transport request.
    pub fn request_failed(resource_key: impl Into<String>, reason: impl Into<String>) -> Self {
        TransportError::RequestFailed {
            resource_key: resource_key.into(),
            reason: reason.into(),
        }
        .into()
    }
}

/// Result type alias for refscope operations.
pub type RefResult<T> = Result<T, RefError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::RequestFailed {
            resource_key: "project".to_string(),
            reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("project"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_scope_error_names_missing_tier() {
        let err = ScopeError::Unresolved {
            resource_key: "region".to_string(),
            missing: ScopeTier::Workspace,
        };
        assert!(format!("{}", err).contains("Workspace"));
    }

    #[test]
    fn test_ref_error_from_transport() {
        let err: RefError = TransportError::Timeout {
            resource_key: "project".to_string(),
        }
        .into();
        assert!(matches!(err, RefError::Transport(TransportError::Timeout { .. })));
        assert!(format!("{}", err).starts_with("Transport error"));
    }

    #[test]
    fn test_request_failed_shorthand() {
        let err = RefError::request_failed("provider", "503");
        assert_eq!(
            err,
            RefError::Transport(TransportError::RequestFailed {
                resource_key: "provider".to_string(),
                reason: "503".to_string(),
            })
        );
    }

    #[test]
    fn test_mutation_error_display() {
        let err = MutationError::MissingId {
            resource_key: "project".to_string(),
            id_key: "project_id".to_string(),
        };
        assert!(format!("{}", err).contains("project_id"));
    }
}
