//! Error types for the mirror coordinator
//!
//! Provides structured error types for link discovery, path management,
//! placement, pair lifecycle, failover, and configuration loading.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the coordinator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Connectivity / Topology Errors
    // =========================================================================
    #[error("{target} is not connected to {source_array}")]
    NoPhysicalLinks { source_array: String, target: String },

    #[error("Invalid port pair: {invalid}, valid port pair(s) are: {valid}")]
    InvalidPortPair { invalid: String, valid: String },

    #[error(
        "The path(s) for volume {volume} are not available any more, make sure the \
         state of the path(s) whose source container is {container} is success"
    )]
    PathUnhealthy { volume: String, container: String },

    #[error("Failed to create replication path {source_container}:{target_container}")]
    PathCreationFailed {
        source_container: String,
        target_container: String,
    },

    #[error("Array unreachable: {array}")]
    ArrayUnreachable { array: String },

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("No eligible container on array {array}: {reason}")]
    CapacityExhausted { array: String, reason: String },

    // =========================================================================
    // Failover Errors
    // =========================================================================
    #[error("Cannot fail back: {reason}")]
    FailbackUnavailable { reason: String },

    #[error("Volume {volume} is {state}, cannot {operation}")]
    InvalidTransition {
        volume: String,
        state: String,
        operation: String,
    },

    // =========================================================================
    // Pair Lifecycle Errors
    // =========================================================================
    #[error("Mirror pair(s) {volumes} did not reach {state} within {waited:?}")]
    PairStateTimeout {
        volumes: String,
        state: String,
        waited: Duration,
    },

    #[error("Failed to delete the target volume for volume {volume}: {reason}")]
    ReplicaDeletionFailed { volume: String, reason: String },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Array operation failed: {array} - {operation}: {reason}")]
    BackendOperationFailed {
        array: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    #[error("Timed out waiting for lease {name}")]
    LeaseTimeout { name: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Port pair parse error: {0}")]
    PortPairParse(String),

    #[error("Container range parse error: {0}")]
    ContainerRangeParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the caller should take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RequeueWithBackoff,
    /// Retry after specific duration
    RequeueAfter(Duration),
    /// Don't retry, operator intervention needed
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::ArrayUnreachable { .. }
            | Error::LeaseTimeout { .. }
            | Error::BackendOperationFailed { .. } => ErrorAction::RequeueWithBackoff,

            // Pairs still copying - wait
            Error::PairStateTimeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            // Resource issues - medium retry
            Error::CapacityExhausted { .. } | Error::PathCreationFailed { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Needs the operator to fix links, config, or bring the array back
            Error::Configuration(_)
            | Error::NoPhysicalLinks { .. }
            | Error::InvalidPortPair { .. }
            | Error::PathUnhealthy { .. }
            | Error::FailbackUnavailable { .. }
            | Error::InvalidTransition { .. }
            | Error::PortPairParse(_)
            | Error::ContainerRangeParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if the array reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }
}

/// Result type alias for the coordinator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::PairStateTimeout {
            volumes: "1000".into(),
            state: "full_duplex".into(),
            waited: Duration::from_secs(600),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(300))
        );

        let err = Error::FailbackUnavailable {
            reason: "primary down".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::CapacityExhausted {
            array: "ds8k-a".into(),
            reason: "all containers full".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::ArrayUnreachable {
            array: "ds8k-b".into(),
        };
        assert!(transient.is_retryable());
        assert_eq!(transient.action(), ErrorAction::RequeueWithBackoff);

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_invalid_port_pair_message() {
        let err = Error::InvalidPortPair {
            invalid: "I0001-I0009".into(),
            valid: "I0001-I0101;I0002-I0102".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid port pair: I0001-I0009, valid port pair(s) are: I0001-I0101;I0002-I0102"
        );
    }
}
