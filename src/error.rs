//! Error types for spotctl
//!
//! One structured error enum for the whole crate. Expected skips (instance
//! not running, already attached, not replaceable) are modelled as engine
//! outcomes, not errors; the variants here cover real failures plus the
//! launch/swap terminal states.

use thiserror::Error;

/// Main error type for spotctl
#[derive(Error, Debug)]
pub enum SpotctlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Underlying cloud call failed transiently; caller retries on the next
    /// scheduling tick.
    #[error("Cloud capability error: {operation} for {instance_id} - {message}")]
    Capability {
        operation: String,
        instance_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Instance not found in registry: {0}")]
    InstanceNotFound(String),

    #[error("Unknown instance type: {0}")]
    UnknownInstanceType(String),

    #[error("No compatible spot instance type for {instance_id}")]
    NoCompatibleType { instance_id: String },

    #[error("Spot capacity exhausted replacing {instance_id}: {message}")]
    InsufficientCapacity {
        instance_id: String,
        message: String,
    },

    #[error("Launch failed for {instance_id} (last type {instance_type}): {message}")]
    LaunchFailed {
        instance_id: String,
        instance_type: String,
        message: String,
    },

    /// Spot replacement is missing its target tag; nothing to swap against.
    #[error("Spot instance {instance_id} is missing the launched-for-replacing-instance tag")]
    MissingReplacementTag { instance_id: String },

    /// The tagged on-demand target could not be re-described or has left the
    /// registry; the spot replacement was terminated.
    #[error("Replacement target {target_id} of spot instance {instance_id} is gone")]
    ReplacementTargetGone {
        instance_id: String,
        target_id: String,
    },

    /// The target no longer qualifies for replacement; the spot replacement
    /// was terminated.
    #[error("Instance {instance_id} should not be replaced with spot: {reason}")]
    NotReplaceable {
        instance_id: String,
        reason: String,
    },

    /// Attach was rejected; the spot replacement was terminated and the next
    /// run can try again.
    #[error("Couldn't attach spot instance {instance_id} to group {group}: {message}")]
    AttachFailed {
        instance_id: String,
        group: String,
        message: String,
    },

    /// Swap half-completed: the spot instance is attached but the on-demand
    /// member survived. No rollback; operator intervention required.
    #[error("Couldn't terminate on-demand instance {instance_id} in group {group}: {message}")]
    TerminateFailed {
        instance_id: String,
        group: String,
        message: String,
    },

    #[error("Retryable error (attempt {attempt}/{max_attempts}): {reason}")]
    Retryable {
        attempt: u32,
        max_attempts: u32,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SpotctlError>;

/// Trait for determining if an error is retryable
///
/// Used by `RetryPolicy` implementations to decide whether an error should
/// trigger another attempt.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for SpotctlError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpotctlError::Capability { .. }
                | SpotctlError::Retryable { .. }
                | SpotctlError::Io(_)
        )
    }
}

impl SpotctlError {
    /// Wrap a cloud SDK failure with the operation name and the instance the
    /// caller was working on.
    pub fn capability(
        operation: impl Into<String>,
        instance_id: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SpotctlError::Capability {
            operation: operation.into(),
            instance_id: instance_id.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}
