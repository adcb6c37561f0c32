//! Error types for the flow orchestration domain.
//!
//! Classification (retryable vs. terminal vs. soft-success) is expressed as
//! pure methods over the error enum rather than through catch-site typing,
//! so retry policy can be unit-tested without unwinding.

use trellis_core::{CommandId, FlowId, SwitchId};

/// The result type used throughout trellis-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in flow orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was rejected before any allocation took place.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// A flow or resource was not found.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// No path satisfies the flow's constraints.
    #[error("no path available: {message}")]
    Unroutable {
        /// Description of why routing failed.
        message: String,
    },

    /// A transient fault that the issuing layer may retry.
    #[error("recoverable error: {message}")]
    Recoverable {
        /// Description of the transient fault.
        message: String,
    },

    /// The allocation would over-provision a segment.
    #[error("resource allocation failed: {message}")]
    ResourceAllocation {
        /// Description of the capacity violation.
        message: String,
    },

    /// The target switch does not support the requested feature.
    ///
    /// Treated as soft success: the operation proceeds without this
    /// command's effect.
    #[error("operation not supported on switch {switch_id}: {message}")]
    UnsupportedOnSwitch {
        /// The switch that rejected the feature.
        switch_id: SwitchId,
        /// Description of the unsupported operation.
        message: String,
    },

    /// A speaker command did not respond before its deadline.
    #[error("command {command_id} timed out")]
    Timeout {
        /// The command that timed out.
        command_id: CommandId,
    },

    /// A step's speaker commands failed after exhausting their retries.
    #[error("{count} switch command(s) failed during {step}")]
    CommandsFailed {
        /// Label of the step that failed.
        step: &'static str,
        /// Number of terminally failed commands.
        count: usize,
    },

    /// The flow already has a live operation.
    #[error("flow {flow_id} has an operation in progress")]
    FlowBusy {
        /// The busy flow.
        flow_id: FlowId,
    },

    /// The service is draining and no longer admits operations.
    #[error("service is shutting down")]
    ShuttingDown,

    /// A correlation key was registered while still open.
    #[error("correlation key already registered: {key}")]
    DuplicateRegistration {
        /// Rendered correlation key.
        key: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new recoverable error.
    #[must_use]
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
        }
    }

    /// Creates a new resource allocation error.
    #[must_use]
    pub fn resource_allocation(message: impl Into<String>) -> Self {
        Self::ResourceAllocation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true if the error is transient and the issuing layer may
    /// retry it within its own budget.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Recoverable { .. } | Self::Timeout { .. })
    }

    /// Returns true if the error should be treated as success-with-skip.
    #[must_use]
    pub const fn is_soft_success(&self) -> bool {
        matches!(self, Self::UnsupportedOnSwitch { .. })
    }

    /// Returns the stable caller-visible error type code.
    ///
    /// Internal retry counts and intermediate attempts are never exposed;
    /// only this code plus the display message reach the caller.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Unroutable { .. } => "UNROUTABLE_FLOW",
            Self::Recoverable { .. } => "RECOVERABLE_ERROR",
            Self::ResourceAllocation { .. } => "RESOURCE_ALLOCATION_ERROR",
            Self::UnsupportedOnSwitch { .. } => "UNSUPPORTED_OPERATION",
            Self::Timeout { .. } => "OPERATION_TIMED_OUT",
            Self::CommandsFailed { .. } => "SWITCH_OPERATION_FAILED",
            Self::FlowBusy { .. } => "FLOW_BUSY",
            Self::ShuttingDown => "SERVICE_UNAVAILABLE",
            Self::DuplicateRegistration { .. } => "INTERNAL_ERROR",
            Self::Storage { .. } => "PERSISTENCE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<trellis_core::Error> for Error {
    fn from(err: trellis_core::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}
