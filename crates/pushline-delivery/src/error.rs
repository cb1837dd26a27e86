//! Error types for push delivery operations.
//!
//! Defines all error conditions that can occur while delivering a
//! notification, including gateway failures, missing device tokens, and
//! database operations. Errors include context for debugging and proper
//! categorization for retry decisions.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Comprehensive error types for push delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Recipient has no registered device tokens.
    #[error("no device tokens registered for user {user_id}")]
    NoDeviceTokens {
        /// Recipient whose token lookup came back empty
        user_id: String,
    },

    /// Network-level connectivity failure reaching the gateway.
    #[error("gateway transport failed: {message}")]
    Transport {
        /// Error message describing the transport failure
        message: String,
    },

    /// Gateway request timeout exceeded.
    #[error("gateway request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Gateway responded with a non-success HTTP status.
    #[error("gateway error: HTTP {status_code}")]
    Gateway {
        /// HTTP status code from the gateway
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The gateway accepted the call but rejected every token.
    #[error("all {attempted} device tokens failed")]
    AllTokensFailed {
        /// Number of tokens in the failed multicast
        attempted: usize,
    },

    /// Entity lookup came back empty.
    #[error("not found: {message}")]
    NotFound {
        /// Description of the missing entity
        message: String,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Invalid gateway or engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the panicked worker
        worker_id: usize,
        /// Panic message
        error: String,
    },

    /// Graceful shutdown did not finish within the timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a no-device-tokens error for a user.
    pub fn no_device_tokens(user_id: impl fmt::Display) -> Self {
        Self::NoDeviceTokens { user_id: user_id.to_string() }
    }

    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a gateway error from an HTTP response.
    pub fn gateway(status_code: u16, body: impl Into<String>) -> Self {
        Self::Gateway { status_code, body: body.into() }
    }

    /// Creates an all-tokens-failed error.
    pub fn all_tokens_failed(attempted: usize) -> Self {
        Self::AllTokensFailed { attempted }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Determines if this error represents a temporary failure that should
    /// advance the retry counter and requeue the job.
    ///
    /// Returns `true` for transport errors, timeouts, gateway errors, and
    /// full token-level failures (the bound on these is the retry counter,
    /// not the classification). Returns `false` for missing device tokens,
    /// configuration problems, and internal errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::Gateway { .. }
            | Self::AllTokensFailed { .. }
            | Self::Database { .. } => true,

            Self::NoDeviceTokens { .. }
            | Self::NotFound { .. }
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }
}

impl From<pushline_core::CoreError> for DeliveryError {
    fn from(err: pushline_core::CoreError) -> Self {
        match err {
            pushline_core::CoreError::NotFound(message) => Self::NotFound { message },
            other => Self::Database { message: other.to_string() },
        }
    }
}

/// Category of delivery error for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Token resolution problems.
    Tokens,
    /// Network connectivity and timeouts.
    Transport,
    /// Gateway-side rejections.
    Gateway,
    /// Database operations.
    Database,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NoDeviceTokens { .. } => Self::Tokens,
            DeliveryError::Transport { .. } | DeliveryError::Timeout { .. } => Self::Transport,
            DeliveryError::Gateway { .. } | DeliveryError::AllTokensFailed { .. } => Self::Gateway,
            DeliveryError::Database { .. } | DeliveryError::NotFound { .. } => Self::Database,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokens => write!(f, "tokens"),
            Self::Transport => write!(f, "transport"),
            Self::Gateway => write!(f, "gateway"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
