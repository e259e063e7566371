//! Error types for consumer management operations

use std::io;
use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Malformed user input: policy tokens, names, percentages
    #[error("{0}")]
    Input(String),

    /// The configuration failed schema validation
    #[error("validation failed: {}", .errors.join("; "))]
    Validation {
        /// Every violation that was found
        errors: Vec<String>,
    },

    /// Stream or consumer does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Leader operations on a consumer without cluster information
    #[error("consumer {stream:?} > {consumer:?} is not clustered")]
    NotClustered {
        /// Stream name
        stream: String,
        /// Consumer name
        consumer: String,
    },

    /// Broker or transport failure
    #[error("broker error: {0}")]
    Broker(String),

    /// No reply within the allowed time
    #[error("timeout: {0}")]
    Timeout(String),

    /// Acknowledging a message failed
    #[error("could not acknowledge message via {subject}: {reason}")]
    Ack {
        /// Reply subject the acknowledgement was sent to
        subject: String,
        /// Failure description
        reason: String,
    },

    /// Tool settings are invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML encoding or decoding failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Broad error classes used when deciding how a failure is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, surfaced immediately
    Input,
    /// Collected validation violations
    Validation,
    /// Network, availability and lookup problems
    Broker,
    /// Cluster precondition failures
    Cluster,
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Logged and processing continues
    Warning,
    /// Reported to the caller
    Error,
    /// Aborts the command
    Fatal,
}

impl ConsumerError {
    /// Shorthand for an input error
    pub fn input(msg: impl Into<String>) -> Self {
        ConsumerError::Input(msg.into())
    }

    /// Shorthand for a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        ConsumerError::Broker(msg.into())
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::Input(_) | ConsumerError::Config(_) => ErrorKind::Input,
            ConsumerError::Json(_) | ConsumerError::Yaml(_) => ErrorKind::Input,
            ConsumerError::Validation { .. } => ErrorKind::Validation,
            ConsumerError::NotClustered { .. } => ErrorKind::Cluster,
            ConsumerError::NotFound(_)
            | ConsumerError::Broker(_)
            | ConsumerError::Timeout(_)
            | ConsumerError::Ack { .. }
            | ConsumerError::Io(_) => ErrorKind::Broker,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsumerError::Broker(_) | ConsumerError::Timeout(_) | ConsumerError::Io(_)
        )
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConsumerError::Input(_) | ConsumerError::Config(_) => ErrorSeverity::Fatal,
            ConsumerError::NotClustered { .. } => ErrorSeverity::Fatal,
            ConsumerError::Validation { .. } => ErrorSeverity::Error,
            ConsumerError::Timeout(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error chain helper for adding context
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, msg: impl Into<String>) -> ConsumerResult<T>;

    /// Add lazily built context
    fn with_context<F>(self, f: F) -> ConsumerResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for ConsumerResult<T> {
    fn context(self, msg: impl Into<String>) -> ConsumerResult<T> {
        self.map_err(|e| wrap(e, msg.into()))
    }

    fn with_context<F>(self, f: F) -> ConsumerResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| wrap(e, f()))
    }
}

// Context is folded into the message while keeping the variant, so callers
// can still match on kind.
fn wrap(err: ConsumerError, msg: String) -> ConsumerError {
    match err {
        ConsumerError::Input(m) => ConsumerError::Input(format!("{}: {}", msg, m)),
        ConsumerError::NotFound(m) => ConsumerError::NotFound(format!("{}: {}", msg, m)),
        ConsumerError::Broker(m) => ConsumerError::Broker(format!("{}: {}", msg, m)),
        ConsumerError::Timeout(m) => ConsumerError::Timeout(format!("{}: {}", msg, m)),
        ConsumerError::Config(m) => ConsumerError::Config(format!("{}: {}", msg, m)),
        ConsumerError::Io(e) => ConsumerError::Io(io::Error::new(e.kind(), format!("{}: {}", msg, e))),
        other => other,
    }
}
