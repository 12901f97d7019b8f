//! Receiver error types and error categorization
//!
//! Every failure the engine can observe falls into one of four categories,
//! and the category decides what happens next:
//! - **Configuration**: fatal at startup, the receiver goes to `ERROR`
//! - **Listener**: fetch or connection failure, handled by the back-off loop
//! - **Pipeline**: business processing failure, handled by retry-or-quarantine
//! - **Storage**: error storage or message log unavailable, message is at risk

use std::time::Duration;
use thiserror::Error;

/// Category of error for determining how the receiver reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid configuration or lifecycle misuse
    Configuration,
    /// The source could not be read
    Listener,
    /// The pipeline rejected or failed the message
    Pipeline,
    /// Durable storage (or its transaction) failed
    Storage,
}

impl ErrorCategory {
    /// Label used for metrics and structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Listener => "listener",
            ErrorCategory::Pipeline => "pipeline",
            ErrorCategory::Storage => "storage",
        }
    }

    /// Whether a message that hit this error may still be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Listener | ErrorCategory::Pipeline)
    }
}

/// Errors raised by a [`crate::Listener`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to fetch message: {0}")]
    Fetch(String),

    #[error("Failed to read message: {0}")]
    Read(String),

    #[error("Listener is closed")]
    Closed,
}

/// Errors raised by a [`crate::Pipeline`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Pipeline failed: {0}")]
    Failed(String),

    #[error("Processing timeout exceeded after {0:?}")]
    Timeout(Duration),

    #[error("Pipeline finished with exit state {exit_state}: {result}")]
    ExitState { exit_state: String, result: String },
}

impl PipelineError {
    pub fn failed(message: impl Into<String>) -> Self {
        PipelineError::Failed(message.into())
    }
}

/// Errors raised by a [`crate::TransactionManager`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("No existing transaction found for propagation MANDATORY")]
    NoExistingTransaction,

    #[error("Existing transaction found for propagation NEVER")]
    ExistingTransaction,

    #[error("Transaction {0} already completed")]
    AlreadyCompleted(String),

    #[error("Transaction {0} was rolled back because it was marked rollback-only")]
    RolledBack(String),

    #[error("Commit of transaction {id} failed: {reason}")]
    CommitFailed { id: String, reason: String },

    #[error("Cannot register synchronization without an active transaction")]
    NotActive,
}

/// Errors raised by a [`crate::MessageStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage '{0}' is unavailable")]
    Unavailable(String),

    #[error("Failed to write to storage: {0}")]
    Write(String),

    #[error("Message '{0}' not found in storage")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Top level receiver error
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Receiver '{receiver}' cannot {action} while in state {state}")]
    InvalidState {
        receiver: String,
        action: &'static str,
        state: String,
    },

    #[error("Timed out waiting for receiver '{receiver}' to reach {state}")]
    Timeout { receiver: String, state: String },
}

impl ReceiverError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ReceiverError::Configuration(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReceiverError::Configuration(_) => ErrorCategory::Configuration,
            ReceiverError::InvalidState { .. } => ErrorCategory::Configuration,
            ReceiverError::Timeout { .. } => ErrorCategory::Configuration,
            ReceiverError::Listener(_) => ErrorCategory::Listener,
            ReceiverError::Pipeline(_) => ErrorCategory::Pipeline,
            ReceiverError::Storage(_) => ErrorCategory::Storage,
            ReceiverError::Transaction(_) => ErrorCategory::Storage,
        }
    }
}

impl From<core_config::ConfigError> for ReceiverError {
    fn from(err: core_config::ConfigError) -> Self {
        ReceiverError::Configuration(err.to_string())
    }
}
