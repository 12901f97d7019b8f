//! Durable, queryable message storage.
//!
//! The same contract backs both the error storage (quarantined messages) and
//! the message log (every dispatched message, used for auditing and
//! duplicate detection).

use crate::error::StorageError;
use crate::message::MessageWrapper;
use crate::transaction::Transaction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub correlation_id: String,
    pub received_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub comment: String,
    /// JSON of the [`MessageWrapper`]
    pub payload: String,
}

impl StoredMessage {
    /// Decode the wrapped message
    pub fn message(&self) -> Result<MessageWrapper, StorageError> {
        Ok(MessageWrapper::from_json(&self.payload)?)
    }
}

/// Message store contract.
///
/// Writes take the transaction they belong to. A store that cannot enlist in
/// transactions applies writes immediately.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Get the store name for logging.
    fn name(&self) -> &str;

    async fn open(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Store a message, replacing an earlier record with the same id.
    async fn store_message(
        &self,
        tx: &Transaction,
        message_id: &str,
        correlation_id: &str,
        received_at: DateTime<Utc>,
        comment: &str,
        message: &MessageWrapper,
    ) -> Result<(), StorageError>;

    async fn contains_message_id(&self, message_id: &str) -> Result<bool, StorageError>;

    async fn contains_correlation_id(&self, correlation_id: &str) -> Result<bool, StorageError>;

    async fn get_message_count(&self) -> Result<usize, StorageError>;

    /// Fetch one record; [`StorageError::NotFound`] if absent
    async fn browse_message(&self, message_id: &str) -> Result<StoredMessage, StorageError>;

    /// All records, oldest first
    async fn list_messages(&self) -> Result<Vec<StoredMessage>, StorageError>;

    async fn delete_message(&self, tx: &Transaction, message_id: &str) -> Result<(), StorageError>;
}
