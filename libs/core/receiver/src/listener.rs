//! Source-side contract consumed by the receiver.
//!
//! A listener owns the connection to one source (a queue, a directory, a
//! topic) and exposes just enough for the receiver to fetch a raw message,
//! read its id and payload, and report back how the message was handled.

use crate::error::ListenerError;
use crate::message::MessageContext;
use crate::pipeline::PipelineResult;
use crate::transaction::Transaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Final decision the receiver took for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The pipeline ran and its transaction may commit
    Processed,
    /// Processing failed; the source must deliver the message again
    Retry,
    /// The message was moved to the error storage
    Quarantined,
    /// The message was skipped as a duplicate or known poison message
    Rejected,
}

/// Outcome handed to [`Listener::after_message_processed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub message_id: String,
    pub correlation_id: String,
    pub result: PipelineResult,
    pub disposition: Disposition,
}

/// Pull source of raw messages.
///
/// All methods take `&self`; implementations that hold per-connection state
/// synchronize it internally, since every poll worker shares one listener.
///
/// # Example
///
/// ```rust,ignore
/// use receiver::{Listener, ListenerError, MessageContext, ProcessOutcome, Transaction};
///
/// struct FileListener { dir: PathBuf }
///
/// #[async_trait]
/// impl Listener for FileListener {
///     type RawMessage = PathBuf;
///
///     async fn get_raw_message(&self, _tx: &Transaction, _ctx: &mut MessageContext)
///         -> Result<Option<PathBuf>, ListenerError> {
///         next_file(&self.dir).await
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Source-specific handle of one fetched message
    type RawMessage: Send + Sync + 'static;

    /// Get the listener name for logging.
    fn name(&self) -> &str;

    /// Acquire the connection. Called once per receiver start.
    async fn open(&self) -> Result<(), ListenerError>;

    /// Release the connection. Called once by the last worker to exit.
    async fn close(&self) -> Result<(), ListenerError>;

    /// Per-worker setup; may seed the worker's context.
    async fn open_thread(&self, _ctx: &mut MessageContext) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn close_thread(&self, _ctx: &mut MessageContext) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Fetch the next message. `Ok(None)` means nothing is available now.
    ///
    /// Transactional sources enlist the fetch in `tx`, so a rollback makes
    /// the message available again.
    async fn get_raw_message(
        &self,
        tx: &Transaction,
        ctx: &mut MessageContext,
    ) -> Result<Option<Self::RawMessage>, ListenerError>;

    /// Transport message id, if the source assigns one
    fn get_id(&self, raw: &Self::RawMessage, ctx: &mut MessageContext) -> Option<String>;

    /// Transport correlation id, if the source carries one
    fn get_correlation_id(&self, _raw: &Self::RawMessage, _ctx: &mut MessageContext) -> Option<String> {
        None
    }

    /// Payload as text
    fn get_string(&self, raw: &Self::RawMessage, ctx: &mut MessageContext) -> Result<String, ListenerError>;

    /// Number of times the source has delivered this message, counting this
    /// delivery. Sources without redelivery tracking return `None`.
    fn delivery_count(&self, _raw: &Self::RawMessage) -> Option<u32> {
        None
    }

    /// Notification after the receiver decided what to do with a message.
    async fn after_message_processed(
        &self,
        outcome: &ProcessOutcome,
        raw: &Self::RawMessage,
        ctx: &MessageContext,
    ) -> Result<(), ListenerError>;
}
