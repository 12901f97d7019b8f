//! Transactional Receiver Engine
//!
//! Pulls messages from a listener, runs them through a pipeline inside a
//! transaction, and quarantines messages that keep failing.
//!
//! ## Features
//!
//! - **Generic receiver**: `Receiver<L>` drives any [`Listener`] in pulling or pushing mode
//! - **Poll workers**: supervised worker pool with an optional fetch semaphore
//! - **Retry back-off**: 1, 2, 4, ... seconds up to ten minutes, reset on the next message
//! - **Poison handling**: try-count tracking, error storage and a poison-id cache
//! - **Duplicate detection**: against the message log, by message or correlation id
//! - **Transactions**: all six propagation attributes over a pluggable manager
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use receiver::{InMemoryMessageStore, QueueListener, Receiver, ReceiverConfig, RunState};
//!
//! let config = ReceiverConfig::from_env()?;
//! let listener = QueueListener::new("orders");
//! let receiver = Receiver::builder(config, listener, Arc::new(MyPipeline))
//!     .with_error_storage(Arc::new(InMemoryMessageStore::new("orders-errors")))
//!     .build();
//!
//! receiver.start_running().await?;
//! shutdown_rx.changed().await?;
//! receiver.stop_running().await;
//! receiver.wait_for_run_state(RunState::Stopped, Duration::from_secs(30)).await;
//! ```

mod backoff;
mod cache;
mod config;
mod container;
mod error;
mod health;
mod listener;
mod memory;
mod message;
pub mod metrics;
mod pipeline;
mod receiver;
mod registry;
mod run_state;
mod statistics;
mod store;
mod transaction;

// Re-export main types
pub use backoff::{is_suspension, ResetOutcome, RetryPolicy, MAX_RETRY_INTERVAL_SECS, SUSPENSION_THRESHOLD_SECS};
pub use cache::{EvictionOrder, LruCache, PoisonCache, ProcessResultCache, ProcessResultCacheItem};
pub use config::{DuplicateCheckMethod, OnError, ReceiverConfig, ReceiverMode};
pub use container::{ListenerContainer, WorkerCounter};
pub use error::{ErrorCategory, ListenerError, PipelineError, ReceiverError, StorageError, TransactionError};
pub use health::{health_router, HealthResponse, HealthState, ReceiverStatus};
pub use listener::{Disposition, Listener, ProcessOutcome};
pub use memory::{InMemoryMessageStore, QueueListener, QueuedMessage};
pub use message::{keys, MessageContext, MessageEnvelope, MessageWrapper, SYNTHETIC_ID_PREFIX};
pub use metrics::{init_metrics, render_metrics, ReceiverMetrics};
pub use pipeline::{ExitState, FailingPipeline, NoOpPipeline, Pipeline, PipelineResult};
pub use receiver::{
    HistoryCheck, Receiver, ReceiverBuilder, RetryDecision, EXCEPTIONS_WITHOUT_MESSAGE_THRESHOLD,
};
pub use registry::{ListenerRegistry, ManagedReceiver};
pub use run_state::{RunState, RunStateManager};
pub use statistics::{ReceiverStatistics, StatisticsSnapshot};
pub use store::{MessageStore, StoredMessage};
pub use transaction::{
    LocalTransactionManager, Transaction, TransactionAttribute, TransactionDefinition, TransactionManager,
};

// Re-export the env-config trait so callers can use `ReceiverConfig::from_env()`
pub use core_config::FromEnv;
