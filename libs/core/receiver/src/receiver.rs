//! The receiver: lifecycle state machine and per-message orchestration.
//!
//! A [`Receiver`] couples one [`Listener`] to one [`Pipeline`]. For every
//! delivery it derives the message identity, checks the message history
//! (poison cache, try count, duplicates), runs the pipeline, and decides
//! between commit, retry and quarantine. Poll workers live in
//! [`crate::container`]; this module owns everything they call into.

use crate::backoff::{is_suspension, ResetOutcome, RetryPolicy};
use crate::cache::{PoisonCache, ProcessResultCache, ProcessResultCacheItem};
use crate::config::{DuplicateCheckMethod, OnError, ReceiverConfig, ReceiverMode};
use crate::container::ListenerContainer;
use crate::error::{PipelineError, ReceiverError, StorageError};
use crate::listener::{Disposition, Listener, ProcessOutcome};
use crate::message::{MessageContext, MessageEnvelope, MessageWrapper};
use crate::metrics::ReceiverMetrics;
use crate::pipeline::{Pipeline, PipelineResult};
use crate::run_state::{RunState, RunStateManager};
use crate::statistics::{ReceiverStatistics, StatisticsSnapshot};
use crate::store::{MessageStore, StoredMessage};
use crate::transaction::{
    LocalTransactionManager, Transaction, TransactionAttribute, TransactionDefinition, TransactionManager,
};
use chrono::Utc;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Consecutive errors without a received message before the receiver
/// reports itself degraded
pub const EXCEPTIONS_WITHOUT_MESSAGE_THRESHOLD: u32 = 5;

const TOO_MANY_RETRIES: &str = "too many retries";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Result of the history check done before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCheck {
    /// Run the pipeline
    Proceed,
    /// The message was quarantined or rejected; do not run the pipeline
    AlreadyHandled,
}

/// Outcome of a failed attempt on a non-transacted receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Quarantined,
}

struct Settings {
    config: ReceiverConfig,
    correlation_pattern: Option<Regex>,
}

pub(crate) struct ReceiverInner<L: Listener> {
    raw_config: ReceiverConfig,
    settings: OnceCell<Settings>,
    listener: L,
    pipeline: Arc<dyn Pipeline>,
    transaction_manager: Arc<dyn TransactionManager>,
    error_storage: Option<Arc<dyn MessageStore>>,
    message_log: Option<Arc<dyn MessageStore>>,
    state: RunStateManager,
    retry_policy: RetryPolicy,
    process_results: Mutex<ProcessResultCache>,
    poison: Mutex<PoisonCache>,
    statistics: ReceiverStatistics,
    container: ListenerContainer,
    resources_open: AtomicBool,
    exceptions_without_message: AtomicU32,
    degraded: AtomicBool,
    suspended: AtomicBool,
}

/// Builder for [`Receiver`]
pub struct ReceiverBuilder<L: Listener> {
    config: ReceiverConfig,
    listener: L,
    pipeline: Arc<dyn Pipeline>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    error_storage: Option<Arc<dyn MessageStore>>,
    message_log: Option<Arc<dyn MessageStore>>,
}

impl<L: Listener> ReceiverBuilder<L> {
    pub fn new(config: ReceiverConfig, listener: L, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            config,
            listener,
            pipeline,
            transaction_manager: None,
            error_storage: None,
            message_log: None,
        }
    }

    /// Defaults to a [`LocalTransactionManager`]
    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    pub fn with_error_storage(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.error_storage = Some(store);
        self
    }

    pub fn with_message_log(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_log = Some(store);
        self
    }

    pub fn build(self) -> Receiver<L> {
        let metrics = ReceiverMetrics::new(self.config.name.clone(), self.listener.name());
        let inner = ReceiverInner {
            process_results: Mutex::new(ProcessResultCache::new(self.config.process_result_cache_size)),
            poison: Mutex::new(PoisonCache::new(self.config.poison_cache_size)),
            statistics: ReceiverStatistics::new(metrics),
            raw_config: self.config,
            settings: OnceCell::new(),
            listener: self.listener,
            pipeline: self.pipeline,
            transaction_manager: self
                .transaction_manager
                .unwrap_or_else(|| Arc::new(LocalTransactionManager::new())),
            error_storage: self.error_storage,
            message_log: self.message_log,
            state: RunStateManager::new(RunState::Stopped),
            retry_policy: RetryPolicy::new(),
            container: ListenerContainer::new(),
            resources_open: AtomicBool::new(false),
            exceptions_without_message: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        };
        Receiver {
            inner: Arc::new(inner),
        }
    }
}

/// Transactional receiver, cheap to clone.
///
/// # Example
///
/// ```rust,ignore
/// let receiver = ReceiverBuilder::new(config, QueueListener::new("orders"), Arc::new(pipeline))
///     .with_error_storage(Arc::new(InMemoryMessageStore::new("orders-errors")))
///     .build();
///
/// receiver.start_running().await?;
/// // ...
/// receiver.stop_running().await;
/// receiver.wait_for_run_state(RunState::Stopped, Duration::from_secs(30)).await;
/// ```
pub struct Receiver<L: Listener> {
    pub(crate) inner: Arc<ReceiverInner<L>>,
}

impl<L: Listener> Clone for Receiver<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Listener> Receiver<L> {
    pub fn builder(config: ReceiverConfig, listener: L, pipeline: Arc<dyn Pipeline>) -> ReceiverBuilder<L> {
        ReceiverBuilder::new(config, listener, pipeline)
    }

    pub fn name(&self) -> &str {
        &self.config().name
    }

    /// Effective configuration (validated once [`Receiver::configure`] ran)
    pub fn config(&self) -> &ReceiverConfig {
        self.inner
            .settings
            .get()
            .map(|settings| &settings.config)
            .unwrap_or(&self.inner.raw_config)
    }

    pub fn listener(&self) -> &L {
        &self.inner.listener
    }

    pub fn error_storage(&self) -> Option<&Arc<dyn MessageStore>> {
        self.inner.error_storage.as_ref()
    }

    pub fn message_log(&self) -> Option<&Arc<dyn MessageStore>> {
        self.inner.message_log.as_ref()
    }

    pub fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.inner.transaction_manager
    }

    pub fn run_state(&self) -> RunState {
        self.inner.state.get()
    }

    pub fn is_in_state(&self, state: RunState) -> bool {
        self.inner.state.is(state)
    }

    pub fn subscribe_run_state(&self) -> tokio::sync::watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    /// Wait until the receiver reaches `state`. Returns false on timeout.
    pub async fn wait_for_run_state(&self, state: RunState, timeout: Duration) -> bool {
        self.inner.state.wait_for(state, timeout).await
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// True after more than [`EXCEPTIONS_WITHOUT_MESSAGE_THRESHOLD`] errors
    /// in a row without a message being received
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    /// Interval the next fetch failure will wait
    pub fn current_retry_interval(&self) -> Duration {
        self.inner.retry_policy.current()
    }

    pub fn is_poisoned(&self, message_id: &str) -> bool {
        lock(&self.inner.poison).contains(message_id)
    }

    pub fn cached_try_count(&self, message_id: &str) -> Option<u32> {
        lock(&self.inner.process_results)
            .get(message_id)
            .map(|item| item.try_count)
    }

    pub(crate) fn container(&self) -> &ListenerContainer {
        &self.inner.container
    }

    pub(crate) fn record_threads_running(&self, count: usize) {
        self.inner.statistics.metrics().threads_running(count);
    }

    /// Sleep unless the receiver leaves `STARTED` first
    pub(crate) async fn sleep_while_started(&self, duration: Duration) -> bool {
        self.inner.state.sleep_while(RunState::Started, duration).await
    }

    pub(crate) fn correlation_pattern(&self) -> Option<&Regex> {
        self.inner
            .settings
            .get()
            .and_then(|settings| settings.correlation_pattern.as_ref())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Validate the configuration. A failure moves the receiver to `ERROR`.
    pub fn configure(&self) -> Result<(), ReceiverError> {
        if self.inner.settings.get().is_some() {
            return Ok(());
        }
        let mut config = self.inner.raw_config.clone();
        match config.validate() {
            Ok(correlation_pattern) => {
                info!(
                    receiver = %config.name,
                    listener = %self.inner.listener.name(),
                    pipeline = %self.inner.pipeline.name(),
                    mode = %config.mode,
                    num_threads = config.num_threads,
                    transaction_attribute = %config.transaction_attribute,
                    max_retries = ?config.max_retries,
                    "Receiver configured"
                );
                let _ = self.inner.settings.set(Settings {
                    config,
                    correlation_pattern,
                });
                Ok(())
            }
            Err(e) => {
                error!(receiver = %config.name, error = %e, "Receiver configuration failed");
                self.inner.state.set(RunState::Error);
                Err(e)
            }
        }
    }

    /// Open resources and, in pulling mode, start the poll workers.
    ///
    /// Accepted from `STOPPED` and `ERROR`; a no-op while already starting or
    /// started.
    pub async fn start_running(&self) -> Result<(), ReceiverError> {
        let (observed, changed) = self.inner.state.transition(RunState::can_start, RunState::Starting);
        if !changed {
            return match observed {
                RunState::Starting | RunState::Started => {
                    info!(receiver = %self.name(), state = %observed, "Receiver already running");
                    Ok(())
                }
                state => Err(ReceiverError::InvalidState {
                    receiver: self.name().to_string(),
                    action: "start",
                    state: state.to_string(),
                }),
            };
        }

        self.configure()?;
        let config = self.config().clone();
        info!(receiver = %config.name, "Starting receiver");

        let container = self.container();
        if !container.wait_until_idle(config.stop_timeout).await {
            warn!(receiver = %config.name, "Poll workers of the previous run are still active");
        } else if !container.join_workers(config.stop_timeout).await {
            warn!(receiver = %config.name, "Aborted poll worker tasks of the previous run");
        }

        if let Err(e) = self.open_all_resources().await {
            error!(receiver = %config.name, error = %e, "Failed to open resources");
            self.close_all_resources().await;
            self.inner.state.set(RunState::Error);
            return Err(e);
        }

        self.inner.retry_policy.reset();
        self.inner.exceptions_without_message.store(0, Ordering::Release);
        self.inner.degraded.store(false, Ordering::Release);
        self.inner.state.set(RunState::Started);

        if config.mode == ReceiverMode::Pulling {
            container.start(self, config.num_threads, config.poll_permits());
        }

        info!(
            receiver = %config.name,
            mode = %config.mode,
            num_threads = config.num_threads,
            "Receiver started"
        );
        Ok(())
    }

    /// Request a stop.
    ///
    /// `STOPPED` is a no-op. `ERROR` closes resources directly and moves to
    /// `STOPPED`. Otherwise the receiver moves to `STOPPING`; the last poll
    /// worker to exit closes resources and completes the move to `STOPPED`.
    pub async fn stop_running(&self) {
        let name = self.name().to_string();
        match self.inner.state.get() {
            RunState::Stopped => {
                debug!(receiver = %name, "Receiver already stopped");
                return;
            }
            RunState::Stopping => return,
            RunState::Error => {
                info!(receiver = %name, "Stopping receiver in ERROR state");
                self.close_all_resources().await;
                self.inner
                    .state
                    .transition(|state| *state == RunState::Error, RunState::Stopped);
                return;
            }
            RunState::Starting | RunState::Started => {}
        }

        let (_, changed) = self.inner.state.transition(
            |state| matches!(state, RunState::Starting | RunState::Started),
            RunState::Stopping,
        );
        if !changed {
            return;
        }
        info!(receiver = %name, "Stopping receiver");

        self.container().close_poll_permits();
        if self.container().threads_running() == 0 {
            self.on_last_worker_exit().await;
        }
    }

    /// Called once the running worker count drops to zero.
    pub(crate) async fn on_last_worker_exit(&self) {
        self.container().reap_finished();
        self.close_all_resources().await;
        let (observed, _) = self
            .inner
            .state
            .transition(|state| *state == RunState::Stopping, RunState::Stopped);
        match observed {
            RunState::Stopping => info!(receiver = %self.name(), "Receiver stopped"),
            RunState::Started => {
                error!(receiver = %self.name(), "All poll workers exited while the receiver was started");
                self.inner.state.set(RunState::Error);
            }
            _ => {}
        }
    }

    async fn open_all_resources(&self) -> Result<(), ReceiverError> {
        if self.inner.resources_open.load(Ordering::Acquire) {
            self.close_all_resources().await;
        }
        self.inner.listener.open().await?;
        self.inner.resources_open.store(true, Ordering::Release);
        if let Some(store) = &self.inner.error_storage {
            store.open().await?;
        }
        if let Some(store) = &self.inner.message_log {
            store.open().await?;
        }
        Ok(())
    }

    /// Close listener and stores. Only the first call after an open has
    /// any effect; errors are logged.
    pub(crate) async fn close_all_resources(&self) {
        if !self.inner.resources_open.swap(false, Ordering::AcqRel) {
            return;
        }
        let name = self.name();
        debug!(receiver = %name, "Closing resources");

        if let Err(e) = self.inner.listener.close().await {
            warn!(receiver = %name, error = %e, "Failed to close listener");
        }
        for store in [&self.inner.error_storage, &self.inner.message_log].into_iter().flatten() {
            if let Err(e) = store.close().await {
                warn!(receiver = %name, store = %store.name(), error = %e, "Failed to close store");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Thread count
    // ---------------------------------------------------------------------

    /// Add one poll worker
    pub fn increase_thread_count(&self) {
        if self.config().mode != ReceiverMode::Pulling || !self.is_in_state(RunState::Started) {
            warn!(receiver = %self.name(), "Thread count can only change while a pulling receiver is started");
            return;
        }
        let target = self.container().increase_target();
        self.container().spawn_worker(self.clone());
        info!(receiver = %self.name(), target, "Increased thread count");
    }

    /// Retire one poll worker, keeping at least one
    pub fn decrease_thread_count(&self) {
        match self.container().decrease_target() {
            Some(target) => info!(receiver = %self.name(), target, "Decreased thread count"),
            None => debug!(receiver = %self.name(), "Thread count already at minimum"),
        }
    }

    /// Workers currently running
    pub fn current_thread_count(&self) -> usize {
        self.container().threads_running()
    }

    /// Workers the receiver aims to run
    pub fn target_thread_count(&self) -> usize {
        self.container().target()
    }

    /// Highest number of workers seen running at once
    pub fn max_thread_count(&self) -> usize {
        self.container().max_threads()
    }

    // ---------------------------------------------------------------------
    // Errors and back-off
    // ---------------------------------------------------------------------

    /// React to an error caught outside message processing, per `on_error`.
    pub async fn exception_thrown(&self, source: &str, err: &ReceiverError) {
        let name = self.name().to_string();
        match self.config().on_error {
            OnError::Continue => {
                let count = self.inner.exceptions_without_message.fetch_add(1, Ordering::AcqRel) + 1;
                if count > EXCEPTIONS_WITHOUT_MESSAGE_THRESHOLD && !self.inner.degraded.swap(true, Ordering::AcqRel) {
                    warn!(
                        receiver = %name,
                        count,
                        "Exceptions without a received message exceeded threshold, receiver degraded"
                    );
                }
                error!(
                    receiver = %name,
                    source,
                    category = err.category().as_str(),
                    error = %err,
                    "Caught exception, will continue processing messages when they arrive"
                );
            }
            OnError::Recover => {
                error!(receiver = %name, source, error = %err, "Caught exception, will try to recover");
                self.inner.state.set(RunState::Error);
            }
            OnError::Close => {
                error!(receiver = %name, source, error = %err, "Caught exception, stopping receiver");
                self.stop_running().await;
            }
        }
    }

    /// Handle a failed fetch: report it, then back off when continuing.
    pub(crate) async fn handle_fetch_error(&self, err: ReceiverError) {
        self.inner.statistics.metrics().fetch_error();
        self.exception_thrown("get_raw_message", &err).await;
        if self.config().on_error == OnError::Continue {
            self.increase_retry_interval_and_wait("fetch failed").await;
        }
    }

    /// Wait the current back-off interval (cut short by any state change)
    /// and double it for the next failure.
    pub(crate) async fn increase_retry_interval_and_wait(&self, reason: &str) {
        let wait = self.inner.retry_policy.next_interval();
        self.inner
            .statistics
            .metrics()
            .retry_interval(self.inner.retry_policy.current());
        warn!(
            receiver = %self.name(),
            wait_secs = wait.as_secs(),
            reason,
            "Will continue retrieving messages after back-off"
        );
        if is_suspension(wait) && !self.inner.suspended.swap(true, Ordering::AcqRel) {
            warn!(receiver = %self.name(), "Receiver operation suspended");
        }
        self.inner.state.sleep_while(RunState::Started, wait).await;
    }

    /// Reset the back-off after a successful fetch
    pub(crate) fn reset_retry_interval(&self) {
        let outcome = self.inner.retry_policy.reset();
        let was_suspended = self.inner.suspended.swap(false, Ordering::AcqRel);
        if outcome == ResetOutcome::Resumed || was_suspended {
            info!(receiver = %self.name(), "Receiver operation resumed");
        } else if outcome == ResetOutcome::Recovered {
            info!(receiver = %self.name(), "Retry interval reset after a successful fetch");
        }
    }

    /// Commit, or roll back when processing failed or marked the transaction.
    pub(crate) async fn complete_transaction(&self, tx: &Transaction, failed: bool) {
        let manager = &self.inner.transaction_manager;
        if failed || tx.is_rollback_only() {
            if let Err(e) = manager.rollback(tx).await {
                error!(receiver = %self.name(), transaction_id = ?tx.id(), error = %e, "Rollback failed");
            }
        } else if let Err(e) = manager.commit(tx).await {
            error!(receiver = %self.name(), transaction_id = ?tx.id(), error = %e, "Commit failed");
        }
    }

    // ---------------------------------------------------------------------
    // Message processing
    // ---------------------------------------------------------------------

    /// Process one fetched message inside `tx`.
    ///
    /// Exactly one of these happens: the pipeline runs and the transaction
    /// may commit, the message is quarantined, or the message is rejected
    /// as a duplicate or known poison message. On failure `tx` is marked
    /// rollback-only and the error is returned; the caller commits or rolls
    /// back.
    pub async fn process_raw_message(
        &self,
        raw: &L::RawMessage,
        ctx: &mut MessageContext,
        tx: &Transaction,
    ) -> Result<(), ReceiverError> {
        let listener = &self.inner.listener;
        let received_at = Utc::now();
        let message_id = listener.get_id(raw, ctx);
        let technical_correlation_id = listener.get_correlation_id(raw, ctx);
        let payload = match listener.get_string(raw, ctx) {
            Ok(payload) => payload,
            Err(e) => {
                tx.set_rollback_only();
                return Err(e.into());
            }
        };

        let envelope = MessageEnvelope::derive(
            message_id,
            technical_correlation_id,
            &payload,
            self.correlation_pattern(),
            received_at,
        );
        self.process_message(&envelope, &payload, Some(raw), ctx, tx, false)
            .await
    }

    /// Process a message delivered by a pushing source in its own transaction.
    pub async fn process_request(&self, raw: &L::RawMessage, ctx: &mut MessageContext) -> Result<(), ReceiverError> {
        let state = self.run_state();
        if state != RunState::Started {
            warn!(receiver = %self.name(), state = %state, "Request refused, receiver not started");
            return Err(ReceiverError::InvalidState {
                receiver: self.name().to_string(),
                action: "process request",
                state: state.to_string(),
            });
        }

        let definition = self.config().transaction_definition();
        let tx = self.inner.transaction_manager.begin(&definition, None).await?;
        let result = self.process_raw_message(raw, ctx, &tx).await;
        self.complete_transaction(&tx, result.is_err()).await;
        result
    }

    async fn process_message(
        &self,
        envelope: &MessageEnvelope,
        payload: &str,
        raw: Option<&L::RawMessage>,
        ctx: &mut MessageContext,
        tx: &Transaction,
        manual_retry: bool,
    ) -> Result<(), ReceiverError> {
        envelope.populate(ctx);
        let span = info_span!(
            "message",
            receiver = %self.name(),
            message_id = %envelope.message_id,
            correlation_id = %envelope.business_correlation_id,
        );
        self.dispatch(envelope, payload, raw, ctx, tx, manual_retry)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        payload: &str,
        raw: Option<&L::RawMessage>,
        ctx: &mut MessageContext,
        tx: &Transaction,
        manual_retry: bool,
    ) -> Result<(), ReceiverError> {
        let message_id = envelope.message_id.as_str();
        let statistics = &self.inner.statistics;

        if !manual_retry && self.is_poisoned(message_id) {
            warn!("Message id is in poison cache, not processing it again");
            statistics.record_rejected("poison");
            let result = PipelineResult::rejected("message id is in poison cache");
            self.notify_listener(raw, envelope, result, Disposition::Rejected, ctx)
                .await;
            return Ok(());
        }

        let native_count = raw.and_then(|raw| self.inner.listener.delivery_count(raw));
        let history = match self
            .check_try_count(envelope, payload, native_count, raw, ctx, tx, manual_retry)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                tx.set_rollback_only();
                return Err(e);
            }
        };
        if history == HistoryCheck::AlreadyHandled {
            return Ok(());
        }

        let config = self.config();
        if config.force_retry_flag {
            ctx.mark_retry();
        }
        statistics.record_received();
        self.inner.exceptions_without_message.store(0, Ordering::Release);
        self.inner.degraded.store(false, Ordering::Release);

        statistics.processing_started();
        let started = Instant::now();
        let pipeline = &self.inner.pipeline;
        let outcome = match config.transaction_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, pipeline.process(&envelope.business_correlation_id, payload, ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PipelineError::Timeout(limit)),
                }
            }
            None => {
                pipeline
                    .process(&envelope.business_correlation_id, payload, ctx)
                    .await
            }
        };
        statistics.processing_finished();
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(result) if result.is_success() || config.is_transacted() => result,
            Ok(result) => {
                statistics.record_processed(elapsed, false);
                let err = PipelineError::ExitState {
                    exit_state: result.exit_state.to_string(),
                    result: result.result,
                };
                return self
                    .handle_failure(envelope, payload, raw, ctx, tx, manual_retry, err.into())
                    .await;
            }
            Err(e) => {
                statistics.record_processed(elapsed, false);
                return self
                    .handle_failure(envelope, payload, raw, ctx, tx, manual_retry, e.into())
                    .await;
            }
        };

        if let Some(log) = &self.inner.message_log {
            let wrapper = MessageWrapper::new(envelope, payload, ctx);
            let logged = log
                .store_message(
                    tx,
                    message_id,
                    &envelope.business_correlation_id,
                    envelope.received_at,
                    "log",
                    &wrapper,
                )
                .await;
            if let Err(e) = logged {
                statistics.record_processed(elapsed, false);
                return self
                    .handle_failure(envelope, payload, raw, ctx, tx, manual_retry, e.into())
                    .await;
            }
        }

        statistics.record_processed(elapsed, true);
        lock(&self.inner.process_results).remove(message_id);
        info!(
            exit_state = %result.exit_state,
            duration_ms = elapsed.as_millis() as u64,
            "Message processed"
        );
        self.notify_listener(raw, envelope, result, Disposition::Processed, ctx)
            .await;
        Ok(())
    }

    /// Decide whether a fetched message has been seen too often.
    ///
    /// Manual retries skip the check. The delivery count is the listener's
    /// own count when it reports one, else one more than the cached try
    /// count. A count above `max_retries + 1` quarantines the message (in
    /// the enclosing transaction when there is one). With duplicate
    /// checking enabled, a message already in the message log is rejected.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn check_try_count(
        &self,
        envelope: &MessageEnvelope,
        payload: &str,
        native_delivery_count: Option<u32>,
        raw: Option<&L::RawMessage>,
        ctx: &mut MessageContext,
        tx: &Transaction,
        manual_retry: bool,
    ) -> Result<HistoryCheck, ReceiverError> {
        if manual_retry {
            ctx.mark_retry();
            return Ok(HistoryCheck::Proceed);
        }

        let config = self.config();
        let message_id = envelope.message_id.as_str();
        let cached = lock(&self.inner.process_results).get(message_id);
        let delivery_count = native_delivery_count
            .unwrap_or_else(|| cached.as_ref().map_or(1, |item| item.try_count.saturating_add(1)));

        if delivery_count > 1 {
            ctx.mark_retry();
            warn!(delivery_count, "Message was delivered before");
        }

        if config.max_deliveries().is_some_and(|max| delivery_count > max) {
            warn!(
                delivery_count,
                max_retries = ?config.max_retries,
                "Message has too many retries, moving it to error storage"
            );
            if config
                .max_deliveries()
                .is_some_and(|max| delivery_count > max.saturating_add(1))
            {
                // The poison cache lost this id, so the message keeps coming back.
                self.increase_retry_interval_and_wait("message keeps being redelivered")
                    .await;
            }

            let wrapper = MessageWrapper::new(envelope, payload, ctx);
            self.move_to_error_storage(envelope, &wrapper, TOO_MANY_RETRIES, TransactionAttribute::Required, Some(tx))
                .await;
            lock(&self.inner.process_results).remove(message_id);
            self.inner.statistics.record_rejected("too_many_retries");
            self.notify_listener(
                raw,
                envelope,
                PipelineResult::error(TOO_MANY_RETRIES),
                Disposition::Quarantined,
                ctx,
            )
            .await;
            return Ok(HistoryCheck::AlreadyHandled);
        }

        if self.is_duplicate(envelope).await? {
            self.inner.statistics.record_rejected("duplicate");
            self.notify_listener(
                raw,
                envelope,
                PipelineResult::success("duplicate, already processed"),
                Disposition::Rejected,
                ctx,
            )
            .await;
            return Ok(HistoryCheck::AlreadyHandled);
        }

        if cached.is_some() || delivery_count > 1 {
            self.inner.statistics.record_retried();
        }
        Ok(HistoryCheck::Proceed)
    }

    async fn is_duplicate(&self, envelope: &MessageEnvelope) -> Result<bool, StorageError> {
        let config = self.config();
        let Some(log) = self.inner.message_log.as_ref().filter(|_| config.check_for_duplicates) else {
            return Ok(false);
        };
        let duplicate = match config.duplicate_check_method {
            DuplicateCheckMethod::MessageId => log.contains_message_id(&envelope.message_id).await?,
            DuplicateCheckMethod::CorrelationId => {
                log.contains_correlation_id(&envelope.business_correlation_id)
                    .await?
            }
        };
        if duplicate {
            warn!(
                method = %config.duplicate_check_method,
                "Message already exists in message log, will not process"
            );
        }
        Ok(duplicate)
    }

    fn record_failure(&self, envelope: &MessageEnvelope, comments: &str) -> ProcessResultCacheItem {
        lock(&self.inner.process_results).record_failure(
            &envelope.message_id,
            &envelope.business_correlation_id,
            envelope.received_at,
            comments,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        envelope: &MessageEnvelope,
        payload: &str,
        raw: Option<&L::RawMessage>,
        ctx: &mut MessageContext,
        tx: &Transaction,
        manual_retry: bool,
        err: ReceiverError,
    ) -> Result<(), ReceiverError> {
        let comments = err.to_string();
        let history = self.record_failure(envelope, &comments);
        tx.set_rollback_only();
        warn!(
            error = %err,
            category = err.category().as_str(),
            retryable = err.category().is_retryable(),
            try_count = history.try_count,
            "Message processing failed"
        );

        if manual_retry || self.config().is_transacted() {
            self.notify_listener(raw, envelope, PipelineResult::error(&comments), Disposition::Retry, ctx)
                .await;
            // Past the limit the redelivery is quarantined, so there is nothing to wait for.
            if !manual_retry && !self.config().retry_limit_reached(history.try_count) {
                self.back_off_before_redelivery().await;
            }
            return Err(err);
        }

        match self
            .retry_or_error_storage(envelope, payload, ctx, tx, &history, &comments)
            .await
        {
            RetryDecision::Retry => {
                self.notify_listener(raw, envelope, PipelineResult::error(&comments), Disposition::Retry, ctx)
                    .await;
                self.back_off_before_redelivery().await;
                Err(err)
            }
            RetryDecision::Quarantined => {
                self.notify_listener(
                    raw,
                    envelope,
                    PipelineResult::error(&comments),
                    Disposition::Quarantined,
                    ctx,
                )
                .await;
                Ok(())
            }
        }
    }

    /// Wait before a failed message comes back. A pushing source redelivers
    /// on its own schedule, so only pulling receivers wait.
    async fn back_off_before_redelivery(&self) {
        if self.config().mode == ReceiverMode::Pulling {
            self.increase_retry_interval_and_wait("message processing failed")
                .await;
        }
    }

    /// Retry-or-quarantine decision for a failed attempt on a non-transacted
    /// receiver. The caller has already marked `tx` rollback-only; the
    /// quarantine write runs in its own transaction so that rollback does
    /// not undo it.
    pub(crate) async fn retry_or_error_storage(
        &self,
        envelope: &MessageEnvelope,
        payload: &str,
        ctx: &MessageContext,
        tx: &Transaction,
        history: &ProcessResultCacheItem,
        comments: &str,
    ) -> RetryDecision {
        let config = self.config();
        if !config.retry_limit_reached(history.try_count) {
            info!(
                try_count = history.try_count,
                max_retries = ?config.max_retries,
                "Message will be retried"
            );
            return RetryDecision::Retry;
        }

        let wrapper = MessageWrapper::new(envelope, payload, ctx);
        self.move_to_error_storage(envelope, &wrapper, comments, TransactionAttribute::RequiresNew, Some(tx))
            .await;
        lock(&self.inner.process_results).remove(&envelope.message_id);
        RetryDecision::Quarantined
    }

    /// Quarantine a message.
    ///
    /// The id goes into the poison cache first, so even a failed write keeps
    /// the message from being dispatched again while the id stays cached.
    /// Write failures are retried `quarantine_failure_retries` times, then
    /// logged. A write that joined `outer` only counts once `outer` commits;
    /// see [`Receiver::settle_with_enclosing`]. Returns whether the write
    /// succeeded or is pending in `outer`.
    pub(crate) async fn move_to_error_storage(
        &self,
        envelope: &MessageEnvelope,
        wrapper: &MessageWrapper,
        comment: &str,
        attribute: TransactionAttribute,
        outer: Option<&Transaction>,
    ) -> bool {
        lock(&self.inner.poison).insert(&envelope.message_id);

        let Some(store) = self.inner.error_storage.as_ref() else {
            warn!(comment, "No error storage configured, message will be lost");
            return false;
        };

        let attempts = self.config().quarantine_failure_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self
                .store_in_error_storage(store.as_ref(), envelope, wrapper, comment, attribute, outer)
                .await
            {
                Ok(true) => {
                    self.inner.statistics.record_quarantined();
                    info!(store = %store.name(), comment, "Message moved to error storage");
                    return true;
                }
                Ok(false) => {
                    if let Some(outer) = outer {
                        self.settle_with_enclosing(outer, &envelope.message_id, store.name());
                    }
                    debug!(store = %store.name(), comment, "Error storage write joined the enclosing transaction");
                    return true;
                }
                Err(e) if attempt < attempts => {
                    warn!(store = %store.name(), attempt, error = %e, "Failed to move message to error storage, retrying");
                }
                Err(e) => {
                    error!(
                        store = %store.name(),
                        attempts,
                        error = %e,
                        "Could not move message to error storage, message is at risk of being lost"
                    );
                }
            }
        }
        false
    }

    async fn store_in_error_storage(
        &self,
        store: &dyn MessageStore,
        envelope: &MessageEnvelope,
        wrapper: &MessageWrapper,
        comment: &str,
        attribute: TransactionAttribute,
        outer: Option<&Transaction>,
    ) -> Result<bool, ReceiverError> {
        let manager = &self.inner.transaction_manager;
        let tx = manager
            .begin(&TransactionDefinition::new(attribute), outer)
            .await?;
        let joined = outer.is_some_and(|outer| tx.same_transaction(outer));
        let stored = store
            .store_message(
                &tx,
                &envelope.message_id,
                &envelope.business_correlation_id,
                envelope.received_at,
                comment,
                wrapper,
            )
            .await;
        if let Err(e) = stored {
            if tx.is_new() {
                let _ = manager.rollback(&tx).await;
            }
            return Err(e.into());
        }
        manager.commit(&tx).await?;
        Ok(!joined)
    }

    /// Account for a quarantine written inside `tx` once `tx` completes.
    ///
    /// On commit the message counts as quarantined. On rollback the write is
    /// gone and the message is back at the source, so its id leaves the
    /// poison cache and the redelivery is quarantined again.
    fn settle_with_enclosing(&self, tx: &Transaction, message_id: &str, store: &str) {
        let receiver = self.clone();
        let message_id = message_id.to_string();
        let store = store.to_string();
        let warn_message_id = message_id.clone();
        let registered = tx.register_synchronization(move |committed| {
            if committed {
                receiver.inner.statistics.record_quarantined();
                info!(
                    receiver = %receiver.name(),
                    message_id = %message_id,
                    store = %store,
                    "Message moved to error storage"
                );
            } else {
                lock(&receiver.inner.poison).remove(&message_id);
                error!(
                    receiver = %receiver.name(),
                    message_id = %message_id,
                    store = %store,
                    "Quarantine rolled back with the enclosing transaction, message stays at the source"
                );
            }
        });
        if let Err(e) = registered {
            warn!(message_id = %warn_message_id, error = %e, "Cannot follow the enclosing transaction of a quarantine");
        }
    }

    async fn notify_listener(
        &self,
        raw: Option<&L::RawMessage>,
        envelope: &MessageEnvelope,
        result: PipelineResult,
        disposition: Disposition,
        ctx: &MessageContext,
    ) {
        let Some(raw) = raw else {
            return;
        };
        let outcome = ProcessOutcome {
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.business_correlation_id.clone(),
            result,
            disposition,
        };
        if let Err(e) = self
            .inner
            .listener
            .after_message_processed(&outcome, raw, ctx)
            .await
        {
            self.exception_thrown("after_message_processed", &e.into())
                .await;
        }
    }

    // ---------------------------------------------------------------------
    // Operator actions
    // ---------------------------------------------------------------------

    /// Records in the error storage, oldest first
    pub async fn quarantined_messages(&self) -> Result<Vec<StoredMessage>, ReceiverError> {
        let store = self.require_error_storage()?;
        Ok(store.list_messages().await?)
    }

    /// Run a quarantined message through the pipeline again.
    ///
    /// Runs in a new transaction with history checks skipped. On success the
    /// record is deleted in that transaction. On failure the record is
    /// replaced, in a separate transaction, by one commented
    /// `after retry: <error>`, and the error is returned.
    pub async fn retry_message(&self, message_id: &str) -> Result<(), ReceiverError> {
        self.configure()?;
        let store = self.require_error_storage()?.clone();
        let record = store.browse_message(message_id).await?;
        let wrapper = record.message()?;

        let mut ctx = MessageContext::from(wrapper.context.clone());
        ctx.mark_retry();
        let envelope = MessageEnvelope {
            message_id: wrapper.id.clone(),
            technical_correlation_id: None,
            business_correlation_id: wrapper.correlation_id.clone(),
            received_at: record.received_at,
        };
        info!(receiver = %self.name(), message_id, "Retrying quarantined message");

        let manager = &self.inner.transaction_manager;
        let tx = manager
            .begin(&TransactionDefinition::new(TransactionAttribute::RequiresNew), None)
            .await?;
        let processed = self
            .process_message(&envelope, &wrapper.payload, None, &mut ctx, &tx, true)
            .await;

        match processed {
            Ok(()) => {
                if let Err(e) = store.delete_message(&tx, message_id).await {
                    let _ = manager.rollback(&tx).await;
                    return Err(e.into());
                }
                manager.commit(&tx).await?;
                lock(&self.inner.poison).remove(message_id);
                info!(receiver = %self.name(), message_id, "Retried message processed and removed from error storage");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = manager.rollback(&tx).await {
                    warn!(receiver = %self.name(), error = %rollback, "Rollback of failed retry failed");
                }
                let comment = format!("after retry: {}", e);
                if let Err(update) = self
                    .replace_error_record(store.as_ref(), &envelope, &wrapper, &comment)
                    .await
                {
                    error!(
                        receiver = %self.name(),
                        message_id,
                        error = %update,
                        "Could not update error storage record after failed retry"
                    );
                }
                Err(e)
            }
        }
    }

    async fn replace_error_record(
        &self,
        store: &dyn MessageStore,
        envelope: &MessageEnvelope,
        wrapper: &MessageWrapper,
        comment: &str,
    ) -> Result<(), ReceiverError> {
        let manager = &self.inner.transaction_manager;
        let tx = manager
            .begin(&TransactionDefinition::new(TransactionAttribute::RequiresNew), None)
            .await?;
        let replaced = async {
            store.delete_message(&tx, &envelope.message_id).await?;
            store
                .store_message(
                    &tx,
                    &envelope.message_id,
                    &envelope.business_correlation_id,
                    envelope.received_at,
                    comment,
                    wrapper,
                )
                .await
        }
        .await;
        if let Err(e) = replaced {
            let _ = manager.rollback(&tx).await;
            return Err(e.into());
        }
        manager.commit(&tx).await?;
        Ok(())
    }

    fn require_error_storage(&self) -> Result<&Arc<dyn MessageStore>, ReceiverError> {
        self.inner
            .error_storage
            .as_ref()
            .ok_or_else(|| ReceiverError::configuration(format!("receiver '{}' has no error storage", self.name())))
    }
}
