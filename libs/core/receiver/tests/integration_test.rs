//! Integration tests for the receiver engine

use async_trait::async_trait;
use receiver::{
    DuplicateCheckMethod, InMemoryMessageStore, LocalTransactionManager, MessageContext, MessageStore, OnError,
    Pipeline, PipelineError, PipelineResult, QueueListener, QueuedMessage, Receiver, ReceiverConfig, ReceiverError,
    ReceiverMode, RunState, TransactionAttribute,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Pipeline that fails its next `failures_left` runs, or on payloads containing "fail"
#[derive(Debug, Default)]
struct ScriptedPipeline {
    failures_left: AtomicU64,
    delay: Option<Duration>,
    attempts: AtomicU64,
    attempt_times: Mutex<Vec<Instant>>,
}

impl ScriptedPipeline {
    fn failing() -> Self {
        Self::failing_first(u64::MAX)
    }

    fn failing_first(count: u64) -> Self {
        Self {
            failures_left: AtomicU64::new(count),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn set_failing(&self, failing: bool) {
        let left = if failing { u64::MAX } else { 0 };
        self.failures_left.store(left, Ordering::SeqCst);
    }

    fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Time between consecutive attempts
    fn attempt_gaps(&self) -> Vec<Duration> {
        let times = self.attempt_times.lock().unwrap();
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    async fn process(
        &self,
        _correlation_id: &str,
        payload: &str,
        _ctx: &mut MessageContext,
    ) -> Result<PipelineResult, PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().unwrap().push(Instant::now());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u64::MAX => Some(u64::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if scripted_failure || payload.contains("fail") {
            return Err(PipelineError::failed("scripted failure"));
        }
        Ok(PipelineResult::success(payload))
    }

    fn name(&self) -> &'static str {
        "ScriptedPipeline"
    }
}

struct Harness {
    receiver: Receiver<QueueListener>,
    listener: QueueListener,
    pipeline: Arc<ScriptedPipeline>,
    errors: InMemoryMessageStore,
    log: InMemoryMessageStore,
}

fn config(name: &str) -> ReceiverConfig {
    ReceiverConfig::new(name).with_poll_interval(Duration::from_millis(100))
}

fn harness(config: ReceiverConfig, listener: QueueListener, pipeline: ScriptedPipeline) -> Harness {
    harness_with_manager(config, listener, pipeline, Arc::new(LocalTransactionManager::new()))
}

fn harness_with_manager(
    config: ReceiverConfig,
    listener: QueueListener,
    pipeline: ScriptedPipeline,
    manager: Arc<LocalTransactionManager>,
) -> Harness {
    let pipeline = Arc::new(pipeline);
    let errors = InMemoryMessageStore::new("errors");
    let log = InMemoryMessageStore::new("log");
    let receiver = Receiver::builder(config, listener.clone(), pipeline.clone())
        .with_transaction_manager(manager)
        .with_error_storage(Arc::new(errors.clone()))
        .with_message_log(Arc::new(log.clone()))
        .build();
    Harness {
        receiver,
        listener,
        pipeline,
        errors,
        log,
    }
}

/// Poll `condition` every 10ms until it holds or `limit` elapses
async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn stop(receiver: &Receiver<QueueListener>) {
    receiver.stop_running().await;
    assert!(
        receiver
            .wait_for_run_state(RunState::Stopped, Duration::from_secs(30))
            .await
    );
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let h = harness(config("orders"), QueueListener::new("orders"), ScriptedPipeline::default());
        assert_eq!(h.receiver.run_state(), RunState::Stopped);

        h.receiver.start_running().await.unwrap();
        assert_eq!(h.receiver.run_state(), RunState::Started);
        assert_eq!(h.listener.open_count(), 1);
        assert_eq!(h.errors.open_count(), 1);

        // Starting twice is a no-op
        h.receiver.start_running().await.unwrap();
        assert_eq!(h.listener.open_count(), 1);

        stop(&h.receiver).await;
        assert_eq!(h.listener.close_count(), 1);
        assert_eq!(h.errors.close_count(), 1);
        assert_eq!(h.log.close_count(), 1);

        // Stopping a stopped receiver is a no-op
        h.receiver.stop_running().await;
        assert_eq!(h.listener.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_worker_closes_resources_once() {
        let h = harness(
            config("orders").with_num_threads(8),
            QueueListener::new("orders"),
            ScriptedPipeline::default(),
        );

        for round in 1..=3 {
            h.receiver.start_running().await.unwrap();
            eventually(Duration::from_secs(5), || h.receiver.current_thread_count() == 8).await;

            stop(&h.receiver).await;
            assert_eq!(h.receiver.current_thread_count(), 0);
            assert_eq!(h.listener.close_count(), round);
            assert_eq!(h.errors.close_count(), round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_queued_messages() {
        let listener = QueueListener::new("orders");
        for i in 0..10 {
            listener.send_text(format!("m{}", i), format!("order {}", i));
        }
        let h = harness(
            config("orders").with_num_threads(3).with_num_threads_polling(1),
            listener,
            ScriptedPipeline::default(),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 10).await;

        let stats = h.receiver.statistics();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.processed, 10);
        assert_eq!(h.log.get_message_count().await.unwrap(), 10);
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_run_state_times_out() {
        let h = harness(config("orders"), QueueListener::new("orders"), ScriptedPipeline::default());
        assert!(
            !h.receiver
                .wait_for_run_state(RunState::Started, Duration::from_secs(1))
                .await
        );
    }
}

mod retry_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_non_transacted_retries_then_quarantines() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(config("orders").with_max_retries(2), listener, ScriptedPipeline::failing());

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.receiver.statistics().quarantined == 1).await;

        assert_eq!(h.pipeline.attempts(), 3);
        let stats = h.receiver.statistics();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.retried, 2);
        assert!(h.receiver.is_poisoned("m1"));
        assert_eq!(h.listener.acknowledged(), vec!["m1".to_string()]);
        assert_eq!(h.listener.pending(), 0);

        let stored = h.errors.browse_message("m1").await.unwrap();
        assert!(stored.comment.contains("scripted failure"));
        assert_eq!(stored.message().unwrap().payload, "payload");
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transacted_rollback_redelivers_until_too_many_retries() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(
            config("orders")
                .with_max_retries(2)
                .with_transaction_attribute(TransactionAttribute::Required),
            listener,
            ScriptedPipeline::failing(),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 1).await;

        assert_eq!(h.pipeline.attempts(), 3);
        let stats = h.receiver.statistics();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.quarantined, 1);

        let stored = h.errors.browse_message("m1").await.unwrap();
        assert_eq!(stored.comment, "too many retries");
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_delivery_count_boundary() {
        let listener = QueueListener::new("orders").with_delivery_count(true);
        listener.send_text("m1", "payload");
        let h = harness(
            config("orders")
                .with_max_retries(1)
                .with_transaction_attribute(TransactionAttribute::Required),
            listener,
            ScriptedPipeline::failing(),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 1).await;

        // Deliveries 1 and 2 are processed; delivery 3 is quarantined.
        assert_eq!(h.pipeline.attempts(), 2);
        assert!(h.errors.contains_message_id("m1").await.unwrap());
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_clears_history() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(
            config("orders").with_max_retries(3),
            listener,
            ScriptedPipeline::failing_first(2),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 1).await;

        assert_eq!(h.pipeline.attempts(), 3);
        assert_eq!(h.receiver.cached_try_count("m1"), None);
        assert_eq!(h.receiver.statistics().retried, 2);
        assert_eq!(h.receiver.statistics().quarantined, 0);
        assert_eq!(h.errors.get_message_count().await.unwrap(), 0);
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_retries_keep_redelivering() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(
            config("orders")
                .with_unlimited_retries()
                .with_transaction_attribute(TransactionAttribute::Required),
            listener,
            ScriptedPipeline::failing_first(6),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(60), || h.listener.acknowledged().len() == 1).await;

        assert_eq!(h.pipeline.attempts(), 7);
        assert_eq!(h.receiver.statistics().quarantined, 0);
        assert!(!h.receiver.is_poisoned("m1"));
        assert_eq!(h.errors.get_message_count().await.unwrap(), 0);
        stop(&h.receiver).await;
    }
}

mod backoff_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_back_off_exponentially() {
        let listener = QueueListener::new("orders");
        listener.fail_next_fetches(3);
        listener.send_text("m1", "payload");
        let h = harness(config("orders"), listener, ScriptedPipeline::default());

        let started = Instant::now();
        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(30), || h.listener.acknowledged().len() == 1).await;

        // Waits of 1, 2 and 4 seconds before the fourth fetch succeeds.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(8), "elapsed {:?}", elapsed);

        assert_eq!(h.receiver.run_state(), RunState::Started);
        assert_eq!(h.receiver.current_retry_interval(), Duration::from_secs(1));
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_failure_delays_redelivery() {
        for attribute in [TransactionAttribute::Supports, TransactionAttribute::Required] {
            let listener = QueueListener::new("orders");
            listener.send_text("m1", "payload");
            let h = harness(
                config("orders")
                    .with_max_retries(3)
                    .with_transaction_attribute(attribute),
                listener,
                ScriptedPipeline::failing_first(2),
            );

            h.receiver.start_running().await.unwrap();
            eventually(Duration::from_secs(30), || h.listener.acknowledged().len() == 1).await;

            let gaps = h.pipeline.attempt_gaps();
            assert_eq!(gaps.len(), 2, "{}", attribute);
            for gap in gaps {
                assert!(gap >= Duration::from_secs(1), "{}: gap {:?}", attribute, gap);
            }
            stop(&h.receiver).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_back_off() {
        let listener = QueueListener::new("orders");
        listener.fail_next_fetches(20);
        let h = harness(config("orders"), listener, ScriptedPipeline::default());

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(600), || {
            h.receiver.current_retry_interval() >= Duration::from_secs(256)
        })
        .await;

        let stopping = Instant::now();
        stop(&h.receiver).await;
        assert!(stopping.elapsed() < Duration::from_secs(1));
    }
}

mod duplicate_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_message_id_rejected() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "first");
        listener.send_text("m1", "second");
        let h = harness(
            config("orders").with_duplicate_check(DuplicateCheckMethod::MessageId),
            listener,
            ScriptedPipeline::default(),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 2).await;

        let stats = h.receiver.statistics();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(h.pipeline.attempts(), 1);
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_correlation_id_rejected() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "order=42 created");
        listener.send_text("m2", "order=42 created again");
        listener.send_text("m3", "order=43 created");
        let h = harness(
            config("orders")
                .with_duplicate_check(DuplicateCheckMethod::CorrelationId)
                .with_correlation_id_pattern(r"order=(\d+)"),
            listener,
            ScriptedPipeline::default(),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 3).await;

        assert_eq!(h.receiver.statistics().rejected, 1);
        assert_eq!(h.pipeline.attempts(), 2);
        assert!(h.log.contains_correlation_id("42").await.unwrap());
        assert!(h.log.contains_correlation_id("43").await.unwrap());
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisoned_id_never_dispatched_again() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(config("orders").with_max_retries(0), listener.clone(), ScriptedPipeline::failing());

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.receiver.is_poisoned("m1")).await;
        assert_eq!(h.pipeline.attempts(), 1);

        listener.send_text("m1", "payload");
        eventually(Duration::from_secs(10), || h.receiver.statistics().rejected == 1).await;
        assert_eq!(h.pipeline.attempts(), 1);
        stop(&h.receiver).await;
    }
}

mod quarantine_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_commit_failure_is_retried() {
        let manager = Arc::new(LocalTransactionManager::new());
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness_with_manager(
            config("orders")
                .with_max_retries(0)
                .with_quarantine_failure_retries(1),
            listener,
            ScriptedPipeline::failing(),
            manager.clone(),
        );
        manager.fail_next_commits(1);

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.receiver.statistics().quarantined == 1).await;

        assert!(h.errors.contains_message_id("m1").await.unwrap());
        assert_eq!(manager.commit_count(), 1);
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolled_back_quarantine_is_redone_on_redelivery() {
        let manager = Arc::new(LocalTransactionManager::new());
        let listener = QueueListener::new("orders").with_delivery_count(true);
        let mut message = QueuedMessage::new("m1", "payload");
        message.delivery_count = 2;
        listener.send(message);
        let h = harness_with_manager(
            config("orders")
                .with_max_retries(1)
                .with_transaction_attribute(TransactionAttribute::Required),
            listener,
            ScriptedPipeline::default(),
            manager.clone(),
        );
        // The fetch transaction holding the quarantine write fails to commit.
        manager.fail_next_commits(1);

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(30), || h.listener.acknowledged().len() == 1).await;

        assert_eq!(h.pipeline.attempts(), 0);
        assert_eq!(h.errors.get_message_count().await.unwrap(), 1);
        assert_eq!(h.errors.browse_message("m1").await.unwrap().comment, "too many retries");
        let stats = h.receiver.statistics();
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.rejected, 2);
        assert!(h.receiver.is_poisoned("m1"));
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_quarantine_relies_on_poison_cache() {
        let manager = Arc::new(LocalTransactionManager::new());
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness_with_manager(
            config("orders").with_max_retries(0),
            listener,
            ScriptedPipeline::failing(),
            manager.clone(),
        );
        manager.fail_next_commits(1);

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.receiver.is_poisoned("m1")).await;
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 1).await;

        assert_eq!(h.receiver.statistics().quarantined, 0);
        assert!(!h.errors.contains_message_id("m1").await.unwrap());
        assert_eq!(h.receiver.run_state(), RunState::Started);
        stop(&h.receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_message_quarantined_while_others_proceed() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "please fail");
        listener.send_text("m2", "fine");
        let h = harness(config("orders").with_max_retries(0), listener, ScriptedPipeline::default());

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 2).await;

        let quarantined = h.receiver.quarantined_messages().await.unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].message_id, "m1");
        assert!(h.log.contains_message_id("m2").await.unwrap());
        assert!(!h.log.contains_message_id("m1").await.unwrap());
        stop(&h.receiver).await;
    }
}

mod manual_retry_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_failure_then_success() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(config("orders").with_max_retries(0), listener, ScriptedPipeline::failing());

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.receiver.statistics().quarantined == 1).await;

        let err = h.receiver.retry_message("m1").await.unwrap_err();
        assert!(matches!(err, ReceiverError::Pipeline(_)));
        let record = h.errors.browse_message("m1").await.unwrap();
        assert!(record.comment.starts_with("after retry: "));
        assert_eq!(h.errors.get_message_count().await.unwrap(), 1);

        h.pipeline.set_failing(false);
        h.receiver.retry_message("m1").await.unwrap();
        assert_eq!(h.errors.get_message_count().await.unwrap(), 0);
        assert!(!h.receiver.is_poisoned("m1"));
        assert!(h.log.contains_message_id("m1").await.unwrap());
        assert_eq!(h.pipeline.attempts(), 3);
        stop(&h.receiver).await;
    }

    #[tokio::test]
    async fn test_manual_retry_unknown_id() {
        let h = harness(config("orders"), QueueListener::new("orders"), ScriptedPipeline::default());
        let err = h.receiver.retry_message("missing").await.unwrap_err();
        assert!(matches!(err, ReceiverError::Storage(_)));
    }
}

mod thread_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_increase_and_decrease_thread_count() {
        let h = harness(
            config("orders").with_num_threads(2),
            QueueListener::new("orders"),
            ScriptedPipeline::default(),
        );
        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(5), || h.receiver.current_thread_count() == 2).await;

        h.receiver.increase_thread_count();
        eventually(Duration::from_secs(5), || h.receiver.current_thread_count() == 3).await;
        assert_eq!(h.receiver.max_thread_count(), 3);

        h.receiver.decrease_thread_count();
        h.receiver.decrease_thread_count();
        h.receiver.decrease_thread_count();
        eventually(Duration::from_secs(5), || h.receiver.current_thread_count() == 1).await;
        assert_eq!(h.receiver.target_thread_count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.receiver.current_thread_count(), 1);
        assert_eq!(h.listener.close_count(), 0);
        stop(&h.receiver).await;
        assert_eq!(h.listener.close_count(), 1);
    }
}

mod pushing_tests {
    use super::*;

    #[tokio::test]
    async fn test_process_request() {
        let h = harness(
            config("orders").with_mode(ReceiverMode::Pushing),
            QueueListener::new("orders"),
            ScriptedPipeline::default(),
        );

        let mut ctx = MessageContext::new();
        let refused = h
            .receiver
            .process_request(&QueuedMessage::new("m1", "payload"), &mut ctx)
            .await;
        assert!(matches!(refused, Err(ReceiverError::InvalidState { .. })));

        h.receiver.start_running().await.unwrap();
        assert_eq!(h.receiver.current_thread_count(), 0);

        h.receiver
            .process_request(&QueuedMessage::new("m1", "payload"), &mut ctx)
            .await
            .unwrap();
        assert_eq!(h.pipeline.attempts(), 1);
        assert_eq!(ctx.get("message_id"), Some("m1"));

        h.receiver.stop_running().await;
        assert_eq!(h.receiver.run_state(), RunState::Stopped);
        assert_eq!(h.listener.close_count(), 1);
    }

    #[tokio::test]
    async fn test_process_request_failure_is_returned() {
        let h = harness(
            config("orders")
                .with_mode(ReceiverMode::Pushing)
                .with_max_retries(1),
            QueueListener::new("orders"),
            ScriptedPipeline::default(),
        );
        h.receiver.start_running().await.unwrap();

        let mut ctx = MessageContext::new();
        let result = h
            .receiver
            .process_request(&QueuedMessage::new("m1", "fail"), &mut ctx)
            .await;
        assert!(result.is_err());
        assert_eq!(h.receiver.cached_try_count("m1"), Some(1));
        h.receiver.stop_running().await;
    }
}

mod on_error_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_on_error_close_stops_receiver() {
        let listener = QueueListener::new("orders");
        listener.fail_next_fetches(1);
        let h = harness(
            config("orders").with_on_error(OnError::Close),
            listener,
            ScriptedPipeline::default(),
        );

        h.receiver.start_running().await.unwrap();
        assert!(
            h.receiver
                .wait_for_run_state(RunState::Stopped, Duration::from_secs(10))
                .await
        );
        assert_eq!(h.listener.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_error_recover_then_restart() {
        let listener = QueueListener::new("orders");
        listener.fail_next_fetches(1);
        let h = harness(
            config("orders").with_on_error(OnError::Recover),
            listener,
            ScriptedPipeline::default(),
        );

        h.receiver.start_running().await.unwrap();
        assert!(
            h.receiver
                .wait_for_run_state(RunState::Error, Duration::from_secs(10))
                .await
        );
        eventually(Duration::from_secs(10), || h.listener.close_count() == 1).await;

        h.receiver.start_running().await.unwrap();
        assert_eq!(h.receiver.run_state(), RunState::Started);
        assert_eq!(h.listener.open_count(), 2);

        h.listener.send_text("m1", "payload");
        eventually(Duration::from_secs(10), || h.listener.acknowledged().len() == 1).await;
        stop(&h.receiver).await;
        assert_eq!(h.listener.close_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_error_closes_resources() {
        let mut config = config("orders");
        config.correlation_id_pattern = Some("(".to_string());
        let h = harness(config, QueueListener::new("orders"), ScriptedPipeline::default());

        assert!(h.receiver.start_running().await.is_err());
        assert_eq!(h.receiver.run_state(), RunState::Error);

        h.receiver.stop_running().await;
        assert_eq!(h.receiver.run_state(), RunState::Stopped);
    }
}

mod timeout_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slow_pipeline_times_out() {
        let listener = QueueListener::new("orders");
        listener.send_text("m1", "payload");
        let h = harness(
            config("orders")
                .with_max_retries(0)
                .with_transaction_timeout(Some(Duration::from_secs(1))),
            listener,
            ScriptedPipeline::slow(Duration::from_secs(5)),
        );

        h.receiver.start_running().await.unwrap();
        eventually(Duration::from_secs(10), || h.receiver.statistics().quarantined == 1).await;

        let stored = h.errors.browse_message("m1").await.unwrap();
        assert!(stored.comment.contains("timeout"), "comment: {}", stored.comment);
        stop(&h.receiver).await;
    }
}
