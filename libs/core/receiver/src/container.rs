//! Poll worker pool of a pulling receiver.
//!
//! Each worker loops while the receiver is `STARTED`: take a poll permit,
//! begin a transaction, fetch one message, release the permit, process, and
//! commit or roll back. Workers run in a supervised [`JoinSet`]; a panic is
//! logged and still counts as an exit. The worker whose exit brings the
//! running count to zero closes the receiver's resources.

use crate::listener::Listener;
use crate::message::MessageContext;
use crate::receiver::Receiver;
use crate::run_state::RunState;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn log_worker_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Poll worker task panicked");
        }
    }
}

/// Number of running workers.
///
/// [`WorkerCounter::exit`] reports the last worker out from the same atomic
/// decrement that removes it, so exactly one caller ever sees `true` per
/// drain to zero.
#[derive(Debug, Default)]
pub struct WorkerCounter {
    running: AtomicUsize,
}

impl WorkerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, returning the new count
    pub fn enter(&self) -> usize {
        self.running.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Deregister a worker. Returns true for the last one out.
    pub fn exit(&self) -> bool {
        self.running.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn current(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

/// Poll workers and the permits they share
#[derive(Debug, Default)]
pub struct ListenerContainer {
    workers: Mutex<JoinSet<()>>,
    poll_permits: Mutex<Option<Arc<Semaphore>>>,
    running: WorkerCounter,
    target: AtomicUsize,
    retire_requests: AtomicUsize,
    max_threads: AtomicUsize,
    next_worker_id: AtomicUsize,
}

impl ListenerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `num_threads` workers. With `permits`, at most that many
    /// workers fetch at the same time.
    pub(crate) fn start<L: Listener>(&self, receiver: &Receiver<L>, num_threads: usize, permits: Option<usize>) {
        *lock(&self.poll_permits) = permits.map(|n| Arc::new(Semaphore::new(n)));
        self.retire_requests.store(0, Ordering::Release);
        self.target.store(num_threads, Ordering::Release);
        for _ in 0..num_threads {
            self.spawn_worker(receiver.clone());
        }
    }

    pub(crate) fn spawn_worker<L: Listener>(&self, receiver: Receiver<L>) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let running = self.running.enter();
        self.max_threads.fetch_max(running, Ordering::AcqRel);
        receiver.record_threads_running(running);

        let mut workers = lock(&self.workers);
        while let Some(finished) = workers.try_join_next() {
            log_worker_result(finished);
        }
        workers.spawn(poll_worker(receiver, worker_id));
    }

    /// Collect worker tasks that already finished
    pub(crate) fn reap_finished(&self) {
        let mut workers = lock(&self.workers);
        while let Some(finished) = workers.try_join_next() {
            log_worker_result(finished);
        }
    }

    /// Await every tracked worker task, aborting the rest after `timeout`.
    /// Returns false when some had to be aborted.
    ///
    /// Must not be called from a poll worker, which would wait on itself.
    pub(crate) async fn join_workers(&self, timeout: Duration) -> bool {
        let mut workers = std::mem::take(&mut *lock(&self.workers));
        let joined = tokio::time::timeout(timeout, async {
            while let Some(finished) = workers.join_next().await {
                log_worker_result(finished);
            }
        })
        .await
        .is_ok();
        if !joined {
            warn!(remaining = workers.len(), "Poll worker tasks did not finish, aborting them");
            workers.abort_all();
        }
        joined
    }

    /// Worker tasks spawned and not yet collected
    pub fn tracked_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Stop handing out poll permits; workers waiting for one exit
    pub(crate) fn close_poll_permits(&self) {
        if let Some(semaphore) = lock(&self.poll_permits).as_ref() {
            semaphore.close();
        }
    }

    fn poll_semaphore(&self) -> Option<Arc<Semaphore>> {
        lock(&self.poll_permits).clone()
    }

    pub fn threads_running(&self) -> usize {
        self.running.current()
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    pub(crate) fn increase_target(&self) -> usize {
        self.target.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Ask one worker to retire. Never goes below one worker.
    pub(crate) fn decrease_target(&self) -> Option<usize> {
        self.target
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 1).then(|| n - 1))
            .ok()
            .map(|previous| {
                self.retire_requests.fetch_add(1, Ordering::AcqRel);
                previous - 1
            })
    }

    fn try_retire(&self) -> bool {
        self.retire_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Wait until no worker runs. Returns false on timeout.
    pub(crate) async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.threads_running() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    fn worker_exit(&self) -> bool {
        self.running.exit()
    }
}

async fn poll_worker<L: Listener>(receiver: Receiver<L>, worker_id: usize) {
    let span = info_span!("poll_worker", receiver = %receiver.name(), worker = worker_id);
    async move {
        debug!("Poll worker started");
        let outcome = AssertUnwindSafe(poll_loop(&receiver)).catch_unwind().await;
        if outcome.is_err() {
            error!("Poll worker panicked");
        }

        let container = receiver.container();
        let last = container.worker_exit();
        receiver.record_threads_running(container.threads_running());
        if last {
            debug!("Last poll worker exiting, closing resources");
            receiver.on_last_worker_exit().await;
        }
        debug!("Poll worker stopped");
    }
    .instrument(span)
    .await
}

async fn poll_loop<L: Listener>(receiver: &Receiver<L>) {
    let listener = receiver.listener();
    let container = receiver.container();
    let config = receiver.config().clone();
    let definition = config.transaction_definition();
    let manager = receiver.transaction_manager().clone();

    let mut thread_ctx = MessageContext::new();
    if let Err(e) = listener.open_thread(&mut thread_ctx).await {
        receiver.exception_thrown("open_thread", &e.into()).await;
        return;
    }

    let mut idle = false;
    while receiver.is_in_state(RunState::Started) {
        if container.try_retire() {
            info!("Poll worker retired");
            break;
        }
        if idle && !receiver.sleep_while_started(config.poll_interval).await {
            break;
        }

        let permit = match container.poll_semaphore() {
            Some(semaphore) => match semaphore.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        if !receiver.is_in_state(RunState::Started) {
            break;
        }

        let tx = match manager.begin(&definition, None).await {
            Ok(tx) => tx,
            Err(e) => {
                drop(permit);
                receiver.handle_fetch_error(e.into()).await;
                continue;
            }
        };

        let mut ctx = thread_ctx.clone();
        let fetched = listener.get_raw_message(&tx, &mut ctx).await;
        drop(permit);

        match fetched {
            Err(e) => {
                idle = false;
                if let Err(rollback) = manager.rollback(&tx).await {
                    warn!(error = %rollback, "Rollback after failed fetch failed");
                }
                receiver.handle_fetch_error(e.into()).await;
            }
            Ok(None) => {
                idle = true;
                if let Err(rollback) = manager.rollback(&tx).await {
                    warn!(error = %rollback, "Rollback of empty poll failed");
                }
            }
            Ok(Some(raw)) => {
                idle = false;
                receiver.reset_retry_interval();
                let processed = receiver.process_raw_message(&raw, &mut ctx, &tx).await;
                if let Err(e) = &processed {
                    debug!(error = %e, "Message processing returned an error");
                }
                receiver
                    .complete_transaction(&tx, processed.is_err())
                    .await;
            }
        }
    }

    if let Err(e) = listener.close_thread(&mut thread_ctx).await {
        warn!(error = %e, "Failed to close listener thread context");
    }
}
