//! In-memory collaborators: a transactional message store and a
//! redelivering queue listener.
//!
//! Both enlist in [`Transaction`]s from [`crate::LocalTransactionManager`]:
//! store writes become visible on commit, and a message fetched inside a
//! transaction goes back to the head of the queue when it rolls back.

use crate::error::{ListenerError, StorageError};
use crate::listener::{Disposition, Listener, ProcessOutcome};
use crate::message::{MessageContext, MessageWrapper};
use crate::store::{MessageStore, StoredMessage};
use crate::transaction::Transaction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<String, (u64, StoredMessage)>,
    sequence: u64,
}

impl StoreState {
    fn put(&mut self, record: StoredMessage) {
        self.sequence += 1;
        self.records
            .insert(record.message_id.clone(), (self.sequence, record));
    }
}

/// Transaction-aware store backed by a map
#[derive(Debug, Clone)]
pub struct InMemoryMessageStore {
    name: String,
    state: Arc<Mutex<StoreState>>,
    fail_writes: Arc<AtomicBool>,
    opened: Arc<AtomicU32>,
    closed: Arc<AtomicU32>,
}

impl InMemoryMessageStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(StoreState::default())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            opened: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make every write fail until switched off again
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    /// Apply `change` on commit, or now when `tx` is not active.
    fn apply<F>(&self, tx: &Transaction, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StoreState) + Send + 'static,
    {
        if tx.is_active() {
            let state = self.state.clone();
            tx.register_synchronization(move |committed| {
                if committed {
                    change(&mut lock(&state));
                }
            })?;
        } else {
            change(&mut lock(&self.state));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), StorageError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn store_message(
        &self,
        tx: &Transaction,
        message_id: &str,
        correlation_id: &str,
        received_at: DateTime<Utc>,
        comment: &str,
        message: &MessageWrapper,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let record = StoredMessage {
            message_id: message_id.to_string(),
            correlation_id: correlation_id.to_string(),
            received_at,
            stored_at: Utc::now(),
            comment: comment.to_string(),
            payload: message.to_json()?,
        };
        debug!(store = %self.name, message_id = %message_id, transaction_id = ?tx.id(), "Storing message");
        self.apply(tx, move |state| state.put(record))
    }

    async fn contains_message_id(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(lock(&self.state).records.contains_key(message_id))
    }

    async fn contains_correlation_id(&self, correlation_id: &str) -> Result<bool, StorageError> {
        Ok(lock(&self.state)
            .records
            .values()
            .any(|(_, record)| record.correlation_id == correlation_id))
    }

    async fn get_message_count(&self) -> Result<usize, StorageError> {
        Ok(lock(&self.state).records.len())
    }

    async fn browse_message(&self, message_id: &str) -> Result<StoredMessage, StorageError> {
        lock(&self.state)
            .records
            .get(message_id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| StorageError::NotFound(message_id.to_string()))
    }

    async fn list_messages(&self) -> Result<Vec<StoredMessage>, StorageError> {
        let state = lock(&self.state);
        let mut records: Vec<&(u64, StoredMessage)> = state.records.values().collect();
        records.sort_by_key(|(sequence, _)| *sequence);
        Ok(records.into_iter().map(|(_, record)| record.clone()).collect())
    }

    async fn delete_message(&self, tx: &Transaction, message_id: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        if !lock(&self.state).records.contains_key(message_id) {
            return Err(StorageError::NotFound(message_id.to_string()));
        }
        let message_id = message_id.to_string();
        self.apply(tx, move |state| {
            state.records.remove(&message_id);
        })
    }
}

/// Message held by a [`QueueListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: Option<String>,
    pub correlation_id: Option<String>,
    pub payload: String,
    /// Deliveries so far, including the current one
    pub delivery_count: u32,
    transacted: bool,
}

impl QueuedMessage {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            correlation_id: None,
            payload: payload.into(),
            delivery_count: 0,
            transacted: false,
        }
    }

    /// A message without a transport id
    pub fn anonymous(payload: impl Into<String>) -> Self {
        Self {
            id: None,
            ..Self::new("", payload)
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueuedMessage>,
    acknowledged: Vec<String>,
    failing_fetches: u32,
    open: bool,
}

/// Pull listener over an in-memory queue.
///
/// Messages fetched inside an active transaction return to the head of the
/// queue on rollback. Messages fetched without one are requeued when the
/// receiver reports [`Disposition::Retry`].
#[derive(Debug, Clone)]
pub struct QueueListener {
    name: String,
    state: Arc<Mutex<QueueState>>,
    reports_delivery_count: bool,
    fetches: Arc<AtomicU64>,
    opened: Arc<AtomicU32>,
    closed: Arc<AtomicU32>,
    outcomes: Arc<Mutex<Vec<ProcessOutcome>>>,
}

impl QueueListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
            reports_delivery_count: false,
            fetches: Arc::new(AtomicU64::new(0)),
            opened: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicU32::new(0)),
            outcomes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Report native delivery counts to the receiver
    pub fn with_delivery_count(mut self, enabled: bool) -> Self {
        self.reports_delivery_count = enabled;
        self
    }

    pub fn send(&self, message: QueuedMessage) {
        lock(&self.state).queue.push_back(message);
    }

    pub fn send_text(&self, id: impl Into<String>, payload: impl Into<String>) {
        self.send(QueuedMessage::new(id, payload));
    }

    /// Make the next `count` fetches fail with a connection error
    pub fn fail_next_fetches(&self, count: u32) {
        lock(&self.state).failing_fetches = count;
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Ids removed from the queue for good
    pub fn acknowledged(&self) -> Vec<String> {
        lock(&self.state).acknowledged.clone()
    }

    /// Outcomes reported by the receiver, in order
    pub fn outcomes(&self) -> Vec<ProcessOutcome> {
        lock(&self.outcomes).clone()
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    fn acknowledge(state: &Mutex<QueueState>, message: &QueuedMessage) {
        if let Some(id) = &message.id {
            lock(state).acknowledged.push(id.clone());
        }
    }
}

#[async_trait]
impl Listener for QueueListener {
    type RawMessage = QueuedMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ListenerError> {
        lock(&self.state).open = true;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        lock(&self.state).open = false;
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_raw_message(
        &self,
        tx: &Transaction,
        _ctx: &mut MessageContext,
    ) -> Result<Option<QueuedMessage>, ListenerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut message = {
            let mut state = lock(&self.state);
            if !state.open {
                return Err(ListenerError::Closed);
            }
            if state.failing_fetches > 0 {
                state.failing_fetches -= 1;
                return Err(ListenerError::Connection(format!("queue '{}' unreachable", self.name)));
            }
            match state.queue.pop_front() {
                Some(message) => message,
                None => return Ok(None),
            }
        };

        message.delivery_count += 1;
        message.transacted = tx.is_active();

        if message.transacted {
            let state = self.state.clone();
            let redelivery = message.clone();
            let registered = tx.register_synchronization(move |committed| {
                if committed {
                    QueueListener::acknowledge(&state, &redelivery);
                } else {
                    lock(&state).queue.push_front(redelivery);
                }
            });
            if let Err(e) = registered {
                lock(&self.state).queue.push_front(message);
                return Err(ListenerError::Fetch(e.to_string()));
            }
        }

        Ok(Some(message))
    }

    fn get_id(&self, raw: &QueuedMessage, _ctx: &mut MessageContext) -> Option<String> {
        raw.id.clone()
    }

    fn get_correlation_id(&self, raw: &QueuedMessage, _ctx: &mut MessageContext) -> Option<String> {
        raw.correlation_id.clone()
    }

    fn get_string(&self, raw: &QueuedMessage, _ctx: &mut MessageContext) -> Result<String, ListenerError> {
        Ok(raw.payload.clone())
    }

    fn delivery_count(&self, raw: &QueuedMessage) -> Option<u32> {
        self.reports_delivery_count.then_some(raw.delivery_count)
    }

    async fn after_message_processed(
        &self,
        outcome: &ProcessOutcome,
        raw: &QueuedMessage,
        _ctx: &MessageContext,
    ) -> Result<(), ListenerError> {
        lock(&self.outcomes).push(outcome.clone());

        if !raw.transacted {
            if outcome.disposition == Disposition::Retry {
                lock(&self.state).queue.push_front(raw.clone());
            } else {
                QueueListener::acknowledge(&self.state, raw);
            }
        }
        Ok(())
    }
}
