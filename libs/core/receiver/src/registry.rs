//! Explicit receiver registry.
//!
//! Receivers are registered by name and managed through the object-safe
//! [`ManagedReceiver`] trait, so receivers over different listener types can
//! live in one registry.

use crate::error::ReceiverError;
use crate::listener::Listener;
use crate::receiver::Receiver;
use crate::run_state::RunState;
use crate::statistics::StatisticsSnapshot;
use crate::store::StoredMessage;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{info, warn};

/// Operator view of a receiver
#[async_trait]
pub trait ManagedReceiver: Send + Sync {
    fn name(&self) -> &str;

    fn run_state(&self) -> RunState;

    fn statistics(&self) -> StatisticsSnapshot;

    fn is_degraded(&self) -> bool;

    async fn start(&self) -> Result<(), ReceiverError>;

    async fn stop(&self);

    async fn wait_for_run_state(&self, state: RunState, timeout: Duration) -> bool;

    async fn retry_message(&self, message_id: &str) -> Result<(), ReceiverError>;

    /// Records in the receiver's error storage, oldest first
    async fn quarantined_messages(&self) -> Result<Vec<StoredMessage>, ReceiverError>;

    fn increase_thread_count(&self);

    fn decrease_thread_count(&self);

    fn current_thread_count(&self) -> usize;
}

#[async_trait]
impl<L: Listener> ManagedReceiver for Receiver<L> {
    fn name(&self) -> &str {
        Receiver::name(self)
    }

    fn run_state(&self) -> RunState {
        Receiver::run_state(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        Receiver::statistics(self)
    }

    fn is_degraded(&self) -> bool {
        Receiver::is_degraded(self)
    }

    async fn start(&self) -> Result<(), ReceiverError> {
        self.start_running().await
    }

    async fn stop(&self) {
        self.stop_running().await
    }

    async fn wait_for_run_state(&self, state: RunState, timeout: Duration) -> bool {
        Receiver::wait_for_run_state(self, state, timeout).await
    }

    async fn retry_message(&self, message_id: &str) -> Result<(), ReceiverError> {
        Receiver::retry_message(self, message_id).await
    }

    async fn quarantined_messages(&self) -> Result<Vec<StoredMessage>, ReceiverError> {
        Receiver::quarantined_messages(self).await
    }

    fn increase_thread_count(&self) {
        Receiver::increase_thread_count(self)
    }

    fn decrease_thread_count(&self) {
        Receiver::decrease_thread_count(self)
    }

    fn current_thread_count(&self) -> usize {
        Receiver::current_thread_count(self)
    }
}

/// Name-keyed set of receivers
#[derive(Default)]
pub struct ListenerRegistry {
    receivers: RwLock<BTreeMap<String, Arc<dyn ManagedReceiver>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn ManagedReceiver>>> {
        self.receivers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn ManagedReceiver>>> {
        self.receivers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a receiver. Names must be unique.
    pub fn register(&self, receiver: Arc<dyn ManagedReceiver>) -> Result<(), ReceiverError> {
        let name = receiver.name().to_string();
        let mut receivers = self.write();
        if receivers.contains_key(&name) {
            return Err(ReceiverError::configuration(format!(
                "receiver '{}' is already registered",
                name
            )));
        }
        info!(receiver = %name, "Registered receiver");
        receivers.insert(name, receiver);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ManagedReceiver>> {
        self.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedReceiver>> {
        self.read().get(name).cloned()
    }

    /// Like [`ListenerRegistry::get`], failing with a configuration error
    pub fn require(&self, name: &str) -> Result<Arc<dyn ManagedReceiver>, ReceiverError> {
        self.get(name)
            .ok_or_else(|| ReceiverError::configuration(format!("receiver '{}' is not registered", name)))
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedReceiver>> {
        self.read().values().cloned().collect()
    }

    pub fn run_states(&self) -> BTreeMap<String, RunState> {
        self.read()
            .iter()
            .map(|(name, receiver)| (name.clone(), receiver.run_state()))
            .collect()
    }

    /// True when every registered receiver is `STARTED`
    pub fn all_started(&self) -> bool {
        self.read()
            .values()
            .all(|receiver| receiver.run_state() == RunState::Started)
    }

    /// Start every receiver. Failures are logged and returned by name.
    pub async fn start_all(&self) -> Vec<(String, ReceiverError)> {
        let mut failures = Vec::new();
        for receiver in self.snapshot() {
            if let Err(e) = receiver.start().await {
                warn!(receiver = %receiver.name(), error = %e, "Failed to start receiver");
                failures.push((receiver.name().to_string(), e));
            }
        }
        failures
    }

    /// Stop every receiver and wait for each to reach `STOPPED`.
    ///
    /// Returns the names of receivers that did not stop within `timeout`.
    pub async fn stop_all(&self, timeout: Duration) -> Vec<String> {
        let receivers = self.snapshot();
        for receiver in &receivers {
            receiver.stop().await;
        }

        let mut lagging = Vec::new();
        for receiver in &receivers {
            if !receiver.wait_for_run_state(RunState::Stopped, timeout).await {
                warn!(
                    receiver = %receiver.name(),
                    state = %receiver.run_state(),
                    "Receiver did not stop in time"
                );
                lagging.push(receiver.name().to_string());
            }
        }
        lagging
    }
}
