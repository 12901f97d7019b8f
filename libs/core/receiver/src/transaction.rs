//! Transaction boundaries with EJB-style propagation.
//!
//! Transactions are explicit handles instead of thread-bound state: callers
//! pass the enclosing [`Transaction`] to [`TransactionManager::begin`], and
//! the propagation attribute decides whether the new handle joins it, runs
//! independently of it, or runs without a transaction at all.
//!
//! Resources take part in a transaction by registering a completion callback
//! through [`Transaction::register_synchronization`]. The callback runs once
//! with `true` after commit and `false` after rollback.

use crate::error::TransactionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};
use uuid::Uuid;

/// Transaction propagation attribute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAttribute {
    /// Join the enclosing transaction, or start one if there is none.
    Required,
    /// Always start an independent transaction.
    RequiresNew,
    /// Join the enclosing transaction; fail if there is none.
    Mandatory,
    /// Join the enclosing transaction if there is one, else run without.
    #[default]
    Supports,
    /// Always run without a transaction.
    NotSupported,
    /// Run without a transaction; fail if one is active.
    Never,
}

impl TransactionAttribute {
    /// Whether a receiver with this attribute owns a transaction per message.
    pub fn is_transacted(&self) -> bool {
        matches!(
            self,
            TransactionAttribute::Required
                | TransactionAttribute::RequiresNew
                | TransactionAttribute::Mandatory
        )
    }
}

/// Attribute plus optional timeout for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub attribute: TransactionAttribute,
    pub timeout: Option<Duration>,
}

impl TransactionDefinition {
    pub fn new(attribute: TransactionAttribute) -> Self {
        Self {
            attribute,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

type Synchronization = Box<dyn FnOnce(bool) + Send>;

struct PhysicalTransaction {
    id: Uuid,
    rollback_only: AtomicBool,
    completed: AtomicBool,
    synchronizations: Mutex<Vec<Synchronization>>,
}

impl PhysicalTransaction {
    fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            rollback_only: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    /// Mark completed and run callbacks. Returns false if already completed.
    fn complete(&self, committed: bool) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = {
            let mut guard = self
                .synchronizations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for callback in callbacks {
            callback(committed);
        }
        true
    }
}

/// Handle to a unit of work.
///
/// A handle either owns a new physical transaction, participates in an
/// enclosing one, or represents "no transaction" (all operations are
/// immediate and rollback is a no-op).
#[derive(Clone)]
pub struct Transaction {
    physical: Option<Arc<PhysicalTransaction>>,
    is_new: bool,
    attribute: TransactionAttribute,
}

impl Transaction {
    /// A handle that runs without any transaction.
    pub fn none() -> Self {
        Self {
            physical: None,
            is_new: false,
            attribute: TransactionAttribute::NotSupported,
        }
    }

    fn new_physical(attribute: TransactionAttribute) -> Self {
        Self {
            physical: Some(Arc::new(PhysicalTransaction::new())),
            is_new: true,
            attribute,
        }
    }

    fn participate(outer: &Transaction, attribute: TransactionAttribute) -> Self {
        Self {
            physical: outer.physical.clone(),
            is_new: false,
            attribute,
        }
    }

    pub fn id(&self) -> Option<String> {
        self.physical.as_ref().map(|p| p.id.to_string())
    }

    pub fn attribute(&self) -> TransactionAttribute {
        self.attribute
    }

    /// Whether this handle owns the physical transaction it refers to.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether a physical transaction is attached and not yet completed.
    pub fn is_active(&self) -> bool {
        self.physical
            .as_ref()
            .is_some_and(|p| !p.completed.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.physical
            .as_ref()
            .is_some_and(|p| p.completed.load(Ordering::Acquire))
    }

    pub fn set_rollback_only(&self) {
        if let Some(physical) = &self.physical {
            physical.rollback_only.store(true, Ordering::Release);
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.physical
            .as_ref()
            .is_some_and(|p| p.rollback_only.load(Ordering::Acquire))
    }

    /// Whether both handles refer to the same physical transaction.
    pub fn same_transaction(&self, other: &Transaction) -> bool {
        match (&self.physical, &other.physical) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Register a callback that runs when the physical transaction completes.
    pub fn register_synchronization<F>(&self, callback: F) -> Result<(), TransactionError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let physical = self
            .physical
            .as_ref()
            .filter(|p| !p.completed.load(Ordering::Acquire))
            .ok_or(TransactionError::NotActive)?;
        physical
            .synchronizations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("is_new", &self.is_new)
            .field("attribute", &self.attribute)
            .field("rollback_only", &self.is_rollback_only())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Begin/commit/rollback with propagation semantics
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Start a unit of work under `definition`, relative to `outer`.
    async fn begin(
        &self,
        definition: &TransactionDefinition,
        outer: Option<&Transaction>,
    ) -> Result<Transaction, TransactionError>;

    /// Commit the handle. Participating handles leave the decision to the
    /// owner of the physical transaction.
    async fn commit(&self, tx: &Transaction) -> Result<(), TransactionError>;

    /// Roll back the handle. Participating handles mark the physical
    /// transaction rollback-only.
    async fn rollback(&self, tx: &Transaction) -> Result<(), TransactionError>;

    /// Get the manager name for logging.
    fn name(&self) -> &'static str;
}

/// In-process transaction manager.
///
/// Coordinates the in-memory resources of this crate. Commits can be made to
/// fail on demand to simulate an unavailable database.
#[derive(Default)]
pub struct LocalTransactionManager {
    failing_commits: AtomicU32,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl LocalTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` physical commits fail and roll back instead.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TransactionManager for LocalTransactionManager {
    async fn begin(
        &self,
        definition: &TransactionDefinition,
        outer: Option<&Transaction>,
    ) -> Result<Transaction, TransactionError> {
        let outer = outer.filter(|tx| tx.is_active());
        let attribute = definition.attribute;

        let tx = match (attribute, outer) {
            (TransactionAttribute::Required, Some(outer)) => Transaction::participate(outer, attribute),
            (TransactionAttribute::Required, None) => Transaction::new_physical(attribute),
            (TransactionAttribute::RequiresNew, _) => Transaction::new_physical(attribute),
            (TransactionAttribute::Mandatory, Some(outer)) => Transaction::participate(outer, attribute),
            (TransactionAttribute::Mandatory, None) => {
                return Err(TransactionError::NoExistingTransaction);
            }
            (TransactionAttribute::Supports, Some(outer)) => Transaction::participate(outer, attribute),
            (TransactionAttribute::Supports, None) => Transaction {
                attribute,
                ..Transaction::none()
            },
            (TransactionAttribute::NotSupported, _) => Transaction::none(),
            (TransactionAttribute::Never, Some(_)) => {
                return Err(TransactionError::ExistingTransaction);
            }
            (TransactionAttribute::Never, None) => Transaction {
                attribute,
                ..Transaction::none()
            },
        };

        debug!(
            transaction_id = ?tx.id(),
            attribute = %attribute,
            is_new = tx.is_new(),
            "Transaction started"
        );
        Ok(tx)
    }

    async fn commit(&self, tx: &Transaction) -> Result<(), TransactionError> {
        let Some(physical) = tx.physical.as_ref().filter(|_| tx.is_new) else {
            return Ok(());
        };
        let id = physical.id.to_string();

        if physical.completed.load(Ordering::Acquire) {
            return Err(TransactionError::AlreadyCompleted(id));
        }

        if physical.rollback_only.load(Ordering::Acquire) {
            if physical.complete(false) {
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
            }
            return Err(TransactionError::RolledBack(id));
        }

        if self.take_injected_failure() {
            if physical.complete(false) {
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
            }
            warn!(transaction_id = %id, "Injected commit failure, transaction rolled back");
            return Err(TransactionError::CommitFailed {
                id,
                reason: "injected failure".to_string(),
            });
        }

        if !physical.complete(true) {
            return Err(TransactionError::AlreadyCompleted(id));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!(transaction_id = %id, "Transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: &Transaction) -> Result<(), TransactionError> {
        let Some(physical) = tx.physical.as_ref() else {
            return Ok(());
        };

        if !tx.is_new {
            physical.rollback_only.store(true, Ordering::Release);
            return Ok(());
        }

        if physical.complete(false) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            debug!(transaction_id = %physical.id, "Transaction rolled back");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LocalTransactionManager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(attribute: TransactionAttribute) -> TransactionDefinition {
        TransactionDefinition::new(attribute)
    }

    #[test]
    fn test_attribute_parsing() {
        let attr: TransactionAttribute = "requires_new".parse().unwrap();
        assert_eq!(attr, TransactionAttribute::RequiresNew);
        assert_eq!(TransactionAttribute::NotSupported.to_string(), "NOT_SUPPORTED");
        assert!(TransactionAttribute::Mandatory.is_transacted());
        assert!(!TransactionAttribute::Supports.is_transacted());
    }

    #[tokio::test]
    async fn test_required_joins_outer() {
        let tm = LocalTransactionManager::new();
        let outer = tm.begin(&def(TransactionAttribute::Required), None).await.unwrap();
        let inner = tm
            .begin(&def(TransactionAttribute::Required), Some(&outer))
            .await
            .unwrap();

        assert!(outer.is_new());
        assert!(!inner.is_new());
        assert!(inner.same_transaction(&outer));

        // Inner rollback only marks the shared transaction.
        tm.rollback(&inner).await.unwrap();
        assert!(outer.is_rollback_only());
        assert!(outer.is_active());

        let err = tm.commit(&outer).await.unwrap_err();
        assert!(matches!(err, TransactionError::RolledBack(_)));
        assert!(outer.is_completed());
    }

    #[tokio::test]
    async fn test_requires_new_is_independent() {
        let tm = LocalTransactionManager::new();
        let outer = tm.begin(&def(TransactionAttribute::Required), None).await.unwrap();
        let inner = tm
            .begin(&def(TransactionAttribute::RequiresNew), Some(&outer))
            .await
            .unwrap();
        assert!(inner.is_new());
        assert!(!inner.same_transaction(&outer));

        let (tx_flag, rx_flag) = std::sync::mpsc::channel();
        inner
            .register_synchronization(move |committed| {
                let _ = tx_flag.send(committed);
            })
            .unwrap();

        tm.commit(&inner).await.unwrap();
        tm.rollback(&outer).await.unwrap();

        assert!(rx_flag.recv().unwrap());
        assert_eq!(tm.commit_count(), 1);
        assert_eq!(tm.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_mandatory_and_never() {
        let tm = LocalTransactionManager::new();
        let err = tm
            .begin(&def(TransactionAttribute::Mandatory), None)
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::NoExistingTransaction);

        let outer = tm.begin(&def(TransactionAttribute::RequiresNew), None).await.unwrap();
        let err = tm
            .begin(&def(TransactionAttribute::Never), Some(&outer))
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::ExistingTransaction);

        let mandatory = tm
            .begin(&def(TransactionAttribute::Mandatory), Some(&outer))
            .await
            .unwrap();
        assert!(mandatory.same_transaction(&outer));
    }

    #[tokio::test]
    async fn test_supports_and_not_supported() {
        let tm = LocalTransactionManager::new();
        let none = tm.begin(&def(TransactionAttribute::Supports), None).await.unwrap();
        assert!(!none.is_active());
        assert!(none.register_synchronization(|_| {}).is_err());
        tm.commit(&none).await.unwrap();

        let outer = tm.begin(&def(TransactionAttribute::Required), None).await.unwrap();
        let supports = tm
            .begin(&def(TransactionAttribute::Supports), Some(&outer))
            .await
            .unwrap();
        assert!(supports.same_transaction(&outer));

        let suspended = tm
            .begin(&def(TransactionAttribute::NotSupported), Some(&outer))
            .await
            .unwrap();
        assert!(!suspended.is_active());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_rolls_back() {
        let tm = LocalTransactionManager::new();
        tm.fail_next_commits(1);

        let tx = tm.begin(&def(TransactionAttribute::RequiresNew), None).await.unwrap();
        let (tx_flag, rx_flag) = std::sync::mpsc::channel();
        tx.register_synchronization(move |committed| {
            let _ = tx_flag.send(committed);
        })
        .unwrap();

        let err = tm.commit(&tx).await.unwrap_err();
        assert!(matches!(err, TransactionError::CommitFailed { .. }));
        assert!(!rx_flag.recv().unwrap());

        // Only the next commit was poisoned.
        let tx = tm.begin(&def(TransactionAttribute::RequiresNew), None).await.unwrap();
        tm.commit(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_double_commit_is_rejected() {
        let tm = LocalTransactionManager::new();
        let tx = tm.begin(&def(TransactionAttribute::Required), None).await.unwrap();
        tm.commit(&tx).await.unwrap();
        let err = tm.commit(&tx).await.unwrap_err();
        assert!(matches!(err, TransactionError::AlreadyCompleted(_)));
        // Rollback after completion is a no-op.
        tm.rollback(&tx).await.unwrap();
        assert_eq!(tm.rollback_count(), 0);
    }
}
