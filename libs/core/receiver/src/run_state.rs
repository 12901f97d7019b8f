//! Receiver run state, published through a `tokio::sync::watch` channel.
//!
//! Readers can peek at the current state without blocking, subscribe to
//! changes, or wait (with a timeout) for a particular state.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl RunState {
    /// States from which a start request is accepted
    pub fn can_start(&self) -> bool {
        matches!(self, RunState::Stopped | RunState::Error)
    }
}

/// Owner of a receiver's run state
#[derive(Debug)]
pub struct RunStateManager {
    tx: watch::Sender<RunState>,
}

impl RunStateManager {
    pub fn new(initial: RunState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current state, without blocking
    pub fn get(&self) -> RunState {
        *self.tx.borrow()
    }

    pub fn is(&self, state: RunState) -> bool {
        self.get() == state
    }

    /// Set the state, returning the previous one
    pub fn set(&self, state: RunState) -> RunState {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Run state changed");
        }
        previous
    }

    /// Move to `to` only if the current state satisfies `allowed`.
    ///
    /// Returns the state observed before the attempt and whether the
    /// transition happened.
    pub fn transition(&self, allowed: impl Fn(&RunState) -> bool, to: RunState) -> (RunState, bool) {
        let mut observed = self.get();
        let changed = self.tx.send_if_modified(|current| {
            observed = *current;
            if allowed(current) && *current != to {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(from = %observed, to = %to, "Run state changed");
        }
        (observed, changed)
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// Wait until the state equals `target`. Returns false on timeout.
    pub async fn wait_for(&self, target: RunState, timeout: Duration) -> bool {
        self.wait_for_any(&[target], timeout).await.is_some()
    }

    /// Wait until the state is one of `targets` and return it.
    pub async fn wait_for_any(&self, targets: &[RunState], timeout: Duration) -> Option<RunState> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| targets.contains(state)).await.map(|state| *state)
        })
        .await;
        match waited {
            Ok(Ok(state)) => Some(state),
            _ => None,
        }
    }

    /// Sleep for `duration` unless the state leaves `state` first.
    ///
    /// Returns true if the full duration elapsed while still in `state`.
    pub async fn sleep_while(&self, state: RunState, duration: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() != state {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is(state),
            _ = rx.wait_for(|current| *current != state) => false,
        }
    }
}
