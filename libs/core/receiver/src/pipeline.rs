//! Business processing invoked once per accepted message.

use crate::error::PipelineError;
use crate::message::MessageContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{AsRefStr, Display, EnumString};

/// How the pipeline ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitState {
    #[default]
    Success,
    Error,
    Rejected,
}

/// Result of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub result: String,
    pub exit_state: ExitState,
}

impl PipelineResult {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            exit_state: ExitState::Success,
        }
    }

    pub fn error(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            exit_state: ExitState::Error,
        }
    }

    pub fn rejected(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            exit_state: ExitState::Rejected,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_state == ExitState::Success
    }
}

/// Trait for message pipelines.
///
/// Return `Ok` with an exit state for handled messages, `Err` for failures.
/// Failures are retried or quarantined by the receiver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn process(
        &self,
        correlation_id: &str,
        payload: &str,
        ctx: &mut MessageContext,
    ) -> Result<PipelineResult, PipelineError>;

    /// Get the pipeline name for logging.
    fn name(&self) -> &'static str;
}

/// Pipeline that accepts every message
#[derive(Debug, Default)]
pub struct NoOpPipeline {
    processed: AtomicU64,
}

impl NoOpPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pipeline for NoOpPipeline {
    async fn process(
        &self,
        _correlation_id: &str,
        payload: &str,
        _ctx: &mut MessageContext,
    ) -> Result<PipelineResult, PipelineError> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(PipelineResult::success(payload))
    }

    fn name(&self) -> &'static str {
        "NoOpPipeline"
    }
}

/// Pipeline that fails every message
#[derive(Debug)]
pub struct FailingPipeline {
    message: String,
    attempts: AtomicU64,
}

impl FailingPipeline {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pipeline for FailingPipeline {
    async fn process(
        &self,
        _correlation_id: &str,
        _payload: &str,
        _ctx: &mut MessageContext,
    ) -> Result<PipelineResult, PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::failed(self.message.clone()))
    }

    fn name(&self) -> &'static str {
        "FailingPipeline"
    }
}
