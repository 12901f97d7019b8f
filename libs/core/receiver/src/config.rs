//! Receiver configuration
//!
//! This module provides `ReceiverConfig`, built either through the `with_*`
//! builder methods or from `RECEIVER_*` environment variables.

use crate::error::ReceiverError;
use crate::transaction::{TransactionAttribute, TransactionDefinition};
use core_config::{env_bool, env_duration_secs, env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tracing::warn;

/// What a receiver does when it catches an error outside message processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Log, back off and keep polling.
    #[default]
    Continue,
    /// Put the receiver in `ERROR`, which stops it until restarted.
    Recover,
    /// Stop the receiver.
    Close,
}

/// Key used to detect already-processed messages in the message log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateCheckMethod {
    #[default]
    MessageId,
    CorrelationId,
}

/// Whether the receiver polls its listener or is fed by it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverMode {
    /// Poll workers fetch messages from the listener.
    #[default]
    Pulling,
    /// The source calls `Receiver::process_request` itself.
    Pushing,
}

/// Configuration for a receiver
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Receiver name, used in logs, metrics and the registry
    pub name: String,

    /// Pulling or pushing
    pub mode: ReceiverMode,

    /// Number of poll workers
    pub num_threads: usize,

    /// Maximum number of workers inside the fetch call at the same time
    pub num_threads_polling: usize,

    /// Wait before the next fetch when the previous one returned nothing
    pub poll_interval: Duration,

    /// Reaction to errors outside message processing
    pub on_error: OnError,

    /// Propagation of the per-message transaction
    pub transaction_attribute: TransactionAttribute,

    /// Bound on pipeline execution (None = unbounded)
    pub transaction_timeout: Option<Duration>,

    /// Number of retries before a message is quarantined (None = unlimited)
    pub max_retries: Option<u32>,

    /// Capacity of the per-message try count cache
    pub process_result_cache_size: usize,

    /// Capacity of the poison message id cache
    pub poison_cache_size: usize,

    /// Reject messages already present in the message log
    pub check_for_duplicates: bool,

    /// Key used by the duplicate check
    pub duplicate_check_method: DuplicateCheckMethod,

    /// Regex extracting the business correlation id from the payload.
    /// The first capture group is used when present, else the whole match.
    pub correlation_id_pattern: Option<String>,

    /// Always flag messages as retries in their context
    pub force_retry_flag: bool,

    /// Extra attempts for a failed error storage write (0 = log only)
    pub quarantine_failure_retries: u32,

    /// Time allowed for start to reach `STARTED`
    pub start_timeout: Duration,

    /// Time allowed for stop to reach `STOPPED`
    pub stop_timeout: Duration,
}

impl ReceiverConfig {
    /// Create a new ReceiverConfig with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: ReceiverMode::Pulling,
            num_threads: 1,
            num_threads_polling: 1,
            poll_interval: Duration::from_secs(10),
            on_error: OnError::Continue,
            transaction_attribute: TransactionAttribute::Supports,
            transaction_timeout: None,
            max_retries: Some(1),
            process_result_cache_size: 100,
            poison_cache_size: 100,
            check_for_duplicates: false,
            duplicate_check_method: DuplicateCheckMethod::MessageId,
            correlation_id_pattern: None,
            force_retry_flag: false,
            quarantine_failure_retries: 0,
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_mode(mut self, mode: ReceiverMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the number of poll workers (minimum 1)
    pub fn with_num_threads(mut self, count: usize) -> Self {
        self.num_threads = count.max(1);
        self
    }

    pub fn with_num_threads_polling(mut self, count: usize) -> Self {
        self.num_threads_polling = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_transaction_attribute(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction_attribute = attribute;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retry failing messages forever instead of quarantining them
    pub fn with_unlimited_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    pub fn with_process_result_cache_size(mut self, size: usize) -> Self {
        self.process_result_cache_size = size;
        self
    }

    pub fn with_poison_cache_size(mut self, size: usize) -> Self {
        self.poison_cache_size = size;
        self
    }

    /// Enable the duplicate check against the message log
    pub fn with_duplicate_check(mut self, method: DuplicateCheckMethod) -> Self {
        self.check_for_duplicates = true;
        self.duplicate_check_method = method;
        self
    }

    pub fn with_correlation_id_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.correlation_id_pattern = Some(pattern.into());
        self
    }

    pub fn with_force_retry_flag(mut self, force: bool) -> Self {
        self.force_retry_flag = force;
        self
    }

    pub fn with_quarantine_failure_retries(mut self, retries: u32) -> Self {
        self.quarantine_failure_retries = retries;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Whether each message runs in a transaction owned by the receiver
    pub fn is_transacted(&self) -> bool {
        self.transaction_attribute.is_transacted()
    }

    /// Highest delivery count that is still processed
    pub fn max_deliveries(&self) -> Option<u32> {
        self.max_retries.map(|max| max.saturating_add(1))
    }

    /// Whether a message tried `try_count` times is out of retries
    pub fn retry_limit_reached(&self, try_count: u32) -> bool {
        self.max_retries.is_some_and(|max| try_count > max)
    }

    /// Permits for the fetch semaphore, or None when every worker may fetch
    pub fn poll_permits(&self) -> Option<usize> {
        (self.num_threads_polling < self.num_threads).then_some(self.num_threads_polling)
    }

    /// Definition of the transaction wrapping fetch and processing
    pub fn transaction_definition(&self) -> TransactionDefinition {
        TransactionDefinition::new(self.transaction_attribute).with_timeout(self.transaction_timeout)
    }

    /// Check the configuration and compile the correlation id pattern.
    ///
    /// `num_threads_polling` larger than `num_threads` is clamped, not rejected.
    pub fn validate(&mut self) -> Result<Option<Regex>, ReceiverError> {
        if self.name.trim().is_empty() {
            return Err(ReceiverError::configuration("receiver name must not be empty"));
        }
        if self.num_threads == 0 {
            return Err(ReceiverError::configuration("num_threads must be at least 1"));
        }
        if self.num_threads_polling == 0 {
            return Err(ReceiverError::configuration("num_threads_polling must be at least 1"));
        }
        if self.num_threads_polling > self.num_threads {
            warn!(
                receiver = %self.name,
                num_threads = self.num_threads,
                num_threads_polling = self.num_threads_polling,
                "num_threads_polling exceeds num_threads, clamping"
            );
            self.num_threads_polling = self.num_threads;
        }
        if self.process_result_cache_size == 0 || self.poison_cache_size == 0 {
            return Err(ReceiverError::configuration("cache sizes must be at least 1"));
        }

        self.correlation_id_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ReceiverError::configuration(format!("invalid correlation id pattern '{}': {}", pattern, e))
                })
            })
            .transpose()
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self::new("receiver")
    }
}

impl FromEnv for ReceiverConfig {
    /// Reads `RECEIVER_*` variables, falling back to the defaults of
    /// [`ReceiverConfig::new`].
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = ReceiverConfig::new(env_or_default("RECEIVER_NAME", "receiver"));

        let transaction_timeout = match env_parse("RECEIVER_TRANSACTION_TIMEOUT_SECS", 0u64)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            mode: env_parse("RECEIVER_MODE", defaults.mode)?,
            num_threads: env_parse("RECEIVER_NUM_THREADS", defaults.num_threads)?,
            num_threads_polling: env_parse("RECEIVER_NUM_THREADS_POLLING", defaults.num_threads_polling)?,
            poll_interval: env_duration_secs("RECEIVER_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            on_error: env_parse("RECEIVER_ON_ERROR", defaults.on_error)?,
            transaction_attribute: env_parse("RECEIVER_TRANSACTION_ATTRIBUTE", defaults.transaction_attribute)?,
            transaction_timeout,
            max_retries: env_max_retries(defaults.max_retries)?,
            process_result_cache_size: env_parse(
                "RECEIVER_PROCESS_RESULT_CACHE_SIZE",
                defaults.process_result_cache_size,
            )?,
            poison_cache_size: env_parse("RECEIVER_POISON_CACHE_SIZE", defaults.poison_cache_size)?,
            check_for_duplicates: env_bool("RECEIVER_CHECK_FOR_DUPLICATES", defaults.check_for_duplicates)?,
            duplicate_check_method: env_parse(
                "RECEIVER_CHECK_FOR_DUPLICATES_METHOD",
                defaults.duplicate_check_method,
            )?,
            correlation_id_pattern: env_optional("RECEIVER_CORRELATION_ID_PATTERN"),
            force_retry_flag: env_bool("RECEIVER_FORCE_RETRY_FLAG", defaults.force_retry_flag)?,
            quarantine_failure_retries: env_parse(
                "RECEIVER_QUARANTINE_FAILURE_RETRIES",
                defaults.quarantine_failure_retries,
            )?,
            start_timeout: env_duration_secs("RECEIVER_START_TIMEOUT_SECS", defaults.start_timeout)?,
            stop_timeout: env_duration_secs("RECEIVER_STOP_TIMEOUT_SECS", defaults.stop_timeout)?,
            name: defaults.name,
        })
    }
}

/// `RECEIVER_MAX_RETRIES`, where a negative value means unlimited
fn env_max_retries(default: Option<u32>) -> Result<Option<u32>, ConfigError> {
    const KEY: &str = "RECEIVER_MAX_RETRIES";
    if env_optional(KEY).is_none() {
        return Ok(default);
    }
    let raw: i64 = env_parse(KEY, 0)?;
    if raw < 0 {
        return Ok(None);
    }
    u32::try_from(raw)
        .map(Some)
        .map_err(|e| ConfigError::parse(KEY, e))
}
