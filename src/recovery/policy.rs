//! Retry policies and backoff computation.

use super::{CommunicationError, ErrorKind};
use crate::config::RecoveryConfig;
use rand::RngExt;
use std::collections::HashMap;
use std::sync::Arc;

pub type ErrorPredicate = dyn Fn(&CommunicationError) -> bool + Send + Sync;

/// Per-error-kind parameters governing whether and how long to wait before
/// reattempting delivery.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_max_ms: u64,
    /// Extra gate deciding whether a given error is retryable under this
    /// policy.
    pub condition: Option<Arc<ErrorPredicate>>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64, backoff_multiplier: f64, jitter_max_ms: u64) -> Self {
        Self {
            max_retries,
            delay_ms,
            backoff_multiplier,
            jitter_max_ms,
            condition: None,
        }
    }

    pub fn with_condition(
        mut self,
        condition: impl Fn(&CommunicationError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Whether this policy permits retrying `error` at all. Unrecoverable
    /// errors are never retried.
    pub fn allows(&self, error: &CommunicationError) -> bool {
        if !error.recoverable {
            return false;
        }
        match &self.condition {
            Some(condition) => condition(error),
            None => true,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("delay_ms", &self.delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_max_ms", &self.jitter_max_ms)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

/// Built-in policies per error kind. Validation errors require human
/// correction and are never auto-retried.
pub(super) fn default_policies() -> HashMap<ErrorKind, RetryPolicy> {
    let mut policies = HashMap::new();
    policies.insert(ErrorKind::Timeout, RetryPolicy::new(3, 2000, 2.0, 1000));
    policies.insert(
        ErrorKind::DeliveryFailure,
        RetryPolicy::new(5, 500, 1.5, 500),
    );
    policies.insert(
        ErrorKind::AgentUnavailable,
        RetryPolicy::new(2, 5000, 2.0, 2000),
    );
    policies.insert(ErrorKind::SystemError, RetryPolicy::new(1, 10_000, 1.0, 0));
    policies.insert(ErrorKind::ValidationError, RetryPolicy::new(0, 0, 1.0, 0));
    policies
}

/// Delay before the next attempt: exponential growth capped at the
/// configured maximum, plus uniform jitter, each gated by config.
pub(super) fn compute_delay(
    policy: &RetryPolicy,
    retry_count: u32,
    config: &RecoveryConfig,
) -> u64 {
    let mut delay = policy.delay_ms;
    if config.exponential_backoff {
        let grown = (policy.delay_ms as f64) * policy.backoff_multiplier.powi(retry_count as i32);
        delay = if grown.is_finite() {
            grown.min(config.max_retry_delay_ms as f64) as u64
        } else {
            config.max_retry_delay_ms
        };
    }
    if config.jitter_enabled && policy.jitter_max_ms > 0 {
        delay = delay.saturating_add(rand::rng().random_range(0..policy.jitter_max_ms));
    }
    delay
}
