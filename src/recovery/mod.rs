//! Communication error recovery.
//!
//! A pluggable policy engine layered above ad-hoc delivery failures: callers
//! construct a [`CommunicationError`] for a failed attempt and ask
//! [`CommunicationErrorHandler::handle_error`] what to do next. The answer
//! (retry-with-delay, reroute, fallback, escalate, drop) drives the caller's
//! next attempt.
//!
//! This layer is independent of the bus's internal retry sweep: some callers
//! bypass it entirely and rely on the sweep alone, others use both.

mod policy;

pub use policy::{ErrorPredicate, RetryPolicy};

use crate::breaker::CircuitBreakerTable;
use crate::config::RecoveryConfig;
use crate::message::AgentMessage;
use crate::observability::{BusEvent, NoopObserver, Observer};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Classified communication failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    DeliveryFailure,
    Timeout,
    ValidationError,
    AgentUnavailable,
    SystemError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DeliveryFailure => "delivery-failure",
            Self::Timeout => "timeout",
            Self::ValidationError => "validation-error",
            Self::AgentUnavailable => "agent-unavailable",
            Self::SystemError => "system-error",
        };
        f.write_str(name)
    }
}

/// A failed communication attempt, as reported by a caller. Immutable once
/// handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommunicationError {
    pub id: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message: Option<AgentMessage>,
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl CommunicationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
            agent_type: None,
            original_message: None,
            timestamp: Utc::now().timestamp_millis(),
            retry_count: 0,
            recoverable: true,
            context: None,
        }
    }

    pub fn with_agent(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_original_message(mut self, message: AgentMessage) -> Self {
        self.original_message = Some(message);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// What to do about one classified error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    Retry,
    Reroute,
    Fallback,
    Escalate,
    Ignore,
}

/// Verdict returned to the caller of `handle_error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub should_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_action: Option<String>,
}

impl RecoveryDecision {
    fn no_retry() -> Self {
        Self {
            should_retry: false,
            delay_ms: None,
            alternative_action: None,
        }
    }

    fn action(action: impl Into<String>, should_retry: bool) -> Self {
        Self {
            should_retry,
            delay_ms: None,
            alternative_action: Some(action.into()),
        }
    }
}

/// Aggregated view for operators.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub errors_by_agent: HashMap<String, u64>,
    pub dead_letter_queue_size: usize,
    pub circuit_breakers: HashMap<String, bool>,
}

#[derive(Default)]
struct ErrorCounters {
    total: u64,
    by_kind: HashMap<ErrorKind, u64>,
    by_agent: HashMap<String, u64>,
}

/// Recovery policy engine with its own circuit breakers and dead-letter
/// queue, fully independent of the router's failure view.
pub struct CommunicationErrorHandler {
    config: RecoveryConfig,
    policies: Mutex<HashMap<ErrorKind, RetryPolicy>>,
    strategies: Mutex<HashMap<ErrorKind, RecoveryStrategy>>,
    history: Mutex<HashMap<String, Vec<CommunicationError>>>,
    dead_letters: Mutex<Vec<CommunicationError>>,
    counters: Mutex<ErrorCounters>,
    breakers: CircuitBreakerTable,
    observer: Arc<dyn Observer>,
}

impl Default for CommunicationErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationErrorHandler {
    pub fn new() -> Self {
        Self::with_config(RecoveryConfig::default())
    }

    pub fn with_config(config: RecoveryConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: RecoveryConfig, observer: Arc<dyn Observer>) -> Self {
        Self {
            policies: Mutex::new(policy::default_policies()),
            strategies: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            counters: Mutex::new(ErrorCounters::default()),
            breakers: CircuitBreakerTable::new(
                config.circuit_breaker_threshold,
                Arc::clone(&observer),
            ),
            config,
            observer,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Classify one error and decide the caller's next step.
    ///
    /// Internal handling failures, including panics from caller-supplied
    /// policy predicates, resolve to a safe no-retry decision; the handler
    /// never propagates its own errors.
    pub fn handle_error(&self, error: &CommunicationError) -> RecoveryDecision {
        match catch_unwind(AssertUnwindSafe(|| self.try_handle(error))) {
            Ok(decision) => decision,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|message| (*message).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".to_string());
                warn!(error_id = %error.id, detail = %detail, "error handling failed");
                self.observer
                    .record_event(&BusEvent::ErrorHandlingFailed { detail });
                RecoveryDecision::no_retry()
            }
        }
    }

    fn try_handle(&self, error: &CommunicationError) -> RecoveryDecision {
        self.record(error);

        if self.config.circuit_breaker_enabled {
            if let Some(agent) = &error.agent_type {
                self.breakers.record_failure(agent);
                if self.breakers.is_open(agent) {
                    debug!(agent = %agent, error_id = %error.id, "breaker open, not consulting strategy");
                    return RecoveryDecision::action("circuit-breaker-open", false);
                }
            }
        }

        match self.resolve_strategy(error.kind) {
            RecoveryStrategy::Retry => self.decide_retry(error),
            RecoveryStrategy::Reroute => self.decide_reroute(error),
            RecoveryStrategy::Fallback => {
                self.observer.record_event(&BusEvent::FallbackActivated {
                    error_id: error.id.clone(),
                });
                RecoveryDecision::action("fallback-response", false)
            }
            RecoveryStrategy::Escalate => {
                self.observer.record_event(&BusEvent::ErrorEscalated {
                    error_id: error.id.clone(),
                });
                RecoveryDecision::action("escalate-to-supervisor", false)
            }
            RecoveryStrategy::Ignore => RecoveryDecision::no_retry(),
        }
    }

    /// Registered strategy, else the built-in default for the kind.
    fn resolve_strategy(&self, kind: ErrorKind) -> RecoveryStrategy {
        if let Some(strategy) = self.strategies.lock().get(&kind) {
            return *strategy;
        }
        match kind {
            ErrorKind::Timeout | ErrorKind::DeliveryFailure => RecoveryStrategy::Retry,
            ErrorKind::AgentUnavailable => RecoveryStrategy::Reroute,
            ErrorKind::ValidationError => RecoveryStrategy::Escalate,
            ErrorKind::SystemError => RecoveryStrategy::Fallback,
        }
    }

    fn decide_retry(&self, error: &CommunicationError) -> RecoveryDecision {
        let policy = self
            .policies
            .lock()
            .get(&error.kind)
            .cloned()
            .unwrap_or_else(|| self.generic_policy());

        if !policy.allows(error) || error.retry_count >= policy.max_retries {
            self.push_dead_letter(error);
            return RecoveryDecision::no_retry();
        }

        let delay_ms = policy::compute_delay(&policy, error.retry_count, &self.config);
        RecoveryDecision {
            should_retry: true,
            delay_ms: Some(delay_ms),
            alternative_action: None,
        }
    }

    fn decide_reroute(&self, error: &CommunicationError) -> RecoveryDecision {
        let alternative = error
            .agent_type
            .as_deref()
            .and_then(alternative_agent);
        match alternative {
            Some(alternative) => {
                self.observer.record_event(&BusEvent::MessageRerouted {
                    from: error.agent_type.clone().unwrap_or_default(),
                    to: alternative.to_string(),
                });
                RecoveryDecision::action(format!("reroute-to-{alternative}"), true)
            }
            None => RecoveryDecision::action("escalate-no-alternative", false),
        }
    }

    /// Fallback policy for error kinds with nothing registered, derived from
    /// the handler's own config.
    fn generic_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.base_retry_delay_ms, 2.0, 1000)
    }

    fn push_dead_letter(&self, error: &CommunicationError) {
        if !self.config.dead_letter_queue_enabled {
            return;
        }
        self.dead_letters.lock().push(error.clone());
        self.observer.record_event(&BusEvent::MessageMovedToDlq {
            error_id: error.id.clone(),
        });
    }

    /// Log the error into per-conversation and per-agent history plus the
    /// aggregate counters.
    fn record(&self, error: &CommunicationError) {
        {
            let mut history = self.history.lock();
            if let Some(conversation_id) = error
                .original_message
                .as_ref()
                .map(|message| message.metadata.conversation_id.clone())
            {
                history
                    .entry(conversation_id)
                    .or_default()
                    .push(error.clone());
            }
            if let Some(agent) = &error.agent_type {
                history.entry(agent.clone()).or_default().push(error.clone());
            }
        }
        let mut counters = self.counters.lock();
        counters.total += 1;
        *counters.by_kind.entry(error.kind).or_insert(0) += 1;
        if let Some(agent) = &error.agent_type {
            *counters.by_agent.entry(agent.clone()).or_insert(0) += 1;
        }
    }

    /// Register or replace the retry policy for one error kind.
    pub fn add_retry_policy(&self, kind: ErrorKind, policy: RetryPolicy) {
        self.policies.lock().insert(kind, policy);
    }

    /// Register or replace the recovery strategy for one error kind.
    pub fn add_recovery_strategy(&self, kind: ErrorKind, strategy: RecoveryStrategy) {
        self.strategies.lock().insert(kind, strategy);
    }

    pub fn get_error_stats(&self) -> ErrorStats {
        let counters = self.counters.lock();
        ErrorStats {
            total_errors: counters.total,
            errors_by_kind: counters.by_kind.clone(),
            errors_by_agent: counters.by_agent.clone(),
            dead_letter_queue_size: self.dead_letters.lock().len(),
            circuit_breakers: self.breakers.snapshot(),
        }
    }

    pub fn get_dead_letter_queue(&self) -> Vec<CommunicationError> {
        self.dead_letters.lock().clone()
    }

    /// Manual drain path for operators. Returns the number of entries
    /// removed.
    pub fn clear_dead_letter_queue(&self) -> usize {
        let mut dead_letters = self.dead_letters.lock();
        let drained = dead_letters.len();
        dead_letters.clear();
        drained
    }

    /// History by conversation id or agent type.
    pub fn get_error_history(&self, key: &str) -> Vec<CommunicationError> {
        self.history.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn is_circuit_open(&self, agent: &str) -> bool {
        self.breakers.is_open(agent)
    }
}

/// Fixed alternative-agent map consulted by the reroute strategy. The
/// supervisor has no stand-in.
fn alternative_agent(agent: &str) -> Option<&'static str> {
    match agent {
        "research" => Some("analysis"),
        "analysis" => Some("research"),
        "planning" | "compliance" | "synthesis" => Some("supervisor"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemoryObserver;
    use serde_json::json;

    fn no_jitter_handler() -> CommunicationErrorHandler {
        CommunicationErrorHandler::with_config(RecoveryConfig {
            jitter_enabled: false,
            ..RecoveryConfig::default()
        })
    }

    #[test]
    fn timeout_errors_retry_with_exponential_delay() {
        let handler = no_jitter_handler();

        let first = handler.handle_error(&CommunicationError::new(ErrorKind::Timeout, "slow"));
        assert!(first.should_retry);
        assert_eq!(first.delay_ms, Some(2000));

        let second = handler.handle_error(
            &CommunicationError::new(ErrorKind::Timeout, "slow").with_retry_count(1),
        );
        assert_eq!(second.delay_ms, Some(4000));

        let third = handler.handle_error(
            &CommunicationError::new(ErrorKind::Timeout, "slow").with_retry_count(2),
        );
        assert_eq!(third.delay_ms, Some(8000));
    }

    #[test]
    fn exhausted_timeout_error_lands_in_dead_letter_queue() {
        let handler = no_jitter_handler();
        let error = CommunicationError::new(ErrorKind::Timeout, "slow").with_retry_count(3);

        let decision = handler.handle_error(&error);
        assert!(!decision.should_retry);

        let dlq = handler.get_dead_letter_queue();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].id, error.id);
    }

    #[test]
    fn condition_rejection_lands_in_dead_letter_queue() {
        let handler = no_jitter_handler();
        handler.add_retry_policy(
            ErrorKind::DeliveryFailure,
            RetryPolicy::new(5, 500, 1.5, 0).with_condition(|_| false),
        );

        let error = CommunicationError::new(ErrorKind::DeliveryFailure, "bounced");
        let decision = handler.handle_error(&error);
        assert!(!decision.should_retry);
        assert_eq!(handler.get_dead_letter_queue().len(), 1);
    }

    #[test]
    fn panicking_policy_condition_resolves_to_no_retry() {
        let observer = Arc::new(MemoryObserver::new());
        let handler = CommunicationErrorHandler::with_observer(
            RecoveryConfig::default(),
            Arc::clone(&observer) as Arc<dyn Observer>,
        );
        handler.add_retry_policy(
            ErrorKind::Timeout,
            RetryPolicy::new(3, 1000, 2.0, 0).with_condition(|_| panic!("bad predicate")),
        );

        let decision = handler.handle_error(&CommunicationError::new(ErrorKind::Timeout, "slow"));
        assert_eq!(decision, RecoveryDecision::no_retry());
        assert!(observer.contains(&BusEvent::ErrorHandlingFailed {
            detail: "bad predicate".to_string()
        }));
    }

    #[test]
    fn unrecoverable_errors_are_never_retried() {
        let handler = no_jitter_handler();
        let error = CommunicationError::new(ErrorKind::Timeout, "poisoned").unrecoverable();
        let decision = handler.handle_error(&error);
        assert!(!decision.should_retry);
        assert_eq!(handler.get_dead_letter_queue().len(), 1);
    }

    #[test]
    fn disabled_dead_letter_queue_stays_empty() {
        let handler = CommunicationErrorHandler::with_config(RecoveryConfig {
            dead_letter_queue_enabled: false,
            jitter_enabled: false,
            ..RecoveryConfig::default()
        });

        let error = CommunicationError::new(ErrorKind::Timeout, "slow").with_retry_count(3);
        let decision = handler.handle_error(&error);
        assert!(!decision.should_retry);
        assert!(handler.get_dead_letter_queue().is_empty());
    }

    #[test]
    fn agent_unavailable_reroutes_to_alternative() {
        let handler = no_jitter_handler();

        let decision = handler.handle_error(
            &CommunicationError::new(ErrorKind::AgentUnavailable, "down").with_agent("research"),
        );
        assert!(decision.should_retry);
        assert_eq!(decision.alternative_action.as_deref(), Some("reroute-to-analysis"));

        let decision = handler.handle_error(
            &CommunicationError::new(ErrorKind::AgentUnavailable, "down").with_agent("planning"),
        );
        assert_eq!(
            decision.alternative_action.as_deref(),
            Some("reroute-to-supervisor")
        );
    }

    #[test]
    fn supervisor_has_no_reroute_alternative() {
        let handler = no_jitter_handler();
        let decision = handler.handle_error(
            &CommunicationError::new(ErrorKind::AgentUnavailable, "down").with_agent("supervisor"),
        );
        assert!(!decision.should_retry);
        assert_eq!(
            decision.alternative_action.as_deref(),
            Some("escalate-no-alternative")
        );
    }

    #[test]
    fn system_errors_fall_back_and_validation_errors_escalate() {
        let observer = Arc::new(MemoryObserver::new());
        let handler = CommunicationErrorHandler::with_observer(
            RecoveryConfig::default(),
            Arc::clone(&observer) as Arc<dyn Observer>,
        );

        let system = CommunicationError::new(ErrorKind::SystemError, "disk full");
        let decision = handler.handle_error(&system);
        assert!(!decision.should_retry);
        assert_eq!(decision.alternative_action.as_deref(), Some("fallback-response"));
        assert!(observer.contains(&BusEvent::FallbackActivated {
            error_id: system.id.clone()
        }));

        let invalid = CommunicationError::new(ErrorKind::ValidationError, "missing sender");
        let decision = handler.handle_error(&invalid);
        assert!(!decision.should_retry);
        assert_eq!(
            decision.alternative_action.as_deref(),
            Some("escalate-to-supervisor")
        );
        assert!(observer.contains(&BusEvent::ErrorEscalated {
            error_id: invalid.id.clone()
        }));
    }

    #[test]
    fn registered_strategy_overrides_default() {
        let handler = no_jitter_handler();
        handler.add_recovery_strategy(ErrorKind::SystemError, RecoveryStrategy::Ignore);

        let decision =
            handler.handle_error(&CommunicationError::new(ErrorKind::SystemError, "disk full"));
        assert_eq!(decision, RecoveryDecision::no_retry());
    }

    #[test]
    fn validation_errors_overridden_to_retry_still_never_retry() {
        // The built-in validation policy has max_retries = 0, so even a
        // caller that points the strategy at Retry gets a dead letter.
        let handler = no_jitter_handler();
        handler.add_recovery_strategy(ErrorKind::ValidationError, RecoveryStrategy::Retry);

        let error = CommunicationError::new(ErrorKind::ValidationError, "missing sender");
        let decision = handler.handle_error(&error);
        assert!(!decision.should_retry);
        assert_eq!(handler.get_dead_letter_queue().len(), 1);
    }

    #[test]
    fn breaker_short_circuits_strategy_resolution() {
        let handler = CommunicationErrorHandler::with_config(RecoveryConfig {
            circuit_breaker_threshold: 2,
            jitter_enabled: false,
            ..RecoveryConfig::default()
        });

        let error = CommunicationError::new(ErrorKind::Timeout, "slow").with_agent("analysis");
        let first = handler.handle_error(&error);
        assert!(first.should_retry, "first failure still retries");

        let second = handler.handle_error(&error);
        assert!(!second.should_retry);
        assert_eq!(
            second.alternative_action.as_deref(),
            Some("circuit-breaker-open")
        );
        assert!(handler.is_circuit_open("analysis"));
    }

    #[test]
    fn breaker_disabled_never_blocks() {
        let handler = CommunicationErrorHandler::with_config(RecoveryConfig {
            circuit_breaker_enabled: false,
            circuit_breaker_threshold: 1,
            jitter_enabled: false,
            ..RecoveryConfig::default()
        });

        let error = CommunicationError::new(ErrorKind::Timeout, "slow").with_agent("analysis");
        for _ in 0..3 {
            let decision = handler.handle_error(&error);
            assert_ne!(
                decision.alternative_action.as_deref(),
                Some("circuit-breaker-open")
            );
        }
    }

    #[test]
    fn stats_and_history_track_kind_agent_and_conversation() {
        let handler = no_jitter_handler();
        let message = AgentMessage::new("planning", "analysis", "request", json!({}), "conv-9");

        handler.handle_error(
            &CommunicationError::new(ErrorKind::Timeout, "slow")
                .with_agent("analysis")
                .with_original_message(message),
        );
        handler.handle_error(&CommunicationError::new(ErrorKind::SystemError, "disk full"));

        let stats = handler.get_error_stats();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.errors_by_kind.get(&ErrorKind::Timeout), Some(&1));
        assert_eq!(stats.errors_by_kind.get(&ErrorKind::SystemError), Some(&1));
        assert_eq!(stats.errors_by_agent.get("analysis"), Some(&1));

        assert_eq!(handler.get_error_history("conv-9").len(), 1);
        assert_eq!(handler.get_error_history("analysis").len(), 1);
        assert!(handler.get_error_history("unknown").is_empty());
    }

    #[test]
    fn clear_dead_letter_queue_reports_drained_count() {
        let handler = no_jitter_handler();
        for _ in 0..3 {
            handler.handle_error(
                &CommunicationError::new(ErrorKind::Timeout, "slow").with_retry_count(9),
            );
        }
        assert_eq!(handler.get_error_stats().dead_letter_queue_size, 3);
        assert_eq!(handler.clear_dead_letter_queue(), 3);
        assert!(handler.get_dead_letter_queue().is_empty());
    }

    #[test]
    fn generic_policy_covers_unregistered_kinds() {
        let handler = no_jitter_handler();
        {
            handler.policies.lock().clear();
        }
        let decision = handler.handle_error(&CommunicationError::new(ErrorKind::Timeout, "slow"));
        assert!(decision.should_retry);
        assert_eq!(decision.delay_ms, Some(1000));
    }
}
