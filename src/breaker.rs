//! Per-agent circuit breaker table.
//!
//! Tracks delivery failure counts per agent and blocks further attempts once
//! a threshold is reached (circuit breaker pattern). An open breaker closes
//! again on its own once the cool-down has elapsed since the last failure.
//!
//! The router and the error handler each hold their own independent table;
//! the two failure views for a given agent are deliberately separate.

use crate::observability::{BusEvent, Observer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Cool-down after which an open breaker closes and zeroes its failures.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
        }
    }
}

/// Thread-safe breaker table keyed by agent identifier.
pub struct CircuitBreakerTable {
    states: Mutex<HashMap<String, BreakerState>>,
    threshold: u32,
    reset_after: Duration,
    observer: Arc<dyn Observer>,
}

impl CircuitBreakerTable {
    pub fn new(threshold: u32, observer: Arc<dyn Observer>) -> Self {
        Self::with_reset_after(threshold, DEFAULT_RESET_AFTER, observer)
    }

    /// Construct with an explicit cool-down. Production callers use
    /// [`DEFAULT_RESET_AFTER`]; tests shrink it.
    pub fn with_reset_after(
        threshold: u32,
        reset_after: Duration,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            reset_after,
            observer,
        }
    }

    /// Whether the breaker for `agent` is open.
    ///
    /// Lazy auto-reset: an open breaker whose cool-down has elapsed closes
    /// here, zeroing its failure count.
    pub fn is_open(&self, agent: &str) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(agent) else {
            return false;
        };
        if !state.is_open {
            return false;
        }
        let expired = state
            .last_failure
            .is_none_or(|at| at.elapsed() >= self.reset_after);
        if expired {
            state.is_open = false;
            state.failures = 0;
            state.last_failure = None;
            drop(states);
            self.observer.record_event(&BusEvent::CircuitBreakerReset {
                agent: agent.to_string(),
            });
            return false;
        }
        true
    }

    /// Record a successful delivery: decrements the failure count toward
    /// zero. Never increments, never opens.
    pub fn record_success(&self, agent: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(agent) {
            state.failures = state.failures.saturating_sub(1);
        }
    }

    /// Record a failed delivery. Returns `true` when this failure opened the
    /// breaker.
    pub fn record_failure(&self, agent: &str) -> bool {
        let mut states = self.states.lock();
        let state = states
            .entry(agent.to_string())
            .or_insert_with(BreakerState::new);
        state.failures += 1;
        state.last_failure = Some(Instant::now());

        let newly_opened = !state.is_open && state.failures >= self.threshold;
        if newly_opened {
            state.is_open = true;
            let failures = state.failures;
            drop(states);
            warn!(
                agent = agent,
                failures,
                threshold = self.threshold,
                "failure threshold reached - opening circuit breaker"
            );
            self.observer.record_event(&BusEvent::CircuitBreakerOpened {
                agent: agent.to_string(),
            });
        }
        newly_opened
    }

    /// Current failure count for an agent.
    pub fn failure_count(&self, agent: &str) -> u32 {
        self.states
            .lock()
            .get(agent)
            .map_or(0, |state| state.failures)
    }

    /// Open-state per tracked agent, with lazy auto-reset applied.
    pub fn snapshot(&self) -> HashMap<String, bool> {
        let agents: Vec<String> = self.states.lock().keys().cloned().collect();
        agents
            .into_iter()
            .map(|agent| {
                let open = self.is_open(&agent);
                (agent, open)
            })
            .collect()
    }
}
