//! Construction-time configuration.
//!
//! Every field carries a serde default so embedders can deserialize partial
//! tables (e.g. from a `config.toml` section) and still get the documented
//! defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Message bus ───────────────────────────────────────────────────

/// Message bus tunables (`[bus]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    /// Retries per queued message before the retry sweep gives up.
    #[serde(default = "default_bus_max_retries")]
    pub max_retries: u32,
    /// Base delay (ms) before the first re-delivery attempt; doubles per retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Age (ms) after which a pending message is dropped by the timeout sweep.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Pending-queue capacity per agent; oldest entries are evicted beyond it.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: default_bus_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_bus_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_max_queue_size() -> usize {
    1000
}

// ── Router ────────────────────────────────────────────────────────

/// Policy for choosing among multiple eligible recipients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastBusy,
    Random,
    /// Weight-ordered selection. High-priority messages prefer heavier
    /// agents; ordinary traffic prefers lighter ones.
    PriorityBased {
        #[serde(default)]
        weights: HashMap<String, u32>,
    },
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        Self::LeastBusy
    }
}

/// Message router tunables (`[router]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterConfig {
    #[serde(default = "default_true")]
    pub enable_load_balancing: bool,
    #[serde(default)]
    pub load_balancing: LoadBalancingStrategy,
    #[serde(default = "default_true")]
    pub enable_circuit_breaker: bool,
    /// Consecutive failures before a recipient's breaker opens.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Routing-hop ceiling guarding against rule cycles.
    #[serde(default = "default_max_routing_hops")]
    pub max_routing_hops: u32,
    /// Agent that receives escalated high-priority traffic.
    #[serde(default = "default_supervisor_agent")]
    pub supervisor_agent: String,
    /// Agent that receives duplicated compliance-tagged traffic.
    #[serde(default = "default_compliance_agent")]
    pub compliance_agent: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_load_balancing: true,
            load_balancing: LoadBalancingStrategy::default(),
            enable_circuit_breaker: true,
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            max_routing_hops: default_max_routing_hops(),
            supervisor_agent: default_supervisor_agent(),
            compliance_agent: default_compliance_agent(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_max_routing_hops() -> u32 {
    10
}

fn default_supervisor_agent() -> String {
    "supervisor".to_string()
}

fn default_compliance_agent() -> String {
    "compliance".to_string()
}

// ── Error handler ─────────────────────────────────────────────────

/// Communication error handler tunables (`[recovery]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Fallback retry ceiling for error kinds with no registered policy.
    #[serde(default = "default_recovery_max_retries")]
    pub max_retries: u32,
    /// Fallback base delay (ms) for error kinds with no registered policy.
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Ceiling applied to exponentially grown delays.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_true")]
    pub jitter_enabled: bool,
    #[serde(default = "default_true")]
    pub dead_letter_queue_enabled: bool,
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    /// Consecutive handled failures per agent before the handler's own
    /// breaker opens.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_recovery_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            exponential_backoff: true,
            jitter_enabled: true,
            dead_letter_queue_enabled: true,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

fn default_recovery_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}
