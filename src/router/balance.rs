//! Load balancing over multiple candidate recipients.

use super::MessageRouter;
use crate::config::LoadBalancingStrategy;
use crate::message::{AgentMessage, MessagePriority};
use chrono::Utc;
use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Coarse availability reported by `update_agent_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentAvailability {
    Available,
    Busy,
    Offline,
    Error,
}

/// Last-known state of one agent, fed into load-balancing decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatus {
    pub agent: String,
    pub availability: AgentAvailability,
    #[serde(default)]
    pub current_tasks: Vec<String>,
    pub last_seen: i64,
}

impl AgentStatus {
    pub fn new(agent: impl Into<String>, availability: AgentAvailability) -> Self {
        Self {
            agent: agent.into(),
            availability,
            current_tasks: Vec::new(),
            last_seen: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_tasks(mut self, current_tasks: Vec<String>) -> Self {
        self.current_tasks = current_tasks;
        self
    }
}

impl MessageRouter {
    /// Choose one recipient from the message's routing targets.
    ///
    /// Targets whose last known status is `Offline` or `Error` are dropped
    /// first; agents with no reported status are assumed eligible.
    pub(super) fn select_balanced_target(&self, message: &AgentMessage) -> Result<String, String> {
        let candidates: Vec<String> = {
            let statuses = self.agent_statuses.lock();
            message
                .metadata
                .routing_targets
                .iter()
                .filter(|target| match statuses.get(target.as_str()) {
                    Some(status) => !matches!(
                        status.availability,
                        AgentAvailability::Offline | AgentAvailability::Error
                    ),
                    None => true,
                })
                .cloned()
                .collect()
        };

        if candidates.is_empty() {
            return Err("no available agents for load balancing".to_string());
        }
        if candidates.len() == 1 {
            let mut candidates = candidates;
            return Ok(candidates.swap_remove(0));
        }

        let chosen = match &self.config.load_balancing {
            LoadBalancingStrategy::RoundRobin => {
                self.round_robin_pick(&message.message_type, &candidates)
            }
            LoadBalancingStrategy::LeastBusy => self.least_busy_pick(&candidates),
            LoadBalancingStrategy::Random => {
                let index = rand::rng().random_range(0..candidates.len());
                candidates[index].clone()
            }
            LoadBalancingStrategy::PriorityBased { weights } => {
                let mut ordered = candidates;
                let weight_of =
                    |agent: &String| weights.get(agent.as_str()).copied().unwrap_or(0);
                // High-priority traffic is steered toward higher-capacity
                // agents, ordinary traffic toward lower-weight ones.
                if message.metadata.priority == MessagePriority::High {
                    ordered.sort_by(|a, b| weight_of(b).cmp(&weight_of(a)));
                } else {
                    ordered.sort_by(|a, b| weight_of(a).cmp(&weight_of(b)));
                }
                ordered.swap_remove(0)
            }
        };
        Ok(chosen)
    }

    /// Counter keyed by message type plus the sorted candidate list. A
    /// candidate set that changes shape starts a fresh counter under the
    /// new key.
    fn round_robin_pick(&self, message_type: &str, candidates: &[String]) -> String {
        let mut sorted: Vec<&str> = candidates.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let key = format!("{message_type}:{}", sorted.join(","));

        let mut counters = self.round_robin.lock();
        let counter = counters.entry(key).or_insert(0);
        let index = *counter % candidates.len();
        *counter += 1;
        candidates[index].clone()
    }

    /// Fewest reported current tasks wins; ties keep the first candidate
    /// encountered. Unreported agents count as idle.
    fn least_busy_pick(&self, candidates: &[String]) -> String {
        let statuses = self.agent_statuses.lock();
        let mut best = &candidates[0];
        let mut best_load = statuses
            .get(best.as_str())
            .map_or(0, |status| status.current_tasks.len());
        for candidate in &candidates[1..] {
            let load = statuses
                .get(candidate.as_str())
                .map_or(0, |status| status.current_tasks.len());
            if load < best_load {
                best = candidate;
                best_load = load;
            }
        }
        best.clone()
    }
}
