//! Message router.
//!
//! Pre-processing and destination-selection layer placed in front of the
//! bus. Applies ordered routing rules (filter/transform/route/duplicate),
//! load-balances among candidate recipients, and gates delivery behind a
//! per-recipient circuit breaker. Optional: callers may use the bus
//! directly.

mod balance;

pub use balance::{AgentAvailability, AgentStatus};

use crate::breaker::CircuitBreakerTable;
use crate::bus::MessageBus;
use crate::config::RouterConfig;
use crate::message::{AgentMessage, DeliveryResult, MessagePriority};
use crate::observability::{NoopObserver, Observer};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub type RuleCondition = dyn Fn(&AgentMessage) -> bool + Send + Sync;
pub type RuleTransformer = dyn Fn(&mut AgentMessage) + Send + Sync;

/// What a matched rule does to the message under routing.
pub enum RuleAction {
    /// Drop the message; no delivery is attempted.
    Filter,
    /// Rewrite the working message in place.
    Transform(Box<RuleTransformer>),
    /// Redirect: one target overwrites the recipient, several become
    /// load-balancing candidates.
    Route(Vec<String>),
    /// Fire-and-forget copies to extra recipients.
    Duplicate(Vec<String>),
}

/// An ordered, conditional rule applied before delivery. Rules are totally
/// ordered by priority (higher first); equal priorities keep insertion
/// order.
///
/// Conditions and transformers run under the router's rule lock: keep them
/// fast and do not call back into the router from inside one.
pub struct RoutingRule {
    pub id: String,
    pub priority: i32,
    condition: Box<RuleCondition>,
    action: RuleAction,
}

impl RoutingRule {
    pub fn filter(
        id: impl Into<String>,
        priority: i32,
        condition: impl Fn(&AgentMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            condition: Box::new(condition),
            action: RuleAction::Filter,
        }
    }

    pub fn transform(
        id: impl Into<String>,
        priority: i32,
        condition: impl Fn(&AgentMessage) -> bool + Send + Sync + 'static,
        transformer: impl Fn(&mut AgentMessage) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            condition: Box::new(condition),
            action: RuleAction::Transform(Box::new(transformer)),
        }
    }

    pub fn route(
        id: impl Into<String>,
        priority: i32,
        condition: impl Fn(&AgentMessage) -> bool + Send + Sync + 'static,
        targets: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            condition: Box::new(condition),
            action: RuleAction::Route(targets),
        }
    }

    pub fn duplicate(
        id: impl Into<String>,
        priority: i32,
        condition: impl Fn(&AgentMessage) -> bool + Send + Sync + 'static,
        targets: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            condition: Box::new(condition),
            action: RuleAction::Duplicate(targets),
        }
    }

    fn matches(&self, message: &AgentMessage) -> bool {
        (self.condition)(message)
    }
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match &self.action {
            RuleAction::Filter => "filter",
            RuleAction::Transform(_) => "transform",
            RuleAction::Route(_) => "route",
            RuleAction::Duplicate(_) => "duplicate",
        };
        f.debug_struct("RoutingRule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("action", &action)
            .finish()
    }
}

/// Rule count, breaker states, and last-known agent statuses.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutingStats {
    pub rule_count: usize,
    pub circuit_breakers: HashMap<String, bool>,
    pub agent_statuses: HashMap<String, AgentStatus>,
}

/// Routes messages through rules, load balancing, and a circuit breaker
/// before handing them to the bus.
pub struct MessageRouter {
    bus: Arc<MessageBus>,
    config: RouterConfig,
    rules: Mutex<Vec<RoutingRule>>,
    breakers: CircuitBreakerTable,
    agent_statuses: Mutex<HashMap<String, AgentStatus>>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl MessageRouter {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self::with_config(bus, RouterConfig::default())
    }

    pub fn with_config(bus: Arc<MessageBus>, config: RouterConfig) -> Self {
        Self::with_observer(bus, config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        bus: Arc<MessageBus>,
        config: RouterConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let router = Self {
            bus,
            breakers: CircuitBreakerTable::new(config.circuit_breaker_threshold, observer),
            rules: Mutex::new(Vec::new()),
            agent_statuses: Mutex::new(HashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
            config,
        };
        for rule in default_rules(&router.config) {
            router.add_routing_rule(rule);
        }
        router
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route one message: hop guard, rules, load balancing, breaker check,
    /// then delegation to the bus. Never panics; every failure surfaces as
    /// a result.
    pub async fn route_message(&self, message: AgentMessage) -> DeliveryResult {
        let message_id = message.metadata.request_id.clone();

        if message.metadata.routing_hops >= self.config.max_routing_hops {
            return DeliveryResult::failed(message_id, "maximum routing hops exceeded");
        }

        let mut working = message;
        working.metadata.routing_hops += 1;

        {
            let rules = self.rules.lock();
            for rule in rules.iter() {
                if !rule.matches(&working) {
                    continue;
                }
                match &rule.action {
                    RuleAction::Filter => {
                        debug!(rule = %rule.id, message_id = %message_id, "message filtered");
                        return DeliveryResult::failed(message_id, "filtered by routing rules");
                    }
                    RuleAction::Transform(transformer) => transformer(&mut working),
                    RuleAction::Route(targets) => {
                        if targets.len() == 1 {
                            working.recipient = targets[0].clone();
                        } else {
                            working.metadata.routing_targets = targets.clone();
                        }
                    }
                    RuleAction::Duplicate(targets) => {
                        for target in targets {
                            self.duplicate_async(&working, target);
                        }
                    }
                }
            }
        }

        if self.config.enable_load_balancing && working.metadata.routing_targets.len() > 1 {
            match self.select_balanced_target(&working) {
                Ok(target) => {
                    working.recipient = target;
                    working.metadata.load_balanced = true;
                    working.metadata.routing_targets.clear();
                }
                Err(error) => return DeliveryResult::failed(message_id, error),
            }
        }

        if self.config.enable_circuit_breaker && self.breakers.is_open(&working.recipient) {
            return DeliveryResult::failed(
                message_id,
                format!("circuit breaker is open for agent: {}", working.recipient),
            );
        }

        let recipient = working.recipient.clone();
        let result = self.bus.send_message(working).await;
        if self.config.enable_circuit_breaker {
            if result.success {
                self.breakers.record_success(&recipient);
            } else {
                self.breakers.record_failure(&recipient);
            }
        }
        result
    }

    /// Fire a detached copy of `message` at `target`. Errors from duplicates
    /// are logged, never propagated.
    fn duplicate_async(&self, message: &AgentMessage, target: &str) {
        if target == message.recipient {
            return;
        }
        let mut copy = message.clone();
        copy.metadata.is_duplicate = true;
        copy.metadata.original_recipient = Some(message.recipient.clone());
        copy.recipient = target.to_string();
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            let result = bus.send_message(copy).await;
            if !result.success {
                warn!(
                    message_id = %result.message_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "duplicate delivery failed"
                );
            }
        });
    }

    /// Insert a rule before the first rule of strictly lower priority.
    pub fn add_routing_rule(&self, rule: RoutingRule) {
        let mut rules = self.rules.lock();
        let position = rules
            .iter()
            .position(|existing| existing.priority < rule.priority)
            .unwrap_or(rules.len());
        rules.insert(position, rule);
    }

    pub fn remove_routing_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.lock();
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        before != rules.len()
    }

    /// Feed the load balancer an agent's latest status.
    pub fn update_agent_status(&self, status: AgentStatus) {
        self.agent_statuses
            .lock()
            .insert(status.agent.clone(), status);
    }

    pub fn is_circuit_open(&self, agent: &str) -> bool {
        self.breakers.is_open(agent)
    }

    pub fn get_routing_stats(&self) -> RoutingStats {
        RoutingStats {
            rule_count: self.rules.lock().len(),
            circuit_breakers: self.breakers.snapshot(),
            agent_statuses: self.agent_statuses.lock().clone(),
        }
    }
}

/// Illustrative default policy installed at construction; callers remove or
/// override these like any other rule.
fn default_rules(config: &RouterConfig) -> Vec<RoutingRule> {
    let supervisor = config.supervisor_agent.clone();
    let supervisor_target = config.supervisor_agent.clone();
    let compliance = config.compliance_agent.clone();
    let compliance_target = config.compliance_agent.clone();

    vec![
        RoutingRule::route(
            "high-priority-to-supervisor",
            100,
            move |message: &AgentMessage| {
                message.metadata.priority == MessagePriority::High
                    && message.recipient != supervisor
                    && !message.is_broadcast()
            },
            vec![supervisor_target],
        ),
        RoutingRule::transform(
            "error-enhancement",
            90,
            |message: &AgentMessage| message.message_type == "error",
            |message: &mut AgentMessage| {
                if let Value::Object(content) = &mut message.content {
                    content.insert(
                        "enhanced_at".to_string(),
                        json!(Utc::now().timestamp_millis()),
                    );
                }
            },
        ),
        RoutingRule::duplicate(
            "compliance-duplicate",
            80,
            move |message: &AgentMessage| {
                message.recipient != compliance && mentions_compliance(message)
            },
            vec![compliance_target],
        ),
        RoutingRule::transform(
            "analysis-load-balance",
            70,
            |message: &AgentMessage| {
                message.message_type == "request" && message.recipient == "analysis"
            },
            |message: &mut AgentMessage| {
                message.metadata.load_balanced = true;
            },
        ),
    ]
}

fn mentions_compliance(message: &AgentMessage) -> bool {
    if message.message_type.to_lowercase().contains("compliance") {
        return true;
    }
    serde_json::to_string(&message.content)
        .is_ok_and(|text| text.to_lowercase().contains("compliance"))
}
