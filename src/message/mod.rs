use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Message urgency. `High` traffic is steered toward supervisor/high-capacity
/// agents by the router's default policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Delivery metadata carried by every message.
///
/// The `routing_*` fields are annotations written by the router while a
/// message moves through routing rules; callers normally leave them at their
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    pub conversation_id: String,
    pub request_id: String,
    /// Unix epoch milliseconds at message creation.
    pub timestamp: i64,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Candidate recipients stashed by a multi-target `route` rule for the
    /// load-balancing step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_targets: Vec<String>,
    /// Number of times this message has passed through the router.
    #[serde(default)]
    pub routing_hops: u32,
    #[serde(default)]
    pub load_balanced: bool,
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_recipient: Option<String>,
}

impl MessageMetadata {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            priority: MessagePriority::Normal,
            routing_targets: Vec::new(),
            routing_hops: 0,
            load_balanced: false,
            is_duplicate: false,
            original_recipient: None,
        }
    }
}

/// A structured message exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub sender: String,
    pub recipient: String,
    /// String tag such as `request`, `response`, or `error`.
    pub message_type: String,
    /// Opaque payload; structured payloads are JSON objects.
    pub content: Value,
    pub metadata: MessageMetadata,
}

impl AgentMessage {
    /// Reserved recipient value that fans a message out to every subscriber.
    pub const BROADCAST: &'static str = "broadcast";

    /// Construct a direct message with a fresh request id and now-timestamp.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        content: Value,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            content,
            metadata: MessageMetadata::new(conversation_id),
        }
    }

    /// Construct a broadcast message.
    pub fn broadcast(
        sender: impl Into<String>,
        message_type: impl Into<String>,
        content: Value,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self::new(sender, Self::BROADCAST, message_type, content, conversation_id)
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == Self::BROADCAST
    }

    /// Validate the identifying fields a message must carry before queuing.
    pub fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty(&self.sender, "sender")?;
        require_non_empty(&self.recipient, "recipient")?;
        require_non_empty(&self.message_type, "message_type")?;
        require_non_empty(&self.metadata.conversation_id, "conversation_id")?;
        require_non_empty(&self.metadata.request_id, "request_id")?;
        Ok(())
    }

    /// All required fields missing from this message, in declaration order.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let checks: [(&str, &'static str); 5] = [
            (&self.sender, "sender"),
            (&self.recipient, "recipient"),
            (&self.message_type, "message_type"),
            (&self.metadata.conversation_id, "conversation_id"),
            (&self.metadata.request_id, "request_id"),
        ];
        checks
            .into_iter()
            .filter(|(value, _)| value.trim().is_empty())
            .map(|(_, field)| field)
            .collect()
    }
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), MessagingError> {
    if value.trim().is_empty() {
        return Err(MessagingError::EmptyField { field });
    }
    Ok(())
}

/// Errors emitted by message validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },
}

/// Outcome of a single delivery attempt. Value type; never mutated after
/// return.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryResult {
    pub success: bool,
    pub message_id: String,
    pub delivered_at: Option<i64>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl DeliveryResult {
    pub fn delivered(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: message_id.into(),
            delivered_at: Some(Utc::now().timestamp_millis()),
            error: None,
            retry_count: 0,
        }
    }

    pub fn failed(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: message_id.into(),
            delivered_at: None,
            error: Some(error.into()),
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Core subscriber trait — implement for any agent endpoint that receives
/// messages from the bus.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver one message. Errors are captured by the bus into the delivery
    /// result; they never propagate to the sending caller.
    async fn deliver(&self, message: &AgentMessage) -> anyhow::Result<()>;
}

/// Identifier handed back by `MessageBus::subscribe`, used for targeted
/// unsubscription.
pub type SubscriptionId = String;

/// Binds one agent type to the message types it accepts and a delivery
/// endpoint. Multiple subscriptions per agent type are allowed.
#[derive(Clone)]
pub struct Subscription {
    pub agent_type: String,
    /// Accepted message types; `"*"` matches all.
    pub message_types: Vec<String>,
    pub subscriber: Arc<dyn Subscriber>,
}

impl Subscription {
    pub fn new(
        agent_type: impl Into<String>,
        message_types: Vec<String>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            message_types,
            subscriber,
        }
    }

    pub fn accepts(&self, message_type: &str) -> bool {
        self.message_types
            .iter()
            .any(|accepted| accepted == "*" || accepted == message_type)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("agent_type", &self.agent_type)
            .field("message_types", &self.message_types)
            .finish_non_exhaustive()
    }
}
