//! In-process message bus.
//!
//! The bus is the only component that invokes subscriber callbacks; it owns
//! the source of truth for who is listening for what, plus per-agent pending
//! queues, per-conversation history/context, and the internal retry queue
//! drained by the background sweeps in [`sweep`].
//!
//! The bus never panics for expected conditions (no subscriber, callback
//! error); every failure surfaces as a [`DeliveryResult`] with
//! `success = false`.

mod sweep;

pub use sweep::{RETRY_SWEEP_INTERVAL, TIMEOUT_SWEEP_INTERVAL};

use crate::config::BusConfig;
use crate::message::{AgentMessage, DeliveryResult, Subscriber, Subscription, SubscriptionId};
use crate::observability::{BusEvent, NoopObserver, Observer};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Per-conversation history retention.
const MAX_HISTORY_MESSAGES: usize = 1000;

/// Accumulated state for a multi-turn exchange. Created on first reference,
/// updated only by explicit caller calls, never auto-expired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub values: HashMap<String, Value>,
    pub updated_at: i64,
}

impl ConversationContext {
    fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            values: HashMap::new(),
            updated_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Read-only queue introspection for operators.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub total_messages: usize,
    pub messages_by_agent: HashMap<String, usize>,
    pub retry_queue_size: usize,
    pub active_conversations: usize,
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BusStats {
    /// Send attempts that entered `send_message`, valid or not.
    pub send_attempts_total: u64,
    /// Successful subscriber callback invocations.
    pub deliveries_total: u64,
    pub broadcasts_total: u64,
    /// Messages parked in a pending queue because no subscriber existed.
    pub queued_no_subscriber_total: u64,
    /// Pending-queue entries evicted by the per-agent capacity limit.
    pub queue_overflow_evictions_total: u64,
    pub retries_attempted_total: u64,
    pub retries_succeeded_total: u64,
    pub retries_exhausted_total: u64,
    /// Pending messages dropped by the timeout sweep.
    pub messages_expired_total: u64,
}

struct SubscriptionEntry {
    id: SubscriptionId,
    message_types: Vec<String>,
    subscriber: Arc<dyn Subscriber>,
}

impl SubscriptionEntry {
    fn accepts(&self, message_type: &str) -> bool {
        self.message_types
            .iter()
            .any(|accepted| accepted == "*" || accepted == message_type)
    }
}

pub(crate) struct RetryEntry {
    pub(crate) message: AgentMessage,
    pub(crate) retry_count: u32,
    pub(crate) next_attempt: std::time::Instant,
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<String, Vec<SubscriptionEntry>>,
    pending: HashMap<String, VecDeque<AgentMessage>>,
    history: HashMap<String, VecDeque<AgentMessage>>,
    contexts: HashMap<String, ConversationContext>,
    retry_queue: Vec<RetryEntry>,
    stats: BusStats,
}

/// In-process message bus with direct and broadcast delivery.
pub struct MessageBus {
    state: Mutex<BusState>,
    config: BusConfig,
    observer: Arc<dyn Observer>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: BusConfig, observer: Arc<dyn Observer>) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            config,
            observer,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Deliver one message.
    ///
    /// Invalid messages produce a failure result naming every missing field.
    /// A direct message whose recipient has no subscriptions is parked in
    /// that recipient's pending queue and scheduled for re-delivery by the
    /// retry sweep; the result reports failure with "no subscribers", which
    /// is a normal state while an agent warms up.
    pub async fn send_message(&self, message: AgentMessage) -> DeliveryResult {
        self.state.lock().stats.send_attempts_total += 1;

        let missing = message.missing_fields();
        if !missing.is_empty() {
            return DeliveryResult::failed(
                message.metadata.request_id.clone(),
                format!("validation failed: missing {}", missing.join(", ")),
            );
        }

        self.append_history(&message);

        if message.is_broadcast() {
            self.deliver_broadcast(message).await
        } else {
            self.deliver_direct(message, 0, true).await
        }
    }

    /// Direct delivery to one recipient's matching subscriptions.
    ///
    /// `queue_on_miss` is false for sweep re-attempts, whose messages are
    /// already parked in the pending queue.
    pub(crate) async fn deliver_direct(
        &self,
        message: AgentMessage,
        retry_count: u32,
        queue_on_miss: bool,
    ) -> DeliveryResult {
        let message_id = message.metadata.request_id.clone();

        let subscribers: Option<Vec<Arc<dyn Subscriber>>> = {
            let state = self.state.lock();
            state
                .subscriptions
                .get(&message.recipient)
                .filter(|entries| !entries.is_empty())
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|entry| entry.accepts(&message.message_type))
                        .map(|entry| Arc::clone(&entry.subscriber))
                        .collect()
                })
        };

        let Some(subscribers) = subscribers else {
            let recipient = message.recipient.clone();
            if queue_on_miss {
                self.queue_pending(message);
            }
            return DeliveryResult::failed(message_id, format!("no subscribers for agent: {recipient}"))
                .with_retry_count(retry_count);
        };

        let errors = self.invoke_all(&subscribers, &message).await;
        if errors.is_empty() {
            DeliveryResult::delivered(message_id).with_retry_count(retry_count)
        } else {
            DeliveryResult::failed(message_id, errors.join("; ")).with_retry_count(retry_count)
        }
    }

    /// Fan a broadcast out to every subscription of every agent type except
    /// the sender. Successful only if every attempted callback succeeded.
    async fn deliver_broadcast(&self, message: AgentMessage) -> DeliveryResult {
        let message_id = message.metadata.request_id.clone();

        let subscribers: Vec<Arc<dyn Subscriber>> = {
            let mut state = self.state.lock();
            state.stats.broadcasts_total += 1;
            state
                .subscriptions
                .iter()
                .filter(|(agent, _)| **agent != message.sender)
                .flat_map(|(_, entries)| {
                    entries
                        .iter()
                        .filter(|entry| entry.accepts(&message.message_type))
                        .map(|entry| Arc::clone(&entry.subscriber))
                })
                .collect()
        };

        let errors = self.invoke_all(&subscribers, &message).await;
        if errors.is_empty() {
            DeliveryResult::delivered(message_id)
        } else {
            DeliveryResult::failed(message_id, errors.join("; "))
        }
    }

    /// Invoke every callback with no internal lock held; a callback throwing
    /// is captured, never propagated.
    async fn invoke_all(
        &self,
        subscribers: &[Arc<dyn Subscriber>],
        message: &AgentMessage,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for subscriber in subscribers {
            match subscriber.deliver(message).await {
                Ok(()) => {
                    self.state.lock().stats.deliveries_total += 1;
                }
                Err(error) => {
                    debug!(
                        recipient = %message.recipient,
                        message_id = %message.metadata.request_id,
                        "subscriber callback failed: {error:#}"
                    );
                    errors.push(error.to_string());
                }
            }
        }
        errors
    }

    /// Park a message in its recipient's pending queue (bounded, oldest
    /// evicted) and schedule a re-delivery attempt.
    fn queue_pending(&self, message: AgentMessage) {
        let mut state = self.state.lock();
        state.stats.queued_no_subscriber_total += 1;

        let max_queue_size = self.config.max_queue_size.max(1);
        let evicted = {
            let queue = state.pending.entry(message.recipient.clone()).or_default();
            let evicted = if queue.len() >= max_queue_size {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(message.clone());
            evicted
        };
        if evicted {
            state.stats.queue_overflow_evictions_total += 1;
        }

        if self.config.max_retries > 0 {
            state.retry_queue.push(RetryEntry {
                next_attempt: std::time::Instant::now()
                    + std::time::Duration::from_millis(self.config.retry_delay_ms),
                retry_count: 0,
                message,
            });
        }
    }

    fn append_history(&self, message: &AgentMessage) {
        let mut state = self.state.lock();
        let history = state
            .history
            .entry(message.metadata.conversation_id.clone())
            .or_default();
        history.push_back(message.clone());
        while history.len() > MAX_HISTORY_MESSAGES {
            history.pop_front();
        }
    }

    /// Register a listener. Returns the id used for targeted unsubscription.
    pub fn subscribe(&self, subscription: Subscription) -> SubscriptionId {
        let id = Uuid::new_v4().to_string();
        let agent = subscription.agent_type.clone();
        {
            let mut state = self.state.lock();
            state
                .subscriptions
                .entry(agent.clone())
                .or_default()
                .push(SubscriptionEntry {
                    id: id.clone(),
                    message_types: subscription.message_types,
                    subscriber: subscription.subscriber,
                });
        }
        self.observer
            .record_event(&BusEvent::AgentSubscribed { agent });
        id
    }

    /// Remove listeners for an agent type. With `None`, removes all of them.
    pub fn unsubscribe(&self, agent_type: &str, subscription_id: Option<&str>) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = match state.subscriptions.get_mut(agent_type) {
                Some(entries) => match subscription_id {
                    Some(id) => {
                        let before = entries.len();
                        entries.retain(|entry| entry.id != id);
                        before != entries.len()
                    }
                    None => {
                        let had = !entries.is_empty();
                        entries.clear();
                        had
                    }
                },
                None => false,
            };
            if state
                .subscriptions
                .get(agent_type)
                .is_some_and(Vec::is_empty)
            {
                state.subscriptions.remove(agent_type);
            }
            removed
        };
        if removed {
            self.observer.record_event(&BusEvent::AgentUnsubscribed {
                agent: agent_type.to_string(),
            });
        }
        removed
    }

    /// Conversation history, most-recent-appended-last, capped at 1000.
    pub fn get_conversation_history(&self, conversation_id: &str) -> Vec<AgentMessage> {
        self.state
            .lock()
            .history
            .get(conversation_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Context for a conversation, created empty on first reference.
    pub fn get_conversation_context(&self, conversation_id: &str) -> ConversationContext {
        let mut state = self.state.lock();
        state
            .contexts
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationContext::new(conversation_id))
            .clone()
    }

    /// Merge keys into a conversation's context.
    pub fn update_conversation_context(
        &self,
        conversation_id: &str,
        updates: HashMap<String, Value>,
    ) {
        {
            let mut state = self.state.lock();
            let context = state
                .contexts
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationContext::new(conversation_id));
            context.values.extend(updates);
            context.updated_at = Utc::now().timestamp_millis();
        }
        self.observer.record_event(&BusEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let state = self.state.lock();
        let messages_by_agent: HashMap<String, usize> = state
            .pending
            .iter()
            .map(|(agent, queue)| (agent.clone(), queue.len()))
            .collect();
        QueueStatus {
            total_messages: messages_by_agent.values().sum(),
            messages_by_agent,
            retry_queue_size: state.retry_queue.len(),
            active_conversations: state.history.len(),
        }
    }

    /// Messages parked for an agent that has not subscribed yet.
    pub fn pending_messages(&self, agent: &str) -> Vec<AgentMessage> {
        self.state
            .lock()
            .pending
            .get(agent)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BusStats {
        self.state.lock().stats
    }

    /// Remove a conversation's history, context, retry-queue entries, and
    /// pending-queue copies. Prevents future retries only; an in-flight
    /// callback is not cancelled.
    pub fn clear_conversation(&self, conversation_id: &str) {
        {
            let mut state = self.state.lock();
            state.history.remove(conversation_id);
            state.contexts.remove(conversation_id);
            state
                .retry_queue
                .retain(|entry| entry.message.metadata.conversation_id != conversation_id);
            for queue in state.pending.values_mut() {
                queue.retain(|message| message.metadata.conversation_id != conversation_id);
            }
            state.pending.retain(|_, queue| !queue.is_empty());
        }
        self.observer.record_event(&BusEvent::ConversationCleared {
            conversation_id: conversation_id.to_string(),
        });
    }
}
