//! Advisory event layer.
//!
//! Components emit named events for an operator/observability layer to
//! subscribe to. Events are never required for correctness; a component with
//! the default `NoopObserver` behaves identically.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Named notification emitted by the bus, router, or error handler.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BusEvent {
    AgentSubscribed {
        agent: String,
    },
    AgentUnsubscribed {
        agent: String,
    },
    ConversationUpdated {
        conversation_id: String,
    },
    ConversationCleared {
        conversation_id: String,
    },
    /// Pending messages dropped by the timeout sweep, counted per agent.
    MessagesTimeout {
        agent: String,
        expired: usize,
    },
    MessageRetrySuccess {
        message_id: String,
        attempts: u32,
    },
    MessageRetryFailed {
        message_id: String,
        attempts: u32,
    },
    MessageRerouted {
        from: String,
        to: String,
    },
    CircuitBreakerOpened {
        agent: String,
    },
    CircuitBreakerReset {
        agent: String,
    },
    FallbackActivated {
        error_id: String,
    },
    ErrorEscalated {
        error_id: String,
    },
    MessageMovedToDlq {
        error_id: String,
    },
    ErrorHandlingFailed {
        detail: String,
    },
}

/// Sink for advisory events.
pub trait Observer: Send + Sync {
    fn record_event(&self, event: &BusEvent);
}

/// Discards all events. The default for every component.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record_event(&self, _event: &BusEvent) {}
}

/// Forwards events to `tracing` at a severity matching the event.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record_event(&self, event: &BusEvent) {
        match event {
            BusEvent::MessagesTimeout { agent, expired } => {
                warn!(agent = %agent, expired, "pending messages expired");
            }
            BusEvent::MessageRetryFailed {
                message_id,
                attempts,
            } => {
                warn!(message_id = %message_id, attempts, "message retries exhausted");
            }
            BusEvent::CircuitBreakerOpened { agent } => {
                warn!(agent = %agent, "circuit breaker opened");
            }
            BusEvent::ErrorHandlingFailed { detail } => {
                warn!(detail = %detail, "error handling failed");
            }
            BusEvent::MessageMovedToDlq { error_id } => {
                warn!(error_id = %error_id, "error moved to dead-letter queue");
            }
            other => {
                info!(event = ?other, "bus event");
            }
        }
    }
}

/// Records events in memory. Useful for embedders that poll events and for
/// tests asserting on emitted notifications.
#[derive(Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<BusEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }

    pub fn contains(&self, expected: &BusEvent) -> bool {
        self.events.lock().iter().any(|event| event == expected)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Observer for MemoryObserver {
    fn record_event(&self, event: &BusEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_serialize_kebab_case() {
        let event = BusEvent::CircuitBreakerOpened {
            agent: "analysis".to_string(),
        };
        let encoded = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(encoded["event"], "circuit-breaker-opened");

        let event = BusEvent::MessagesTimeout {
            agent: "research".to_string(),
            expired: 3,
        };
        let encoded = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(encoded["event"], "messages-timeout");

        let event = BusEvent::MessageMovedToDlq {
            error_id: "err-1".to_string(),
        };
        let encoded = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(encoded["event"], "message-moved-to-dlq");
    }

    #[test]
    fn memory_observer_records_in_order() {
        let observer = MemoryObserver::new();
        observer.record_event(&BusEvent::AgentSubscribed {
            agent: "analysis".to_string(),
        });
        observer.record_event(&BusEvent::AgentUnsubscribed {
            agent: "analysis".to_string(),
        });

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(observer.contains(&BusEvent::AgentSubscribed {
            agent: "analysis".to_string()
        }));

        observer.clear();
        assert!(observer.events().is_empty());
    }
}
