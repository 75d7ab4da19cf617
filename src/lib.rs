#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod breaker;
pub mod bus;
pub mod config;
pub mod message;
pub mod observability;
pub mod recovery;
pub mod router;

pub use breaker::CircuitBreakerTable;
pub use bus::{BusStats, ConversationContext, MessageBus, QueueStatus};
pub use config::{BusConfig, LoadBalancingStrategy, RecoveryConfig, RouterConfig};
pub use message::{
    AgentMessage, DeliveryResult, MessageMetadata, MessagePriority, MessagingError, Subscriber,
    Subscription, SubscriptionId,
};
pub use observability::{BusEvent, MemoryObserver, NoopObserver, Observer, TracingObserver};
pub use recovery::{
    CommunicationError, CommunicationErrorHandler, ErrorKind, ErrorStats, RecoveryDecision,
    RecoveryStrategy, RetryPolicy,
};
pub use router::{
    AgentAvailability, AgentStatus, MessageRouter, RoutingRule, RoutingStats, RuleAction,
};
