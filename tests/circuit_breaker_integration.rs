//! Integration tests for circuit breaker behavior.
//!
//! Covers breaker opening through the router, fail-fast on an open breaker,
//! cool-down auto-reset, and the error handler's independent failure view.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use swarmbus::{
    AgentMessage, CircuitBreakerTable, CommunicationError, CommunicationErrorHandler, ErrorKind,
    MessageBus, MessageRouter, NoopObserver, RecoveryConfig, Subscriber, Subscription,
};

/// `RUST_LOG=swarmbus=debug cargo test` shows breaker transitions.
fn init_logs() {
    let _ = tracing_subscriber::fmt::try_init();
}

struct AlwaysFails;

#[async_trait]
impl Subscriber for AlwaysFails {
    async fn deliver(&self, _message: &AgentMessage) -> anyhow::Result<()> {
        anyhow::bail!("agent crashed")
    }
}

fn failing_message() -> AgentMessage {
    AgentMessage::new("planning", "analysis", "task", json!({}), "c1")
}

#[tokio::test]
async fn five_failures_open_the_breaker_and_the_sixth_fails_fast() {
    init_logs();
    let bus = Arc::new(MessageBus::new());
    bus.subscribe(Subscription::new(
        "analysis",
        vec!["*".to_string()],
        Arc::new(AlwaysFails) as Arc<dyn Subscriber>,
    ));
    let router = MessageRouter::new(Arc::clone(&bus));

    for _ in 0..5 {
        let result = router.route_message(failing_message()).await;
        assert!(!result.success);
    }

    let stats = router.get_routing_stats();
    assert_eq!(stats.circuit_breakers.get("analysis"), Some(&true));

    let attempts_before = bus.stats().send_attempts_total;
    let result = router.route_message(failing_message()).await;
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("circuit breaker is open for agent: analysis")
    );
    assert_eq!(
        bus.stats().send_attempts_total,
        attempts_before,
        "fail-fast must not invoke the bus"
    );
}

#[test]
fn breaker_closes_after_cooldown() {
    let breakers =
        CircuitBreakerTable::with_reset_after(3, Duration::from_millis(60), Arc::new(NoopObserver));

    breakers.record_failure("analysis");
    breakers.record_failure("analysis");
    breakers.record_failure("analysis");
    assert!(breakers.is_open("analysis"));

    std::thread::sleep(Duration::from_millis(80));
    assert!(
        !breakers.is_open("analysis"),
        "breaker must close after the cool-down elapses"
    );
    assert_eq!(breakers.failure_count("analysis"), 0);
}

#[tokio::test]
async fn exhausted_timeout_error_reaches_the_dead_letter_queue() {
    let handler = CommunicationErrorHandler::new();

    let error = CommunicationError::new(ErrorKind::Timeout, "deadline exceeded")
        .with_original_message(failing_message())
        .with_retry_count(3);
    let decision = handler.handle_error(&error);

    assert!(!decision.should_retry);
    let dlq = handler.get_dead_letter_queue();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id, error.id);
}

#[tokio::test]
async fn router_and_handler_track_independent_failure_views() {
    init_logs();
    let bus = Arc::new(MessageBus::new());
    bus.subscribe(Subscription::new(
        "analysis",
        vec!["*".to_string()],
        Arc::new(AlwaysFails) as Arc<dyn Subscriber>,
    ));
    let router = MessageRouter::new(Arc::clone(&bus));
    let handler = CommunicationErrorHandler::with_config(RecoveryConfig {
        circuit_breaker_threshold: 2,
        ..RecoveryConfig::default()
    });

    // Two failed deliveries through the router, each reported to the
    // handler as well.
    for _ in 0..2 {
        let result = router.route_message(failing_message()).await;
        assert!(!result.success);
        handler.handle_error(
            &CommunicationError::new(ErrorKind::DeliveryFailure, "callback failed")
                .with_agent("analysis"),
        );
    }

    // The handler's breaker (threshold 2) is open; the router's (threshold
    // 5) is not. The two views never share state.
    assert!(handler.is_circuit_open("analysis"));
    assert!(!router.is_circuit_open("analysis"));
}
