//! End-to-end messaging scenarios: direct delivery, queued warm-up with
//! retry, broadcast fan-out, and round-robin load balancing through the
//! router.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use swarmbus::{
    AgentMessage, BusConfig, LoadBalancingStrategy, MessageBus, MessageRouter, RouterConfig,
    RoutingRule, Subscriber, Subscription,
};

/// `RUST_LOG=swarmbus=debug cargo test` shows retry and delivery logs.
fn init_logs() {
    let _ = tracing_subscriber::fmt::try_init();
}

struct Recorder {
    delivered: Mutex<Vec<AgentMessage>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl Subscriber for Recorder {
    async fn deliver(&self, message: &AgentMessage) -> anyhow::Result<()> {
        self.delivered.lock().push(message.clone());
        Ok(())
    }
}

fn subscribe(bus: &MessageBus, agent: &str, message_types: &[&str]) -> Arc<Recorder> {
    let recorder = Recorder::new();
    bus.subscribe(Subscription::new(
        agent,
        message_types.iter().map(ToString::to_string).collect(),
        Arc::clone(&recorder) as Arc<dyn Subscriber>,
    ));
    recorder
}

#[tokio::test]
async fn request_reaches_subscribed_agent() {
    let bus = MessageBus::new();
    let analysis = subscribe(&bus, "analysis", &["request"]);

    let message = AgentMessage::new(
        "planning",
        "analysis",
        "request",
        json!({"task": "correlate sector exposure"}),
        "c1",
    );
    let result = bus.send_message(message).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(analysis.count(), 1);
    assert_eq!(bus.get_conversation_history("c1").len(), 1);
}

#[tokio::test]
async fn queued_message_is_delivered_once_the_agent_warms_up() {
    init_logs();
    let bus = MessageBus::with_config(BusConfig {
        retry_delay_ms: 0,
        ..BusConfig::default()
    });

    // The recipient has not subscribed yet: delivery fails without raising,
    // and the message parks in the pending queue.
    let result = bus
        .send_message(AgentMessage::new(
            "planning",
            "analysis",
            "request",
            json!({}),
            "c1",
        ))
        .await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("no subscribers"));
    assert_eq!(bus.pending_messages("analysis").len(), 1);

    let analysis = subscribe(&bus, "analysis", &["*"]);
    bus.run_retry_sweep_once().await;

    assert_eq!(analysis.count(), 1);
    assert!(bus.pending_messages("analysis").is_empty());
    assert_eq!(bus.get_queue_status().retry_queue_size, 0);
}

#[tokio::test]
async fn broadcast_fans_out_to_every_other_agent() {
    let bus = MessageBus::new();
    let research = subscribe(&bus, "research", &["*"]);
    let analysis = subscribe(&bus, "analysis", &["*"]);
    let planning = subscribe(&bus, "planning", &["*"]);

    let result = bus
        .send_message(AgentMessage::broadcast(
            "planning",
            "notice",
            json!({"text": "market close in 10m"}),
            "c1",
        ))
        .await;

    assert!(result.success);
    assert_eq!(research.count(), 1);
    assert_eq!(analysis.count(), 1);
    assert_eq!(planning.count(), 0);
}

#[tokio::test]
async fn round_robin_selects_each_target_exactly_once_per_cycle() {
    let bus = Arc::new(MessageBus::new());
    let workers = [
        subscribe(&bus, "worker-a", &["*"]),
        subscribe(&bus, "worker-b", &["*"]),
        subscribe(&bus, "worker-c", &["*"]),
    ];

    let router = MessageRouter::with_config(
        Arc::clone(&bus),
        RouterConfig {
            load_balancing: LoadBalancingStrategy::RoundRobin,
            ..RouterConfig::default()
        },
    );
    router.add_routing_rule(RoutingRule::route(
        "spread-crunch-jobs",
        150,
        |message: &AgentMessage| message.message_type == "crunch",
        vec![
            "worker-a".to_string(),
            "worker-b".to_string(),
            "worker-c".to_string(),
        ],
    ));

    for index in 0..3 {
        let result = router
            .route_message(AgentMessage::new(
                "planning",
                "pool",
                "crunch",
                json!({"batch": index}),
                "c1",
            ))
            .await;
        assert!(result.success, "error: {:?}", result.error);
    }

    for worker in &workers {
        assert_eq!(worker.count(), 1, "each target selected exactly once");
    }
}

#[tokio::test]
async fn cleared_conversation_stops_future_retries() {
    let bus = MessageBus::with_config(BusConfig {
        retry_delay_ms: 0,
        ..BusConfig::default()
    });

    bus.send_message(AgentMessage::new("planning", "analysis", "request", json!({}), "c1"))
        .await;
    bus.clear_conversation("c1");

    let analysis = subscribe(&bus, "analysis", &["*"]);
    bus.run_retry_sweep_once().await;

    assert_eq!(analysis.count(), 0, "cleared conversations are not retried");
    assert!(bus.get_conversation_history("c1").is_empty());
}
