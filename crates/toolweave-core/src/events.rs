use crate::{CapabilityId, ExecutionId, ToolId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Typed domain events fanned out across components. Delivery is
/// best-effort and in-process; a publisher never blocks on subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    GraphSynced {
        nodes: usize,
        edges: usize,
    },
    EdgeCreated {
        from: ToolId,
        to: ToolId,
    },
    EdgeUpdated {
        from: ToolId,
        to: ToolId,
        confidence: f32,
    },
    GraphMetricsComputed {
        density: f32,
        nodes: usize,
        edges: usize,
    },
    TaskStarted {
        workflow_id: ExecutionId,
        task_id: String,
    },
    TaskCompleted {
        workflow_id: ExecutionId,
        task_id: String,
        execution_time_ms: u64,
    },
    TaskError {
        workflow_id: ExecutionId,
        task_id: String,
        error: String,
    },
    DagStarted {
        workflow_id: ExecutionId,
        tasks: usize,
    },
    LayerCompleted {
        workflow_id: ExecutionId,
        layer: usize,
        tasks: usize,
    },
    DagCompleted {
        workflow_id: ExecutionId,
        success: bool,
    },
    DagReplanned {
        workflow_id: ExecutionId,
        added_tasks: usize,
    },
    CapabilityMatched {
        capability_id: CapabilityId,
        score: f32,
    },
    CapabilityLearned {
        capability_id: CapabilityId,
        name: String,
    },
    CapabilityStarted {
        capability_id: CapabilityId,
    },
    CapabilityEnded {
        capability_id: CapabilityId,
        success: bool,
    },
    Heartbeat,
    MetricsSnapshot {
        density: f32,
        nodes: usize,
        edges: usize,
    },
    HealthCheck {
        healthy: bool,
    },
}

impl GatewayEvent {
    /// Dotted topic used for wildcard subscriptions.
    pub fn topic(&self) -> &'static str {
        match self {
            GatewayEvent::GraphSynced { .. } => "graph.synced",
            GatewayEvent::EdgeCreated { .. } => "graph.edge.created",
            GatewayEvent::EdgeUpdated { .. } => "graph.edge.updated",
            GatewayEvent::GraphMetricsComputed { .. } => "graph.metrics.computed",
            GatewayEvent::TaskStarted { .. } => "task.started",
            GatewayEvent::TaskCompleted { .. } => "task.completed",
            GatewayEvent::TaskError { .. } => "task.error",
            GatewayEvent::DagStarted { .. } => "dag.started",
            GatewayEvent::LayerCompleted { .. } => "dag.layer_completed",
            GatewayEvent::DagCompleted { .. } => "dag.completed",
            GatewayEvent::DagReplanned { .. } => "dag.replanned",
            GatewayEvent::CapabilityMatched { .. } => "capability.matched",
            GatewayEvent::CapabilityLearned { .. } => "capability.learned",
            GatewayEvent::CapabilityStarted { .. } => "capability.start",
            GatewayEvent::CapabilityEnded { .. } => "capability.end",
            GatewayEvent::Heartbeat => "heartbeat",
            GatewayEvent::MetricsSnapshot { .. } => "metrics.snapshot",
            GatewayEvent::HealthCheck { .. } => "health.check",
        }
    }
}

/// Matches `*`, `prefix.*`, or an exact topic.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic == prefix || topic.starts_with(&format!("{}.", prefix));
    }
    pattern == topic
}

/// In-process pub/sub bus. Owned by the gateway and passed into
/// components; there is no global instance.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fan out to current subscribers. Lagging or absent subscribers are
    /// not an error.
    pub fn publish(&self, event: GatewayEvent) {
        tracing::trace!(topic = event.topic(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_pattern(&self, pattern: &str) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            pattern: pattern.to_string(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A filtered subscription; `recv` skips events whose topic does not
/// match the pattern and swallows lag.
pub struct EventSubscription {
    rx: broadcast::Receiver<GatewayEvent>,
    pattern: String,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if topic_matches(&self.pattern, event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching() {
        assert!(topic_matches("*", "graph.edge.created"));
        assert!(topic_matches("graph.*", "graph.edge.created"));
        assert!(topic_matches("graph.edge.created", "graph.edge.created"));
        assert!(!topic_matches("task.*", "graph.edge.created"));
        assert!(!topic_matches("graph", "graph.edge.created"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(GatewayEvent::Heartbeat);
    }

    #[tokio::test]
    async fn filtered_subscription_skips_other_topics() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_pattern("capability.*");
        bus.publish(GatewayEvent::Heartbeat);
        bus.publish(GatewayEvent::CapabilityStarted {
            capability_id: uuid::Uuid::new_v4(),
        });
        let event = sub.recv().await.unwrap();
        assert_eq!(event.topic(), "capability.start");
    }
}
