use crate::types::{ConnectionId, ConnectionStatus, ExecutionId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event emitted by the engine as executions and connections change state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(kind: EngineEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Types of engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    // Execution lifecycle
    ExecutionStarted {
        execution_id: ExecutionId,
        total_steps: u32,
    },
    ExecutionPaused {
        execution_id: ExecutionId,
    },
    ExecutionResumed {
        execution_id: ExecutionId,
    },
    ExecutionCancelled {
        execution_id: ExecutionId,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        duration_secs: u64,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        error: String,
    },

    // Step lifecycle
    StepScheduled {
        execution_id: ExecutionId,
        step_id: StepId,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step_id: StepId,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: ExecutionId,
        step_id: StepId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    StepSkipped {
        execution_id: ExecutionId,
        step_id: StepId,
        reason: String,
    },
    BranchSelected {
        execution_id: ExecutionId,
        step_id: StepId,
        matched: bool,
    },

    // Connection lifecycle
    ConnectionStateChanged {
        connection_id: ConnectionId,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
}

/// Broadcast hub for engine events. The coordinator publishes every
/// transition here so a push-based interface (e.g. streaming updates) can be
/// layered on without polling execution status.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers never block the engine.
    pub fn publish(&self, kind: EngineEventKind) {
        let event = EngineEvent::new(kind);
        tracing::debug!(event = ?event.kind, "engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let execution_id = ExecutionId::new();
        bus.publish(EngineEventKind::ExecutionStarted {
            execution_id,
            total_steps: 4,
        });

        let event = rx.recv().await.unwrap();
        match event.kind {
            EngineEventKind::ExecutionStarted {
                execution_id: id,
                total_steps,
            } => {
                assert_eq!(id, execution_id);
                assert_eq!(total_steps, 4);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(16);
        bus.publish(EngineEventKind::ExecutionPaused {
            execution_id: ExecutionId::new(),
        });
    }
}
