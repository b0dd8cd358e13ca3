//! Typed event channels for container lifecycle notifications.
//!
//! One broadcast channel per operation category, plus a generic lifecycle
//! channel carrying the operation name and a channel for deaths seen by the
//! events monitor. Each channel holds a keep-alive receiver so publishing
//! never depends on subscriber presence, and every state-changing operation
//! publishes its specific event first and the lifecycle event second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{ContainerInfo, ContainerOperationResult};

/// Buffered events per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1000;

/// Payload shared by all lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerOperationEvent {
    pub container_id: String,
    /// Caller-supplied correlation key, when one was given
    pub task_id: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// Exact command line the operation executed
    pub command: String,
    pub error: Option<String>,
    pub container_info: Option<ContainerInfo>,
}

impl ContainerOperationEvent {
    /// Event payload for an operation's outcome.
    pub fn from_result(result: &ContainerOperationResult, task_id: Option<String>) -> Self {
        Self {
            container_id: result.container_id.clone(),
            task_id,
            success: result.success,
            timestamp: Utc::now(),
            command: result.command.clone(),
            error: result.error.clone(),
            container_info: result.container_info.clone(),
        }
    }
}

/// The four state-changing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOperation {
    Created,
    Started,
    Stopped,
    Removed,
}

impl std::fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LifecycleOperation::Created => "created",
            LifecycleOperation::Started => "started",
            LifecycleOperation::Stopped => "stopped",
            LifecycleOperation::Removed => "removed",
        };
        write!(f, "{}", label)
    }
}

/// Generic lifecycle notification pairing the operation with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub operation: LifecycleOperation,
    pub event: ContainerOperationEvent,
}

/// Emitted when the events monitor sees one of our containers die.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDiedEvent {
    pub container_id: String,
    /// Runtime-assigned name with the configured prefix stripped
    pub task_id: String,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast hub for container events.
#[derive(Debug)]
pub struct ContainerEventBus {
    created: broadcast::Sender<ContainerOperationEvent>,
    started: broadcast::Sender<ContainerOperationEvent>,
    stopped: broadcast::Sender<ContainerOperationEvent>,
    removed: broadcast::Sender<ContainerOperationEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    died: broadcast::Sender<ContainerDiedEvent>,
    // Keep one receiver per channel alive so sends never fail closed
    #[allow(dead_code)]
    _keep_alive: KeepAlive,
}

#[derive(Debug)]
struct KeepAlive {
    created: broadcast::Receiver<ContainerOperationEvent>,
    started: broadcast::Receiver<ContainerOperationEvent>,
    stopped: broadcast::Receiver<ContainerOperationEvent>,
    removed: broadcast::Receiver<ContainerOperationEvent>,
    lifecycle: broadcast::Receiver<LifecycleEvent>,
    died: broadcast::Receiver<ContainerDiedEvent>,
}

impl ContainerEventBus {
    /// Create a bus with all channels open.
    pub fn new() -> Self {
        let (created, created_rx) = broadcast::channel(CHANNEL_CAPACITY);
        let (started, started_rx) = broadcast::channel(CHANNEL_CAPACITY);
        let (stopped, stopped_rx) = broadcast::channel(CHANNEL_CAPACITY);
        let (removed, removed_rx) = broadcast::channel(CHANNEL_CAPACITY);
        let (lifecycle, lifecycle_rx) = broadcast::channel(CHANNEL_CAPACITY);
        let (died, died_rx) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            created,
            started,
            stopped,
            removed,
            lifecycle,
            died,
            _keep_alive: KeepAlive {
                created: created_rx,
                started: started_rx,
                stopped: stopped_rx,
                removed: removed_rx,
                lifecycle: lifecycle_rx,
                died: died_rx,
            },
        }
    }

    /// Publish one operation outcome: specific channel first, lifecycle
    /// second.
    pub fn publish_operation(
        &self,
        operation: LifecycleOperation,
        event: ContainerOperationEvent,
    ) {
        let channel = match operation {
            LifecycleOperation::Created => &self.created,
            LifecycleOperation::Started => &self.started,
            LifecycleOperation::Stopped => &self.stopped,
            LifecycleOperation::Removed => &self.removed,
        };
        let _ = channel.send(event.clone());
        let _ = self.lifecycle.send(LifecycleEvent { operation, event });
    }

    /// Publish a death observed by the events monitor.
    pub fn publish_died(&self, event: ContainerDiedEvent) {
        let _ = self.died.send(event);
    }

    pub fn subscribe_created(&self) -> broadcast::Receiver<ContainerOperationEvent> {
        self.created.subscribe()
    }

    pub fn subscribe_started(&self) -> broadcast::Receiver<ContainerOperationEvent> {
        self.started.subscribe()
    }

    pub fn subscribe_stopped(&self) -> broadcast::Receiver<ContainerOperationEvent> {
        self.stopped.subscribe()
    }

    pub fn subscribe_removed(&self) -> broadcast::Receiver<ContainerOperationEvent> {
        self.removed.subscribe()
    }

    /// Every state-changing operation, tagged with its operation name.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_died(&self) -> broadcast::Receiver<ContainerDiedEvent> {
        self.died.subscribe()
    }
}

impl Default for ContainerEventBus {
    fn default() -> Self {
        Self::new()
    }
}
