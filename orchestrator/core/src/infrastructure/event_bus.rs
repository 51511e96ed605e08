// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming using tokio broadcast channels. Used to fan a
// task's transitions out to SSE subscribers and to anything else observing
// the orchestrator (metrics, audit logging).
//
// In-memory only: events are lost on restart. Durable state lives in the
// repositories, not the bus.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::events::{AuthEvent, DomainEvent, McpEvent, TaskEvent};
use crate::domain::identity::TaskId;

/// Event bus for publishing and subscribing to domain events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender: Arc::new(sender) }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_task_event(&self, event: TaskEvent) {
        self.publish(DomainEvent::Task(event));
    }

    pub fn publish_mcp_event(&self, event: McpEvent) {
        self.publish(DomainEvent::Mcp(event));
    }

    pub fn publish_auth_event(&self, event: AuthEvent) {
        self.publish(DomainEvent::Auth(event));
    }

    fn publish(&self, event: DomainEvent) {
        let _receiver_count = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver { receiver: self.sender.subscribe() }
    }

    /// Subscribe filtered to a single task's events — what the `/stream` and
    /// `/resume/{request_id}/stream` SSE handlers use to forward `Paused`/
    /// `Completed`/`Failed` transitions to the client that owns the task.
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEventReceiver {
        TaskEventReceiver { receiver: self.sender.subscribe(), task_id }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }
}

/// Receiver filtered to a single task, so a streaming handler never has to
/// see another user's events going past.
pub struct TaskEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    task_id: TaskId,
}

impl TaskEventReceiver {
    pub async fn recv(&mut self) -> Result<TaskEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Task(task_event) = event {
                if task_event.task_id() == self.task_id {
                    return Ok(task_event);
                }
            }
        }
    }
}

fn map_recv_error(err: broadcast::error::RecvError) -> EventBusError {
    match err {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,
    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
