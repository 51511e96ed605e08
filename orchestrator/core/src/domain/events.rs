// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain events: the record of every state transition an [`crate::domain::task::AgentTask`]
//! (or the MCP/auth subsystems) has gone through. Transition methods return
//! these rather than relying on callers to reconstruct what happened from the
//! mutated aggregate, mirroring the teacher's `ExecutionEvent`/`AgentLifecycleEvent`
//! enum-of-transitions pattern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::{RequestId, SessionId, TaskId};
use crate::domain::task::FunctionCall;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    Paused {
        task_id: TaskId,
        request_id: RequestId,
        pending_tool_calls: Vec<FunctionCall>,
        paused_at: DateTime<Utc>,
    },
    Resumed {
        task_id: TaskId,
        resumed_at: DateTime<Utc>,
    },
    Canceled {
        task_id: TaskId,
        canceled_at: DateTime<Utc>,
    },
    Completed {
        task_id: TaskId,
        completed_at: DateTime<Utc>,
    },
    Failed {
        task_id: TaskId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Paused { task_id, .. }
            | TaskEvent::Resumed { task_id, .. }
            | TaskEvent::Canceled { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => *task_id,
        }
    }
}

/// Events from the per-session MCP discovery cache (`SPEC_FULL.md` §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpEvent {
    DiscoveryStarted {
        session_id: SessionId,
        server_name: String,
        started_at: DateTime<Utc>,
    },
    DiscoveryCompleted {
        session_id: SessionId,
        server_name: String,
        tool_count: usize,
        completed_at: DateTime<Utc>,
    },
    DiscoveryFailed {
        session_id: SessionId,
        server_name: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    ToolInvoked {
        session_id: SessionId,
        server_name: String,
        tool_name: String,
        is_error: bool,
        invoked_at: DateTime<Utc>,
    },
}

/// Events from the OAuth2 broker (`SPEC_FULL.md` §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthEvent {
    ChallengeIssued {
        auth_server: String,
        scopes: Vec<String>,
        issued_at: DateTime<Utc>,
    },
    TokenRefreshed {
        auth_server: String,
        refreshed_at: DateTime<Utc>,
    },
    TokenRefreshFailed {
        auth_server: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

/// The envelope published on the shared event bus, mirroring the teacher's
/// `DomainEvent` wrapper but scoped to this crate's three event families.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    Task(TaskEvent),
    Mcp(McpEvent),
    Auth(AuthEvent),
}

impl From<TaskEvent> for DomainEvent {
    fn from(event: TaskEvent) -> Self {
        DomainEvent::Task(event)
    }
}

impl From<McpEvent> for DomainEvent {
    fn from(event: McpEvent) -> Self {
        DomainEvent::Mcp(event)
    }
}

impl From<AuthEvent> for DomainEvent {
    fn from(event: AuthEvent) -> Self {
        DomainEvent::Auth(event)
    }
}
