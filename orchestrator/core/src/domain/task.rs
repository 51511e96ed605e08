// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The `AgentTask` aggregate: a durable, stateful job owned by exactly one
//! user, holding the full interaction history and current status. Modeled
//! after [`crate::domain::execution::Execution`]'s state-machine shape: every
//! transition is a method that validates the current state and returns a
//! [`crate::domain::events::TaskEvent`] rather than mutating silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::events::TaskEvent;
use crate::domain::identity::{RequestId, SessionId, TaskId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Paused,
    Completed,
    Canceled,
    Failed,
}

/// A single multimodal content fragment carried by a [`UserMessage`] or
/// [`AgentTaskItem`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MultiModalItem {
    Text { text: String },
    Image { source: ImageSource, mime: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    Bytes { base64: String },
    Uri { uri: String },
}

/// A function call emitted by the LLM during a tool-calling turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub plugin_name: String,
    pub function_name: String,
    pub arguments: serde_json::Value,
}

impl FunctionCall {
    pub fn tool_id(&self) -> String {
        format!("{}-{}", self.plugin_name, self.function_name)
    }
}

/// The result of executing a single [`FunctionCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub is_error: bool,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ItemContent {
    User { items: Vec<MultiModalItem> },
    AssistantText { text: String },
    AssistantToolCalls { calls: Vec<FunctionCall> },
    Tool { result: ToolResult },
}

/// One durable, append-only entry in an [`AgentTask`]'s history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskItem {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub content: ItemContent,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task is not in a state that permits this transition: {0:?}")]
    InvalidStateTransition(TaskStatus),
    #[error("resume request_id does not match the stored pending request")]
    StalePendingRequest,
    #[error("task has no pending tool calls to resume")]
    NoPendingToolCalls,
    #[error("task {0} is owned by a different user")]
    NotOwner(TaskId),
}

/// The durable S/T/R-scoped job. See `SPEC_FULL.md` §3 for the full invariant
/// list; the state-transition methods below are the only legal way to mutate
/// `status` and `pending_tool_calls`, mirroring the teacher's
/// `Execution::start`/`complete`/`fail` pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub status: TaskStatus,
    pub items: Vec<AgentTaskItem>,
    pub pending_tool_calls: Option<Vec<FunctionCall>>,
    pub pending_request_id: Option<RequestId>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            session_id,
            user_id,
            status: TaskStatus::Running,
            items: Vec::new(),
            pending_tool_calls: None,
            pending_request_id: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn assert_owner(&self, user_id: &UserId) -> Result<(), TaskError> {
        if &self.user_id != user_id {
            return Err(TaskError::NotOwner(self.task_id));
        }
        Ok(())
    }

    /// Append-only: every call pushes a new item and advances `updated`
    /// monotonically.
    fn push_item(&mut self, request_id: RequestId, content: ItemContent) {
        let now = Utc::now();
        self.items.push(AgentTaskItem {
            task_id: self.task_id,
            request_id,
            content,
            updated: now,
        });
        self.last_updated_at = now;
    }

    pub fn append_user_items(&mut self, request_id: RequestId, items: Vec<MultiModalItem>) {
        self.push_item(request_id, ItemContent::User { items });
    }

    pub fn append_assistant_text(&mut self, request_id: RequestId, text: String) {
        self.push_item(request_id, ItemContent::AssistantText { text });
    }

    pub fn append_assistant_tool_calls(&mut self, request_id: RequestId, calls: Vec<FunctionCall>) {
        self.push_item(request_id, ItemContent::AssistantToolCalls { calls });
    }

    pub fn append_tool_result(&mut self, request_id: RequestId, result: ToolResult) {
        self.push_item(request_id, ItemContent::Tool { result });
    }

    /// Transition `Running -> Paused`, recording the tool calls awaiting
    /// human approval. Returns the event to publish.
    pub fn pause_for_hitl(
        &mut self,
        request_id: RequestId,
        calls: Vec<FunctionCall>,
    ) -> Result<TaskEvent, TaskError> {
        if self.status != TaskStatus::Running {
            return Err(TaskError::InvalidStateTransition(self.status));
        }
        self.status = TaskStatus::Paused;
        self.pending_tool_calls = Some(calls.clone());
        self.pending_request_id = Some(request_id);
        self.last_updated_at = Utc::now();
        Ok(TaskEvent::Paused {
            task_id: self.task_id,
            request_id,
            pending_tool_calls: calls,
            paused_at: self.last_updated_at,
        })
    }

    /// Validate a resume attempt without mutating state: the caller must
    /// check this before executing/rejecting pending calls.
    pub fn validate_resume(&self, request_id: RequestId) -> Result<&[FunctionCall], TaskError> {
        if self.status != TaskStatus::Paused {
            return Err(TaskError::InvalidStateTransition(self.status));
        }
        if self.pending_request_id != Some(request_id) {
            return Err(TaskError::StalePendingRequest);
        }
        self.pending_tool_calls
            .as_deref()
            .ok_or(TaskError::NoPendingToolCalls)
    }

    /// Transition `Paused -> Running` after HITL approval and tool
    /// execution; clears the pending set.
    pub fn resume_running(&mut self) -> Result<TaskEvent, TaskError> {
        if self.status != TaskStatus::Paused {
            return Err(TaskError::InvalidStateTransition(self.status));
        }
        self.status = TaskStatus::Running;
        self.pending_tool_calls = None;
        self.pending_request_id = None;
        self.last_updated_at = Utc::now();
        Ok(TaskEvent::Resumed {
            task_id: self.task_id,
            resumed_at: self.last_updated_at,
        })
    }

    /// Transition `Paused -> Canceled` after HITL rejection.
    pub fn reject_pending(&mut self) -> Result<TaskEvent, TaskError> {
        if self.status != TaskStatus::Paused {
            return Err(TaskError::InvalidStateTransition(self.status));
        }
        self.status = TaskStatus::Canceled;
        self.pending_tool_calls = None;
        self.pending_request_id = None;
        self.last_updated_at = Utc::now();
        Ok(TaskEvent::Canceled {
            task_id: self.task_id,
            canceled_at: self.last_updated_at,
        })
    }

    pub fn complete(&mut self) -> Result<TaskEvent, TaskError> {
        if self.status != TaskStatus::Running {
            return Err(TaskError::InvalidStateTransition(self.status));
        }
        self.status = TaskStatus::Completed;
        self.last_updated_at = Utc::now();
        Ok(TaskEvent::Completed {
            task_id: self.task_id,
            completed_at: self.last_updated_at,
        })
    }

    pub fn fail(&mut self, reason: String) -> TaskEvent {
        self.status = TaskStatus::Failed;
        self.last_updated_at = Utc::now();
        TaskEvent::Failed {
            task_id: self.task_id,
            reason,
            failed_at: self.last_updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Canceled | TaskStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    fn sample_call() -> FunctionCall {
        FunctionCall {
            id: "call_1".to_string(),
            plugin_name: "sensitive_plugin".to_string(),
            function_name: "delete_user_data".to_string(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn new_task_is_running_and_owned() {
        let task = AgentTask::new(SessionId::new(), user("alice"));
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.assert_owner(&user("alice")).is_ok());
        assert!(task.assert_owner(&user("bob")).is_err());
    }

    #[test]
    fn pause_requires_running_state() {
        let mut task = AgentTask::new(SessionId::new(), user("alice"));
        let req = RequestId::new();
        task.pause_for_hitl(req, vec![sample_call()]).unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert!(task.pause_for_hitl(req, vec![sample_call()]).is_err());
    }

    #[test]
    fn resume_rejects_mismatched_request_id() {
        let mut task = AgentTask::new(SessionId::new(), user("alice"));
        let req = RequestId::new();
        task.pause_for_hitl(req, vec![sample_call()]).unwrap();
        let other = RequestId::new();
        assert!(matches!(
            task.validate_resume(other),
            Err(TaskError::StalePendingRequest)
        ));
        assert!(task.validate_resume(req).is_ok());
    }

    #[test]
    fn pending_tool_call_id_survives_the_pause() {
        let mut task = AgentTask::new(SessionId::new(), user("alice"));
        let req = RequestId::new();
        let call = sample_call();
        task.pause_for_hitl(req, vec![call.clone()]).unwrap();
        let pending = task.validate_resume(req).unwrap();
        assert_eq!(pending[0].id, call.id);
    }

    #[test]
    fn reject_then_resume_running_is_invalid() {
        let mut task = AgentTask::new(SessionId::new(), user("alice"));
        let req = RequestId::new();
        task.pause_for_hitl(req, vec![sample_call()]).unwrap();
        task.reject_pending().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.resume_running().is_err());
    }

    #[test]
    fn items_append_only_with_nondecreasing_timestamps() {
        let mut task = AgentTask::new(SessionId::new(), user("alice"));
        let req = RequestId::new();
        task.append_user_items(req, vec![MultiModalItem::Text { text: "hi".into() }]);
        task.append_assistant_text(req, "hello".into());
        assert_eq!(task.items.len(), 2);
        assert!(task.items[1].updated >= task.items[0].updated);
    }
}
