// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request/response shapes for the Request Handler's public surface
//! (`SPEC_FULL.md` §3, §4.1, §6).

use serde::{Deserialize, Serialize};

use crate::domain::identity::{RequestId, SessionId, TaskId};
use crate::domain::task::{FunctionCall, MultiModalItem, TaskStatus};
use crate::domain::llm::TokenUsage;

/// Inbound request body for `POST /` and `POST /stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    pub session_id: Option<SessionId>,
    pub task_id: Option<TaskId>,
    pub items: Vec<MultiModalItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub server: String,
    pub auth_url: String,
}

/// The sum type returned from a unary `invoke`/`resume` call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum Response {
    Agent(AgentResponse),
    Hitl(HitlResponse),
    AuthChallenge(AuthChallengeResponse),
    RejectedTool(RejectedToolResponse),
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub output: String,
    pub token_usage: TokenUsage,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HitlResponse {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub tool_calls: Vec<FunctionCall>,
    pub approval_url: String,
    pub rejection_url: String,
}

impl HitlResponse {
    pub fn new(session_id: SessionId, task_id: TaskId, request_id: RequestId, tool_calls: Vec<FunctionCall>) -> Self {
        let url = format!("/resume/{request_id}");
        Self {
            session_id,
            task_id,
            request_id,
            tool_calls,
            approval_url: url.clone(),
            rejection_url: url,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthChallengeResponse {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub challenges: Vec<AuthChallenge>,
    pub resume_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedToolResponse {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub reason: String,
    pub status: TaskStatus,
}

/// One fragment of a streaming reply; a finite sequence terminated by
/// exactly one event with `done:true`.
#[derive(Debug, Clone, Serialize)]
pub struct PartialResponse {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub output_partial: String,
    pub done: bool,
}

/// One frame of an SSE stream: zero or more partial-text fragments followed
/// by exactly one terminal frame carrying the full structured response
/// (`SPEC_FULL.md` §6 SSE event format).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Partial(PartialResponse),
    Final(Response),
}

/// The decision body for `POST /resume/{request_id}`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeDecision {
    Approve,
    Reject,
}
