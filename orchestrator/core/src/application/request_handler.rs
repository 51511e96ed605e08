// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The Stateful Request Handler: entry point for every user interaction.
//! Wires authentication, per-user MCP discovery, task persistence, and the
//! agent tool-call loop into the four response shapes a caller can observe
//! (`SPEC_FULL.md` §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

use crate::application::agent_loop::{AgentLoop, AgentLoopError, LoopOutcome, StreamEvent};
use crate::application::authorizer::{Authorizer, AuthorizerError};
use crate::application::kernel::{Kernel, McpPluginInstance, NativeFunction};
use crate::application::mcp_registry::{DiscoveryOutcome, McpRegistry};
use crate::application::oauth_broker::OAuthBroker;
use crate::domain::agent_config::AgentDefinition;
use crate::domain::auth::AuthRequired;
use crate::domain::identity::{RequestId, SessionId, TaskId, UserId};
use crate::domain::llm::{GenerationOptions, ToolSpec};
use crate::domain::repository::{RepositoryError, SessionStateRepository, TaskRepository};
use crate::domain::response::{
    AgentResponse, AuthChallenge, AuthChallengeResponse, HitlResponse, PartialResponse,
    RejectedToolResponse, Response, ResumeDecision, StreamFrame, UserMessage,
};
use crate::domain::session_state::SessionState;
use crate::domain::task::{AgentTask, ItemContent, TaskError, TaskStatus, ToolResult};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum RequestHandlerError {
    #[error(transparent)]
    NotAuthenticated(#[from] AuthorizerError),
    #[error("task {0} was not found")]
    TaskNotFound(TaskId),
    #[error(transparent)]
    Ownership(#[from] TaskError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    AgentLoop(#[from] AgentLoopError),
    #[error("no resumable request found for request_id")]
    NoSuchPendingRequest,
    #[error("OAuth callback failed: {0}")]
    OAuthCallback(String),
}

/// Everything one deployed agent needs to answer requests: its declarative
/// configuration plus the shared infrastructure built at the composition
/// root. One instance serves every user of this agent.
pub struct RequestHandlerService {
    agent: AgentDefinition,
    authorizer: Arc<dyn Authorizer>,
    task_repo: Arc<dyn TaskRepository>,
    session_state_repo: Arc<dyn SessionStateRepository>,
    mcp_registry: Arc<McpRegistry>,
    oauth_broker: Arc<OAuthBroker>,
    agent_loop: Arc<AgentLoop>,
    native: HashMap<String, Arc<dyn NativeFunction>>,
    event_bus: EventBus,
}

impl RequestHandlerService {
    pub fn new(
        agent: AgentDefinition,
        authorizer: Arc<dyn Authorizer>,
        task_repo: Arc<dyn TaskRepository>,
        session_state_repo: Arc<dyn SessionStateRepository>,
        mcp_registry: Arc<McpRegistry>,
        oauth_broker: Arc<OAuthBroker>,
        agent_loop: Arc<AgentLoop>,
        native: HashMap<String, Arc<dyn NativeFunction>>,
        event_bus: EventBus,
    ) -> Self {
        Self { agent, authorizer, task_repo, session_state_repo, mcp_registry, oauth_broker, agent_loop, native, event_bus }
    }

    pub async fn invoke(&self, auth_header: &str, message: UserMessage) -> Result<Response, RequestHandlerError> {
        let user_id = self.authorizer.authorize_request(auth_header).await?;
        let session_id = message.session_id.unwrap_or_else(SessionId::new);

        if let Some(challenge) = self.ensure_discovery(&user_id, session_id).await? {
            return Ok(Response::AuthChallenge(challenge));
        }

        let mut task = self.resolve_task(&user_id, session_id, message.task_id).await?;
        let request_id = RequestId::new();
        task.append_user_items(request_id, message.items);
        self.task_repo.save(&task).await?;

        let kernel = self.build_kernel(&user_id, session_id).await?;
        let options = self.options(kernel.tool_specs());
        let outcome = self
            .agent_loop
            .drive(&mut task, request_id, &self.agent.system_prompt, &self.agent.model, &options, &kernel)
            .await?;

        self.finish(task, session_id, request_id, outcome).await
    }

    /// Streaming `invoke`: a finite sequence of `PartialResponse` fragments
    /// terminated by exactly one `done:true` event (`SPEC_FULL.md` §4.1,
    /// §4.2 streaming mode). Runs the whole drive eagerly and replays it as
    /// a stream rather than holding a self-referential inner stream alive
    /// across `.await` points.
    pub fn invoke_stream<'a>(
        &'a self,
        auth_header: &'a str,
        message: UserMessage,
    ) -> BoxStream<'a, Result<StreamFrame, RequestHandlerError>> {
        stream::once(async move {
            let (mut task, request_id, kernel) = self.authorize_and_prepare(auth_header, message).await?;
            let session_id = task.session_id;
            let options = self.options(kernel.tool_specs());
            let (partials, outcome) = drive_to_partials(
                self.agent_loop.drive_stream(&mut task, request_id, &self.agent.system_prompt, &self.agent.model, &options, &kernel),
                session_id,
                task.task_id,
                request_id,
            )
            .await?;
            self.finish_stream(task, session_id, request_id, partials, outcome).await
        })
        .flat_map(frames_to_stream)
        .boxed()
    }

    async fn authorize_and_prepare(
        &self,
        auth_header: &str,
        message: UserMessage,
    ) -> Result<(AgentTask, RequestId, Kernel), RequestHandlerError> {
        let user_id = self.authorizer.authorize_request(auth_header).await?;
        let session_id = message.session_id.unwrap_or_else(SessionId::new);

        // Streaming mode has no channel back to the client for an
        // AuthChallengeResponse mid-stream; discovery must clear before the
        // stream starts, same as the unary path's short-circuit.
        if self.ensure_discovery(&user_id, session_id).await?.is_some() {
            return Err(RequestHandlerError::NoSuchPendingRequest);
        }

        let mut task = self.resolve_task(&user_id, session_id, message.task_id).await?;
        let request_id = RequestId::new();
        task.append_user_items(request_id, message.items);
        self.task_repo.save(&task).await?;

        let kernel = self.build_kernel(&user_id, session_id).await?;
        Ok((task, request_id, kernel))
    }

    /// Decide the user's pending tool calls: approve executes and resumes
    /// the loop, reject cancels the task. Idempotent against replay of an
    /// already-resolved `request_id` (`SPEC_FULL.md` §4.1 resume step 2).
    pub async fn resume(
        &self,
        auth_header: &str,
        request_id: RequestId,
        decision: ResumeDecision,
    ) -> Result<Response, RequestHandlerError> {
        let user_id = self.authorizer.authorize_request(auth_header).await?;
        let mut task = self
            .task_repo
            .find_by_pending_request_id(request_id)
            .await?
            .ok_or(RequestHandlerError::NoSuchPendingRequest)?;
        task.assert_owner(&user_id)?;

        if task.status != TaskStatus::Paused {
            return Ok(self.response_from_current_state(&task, request_id));
        }

        let pending = task.validate_resume(request_id)?.to_vec();
        let session_id = task.session_id;

        match decision {
            ResumeDecision::Reject => self.reject_pending(&mut task, request_id, session_id, &pending).await,
            ResumeDecision::Approve => {
                let resumed_event = task.resume_running()?;
                self.event_bus.publish_task_event(resumed_event);
                let kernel = self.build_kernel(&user_id, session_id).await?;
                let options = self.options(kernel.tool_specs());
                let outcome = self
                    .agent_loop
                    .resume_after_approval(
                        &mut task,
                        request_id,
                        &pending,
                        &self.agent.system_prompt,
                        &self.agent.model,
                        &options,
                        &kernel,
                    )
                    .await?;
                self.finish(task, session_id, request_id, outcome).await
            }
        }
    }

    /// Streaming counterpart to [`RequestHandlerService::resume`]: reject
    /// and idempotent-replay both resolve to a single terminal frame, only
    /// an approval continues on into streamed text fragments.
    pub fn resume_stream<'a>(
        &'a self,
        auth_header: &'a str,
        request_id: RequestId,
        decision: ResumeDecision,
    ) -> BoxStream<'a, Result<StreamFrame, RequestHandlerError>> {
        stream::once(async move {
            let user_id = self.authorizer.authorize_request(auth_header).await?;
            let mut task = self
                .task_repo
                .find_by_pending_request_id(request_id)
                .await?
                .ok_or(RequestHandlerError::NoSuchPendingRequest)?;
            task.assert_owner(&user_id)?;

            if task.status != TaskStatus::Paused {
                let response = self.response_from_current_state(&task, request_id);
                return Ok(vec![StreamFrame::Final(response)]);
            }

            let pending = task.validate_resume(request_id)?.to_vec();
            let session_id = task.session_id;

            match decision {
                ResumeDecision::Reject => {
                    let response = self.reject_pending(&mut task, request_id, session_id, &pending).await?;
                    Ok(vec![StreamFrame::Final(response)])
                }
                ResumeDecision::Approve => {
                    let resumed_event = task.resume_running()?;
                    self.event_bus.publish_task_event(resumed_event);
                    let kernel = self.build_kernel(&user_id, session_id).await?;
                    let options = self.options(kernel.tool_specs());
                    let (partials, outcome) = drive_to_partials(
                        self.agent_loop.resume_after_approval_stream(
                            &mut task,
                            request_id,
                            &pending,
                            &self.agent.system_prompt,
                            &self.agent.model,
                            &options,
                            &kernel,
                        ),
                        session_id,
                        task.task_id,
                        request_id,
                    )
                    .await?;
                    self.finish_stream(task, session_id, request_id, partials, outcome).await
                }
            }
        })
        .flat_map(frames_to_stream)
        .boxed()
    }

    async fn reject_pending(
        &self,
        task: &mut AgentTask,
        request_id: RequestId,
        session_id: SessionId,
        pending: &[crate::domain::task::FunctionCall],
    ) -> Result<Response, RequestHandlerError> {
        for call in pending {
            task.append_tool_result(
                request_id,
                ToolResult { call_id: call.id.clone(), is_error: true, content: "rejected by human reviewer".into() },
            );
        }
        let event = task.reject_pending()?;
        self.task_repo.save(task).await?;
        self.event_bus.publish_task_event(event);
        Ok(Response::RejectedTool(RejectedToolResponse {
            session_id,
            task_id: task.task_id,
            request_id,
            reason: "rejected by human reviewer".into(),
            status: task.status,
        }))
    }

    async fn finish(
        &self,
        mut task: AgentTask,
        session_id: SessionId,
        request_id: RequestId,
        outcome: LoopOutcome,
    ) -> Result<Response, RequestHandlerError> {
        match outcome {
            LoopOutcome::Done { text, usage } => {
                let event = task.complete()?;
                self.task_repo.save(&task).await?;
                self.event_bus.publish_task_event(event);
                Ok(Response::Agent(AgentResponse {
                    session_id,
                    task_id: task.task_id,
                    request_id,
                    output: text,
                    token_usage: usage,
                    status: task.status,
                }))
            }
            LoopOutcome::Paused { calls, usage: _ } => {
                let event = task.pause_for_hitl(request_id, calls.clone())?;
                self.task_repo.save(&task).await?;
                self.event_bus.publish_task_event(event);
                Ok(Response::Hitl(HitlResponse::new(session_id, task.task_id, request_id, calls)))
            }
        }
    }

    /// Persist/publish the terminal state transition for a streamed drive,
    /// then append the structured terminal response as the final frame.
    async fn finish_stream(
        &self,
        task: AgentTask,
        session_id: SessionId,
        request_id: RequestId,
        partials: Vec<PartialResponse>,
        outcome: LoopOutcome,
    ) -> Result<Vec<StreamFrame>, RequestHandlerError> {
        let response = self.finish(task, session_id, request_id, outcome).await?;
        let mut frames: Vec<StreamFrame> = partials.into_iter().map(StreamFrame::Partial).collect();
        frames.push(StreamFrame::Final(response));
        Ok(frames)
    }

    /// Idempotent replay for a `resume` call whose task already advanced
    /// past `Paused` — no re-execution, just the current terminal shape.
    fn response_from_current_state(&self, task: &AgentTask, request_id: RequestId) -> Response {
        match task.status {
            TaskStatus::Completed => {
                let output = task
                    .items
                    .iter()
                    .rev()
                    .find_map(|item| match &item.content {
                        ItemContent::AssistantText { text } => Some(text.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                Response::Agent(AgentResponse {
                    session_id: task.session_id,
                    task_id: task.task_id,
                    request_id,
                    output,
                    token_usage: Default::default(),
                    status: task.status,
                })
            }
            TaskStatus::Canceled => Response::RejectedTool(RejectedToolResponse {
                session_id: task.session_id,
                task_id: task.task_id,
                request_id,
                reason: "already resolved".into(),
                status: task.status,
            }),
            _ => Response::RejectedTool(RejectedToolResponse {
                session_id: task.session_id,
                task_id: task.task_id,
                request_id,
                reason: format!("task is in state {:?}, nothing to resume", task.status),
                status: task.status,
            }),
        }
    }

    async fn resolve_task(
        &self,
        user_id: &UserId,
        session_id: SessionId,
        task_id: Option<TaskId>,
    ) -> Result<AgentTask, RequestHandlerError> {
        match task_id {
            Some(id) => {
                let task = self.task_repo.find_by_id(id).await?.ok_or(RequestHandlerError::TaskNotFound(id))?;
                task.assert_owner(user_id)?;
                Ok(task)
            }
            None => Ok(AgentTask::new(session_id, user_id.clone())),
        }
    }

    async fn ensure_discovery(
        &self,
        user_id: &UserId,
        session_id: SessionId,
    ) -> Result<Option<AuthChallengeResponse>, RequestHandlerError> {
        match self.mcp_registry.discover_and_materialize(user_id, session_id, &self.agent.mcp_servers).await {
            Ok(()) => Ok(None),
            Err(DiscoveryOutcome::AuthRequired(requirements)) => {
                let request_id = RequestId::new();
                let challenges =
                    requirements.iter().map(|r| self.to_auth_challenge(user_id, session_id, r)).collect();
                warn!(%user_id, %session_id, "request blocked on downstream OAuth authorization");
                // No task exists yet at this point (discovery runs before
                // resolve_task), so there is nothing `/resume/{request_id}`
                // could look up. Under the re-discovery model (SPEC_FULL.md
                // §4.3) the client retries by re-POSTing to the invoke entry
                // point with the same session_id; discovery then re-runs and
                // succeeds once the OAuth callback has stored the token.
                Ok(Some(AuthChallengeResponse {
                    session_id,
                    task_id: TaskId::new(),
                    request_id,
                    challenges,
                    resume_url: "/".to_string(),
                }))
            }
            Err(DiscoveryOutcome::Repository(e)) => Err(e.into()),
        }
    }

    fn to_auth_challenge(&self, user_id: &UserId, session_id: SessionId, requirement: &AuthRequired) -> AuthChallenge {
        let auth_url = self.oauth_broker.begin_flow(user_id, session_id, requirement).unwrap_or_default();
        AuthChallenge { server: requirement.server_name.clone(), auth_url }
    }

    /// `POST /auth/arcade/verify` side effect: exchange the authorization
    /// code, store the token, and clear the cached discovery result so the
    /// user's next request re-runs discovery against the now-authorized
    /// server (`SPEC_FULL.md` §6, §8 scenario 6).
    pub async fn verify_oauth_callback(&self, flow_id: &str, code: String) -> Result<(), RequestHandlerError> {
        let (user_id, session_id) = self
            .oauth_broker
            .complete_flow(flow_id, code)
            .await
            .map_err(|e| RequestHandlerError::OAuthCallback(e.to_string()))?;
        self.session_state_repo.delete(&user_id, session_id).await?;
        Ok(())
    }

    async fn build_kernel(&self, user_id: &UserId, session_id: SessionId) -> Result<Kernel, RequestHandlerError> {
        let state: SessionState = self.session_state_repo.find(user_id, session_id).await?.unwrap_or_default();
        let mut mcp_plugins = HashMap::new();

        for server in &self.agent.mcp_servers {
            if let Some(discovery) = state.per_server.get(&server.name) {
                mcp_plugins.insert(
                    format!("mcp_{}", server.name),
                    McpPluginInstance {
                        server_config: server.clone(),
                        tool_metadata: discovery.plugin_data.clone(),
                        user_id: user_id.clone(),
                        session_id,
                    },
                );
            }
        }

        Ok(Kernel::new(self.native.clone(), mcp_plugins, self.oauth_broker.clone()))
    }

    fn options(&self, tools: Vec<ToolSpec>) -> GenerationOptions {
        GenerationOptions { max_tokens: Some(4096), temperature: self.agent.temperature, stop_sequences: Vec::new(), tools }
    }
}

/// Replay a collected `Vec<StreamFrame>` (or single error) as a stream —
/// the `flat_map` combinator shared by `invoke_stream` and `resume_stream`.
fn frames_to_stream(
    result: Result<Vec<StreamFrame>, RequestHandlerError>,
) -> BoxStream<'static, Result<StreamFrame, RequestHandlerError>> {
    match result {
        Ok(frames) => stream::iter(frames.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
    }
}

/// Drain an [`AgentLoop::drive_stream`] sequence into `PartialResponse`
/// fragments plus the terminal outcome, without the final `done:true` frame
/// (the caller appends that after persisting the outcome).
async fn drive_to_partials(
    mut inner: BoxStream<'_, Result<StreamEvent, AgentLoopError>>,
    session_id: SessionId,
    task_id: TaskId,
    request_id: RequestId,
) -> Result<(Vec<PartialResponse>, LoopOutcome), RequestHandlerError> {
    let mut partials = Vec::new();
    while let Some(event) = inner.next().await {
        match event? {
            StreamEvent::TextDelta(chunk) => {
                partials.push(PartialResponse { session_id, task_id, request_id, output_partial: chunk, done: false });
            }
            StreamEvent::Outcome(outcome) => return Ok((partials, outcome)),
        }
    }
    Err(RequestHandlerError::AgentLoop(AgentLoopError::Canceled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::application::authorizer::DummyAuthorizer;
    use crate::application::catalog::PluginCatalog;
    use crate::application::hitl_gate::HitlGate;
    use crate::application::kernel::KernelError;
    use crate::domain::governance::{Governance, PluginTool};
    use crate::domain::llm::{ChatMessage, FinishReason, GenerationFragment, GenerationResponse, LLMProvider};
    use crate::domain::task::{FunctionCall, MultiModalItem};
    use crate::infrastructure::llm::registry::ProviderRegistry;
    use crate::infrastructure::repositories::{InMemoryAuthStorageRepository, InMemorySessionStateRepository, InMemoryTaskRepository};

    struct FakeProvider {
        responses: StdMutex<VecDeque<GenerationResponse>>,
        streams: StdMutex<VecDeque<Vec<GenerationFragment>>>,
    }

    impl FakeProvider {
        fn with_responses(responses: Vec<GenerationResponse>) -> Self {
            Self { responses: StdMutex::new(responses.into()), streams: StdMutex::new(VecDeque::new()) }
        }

        fn with_streams(streams: Vec<Vec<GenerationFragment>>) -> Self {
            Self { responses: StdMutex::new(VecDeque::new()), streams: StdMutex::new(streams.into()) }
        }
    }

    #[async_trait]
    impl LLMProvider for FakeProvider {
        async fn generate(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, crate::domain::llm::LLMError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| crate::domain::llm::LLMError::Provider("no scripted response left".into()))
        }

        async fn generate_stream(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<BoxStream<'static, Result<GenerationFragment, crate::domain::llm::LLMError>>, crate::domain::llm::LLMError> {
            let fragments = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| crate::domain::llm::LLMError::Provider("no scripted stream left".into()))?;
            Ok(stream::iter(fragments.into_iter().map(Ok)).boxed())
        }

        async fn health_check(&self) -> Result<(), crate::domain::llm::LLMError> {
            Ok(())
        }
    }

    struct EchoFunction;

    #[async_trait]
    impl NativeFunction for EchoFunction {
        async fn invoke(&self, _function_name: &str, arguments: serde_json::Value) -> Result<String, KernelError> {
            Ok(arguments.to_string())
        }

        fn function_specs(&self, _plugin_name: &str) -> Vec<ToolSpec> {
            Vec::new()
        }
    }

    fn text_response(text: &str) -> GenerationResponse {
        GenerationResponse {
            text: Some(text.to_string()),
            tool_calls: Vec::new(),
            usage: crate::domain::llm::TokenUsage::default(),
            provider: "test".into(),
            model: "fake-model".into(),
            finish_reason: FinishReason::Stop,
        }
    }

    fn tool_call_response(call: FunctionCall) -> GenerationResponse {
        GenerationResponse {
            text: None,
            tool_calls: vec![call],
            usage: crate::domain::llm::TokenUsage::default(),
            provider: "test".into(),
            model: "fake-model".into(),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    fn user_message(text: &str) -> UserMessage {
        UserMessage { session_id: None, task_id: None, items: vec![MultiModalItem::Text { text: text.into() }] }
    }

    fn sensitive_catalog() -> Arc<PluginCatalog> {
        let catalog = PluginCatalog::new();
        catalog.register(PluginTool {
            tool_id: "sensitive_plugin-delete_user_data".into(),
            plugin_id: "sensitive_plugin".into(),
            name: "delete_user_data".into(),
            description: "deletes user data".into(),
            governance: Governance::destructive(),
            input_schema: serde_json::json!({}),
            auth: None,
        });
        Arc::new(catalog)
    }

    fn service_with(
        provider: FakeProvider,
        hitl_catalog: Arc<PluginCatalog>,
        native: HashMap<String, Arc<dyn NativeFunction>>,
        max_rounds: u32,
    ) -> (RequestHandlerService, Arc<InMemoryTaskRepository>) {
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let session_state_repo = Arc::new(InMemorySessionStateRepository::new());
        let auth_storage = Arc::new(InMemoryAuthStorageRepository::new());
        let oauth_broker = Arc::new(OAuthBroker::new(auth_storage, HashMap::new()));
        let mcp_registry = Arc::new(McpRegistry::new(session_state_repo.clone(), hitl_catalog.clone(), oauth_broker.clone()));

        let mut providers = ProviderRegistry::new();
        providers.register("test", Arc::new(provider));
        let hitl_gate = Arc::new(HitlGate::new(hitl_catalog));
        let agent_loop = Arc::new(AgentLoop::new(Arc::new(providers), hitl_gate, task_repo.clone(), max_rounds));

        let agent = AgentDefinition {
            name: "support-bot".into(),
            model: "test:fake-model".into(),
            system_prompt: "be helpful".into(),
            temperature: Some(0.2),
            plugins: Vec::new(),
            remote_plugins: Vec::new(),
            mcp_servers: Vec::new(),
            max_rounds,
            mount_path: None,
        };

        let service = RequestHandlerService::new(
            agent,
            Arc::new(DummyAuthorizer),
            task_repo.clone(),
            session_state_repo,
            mcp_registry,
            oauth_broker,
            agent_loop,
            native,
            EventBus::with_default_capacity(),
        );
        (service, task_repo)
    }

    #[tokio::test]
    async fn invoke_happy_path_completes_and_persists_task() {
        let provider = FakeProvider::with_responses(vec![text_response("hello!")]);
        let (service, task_repo) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);

        let response = service.invoke("Bearer alice", user_message("hi")).await.unwrap();
        let agent_response = match response {
            Response::Agent(r) => r,
            other => panic!("expected Agent response, got {other:?}"),
        };
        assert_eq!(agent_response.output, "hello!");
        assert_eq!(agent_response.status, TaskStatus::Completed);

        let stored = task_repo.find_by_id(agent_response.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.user_id, UserId::from("alice"));
    }

    #[tokio::test]
    async fn invoke_rejects_missing_bearer_prefix() {
        let provider = FakeProvider::with_responses(vec![]);
        let (service, _) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);
        let err = service.invoke("alice", user_message("hi")).await.unwrap_err();
        assert!(matches!(err, RequestHandlerError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn invoke_with_unknown_task_id_is_not_found() {
        let provider = FakeProvider::with_responses(vec![]);
        let (service, _) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);
        let message = UserMessage { session_id: None, task_id: Some(TaskId::new()), items: vec![] };
        let err = service.invoke("Bearer alice", message).await.unwrap_err();
        assert!(matches!(err, RequestHandlerError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn invoke_rejects_cross_user_task_access() {
        let provider = FakeProvider::with_responses(vec![text_response("irrelevant")]);
        let (service, task_repo) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);
        let owned_task = AgentTask::new(SessionId::new(), UserId::from("alice"));
        task_repo.save(&owned_task).await.unwrap();

        let message = UserMessage { session_id: Some(owned_task.session_id), task_id: Some(owned_task.task_id), items: vec![] };
        let err = service.invoke("Bearer bob", message).await.unwrap_err();
        assert!(matches!(err, RequestHandlerError::Ownership(TaskError::NotOwner(_))));
    }

    #[tokio::test]
    async fn hitl_pause_then_resume_approve_converges() {
        let call = FunctionCall {
            id: "c1".into(),
            plugin_name: "sensitive_plugin".into(),
            function_name: "delete_user_data".into(),
            arguments: serde_json::json!({}),
        };
        let provider = FakeProvider::with_responses(vec![tool_call_response(call), text_response("deleted")]);
        let mut native: HashMap<String, Arc<dyn NativeFunction>> = HashMap::new();
        native.insert("sensitive_plugin".to_string(), Arc::new(EchoFunction));
        let (service, task_repo) = service_with(provider, sensitive_catalog(), native, 5);

        let response = service.invoke("Bearer alice", user_message("please delete")).await.unwrap();
        let hitl = match response {
            Response::Hitl(h) => h,
            other => panic!("expected Hitl response, got {other:?}"),
        };
        assert_eq!(hitl.tool_calls[0].id, "c1");

        let stored = task_repo.find_by_id(hitl.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Paused);

        let resumed = service.resume("Bearer alice", hitl.request_id, ResumeDecision::Approve).await.unwrap();
        match resumed {
            Response::Agent(r) => {
                assert_eq!(r.output, "deleted");
                assert_eq!(r.status, TaskStatus::Completed);
            }
            other => panic!("expected Agent response after approval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_reject_cancels_the_task() {
        let call = FunctionCall {
            id: "c1".into(),
            plugin_name: "sensitive_plugin".into(),
            function_name: "delete_user_data".into(),
            arguments: serde_json::json!({}),
        };
        let provider = FakeProvider::with_responses(vec![tool_call_response(call)]);
        let (service, task_repo) = service_with(provider, sensitive_catalog(), HashMap::new(), 5);

        let response = service.invoke("Bearer alice", user_message("please delete")).await.unwrap();
        let hitl = match response {
            Response::Hitl(h) => h,
            other => panic!("expected Hitl response, got {other:?}"),
        };

        let rejected = service.resume("Bearer alice", hitl.request_id, ResumeDecision::Reject).await.unwrap();
        match rejected {
            Response::RejectedTool(r) => assert_eq!(r.status, TaskStatus::Canceled),
            other => panic!("expected RejectedTool response, got {other:?}"),
        }

        let stored = task_repo.find_by_id(hitl.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Canceled);
    }

    /// Simulates a duplicate resume call racing in after the task already
    /// resolved: `pending_request_id` manually left set to model the window
    /// between a state transition and its repository save landing.
    #[tokio::test]
    async fn resume_replay_after_task_already_resolved_is_idempotent() {
        let provider = FakeProvider::with_responses(vec![]);
        let (service, task_repo) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);

        let mut task = AgentTask::new(SessionId::new(), UserId::from("alice"));
        let request_id = RequestId::new();
        task.append_assistant_text(request_id, "already done".into());
        task.status = TaskStatus::Completed;
        task.pending_request_id = Some(request_id);
        task_repo.save(&task).await.unwrap();

        let response = service.resume("Bearer alice", request_id, ResumeDecision::Approve).await.unwrap();
        match response {
            Response::Agent(r) => assert_eq!(r.output, "already done"),
            other => panic!("expected idempotent Agent response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_stream_yields_partials_then_a_final_frame() {
        let provider = FakeProvider::with_streams(vec![vec![
            GenerationFragment::Text("Hel".into()),
            GenerationFragment::Text("lo".into()),
            GenerationFragment::Done(GenerationResponse {
                text: None,
                tool_calls: Vec::new(),
                usage: crate::domain::llm::TokenUsage::default(),
                provider: "test".into(),
                model: "fake-model".into(),
                finish_reason: FinishReason::Stop,
            }),
        ]]);
        let (service, _) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);

        let frames: Vec<_> = service.invoke_stream("Bearer alice", user_message("hi")).collect().await;
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            Ok(StreamFrame::Partial(p)) => assert_eq!(p.output_partial, "Hel"),
            other => panic!("unexpected first frame: {other:?}"),
        }
        match &frames[2] {
            Ok(StreamFrame::Final(Response::Agent(r))) => assert_eq!(r.output, "Hello"),
            other => panic!("unexpected final frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_oauth_callback_surfaces_unknown_flow_as_error() {
        let provider = FakeProvider::with_responses(vec![]);
        let (service, _) = service_with(provider, Arc::new(PluginCatalog::new()), HashMap::new(), 5);
        let err = service.verify_oauth_callback("not-a-real-flow", "code".into()).await.unwrap_err();
        assert!(matches!(err, RequestHandlerError::OAuthCallback(_)));
    }
}
