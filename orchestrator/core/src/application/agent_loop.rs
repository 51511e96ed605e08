// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The agent tool-call loop: drive the LLM to completion across any number
//! of tool-call rounds, interposing the HITL gate before any function
//! executes (`SPEC_FULL.md` §4.2). Unary and streaming modes share this
//! recursion; streaming only changes how text fragments reach the caller.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{info, warn};

use crate::application::hitl_gate::HitlGate;
use crate::application::kernel::Kernel;
use crate::domain::identity::RequestId;
use crate::domain::llm::{ChatMessage, GenerationFragment, GenerationOptions, LLMError, TokenUsage};
use crate::domain::repository::{RepositoryError, TaskRepository};
use crate::domain::task::{AgentTask, AgentTaskItem, FunctionCall, ItemContent, ToolResult};
use crate::infrastructure::llm::registry::ProviderRegistry;

#[derive(Debug, thiserror::Error)]
pub enum AgentLoopError {
    #[error(transparent)]
    Llm(#[from] LLMError),
    #[error("agent loop exceeded its configured round cap ({0})")]
    MaxRoundsExceeded(u32),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Task(#[from] crate::domain::task::TaskError),
    #[error("request canceled")]
    Canceled,
}

/// The tagged outcome of one drive through the loop — a "continue" round is
/// never observed by the caller, only the terminal `Done`/`Paused` tags
/// (`SPEC_FULL.md` §9: HITL as tagged outcome, not control-flow exception).
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    Done { text: String, usage: TokenUsage },
    Paused { calls: Vec<FunctionCall>, usage: TokenUsage },
}

/// Rebuild the provider-facing chat history fresh from durable task items —
/// no in-memory continuation is ever assumed (`SPEC_FULL.md` §4.2).
pub fn reconstruct_history(items: &[AgentTaskItem]) -> Vec<ChatMessage> {
    items
        .iter()
        .map(|item| match &item.content {
            ItemContent::User { items } => {
                let text = items
                    .iter()
                    .filter_map(|m| match m {
                        crate::domain::task::MultiModalItem::Text { text } => Some(text.clone()),
                        crate::domain::task::MultiModalItem::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                ChatMessage::user(text)
            }
            ItemContent::AssistantText { text } => ChatMessage::assistant_text(text.clone()),
            ItemContent::AssistantToolCalls { calls } => ChatMessage::assistant_tool_calls(calls.clone()),
            ItemContent::Tool { result } => ChatMessage::tool_result(result.call_id.clone(), result.content.clone()),
        })
        .collect()
}

pub struct AgentLoop {
    providers: Arc<ProviderRegistry>,
    hitl_gate: Arc<HitlGate>,
    task_repo: Arc<dyn TaskRepository>,
    max_rounds: u32,
}

impl AgentLoop {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        hitl_gate: Arc<HitlGate>,
        task_repo: Arc<dyn TaskRepository>,
        max_rounds: u32,
    ) -> Self {
        Self { providers, hitl_gate, task_repo, max_rounds }
    }

    /// Drive one or more LLM rounds to completion, appending and persisting
    /// every item as it is produced so a crash mid-loop never loses
    /// already-executed tool results.
    pub async fn drive(
        &self,
        task: &mut AgentTask,
        request_id: RequestId,
        system_prompt: &str,
        model: &str,
        base_options: &GenerationOptions,
        kernel: &Kernel,
    ) -> Result<LoopOutcome, AgentLoopError> {
        let mut messages = vec![ChatMessage::system(system_prompt)];
        messages.extend(reconstruct_history(&task.items));
        let mut usage = TokenUsage::default();

        for round in 0..self.max_rounds {
            let response = self.providers.generate(model, &messages, base_options).await?;
            usage.accumulate(response.usage);

            if response.tool_calls.is_empty() {
                let text = response.text.unwrap_or_default();
                task.append_assistant_text(request_id, text.clone());
                self.task_repo.save(task).await?;
                return Ok(LoopOutcome::Done { text, usage });
            }

            if let Some(pending) = self.hitl_gate.evaluate(&response.tool_calls) {
                info!(task_id = %task.task_id, round, "agent loop paused for HITL approval");
                task.append_assistant_tool_calls(request_id, pending.clone());
                self.task_repo.save(task).await?;
                return Ok(LoopOutcome::Paused { calls: pending, usage });
            }

            task.append_assistant_tool_calls(request_id, response.tool_calls.clone());
            messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

            for call in &response.tool_calls {
                let result = self.execute_and_record(task, request_id, kernel, call).await?;
                messages.push(ChatMessage::tool_result(result.call_id.clone(), result.content.clone()));
            }

            self.task_repo.save(task).await?;
        }

        warn!(task_id = %task.task_id, "agent loop exceeded max_rounds without converging");
        Err(AgentLoopError::MaxRoundsExceeded(self.max_rounds))
    }

    /// Execute already-approved pending tool calls after a HITL resume, then
    /// continue the loop with the updated history (`SPEC_FULL.md` §4.1
    /// resume algorithm, step 4).
    pub async fn resume_after_approval(
        &self,
        task: &mut AgentTask,
        request_id: RequestId,
        pending: &[FunctionCall],
        system_prompt: &str,
        model: &str,
        base_options: &GenerationOptions,
        kernel: &Kernel,
    ) -> Result<LoopOutcome, AgentLoopError> {
        for call in pending {
            self.execute_and_record(task, request_id, kernel, call).await?;
        }
        self.task_repo.save(task).await?;
        self.drive(task, request_id, system_prompt, model, base_options, kernel).await
    }

    async fn execute_and_record(
        &self,
        task: &mut AgentTask,
        request_id: RequestId,
        kernel: &Kernel,
        call: &FunctionCall,
    ) -> Result<ToolResult, AgentLoopError> {
        let result = match kernel.dispatch(call).await {
            Ok(content) => ToolResult { call_id: call.id.clone(), is_error: false, content },
            Err(e) => {
                warn!(task_id = %task.task_id, tool_id = %call.tool_id(), error = %e, "tool execution failed");
                ToolResult { call_id: call.id.clone(), is_error: true, content: e.to_string() }
            }
        };
        task.append_tool_result(request_id, result.clone());
        Ok(result)
    }
}

/// One fragment of a streamed drive: either a partial-text chunk or the
/// same terminal outcome a unary call would have returned.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    Outcome(LoopOutcomeOwned),
}

/// `LoopOutcome` is not `Clone`-free of borrowed data in all call sites; a
/// thin owned alias keeps `StreamEvent` simple to move across the stream.
pub type LoopOutcomeOwned = LoopOutcome;

impl AgentLoop {
    /// Streaming counterpart to [`AgentLoop::resume_after_approval`]: execute
    /// already-approved pending calls, then continue the loop in streaming
    /// mode. The resumed tool-execution round itself is never streamed
    /// (`SPEC_FULL.md` §4.2), matching the unary resume's behavior.
    pub fn resume_after_approval_stream<'a>(
        &'a self,
        task: &'a mut AgentTask,
        request_id: RequestId,
        pending: &'a [FunctionCall],
        system_prompt: &'a str,
        model: &'a str,
        base_options: &'a GenerationOptions,
        kernel: &'a Kernel,
    ) -> BoxStream<'a, Result<StreamEvent, AgentLoopError>> {
        stream::once(async move {
            for call in pending {
                if let Err(e) = self.execute_and_record(task, request_id, kernel, call).await {
                    return stream::once(async move { Err(e) }).boxed();
                }
            }
            if let Err(e) = self.task_repo.save(task).await {
                return stream::once(async move { Err(AgentLoopError::from(e)) }).boxed();
            }
            self.drive_stream(task, request_id, system_prompt, model, base_options, kernel)
        })
        .flatten()
        .boxed()
    }

    /// Streaming drive: yields `TextDelta` fragments for the first round's
    /// text output, then falls back to the same round-by-round execution as
    /// [`AgentLoop::drive`] for any tool-calling rounds (tool rounds are not
    /// streamed to the client — `SPEC_FULL.md` §4.2). The stream always
    /// ends with exactly one `Outcome` event.
    pub fn drive_stream<'a>(
        &'a self,
        task: &'a mut AgentTask,
        request_id: RequestId,
        system_prompt: &'a str,
        model: &'a str,
        base_options: &'a GenerationOptions,
        kernel: &'a Kernel,
    ) -> BoxStream<'a, Result<StreamEvent, AgentLoopError>> {
        stream::once(async move {
            let mut messages = vec![ChatMessage::system(system_prompt)];
            messages.extend(reconstruct_history(&task.items));
            let mut usage = TokenUsage::default();
            let mut events = Vec::new();

            for round in 0..self.max_rounds {
                let mut fragments = match self.providers.generate_stream(model, &messages, base_options).await {
                    Ok(s) => s,
                    Err(e) => return (events, Err(AgentLoopError::from(e))),
                };

                let mut collected_text = String::new();
                let mut final_response = None;
                while let Some(fragment) = fragments.next().await {
                    match fragment {
                        Ok(GenerationFragment::Text(chunk)) => {
                            collected_text.push_str(&chunk);
                            events.push(StreamEvent::TextDelta(chunk));
                        }
                        Ok(GenerationFragment::ToolCallDelta { .. }) => {}
                        Ok(GenerationFragment::Done(response)) => final_response = Some(response),
                        Err(e) => return (events, Err(AgentLoopError::from(e))),
                    }
                }

                let Some(response) = final_response else {
                    return (
                        events,
                        Err(AgentLoopError::Llm(LLMError::Provider("stream ended without a Done fragment".into()))),
                    );
                };
                usage.accumulate(response.usage);

                if response.tool_calls.is_empty() {
                    let text = if response.text.is_some() { response.text.unwrap_or_default() } else { collected_text };
                    task.append_assistant_text(request_id, text.clone());
                    if let Err(e) = self.task_repo.save(task).await {
                        return (events, Err(AgentLoopError::from(e)));
                    }
                    events.push(StreamEvent::Outcome(LoopOutcome::Done { text, usage }));
                    return (events, Ok(()));
                }

                if let Some(pending) = self.hitl_gate.evaluate(&response.tool_calls) {
                    task.append_assistant_tool_calls(request_id, pending.clone());
                    if let Err(e) = self.task_repo.save(task).await {
                        return (events, Err(AgentLoopError::from(e)));
                    }
                    events.push(StreamEvent::Outcome(LoopOutcome::Paused { calls: pending, usage }));
                    return (events, Ok(()));
                }

                task.append_assistant_tool_calls(request_id, response.tool_calls.clone());
                messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

                for call in &response.tool_calls {
                    match self.execute_and_record(task, request_id, kernel, &call.clone()).await {
                        Ok(result) => messages.push(ChatMessage::tool_result(result.call_id.clone(), result.content.clone())),
                        Err(e) => return (events, Err(e)),
                    }
                }

                if let Err(e) = self.task_repo.save(task).await {
                    return (events, Err(AgentLoopError::from(e)));
                }
                let _ = round;
            }

            (events, Err(AgentLoopError::MaxRoundsExceeded(self.max_rounds)))
        })
        .flat_map(|(events, outcome)| {
            let mut results: Vec<Result<StreamEvent, AgentLoopError>> = events.into_iter().map(Ok).collect();
            if let Err(e) = outcome {
                results.push(Err(e));
            }
            stream::iter(results)
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::application::catalog::PluginCatalog;
    use crate::application::kernel::{Kernel, KernelError, NativeFunction};
    use crate::application::oauth_broker::OAuthBroker;
    use crate::domain::governance::{Governance, PluginTool};
    use crate::domain::identity::{SessionId, UserId};
    use crate::domain::llm::{FinishReason, GenerationResponse, ToolSpec};
    use crate::infrastructure::repositories::{InMemoryAuthStorageRepository, InMemoryTaskRepository};

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
        ) -> Result<GenerationResponse, LLMError> {
            self.responses.lock().unwrap().pop_front().ok_or_else(|| LLMError::Provider("no scripted response left".into()))
        }

        async fn generate_stream(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<BoxStream<'static, Result<GenerationFragment, LLMError>>, LLMError> {
            let fragments =
                self.streams.lock().unwrap().pop_front().ok_or_else(|| LLMError::Provider("no scripted stream left".into()))?;
            Ok(stream::iter(fragments.into_iter().map(Ok)).boxed())
        }

        async fn health_check(&self) -> Result<(), LLMError> {
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
            usage: TokenUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 },
            provider: "test".into(),
            model: "fake-model".into(),
            finish_reason: FinishReason::Stop,
        }
    }

    fn tool_call_response(call: FunctionCall) -> GenerationResponse {
        GenerationResponse {
            text: None,
            tool_calls: vec![call],
            usage: TokenUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 },
            provider: "test".into(),
            model: "fake-model".into(),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    fn calc_call(id: &str) -> FunctionCall {
        FunctionCall { id: id.into(), plugin_name: "native_calc".into(), function_name: "add".into(), arguments: serde_json::json!({"a": 1}) }
    }

    fn sensitive_call(id: &str) -> FunctionCall {
        FunctionCall { id: id.into(), plugin_name: "sensitive_plugin".into(), function_name: "delete_user_data".into(), arguments: serde_json::json!({}) }
    }

    fn no_hitl_gate() -> Arc<HitlGate> {
        Arc::new(HitlGate::new(Arc::new(PluginCatalog::new())))
    }

    fn hitl_gate_with_sensitive_tool() -> Arc<HitlGate> {
        let catalog = Arc::new(PluginCatalog::new());
        catalog.register(PluginTool {
            tool_id: "sensitive_plugin-delete_user_data".into(),
            plugin_id: "sensitive_plugin".into(),
            name: "delete_user_data".into(),
            description: "deletes user data".into(),
            governance: Governance::destructive(),
            input_schema: serde_json::json!({}),
            auth: None,
        });
        Arc::new(HitlGate::new(catalog))
    }

    fn kernel_with_echo() -> Kernel {
        let auth_storage = Arc::new(InMemoryAuthStorageRepository::new());
        let oauth_broker = Arc::new(OAuthBroker::new(auth_storage, HashMap::new()));
        let mut native: HashMap<String, Arc<dyn NativeFunction>> = HashMap::new();
        native.insert("native_calc".to_string(), Arc::new(EchoFunction));
        Kernel::new(native, HashMap::new(), oauth_broker)
    }

    fn new_task() -> AgentTask {
        AgentTask::new(SessionId::new(), UserId::from("alice"))
    }

    #[tokio::test]
    async fn text_only_round_reaches_done() {
        let mut providers = ProviderRegistry::new();
        providers.register("test", Arc::new(FakeProvider::with_responses(vec![text_response("hello there")])));
        let agent_loop = AgentLoop::new(Arc::new(providers), no_hitl_gate(), Arc::new(InMemoryTaskRepository::new()), 5);

        let mut task = new_task();
        let kernel = kernel_with_echo();
        let outcome = agent_loop
            .drive(&mut task, RequestId::new(), "be helpful", "test:fake-model", &GenerationOptions::default(), &kernel)
            .await
            .unwrap();

        match outcome {
            LoopOutcome::Done { text, .. } => assert_eq!(text, "hello there"),
            LoopOutcome::Paused { .. } => panic!("expected Done, got Paused"),
        }
        assert_eq!(task.items.len(), 1);
    }

    #[tokio::test]
    async fn tool_call_round_pauses_for_hitl() {
        let mut providers = ProviderRegistry::new();
        providers.register("test", Arc::new(FakeProvider::with_responses(vec![tool_call_response(sensitive_call("c1"))])));
        let agent_loop =
            AgentLoop::new(Arc::new(providers), hitl_gate_with_sensitive_tool(), Arc::new(InMemoryTaskRepository::new()), 5);

        let mut task = new_task();
        let kernel = kernel_with_echo();
        let outcome = agent_loop
            .drive(&mut task, RequestId::new(), "be helpful", "test:fake-model", &GenerationOptions::default(), &kernel)
            .await
            .unwrap();

        match outcome {
            LoopOutcome::Paused { calls, .. } => assert_eq!(calls[0].id, "c1"),
            LoopOutcome::Done { .. } => panic!("expected Paused, got Done"),
        }
    }

    #[tokio::test]
    async fn tool_call_round_executes_without_hitl_then_converges() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            "test",
            Arc::new(FakeProvider::with_responses(vec![tool_call_response(calc_call("c1")), text_response("done")])),
        );
        let agent_loop = AgentLoop::new(Arc::new(providers), no_hitl_gate(), Arc::new(InMemoryTaskRepository::new()), 5);

        let mut task = new_task();
        let kernel = kernel_with_echo();
        let outcome = agent_loop
            .drive(&mut task, RequestId::new(), "be helpful", "test:fake-model", &GenerationOptions::default(), &kernel)
            .await
            .unwrap();

        match outcome {
            LoopOutcome::Done { text, .. } => assert_eq!(text, "done"),
            LoopOutcome::Paused { .. } => panic!("expected Done, got Paused"),
        }
        // assistant tool-call item + tool-result item from round 1, assistant text from round 2
        assert_eq!(task.items.len(), 3);
    }

    #[tokio::test]
    async fn max_rounds_exceeded_surfaces_as_error() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            "test",
            Arc::new(FakeProvider::with_responses(vec![tool_call_response(calc_call("c1")), tool_call_response(calc_call("c2"))])),
        );
        let agent_loop = AgentLoop::new(Arc::new(providers), no_hitl_gate(), Arc::new(InMemoryTaskRepository::new()), 2);

        let mut task = new_task();
        let kernel = kernel_with_echo();
        let err = agent_loop
            .drive(&mut task, RequestId::new(), "be helpful", "test:fake-model", &GenerationOptions::default(), &kernel)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentLoopError::MaxRoundsExceeded(2)));
    }

    #[tokio::test]
    async fn streaming_drive_yields_text_deltas_then_a_single_outcome() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            "test",
            Arc::new(FakeProvider::with_streams(vec![vec![
                GenerationFragment::Text("Hel".into()),
                GenerationFragment::Text("lo".into()),
                GenerationFragment::Done(GenerationResponse {
                    text: None,
                    tool_calls: Vec::new(),
                    usage: TokenUsage::default(),
                    provider: "test".into(),
                    model: "fake-model".into(),
                    finish_reason: FinishReason::Stop,
                }),
            ]])),
        );
        let agent_loop = AgentLoop::new(Arc::new(providers), no_hitl_gate(), Arc::new(InMemoryTaskRepository::new()), 5);

        let mut task = new_task();
        let kernel = kernel_with_echo();
        let events: Vec<_> = agent_loop
            .drive_stream(&mut task, RequestId::new(), "be helpful", "test:fake-model", &GenerationOptions::default(), &kernel)
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        match &events[0] {
            Ok(StreamEvent::TextDelta(chunk)) => assert_eq!(chunk, "Hel"),
            other => panic!("unexpected first event: {other:?}"),
        }
        match &events[2] {
            Ok(StreamEvent::Outcome(LoopOutcome::Done { text, .. })) => assert_eq!(text, "Hello"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_after_approval_stream_executes_pending_then_continues() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            "test",
            Arc::new(FakeProvider::with_streams(vec![vec![GenerationFragment::Done(GenerationResponse {
                text: Some("ok".into()),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                provider: "test".into(),
                model: "fake-model".into(),
                finish_reason: FinishReason::Stop,
            })]])),
        );
        let agent_loop = AgentLoop::new(Arc::new(providers), no_hitl_gate(), Arc::new(InMemoryTaskRepository::new()), 5);

        let mut task = new_task();
        let request_id = RequestId::new();
        task.pause_for_hitl(request_id, vec![calc_call("c1")]).unwrap();
        let pending = vec![calc_call("c1")];
        let kernel = kernel_with_echo();

        let events: Vec<_> = agent_loop
            .resume_after_approval_stream(
                &mut task,
                request_id,
                &pending,
                "be helpful",
                "test:fake-model",
                &GenerationOptions::default(),
                &kernel,
            )
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(StreamEvent::Outcome(LoopOutcome::Done { text, .. })) => assert_eq!(text, "ok"),
            other => panic!("unexpected event: {other:?}"),
        }
        // the tool call executed during resume was recorded even though it wasn't streamed
        assert!(task.items.iter().any(|item| matches!(item.content, ItemContent::Tool { .. })));
    }
}
