// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The HTTP/SSE surface (`SPEC_FULL.md` §6): five routes, all bearer-token
//! authenticated, mounted at whatever path the composition root chooses for
//! this agent (`AgentDefinition::mount_path`).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response as AxumResponse};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::application::agent_loop::AgentLoopError;
use crate::application::request_handler::{RequestHandlerError, RequestHandlerService};
use crate::domain::identity::RequestId;
use crate::domain::response::{ResumeDecision, StreamFrame, UserMessage};
use crate::domain::task::TaskError;

pub fn app(service: Arc<RequestHandlerService>) -> Router {
    Router::new()
        .route("/", post(invoke))
        .route("/stream", post(invoke_stream))
        .route("/resume/{request_id}", post(resume))
        .route("/resume/{request_id}/stream", post(resume_stream))
        .route("/auth/arcade/verify", post(verify_oauth_callback))
        .with_state(service)
}

fn bearer_header(headers: &HeaderMap) -> String {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string()
}

async fn invoke(
    State(service): State<Arc<RequestHandlerService>>,
    headers: HeaderMap,
    Json(message): Json<UserMessage>,
) -> AxumResponse {
    let auth = bearer_header(&headers);
    match service.invoke(&auth, message).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e, None),
    }
}

/// Runs the whole request inside a spawned task so the `BoxStream` borrowing
/// `&service` never has to escape a stack frame; the caller only ever sees
/// owned `Event`s forwarded over a channel (`SPEC_FULL.md` §6 SSE framing).
async fn invoke_stream(
    State(service): State<Arc<RequestHandlerService>>,
    headers: HeaderMap,
    Json(message): Json<UserMessage>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let auth = bearer_header(&headers);
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut stream = service.invoke_stream(&auth, message);
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(frame) => frame_to_event(frame),
                Err(e) => error_event(&e),
            };
            let stop = event.is_none();
            if tx.send(Ok(event.unwrap_or_else(error_closed_event))).await.is_err() || stop {
                break;
            }
        }
    });
    sse_response(rx)
}

async fn resume(
    State(service): State<Arc<RequestHandlerService>>,
    headers: HeaderMap,
    Path(request_id): Path<RequestId>,
    Json(decision): Json<ResumeDecision>,
) -> AxumResponse {
    let auth = bearer_header(&headers);
    match service.resume(&auth, request_id, decision).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e, Some(request_id)),
    }
}

async fn resume_stream(
    State(service): State<Arc<RequestHandlerService>>,
    headers: HeaderMap,
    Path(request_id): Path<RequestId>,
    Json(decision): Json<ResumeDecision>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let auth = bearer_header(&headers);
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut stream = service.resume_stream(&auth, request_id, decision);
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(frame) => frame_to_event(frame),
                Err(e) => error_event(&e),
            };
            let stop = event.is_none();
            if tx.send(Ok(event.unwrap_or_else(error_closed_event))).await.is_err() || stop {
                break;
            }
        }
    });
    sse_response(rx)
}

/// `SPEC_FULL.md` §6 calls for a named `event: keepalive` heartbeat, but by
/// the time this crate's collect-then-replay streams start emitting, the
/// drive loop has already run to completion — there is no mid-computation
/// gap left to bridge. We still configure axum's built-in comment-based
/// keep-alive so a genuinely slow downstream (LLM provider, MCP call) keeps
/// idle proxies from timing out the connection.
fn sse_response(rx: mpsc::Receiver<Result<Event, Infallible>>) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keepalive"))
}

fn frame_to_event(frame: StreamFrame) -> Option<Event> {
    let event = match frame {
        StreamFrame::Partial(p) => Event::default().event("partial").json_data(&p),
        StreamFrame::Final(r) => Event::default().event("final").json_data(&r),
    };
    event.ok()
}

fn error_event(err: &RequestHandlerError) -> Option<Event> {
    Event::default().event("error").json_data(&ErrorBody { status: 500, message: err.to_string(), request_id: None }).ok()
}

fn error_closed_event() -> Event {
    Event::default().event("error").data("stream closed")
}

#[derive(Deserialize)]
struct VerifyQuery {
    flow_id: String,
    code: String,
}

async fn verify_oauth_callback(
    State(service): State<Arc<RequestHandlerService>>,
    Query(query): Query<VerifyQuery>,
) -> AxumResponse {
    match service.verify_oauth_callback(&query.flow_id, query.code).await {
        Ok(()) => Html(SUCCESS_PAGE).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Html(failure_page(&e.to_string()))).into_response(),
    }
}

const SUCCESS_PAGE: &str = "<html><body><h1>Authorization complete</h1><p>You may close this window and resume your request.</p></body></html>";

fn failure_page(reason: &str) -> String {
    format!("<html><body><h1>Authorization failed</h1><p>{reason}</p></body></html>")
}

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    message: String,
    request_id: Option<RequestId>,
}

/// Maps the taxonomy in `SPEC_FULL.md` §7 onto HTTP status codes. Tool
/// execution errors, HITL pauses, and auth challenges never reach this
/// function — they are recovered or returned as structured [`Response`]
/// variants by the application layer.
fn error_response(err: RequestHandlerError, request_id: Option<RequestId>) -> AxumResponse {
    let status = match &err {
        RequestHandlerError::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
        RequestHandlerError::TaskNotFound(_) | RequestHandlerError::NoSuchPendingRequest => StatusCode::NOT_FOUND,
        RequestHandlerError::Ownership(TaskError::NotOwner(_)) => StatusCode::FORBIDDEN,
        RequestHandlerError::Ownership(_) => StatusCode::CONFLICT,
        RequestHandlerError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RequestHandlerError::AgentLoop(AgentLoopError::Llm(_)) => StatusCode::BAD_GATEWAY,
        RequestHandlerError::AgentLoop(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RequestHandlerError::OAuthCallback(_) => StatusCode::BAD_GATEWAY,
    };
    let body = ErrorBody { status: status.as_u16(), message: err.to_string(), request_id };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::application::agent_loop::AgentLoop;
    use crate::application::authorizer::DummyAuthorizer;
    use crate::application::catalog::PluginCatalog;
    use crate::application::hitl_gate::HitlGate;
    use crate::application::kernel::NativeFunction;
    use crate::application::mcp_registry::McpRegistry;
    use crate::application::oauth_broker::OAuthBroker;
    use crate::domain::agent_config::AgentDefinition;
    use crate::domain::governance::{Governance, PluginTool};
    use crate::domain::identity::TaskId;
    use crate::domain::llm::{
        ChatMessage, FinishReason, GenerationFragment, GenerationOptions, GenerationResponse, LLMError, LLMProvider, TokenUsage,
    };
    use crate::domain::task::FunctionCall;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::llm::registry::ProviderRegistry;
    use crate::infrastructure::repositories::{InMemoryAuthStorageRepository, InMemorySessionStateRepository, InMemoryTaskRepository};

    struct FakeProvider {
        responses: StdMutex<VecDeque<GenerationResponse>>,
    }

    impl FakeProvider {
        fn with_responses(responses: Vec<GenerationResponse>) -> Self {
            Self { responses: StdMutex::new(responses.into()) }
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
        ) -> Result<futures::stream::BoxStream<'static, Result<GenerationFragment, LLMError>>, LLMError> {
            Err(LLMError::Provider("streaming not scripted in this fixture".into()))
        }

        async fn health_check(&self) -> Result<(), LLMError> {
            Ok(())
        }
    }

    fn text_response(text: &str) -> GenerationResponse {
        GenerationResponse {
            text: Some(text.to_string()),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
            provider: "test".into(),
            model: "fake-model".into(),
            finish_reason: FinishReason::Stop,
        }
    }

    fn tool_call_response(call: FunctionCall) -> GenerationResponse {
        GenerationResponse {
            text: None,
            tool_calls: vec![call],
            usage: TokenUsage::default(),
            provider: "test".into(),
            model: "fake-model".into(),
            finish_reason: FinishReason::ToolCalls,
        }
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

    fn build_app(provider: FakeProvider, catalog: Arc<PluginCatalog>) -> Router {
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let session_state_repo = Arc::new(InMemorySessionStateRepository::new());
        let auth_storage = Arc::new(InMemoryAuthStorageRepository::new());
        let oauth_broker = Arc::new(OAuthBroker::new(auth_storage, HashMap::new()));
        let mcp_registry = Arc::new(McpRegistry::new(session_state_repo.clone(), catalog.clone(), oauth_broker.clone()));

        let mut providers = ProviderRegistry::new();
        providers.register("test", Arc::new(provider));
        let hitl_gate = Arc::new(HitlGate::new(catalog));
        let agent_loop = Arc::new(AgentLoop::new(Arc::new(providers), hitl_gate, task_repo.clone(), 5));

        let agent = AgentDefinition {
            name: "support-bot".into(),
            model: "test:fake-model".into(),
            system_prompt: "be helpful".into(),
            temperature: Some(0.2),
            plugins: Vec::new(),
            remote_plugins: Vec::new(),
            mcp_servers: Vec::new(),
            max_rounds: 5,
            mount_path: None,
        };
        let native: HashMap<String, Arc<dyn NativeFunction>> = HashMap::new();

        let service = Arc::new(RequestHandlerService::new(
            agent,
            Arc::new(DummyAuthorizer),
            task_repo,
            session_state_repo,
            mcp_registry,
            oauth_broker,
            agent_loop,
            native,
            EventBus::with_default_capacity(),
        ));
        app(service)
    }

    fn json_body(value: serde_json::Value) -> Body {
        Body::from(serde_json::to_vec(&value).unwrap())
    }

    async fn body_json(response: AxumResponse) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invoke_happy_path_returns_200_with_agent_body() {
        let router = build_app(FakeProvider::with_responses(vec![text_response("hello!")]), Arc::new(PluginCatalog::new()));
        let body = json_body(serde_json::json!({"session_id": null, "task_id": null, "items": [{"type": "text", "text": "hi"}]}));
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("authorization", "Bearer alice")
            .header("content-type", "application/json")
            .body(body)
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["kind"], "agent");
        assert_eq!(value["output"], "hello!");
    }

    #[tokio::test]
    async fn invoke_without_bearer_returns_401() {
        let router = build_app(FakeProvider::with_responses(vec![]), Arc::new(PluginCatalog::new()));
        let body = json_body(serde_json::json!({"session_id": null, "task_id": null, "items": []}));
        let request =
            Request::builder().method("POST").uri("/").header("content-type", "application/json").body(body).unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invoke_with_unknown_task_id_returns_404() {
        let router = build_app(FakeProvider::with_responses(vec![]), Arc::new(PluginCatalog::new()));
        let task_id = TaskId::new();
        let body = json_body(serde_json::json!({"session_id": null, "task_id": task_id, "items": []}));
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("authorization", "Bearer alice")
            .header("content-type", "application/json")
            .body(body)
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hitl_pause_then_resume_reject_round_trips_over_http() {
        let call = FunctionCall {
            id: "c1".into(),
            plugin_name: "sensitive_plugin".into(),
            function_name: "delete_user_data".into(),
            arguments: serde_json::json!({}),
        };
        let router = build_app(FakeProvider::with_responses(vec![tool_call_response(call)]), sensitive_catalog());

        let invoke_body =
            json_body(serde_json::json!({"session_id": null, "task_id": null, "items": [{"type": "text", "text": "please delete"}]}));
        let invoke_request = Request::builder()
            .method("POST")
            .uri("/")
            .header("authorization", "Bearer alice")
            .header("content-type", "application/json")
            .body(invoke_body)
            .unwrap();
        let invoke_response = router.clone().oneshot(invoke_request).await.unwrap();
        assert_eq!(invoke_response.status(), StatusCode::OK);
        let value = body_json(invoke_response).await;
        assert_eq!(value["kind"], "hitl");
        let request_id = value["request_id"].as_str().unwrap().to_string();

        let resume_body = json_body(serde_json::json!("reject"));
        let resume_request = Request::builder()
            .method("POST")
            .uri(format!("/resume/{request_id}"))
            .header("authorization", "Bearer alice")
            .header("content-type", "application/json")
            .body(resume_body)
            .unwrap();
        let resume_response = router.oneshot(resume_request).await.unwrap();
        assert_eq!(resume_response.status(), StatusCode::OK);
        let value = body_json(resume_response).await;
        assert_eq!(value["kind"], "rejected_tool");
        assert_eq!(value["status"], "canceled");
    }

    #[tokio::test]
    async fn verify_oauth_callback_with_unknown_flow_returns_bad_gateway_html() {
        let router = build_app(FakeProvider::with_responses(vec![]), Arc::new(PluginCatalog::new()));
        let request = Request::builder()
            .method("POST")
            .uri("/auth/arcade/verify?flow_id=not-a-real-flow&code=abc123")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("Authorization failed"));
    }
}
