//! HTTP surface (SPEC_FULL.md §4.12, §6): axum routes binding the request
//! builder, runners, and registries to `/api/chat`, `/api/chat/stream`,
//! `/api/providers`, and `/healthz`.
//!
//! Grounded in the teacher's `main.rs` CLI dispatch — generalized from a
//! `clap` subcommand table to an axum router, since this crate is a server
//! rather than a one-shot CLI.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::codec::{ChatRequestDto, ChatResponseDto, Mode, StepDto};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::prompt::PromptRegistry;
use crate::provider::Provider;
use crate::request_builder::{build_request, BuildContext};
use crate::runner::accumulator::Accumulator;
use crate::runner::{run_buffered, run_streaming};
use crate::tools::{ToolInvoker, ToolRegistry};

pub struct AppState {
    pub config: AppConfig,
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub tools: Arc<ToolRegistry>,
    pub prompts: PromptRegistry,
    pub invoker: Arc<ToolInvoker>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/providers", get(list_providers))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(120)))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Cancels its token when dropped. Moved into the NDJSON body stream's
/// generator so that a client disconnect — which makes axum/hyper drop the
/// response body stream without polling it to completion — fires request
/// cancellation (SPEC §5, testable scenario S6) instead of only being
/// noticed lazily the next time the driver tries to send on the channel.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[derive(Debug, Serialize)]
struct ProviderProfile {
    id: String,
    display_name: String,
    capabilities: crate::provider::Capabilities,
    default_model: String,
    models: Vec<String>,
    tools: Vec<String>,
    system_prompt: String,
    prompt_name: String,
    prompt_version: String,
    prompt_fingerprint: String,
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderProfile>> {
    let rendered = state.prompts.render("chat_system", &HashMap::new());
    let tool_names: Vec<String> = state.tools.names().into_iter().map(str::to_string).collect();
    let profiles = state
        .providers
        .iter()
        .map(|(id, provider)| {
            let caps = provider.capabilities();
            ProviderProfile {
                id: id.clone(),
                display_name: caps.provider.clone(),
                default_model: caps.default_model.clone(),
                models: caps.models.clone(),
                capabilities: caps,
                tools: tool_names.clone(),
                system_prompt: rendered.text.clone(),
                prompt_name: rendered.name.clone(),
                prompt_version: rendered.version.clone(),
                prompt_fingerprint: rendered.fingerprint.clone(),
            }
        })
        .collect();
    Json(profiles)
}

fn build_context<'a>(state: &'a AppState) -> BuildContext<'a> {
    BuildContext {
        providers: &state.providers,
        tools: &state.tools,
        prompts: &state.prompts,
        max_consecutive_tool_steps: state.config.max_consecutive_tool_steps,
    }
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(dto): Json<ChatRequestDto>,
) -> Result<Response, AppError> {
    let mode = dto.mode;
    let ctx = build_context(&state);
    let (provider, request) = build_request(&ctx, dto)?;
    let cancel = CancellationToken::new();
    let span_request_id = request
        .metadata
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let span = tracing::info_span!("chat", request_id = %span_request_id, provider = %provider.capabilities().provider);
    let _enter = span.enter();

    // JSON mode is a single non-streaming code path (SPEC_FULL.md §1
    // Non-goals, §4.1): one `generate_object` round-trip, no step loop, no
    // tools. Adapters without strict-JSON support reject via the trait's
    // default, which surfaces as `unsupported_mode` here.
    if mode == Mode::Json {
        let result = provider.generate_object(&request, &cancel).await?;
        let body = ChatResponseDto {
            id: span_request_id,
            text: None,
            json: Some(result.json),
            model: result.model,
            provider: provider.capabilities().provider,
            usage: result.usage,
            finish_reason: crate::runner::stop::StopReason::provider_finish(),
            steps: Vec::new(),
            warnings: result.warnings,
        };
        return Ok(Json(body).into_response());
    }

    let result = run_buffered(provider.as_ref(), request, &state.tools, &state.invoker, &cancel).await?;

    let body = ChatResponseDto {
        id: span_request_id,
        text: Some(result.text),
        json: None,
        model: result.model,
        provider: result.provider,
        usage: result.usage,
        finish_reason: result.finish_reason,
        steps: result.steps.iter().map(StepDto::from).collect(),
        warnings: result.warnings,
    };
    Ok(Json(body).into_response())
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(dto): Json<ChatRequestDto>,
) -> Result<Response, AppError> {
    if dto.mode == Mode::Json {
        // Streaming JSON mode is explicitly unsupported (SPEC_FULL.md §9).
        return Err(AppError::UnsupportedMode("json".to_string()));
    }

    let ctx = build_context(&state);
    let (provider, request) = build_request(&ctx, dto)?;
    let cancel = CancellationToken::new();
    let request_id = request
        .metadata
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let provider_name = provider.capabilities().provider;

    let mut handle = run_streaming(provider, request, state.tools.clone(), state.invoker.clone(), cancel.clone());
    let cancel_guard = CancelOnDrop(cancel);

    // Per SPEC_FULL.md §9's resolved Open Question: no broadcast tee. This
    // generator folds each event into the accumulator synchronously as it
    // forwards it to the client, then logs the summary once the forward
    // loop ends — side-effect free w.r.t. the events it yields.
    let body_stream = async_stream::stream! {
        let _cancel_guard = cancel_guard;
        let mut accumulator = Accumulator::new();
        while let Some(event) = handle.events.recv().await {
            accumulator.fold(&event);
            let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            line.push('\n');
            yield Ok::<_, std::io::Error>(bytes::Bytes::from(line));
        }
        let summary = accumulator.into_summary();
        tracing::info!(
            request_id = %request_id,
            provider = %provider_name,
            tool_calls = summary.tool_records.len(),
            input_tokens = summary.usage.input_tokens,
            output_tokens = summary.usage.output_tokens,
            error = summary.error.as_deref().unwrap_or(""),
            "streaming chat response closed",
        );
    };

    let response = Response::builder()
        .status(200)
        .header("Content-Type", "application/x-ndjson")
        .header("Cache-Control", "no-store")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .expect("building a static-header response never fails");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use super::*;
    use crate::codec::{ChatRequestDto, MessageDto, Mode, PartDto, ToolChoiceDto};
    use crate::config::{AppConfig, LogFormat};
    use crate::provider::mock::{MockProvider, MockTurn};
    use crate::tools::{ToolErrorPolicy, ToolInvoker, ToolRegistry};

    fn test_state(providers: HashMap<String, Arc<dyn Provider>>) -> Arc<AppState> {
        Arc::new(AppState {
            config: AppConfig {
                openai_api_key: None,
                anthropic_api_key: None,
                listen_addr: "127.0.0.1:0".to_string(),
                prompt_dir: None,
                web_search_api_key: None,
                log_format: LogFormat::Pretty,
                tool_timeout_secs: 25,
                tool_concurrency: 4,
                max_consecutive_tool_steps: 8,
            },
            providers,
            tools: Arc::new(ToolRegistry::new()),
            prompts: PromptRegistry::new(None),
            invoker: Arc::new(ToolInvoker::new(4, Duration::from_secs(1), ToolErrorPolicy::AppendAndContinue)),
        })
    }

    fn json_dto(provider: &str) -> ChatRequestDto {
        ChatRequestDto {
            provider: provider.to_string(),
            model: None,
            mode: Mode::Json,
            messages: vec![MessageDto {
                role: "user".to_string(),
                parts: vec![PartDto::Text { text: "give me json".to_string() }],
                metadata: HashMap::new(),
            }],
            temperature: None,
            max_output_tokens: None,
            tool_choice: ToolChoiceDto::Auto,
            tools: Vec::new(),
            provider_options: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn json_mode_calls_generate_object_on_a_supporting_provider() {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(
            "mock".to_string(),
            Arc::new(MockProvider::new(vec![MockTurn::text(r#"{"answer": 42}"#)])),
        );
        let state = test_state(providers);

        let response = chat(State(state), Json(json_dto("mock"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["json"], serde_json::json!({ "answer": 42 }));
        assert!(body.get("text").is_none());
        assert_eq!(body["steps"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn json_mode_rejects_a_request_for_an_unknown_provider_before_calling_the_adapter() {
        let state = test_state(HashMap::new());
        let err = chat(State(state), Json(json_dto("nope"))).await.unwrap_err();
        assert_eq!(err.code(), "unknown_provider");
    }

    #[tokio::test]
    async fn chat_stream_rejects_json_mode_unconditionally() {
        let state = test_state(HashMap::new());
        let err = chat_stream(State(state), Json(json_dto("nope"))).await.unwrap_err();
        assert_eq!(err.code(), "unsupported_mode");
    }

    #[test]
    fn dropping_the_cancel_guard_cancels_the_token() {
        let cancel = CancellationToken::new();
        let guard = CancelOnDrop(cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(guard);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn disconnecting_mid_stream_cancels_in_flight_tools() {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(
            "mock".to_string(),
            Arc::new(MockProvider::new(vec![
                MockTurn::text("").with_tool_call("call_1", "sleepy", serde_json::json!({})),
            ])),
        );

        let mut tools = ToolRegistry::new();
        tools
            .register(crate::tools::ToolHandle::new(
                "sleepy",
                "sleeps past the test's patience",
                serde_json::json!({"type": "object"}),
                |_input: serde_json::Value| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::json!({}))
                },
            ))
            .unwrap();
        let mut state = test_state(providers);
        Arc::get_mut(&mut state).unwrap().tools = Arc::new(tools);
        Arc::get_mut(&mut state).unwrap().invoker =
            Arc::new(ToolInvoker::new(4, Duration::from_secs(60), ToolErrorPolicy::AppendAndContinue));

        let response = chat_stream(State(state), Json(ChatRequestDto {
            provider: "mock".to_string(),
            model: None,
            mode: Mode::Text,
            messages: vec![MessageDto {
                role: "user".to_string(),
                parts: vec![PartDto::Text { text: "go".to_string() }],
                metadata: HashMap::new(),
            }],
            temperature: None,
            max_output_tokens: None,
            tool_choice: ToolChoiceDto::Auto,
            tools: Vec::new(),
            provider_options: HashMap::new(),
        }))
        .await
        .unwrap();

        // Dropping the body stream without polling it to completion emulates
        // a client disconnect; it should run the `CancelOnDrop` guard inside
        // the generator and release the in-flight tool call promptly instead
        // of leaving it running for the full timeout.
        drop(response);
    }
}
