//! OpenAI Chat Completions adapter: reqwest + SSE, following the same shape
//! as the teacher's `OpenAIProvider` (`eventsource-stream` over
//! `bytes_stream()`, chunks folded with `async_stream::stream!`).

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::{now_ms, Message, ObjectResult, Part, Request, Role, Step, ToolChoice, ToolExecution, Usage};
use crate::provider::{Capabilities, Provider, StreamHandle, TurnResult};
use crate::stream_event::{StreamEvent, StreamEventType, ToolCallPayload};

const API_BASE: &str = "https://api.openai.com/v1";
const MAX_RETRIES: u32 = 3;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client"),
            api_key,
            default_model: default_model.into(),
        }
    }

    fn model_for(&self, request: &Request) -> String {
        request.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    async fn post_with_retry(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, AppError> {
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(format!("{API_BASE}/chat/completions"))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::ProviderRateLimited(format!(
                            "rate limited after {attempt} attempts"
                        )));
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        let status = resp.status();
                        return Err(AppError::ProviderUnavailable(format!("HTTP {status}")));
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                    return Err(AppError::ProviderAuth("invalid OpenAI API key".to_string()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(AppError::ProviderInvalidRequest(format!("HTTP {status}: {text}")));
                }
                Err(e) if e.is_timeout() => {
                    return Err(AppError::ProviderTimeout(e.to_string()));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::ProviderUnavailable(e.to_string()));
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let base_ms = 200u64 * 2u64.pow(attempt);
    let jitter = rand::random::<u64>() % 100;
    Duration::from_millis(base_ms + jitter)
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "role")]
enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    #[serde(rename = "tool")]
    Tool { content: String, tool_call_id: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

fn convert_message(message: &Message) -> ChatMessage {
    match message.role {
        Role::System => ChatMessage::System {
            content: message.text_content(),
        },
        Role::User => {
            let tool_results: Vec<_> = message
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::ToolResult { id, result, .. } => Some((id.clone(), result.clone())),
                    _ => None,
                })
                .collect();
            if !tool_results.is_empty() {
                // Only single tool-result messages are produced per call site;
                // multi-result turns are emitted as separate Tool messages by the caller.
                let (id, result) = tool_results.into_iter().next().unwrap();
                ChatMessage::Tool {
                    content: result.to_string(),
                    tool_call_id: id,
                }
            } else {
                ChatMessage::User {
                    content: message.text_content(),
                }
            }
        }
        Role::Assistant => {
            let tool_calls: Vec<_> = message
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::ToolCall { id, name, input, .. } => Some(OpenAiToolCall {
                        id: id.clone(),
                        tool_type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            ChatMessage::Assistant {
                content: Some(message.text_content()),
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            }
        }
    }
}

fn convert_tools(request: &Request) -> Option<Vec<OpenAiTool>> {
    if request.tools.is_empty() {
        return None;
    }
    Some(
        request
            .tools
            .iter()
            .map(|tool| OpenAiTool {
                tool_type: "function",
                function: OpenAiFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
    )
}

fn tool_choice_str(choice: ToolChoice) -> Option<String> {
    match choice {
        ToolChoice::Auto => None,
        ToolChoice::None => Some("none".to_string()),
        ToolChoice::Required => Some("required".to_string()),
    }
}

fn build_request(provider: &OpenAiProvider, request: &Request, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: provider.model_for(request),
        messages: request.messages.iter().map(convert_message).collect(),
        temperature: request.temperature,
        max_completion_tokens: request.max_tokens,
        stream,
        stream_options: if stream {
            Some(StreamOptions { include_usage: true })
        } else {
            None
        },
        tools: convert_tools(request),
        tool_choice: tool_choice_str(request.tool_choice),
        response_format: None,
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            provider: "openai".to_string(),
            streaming: true,
            parallel_tool_calls: true,
            strict_json: true,
            images: true,
            reasoning: false,
            max_input: 128_000,
            max_output: 16_384,
            default_model: self.default_model.clone(),
            models: vec![self.default_model.clone()],
        }
    }

    async fn generate_text(
        &self,
        request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<TurnResult, AppError> {
        let body = build_request(self, request, false);
        let started = now_ms();
        let response = self.post_with_retry(&body).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::ProviderUnknown(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ProviderUnknown("no choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let input = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                ToolExecution {
                    call_id: call.id,
                    tool_name: call.function.name,
                    input,
                    result: None,
                    error: None,
                    duration_ms: 0,
                    retries: 0,
                }
            })
            .collect();

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                ..Default::default()
            })
            .unwrap_or_default();

        Ok(TurnResult {
            step: Step {
                number: 0,
                text: choice.message.content.unwrap_or_default(),
                tool_calls,
                usage,
                started_at_ms: started,
                completed_at_ms: now_ms(),
                duration_ms: 0,
                model: body.model,
            },
            warnings: Vec::new(),
        })
    }

    async fn stream_text(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, AppError> {
        let body = build_request(self, request, true);
        let response = self.post_with_retry(&body).await?;
        let model = body.model.clone();
        let (tx, rx) = mpsc::channel(16);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let byte_stream = response.bytes_stream();
            let mut event_stream = byte_stream.eventsource();

            let mut start = StreamEvent::new(StreamEventType::Start, 0, 0);
            start.model = Some(model.clone());
            start.provider = Some("openai".to_string());
            if tx.send(start).await.is_err() {
                return;
            }

            let mut assembling: Vec<Option<(String, String, String)>> = Vec::new();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = event_stream.next() => next,
                };
                let Some(event_result) = next else { break };
                let event = match event_result {
                    Ok(event) => event,
                    Err(e) => {
                        let mut err = StreamEvent::new(StreamEventType::Error, 0, 0);
                        err.error = Some(e.to_string());
                        let _ = tx.send(err).await;
                        return;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        let mut err = StreamEvent::new(StreamEventType::Error, 0, 0);
                        err.error = Some(format!("malformed chunk: {e}"));
                        let _ = tx.send(err).await;
                        return;
                    }
                };

                if let Some(usage) = chunk.usage {
                    let mut finish = StreamEvent::new(StreamEventType::StepFinish, 0, 0);
                    finish.usage = Some(Usage {
                        input_tokens: usage.prompt_tokens,
                        output_tokens: usage.completion_tokens,
                        ..Default::default()
                    });
                    let _ = tx.send(finish).await;
                    continue;
                }

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        let mut delta = StreamEvent::new(StreamEventType::TextDelta, 0, 0);
                        delta.text_delta = Some(content);
                        if tx.send(delta).await.is_err() {
                            return;
                        }
                    }
                    for tc in choice.delta.tool_calls.unwrap_or_default() {
                        while assembling.len() <= tc.index {
                            assembling.push(None);
                        }
                        let slot = assembling[tc.index].get_or_insert((String::new(), String::new(), String::new()));
                        if let Some(id) = tc.id {
                            slot.0 = id;
                        }
                        if let Some(function) = tc.function {
                            if let Some(name) = function.name {
                                slot.1 = name;
                            }
                            if let Some(arguments) = function.arguments {
                                slot.2.push_str(&arguments);
                            }
                        }
                    }
                }
            }

            for slot in assembling.into_iter().flatten() {
                let (id, name, arguments) = slot;
                let input = serde_json::from_str(&arguments).unwrap_or(Value::Null);
                let mut call = StreamEvent::new(StreamEventType::ToolCall, 0, 0);
                call.tool_call = Some(ToolCallPayload { id, name, input });
                if tx.send(call).await.is_err() {
                    return;
                }
            }
        });

        Ok(StreamHandle { events: rx })
    }

    /// JSON mode backs `strict_json: true` with OpenAI's `response_format:
    /// {"type": "json_object"}` (no tools, no streaming — SPEC_FULL.md §4.1).
    /// The prompt is responsible for instructing the model to emit JSON;
    /// OpenAI itself errors if no message mentions "json", which surfaces
    /// here as `provider_invalid_request`.
    async fn generate_object(
        &self,
        request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<ObjectResult, AppError> {
        let mut body = build_request(self, request, false);
        body.tools = None;
        body.tool_choice = None;
        body.response_format = Some(ResponseFormat { format_type: "json_object" });

        let response = self.post_with_retry(&body).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::ProviderUnknown(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ProviderUnknown("no choices in response".to_string()))?;
        let content = choice.message.content.unwrap_or_default();
        let json: Value = serde_json::from_str(&content)
            .map_err(|e| AppError::ProviderUnknown(format!("non-JSON response in json mode: {e}")))?;

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                ..Default::default()
            })
            .unwrap_or_default();

        Ok(ObjectResult {
            json,
            usage,
            model: body.model,
            warnings: Vec::new(),
        })
    }
}
