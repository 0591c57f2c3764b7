//! Anthropic Messages API adapter. Same reqwest+SSE shape as
//! [`crate::provider::openai`], but Anthropic turns text/tool-call content
//! into blocks within one message rather than separate OpenAI-style
//! `delta.tool_calls[]` entries, and streams them via `content_block_delta`
//! events carrying `input_json_delta` for tool arguments.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::{now_ms, Message, Part, Request, Role, Step, ToolChoice, ToolExecution, Usage};
use crate::provider::{Capabilities, Provider, StreamHandle, TurnResult};
use crate::stream_event::{StreamEvent, StreamEventType, ToolCallPayload};

const API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
}

impl AnthropicProvider {
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

    async fn post_with_retry(&self, body: &MessagesRequest) -> Result<reqwest::Response, AppError> {
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(format!("{API_BASE}/messages"))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                    return Err(AppError::ProviderAuth("invalid Anthropic API key".to_string()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(AppError::ProviderInvalidRequest(format!("HTTP {status}: {text}")));
                }
                Err(e) if e.is_timeout() => return Err(AppError::ProviderTimeout(e.to_string())),
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
struct MessagesRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize, Clone)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize, Clone)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEventBody {
    MessageStart {
        message: MessageStartPayload,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentBlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageStartPayload {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStart {
    Text { text: String },
    ToolUse { id: String, name: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

fn convert_message(message: &Message) -> AnthropicMessage {
    let role = match message.role {
        Role::System | Role::User => "user",
        Role::Assistant => "assistant",
    };
    let mut content = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text { text } if !text.is_empty() => content.push(AnthropicBlock::Text { text: text.clone() }),
            Part::ToolCall { id, name, input, .. } => content.push(AnthropicBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            Part::ToolResult { id, result, .. } => content.push(AnthropicBlock::ToolResult {
                tool_use_id: id.clone(),
                content: result.to_string(),
            }),
            _ => {}
        }
    }
    AnthropicMessage { role, content }
}

fn split_system(request: &Request) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system = None;
    let mut messages = Vec::new();
    for message in &request.messages {
        if message.role == Role::System {
            system = Some(message.text_content());
        } else {
            messages.push(convert_message(message));
        }
    }
    (system, messages)
}

fn convert_tools(request: &Request) -> Option<Vec<AnthropicTool>> {
    if request.tools.is_empty() {
        return None;
    }
    Some(
        request
            .tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect(),
    )
}

fn tool_choice(choice: ToolChoice) -> Option<AnthropicToolChoice> {
    match choice {
        ToolChoice::Auto => None,
        ToolChoice::None => None, // signaled by omitting `tools` entirely at the call site
        ToolChoice::Required => Some(AnthropicToolChoice { kind: "any" }),
    }
}

fn build_request(provider: &AnthropicProvider, request: &Request, stream: bool) -> MessagesRequest {
    let (system, messages) = split_system(request);
    let tools = if matches!(request.tool_choice, ToolChoice::None) {
        None
    } else {
        convert_tools(request)
    };
    MessagesRequest {
        model: provider.model_for(request),
        messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        temperature: request.temperature,
        stream,
        tools,
        tool_choice: tool_choice(request.tool_choice),
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            provider: "anthropic".to_string(),
            streaming: true,
            parallel_tool_calls: true,
            strict_json: false,
            images: true,
            reasoning: true,
            max_input: 200_000,
            max_output: 8_192,
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
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AppError::ProviderUnknown(e.to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicBlock::Text { text: t } => text.push_str(&t),
                AnthropicBlock::ToolUse { id, name, input } => tool_calls.push(ToolExecution {
                    call_id: id,
                    tool_name: name,
                    input,
                    result: None,
                    error: None,
                    duration_ms: 0,
                    retries: 0,
                }),
                AnthropicBlock::ToolResult { .. } => {}
            }
        }

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                ..Default::default()
            })
            .unwrap_or_default();

        Ok(TurnResult {
            step: Step {
                number: 0,
                text,
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
            start.provider = Some("anthropic".to_string());
            if tx.send(start).await.is_err() {
                return;
            }

            // index -> (id, name, accumulated json)
            let mut tool_blocks: std::collections::HashMap<usize, (String, String, String)> =
                std::collections::HashMap::new();
            let mut usage = Usage::default();

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
                if event.data.is_empty() {
                    continue;
                }
                let body: StreamEventBody = match serde_json::from_str(&event.data) {
                    Ok(b) => b,
                    Err(_) => continue,
                };

                match body {
                    StreamEventBody::MessageStart { message } => {
                        if let Some(u) = message.usage {
                            usage.input_tokens = u.input_tokens;
                        }
                    }
                    StreamEventBody::ContentBlockStart { index, content_block } => {
                        if let ContentBlockStart::ToolUse { id, name } = content_block {
                            tool_blocks.insert(index, (id, name, String::new()));
                        }
                    }
                    StreamEventBody::ContentBlockDelta { index, delta } => match delta {
                        ContentBlockDelta::TextDelta { text } => {
                            let mut event = StreamEvent::new(StreamEventType::TextDelta, 0, 0);
                            event.text_delta = Some(text);
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        ContentBlockDelta::InputJsonDelta { partial_json } => {
                            if let Some(slot) = tool_blocks.get_mut(&index) {
                                slot.2.push_str(&partial_json);
                            }
                        }
                        ContentBlockDelta::Unknown => {}
                    },
                    StreamEventBody::MessageDelta { usage: delta_usage } => {
                        if let Some(u) = delta_usage {
                            usage.output_tokens = u.output_tokens;
                        }
                    }
                    StreamEventBody::MessageStop => break,
                    _ => {}
                }
            }

            let mut indices: Vec<_> = tool_blocks.into_iter().collect();
            indices.sort_by_key(|(index, _)| *index);
            for (_, (id, name, json)) in indices {
                let input = if json.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&json).unwrap_or(Value::Null)
                };
                let mut call = StreamEvent::new(StreamEventType::ToolCall, 0, 0);
                call.tool_call = Some(ToolCallPayload { id, name, input });
                if tx.send(call).await.is_err() {
                    return;
                }
            }

            let mut finish = StreamEvent::new(StreamEventType::StepFinish, 0, 0);
            finish.usage = Some(usage);
            let _ = tx.send(finish).await;
        });

        Ok(StreamHandle { events: rx })
    }
}
