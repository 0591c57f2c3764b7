//! Canonical, provider-neutral data model for the gateway runner.
//!
//! Every adapter translates its own wire format into these types and back.
//! Nothing in this module knows about HTTP, SSE, or any particular provider.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runner::stop::{StopCondition, StopReason};

/// `system`, `user`, or `assistant` role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One element of a [`Message`]'s ordered part sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Image {
        bytes: Vec<u8>,
        mime: String,
    },
    ImageUrl {
        url: String,
        mime: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, Value>,
    },
    ToolResult {
        id: String,
        name: String,
        result: Value,
    },
}

/// A single turn in the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
            metadata: HashMap::new(),
        }
    }

    /// Concatenates every `Text` part into one string.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolCall { id, name, input, .. } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|part| matches!(part, Part::ToolCall { .. }))
    }
}

/// `auto`, `none`, or `required` tool-use policy for a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

impl Default for ToolChoice {
    fn default() -> Self {
        ToolChoice::Auto
    }
}

/// Declarative definition plus invocation hook for a callable tool.
///
/// Cloning a handle is cheap: the invoke closure is held behind an `Arc`.
#[derive(Clone)]
pub struct ToolHandle {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    invoke: std::sync::Arc<
        dyn Fn(Value) -> futures::future::BoxFuture<'static, Result<Value, String>>
            + Send
            + Sync,
    >,
}

impl ToolHandle {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, input_schema: Value, invoke: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            invoke: std::sync::Arc::new(move |input| Box::pin(invoke(input))),
        }
    }

    pub async fn invoke(&self, input: Value) -> Result<Value, String> {
        (self.invoke)(input).await
    }
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Additive token/cost accounting for one step or an entire run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cached_input_tokens: u64,
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            reasoning_tokens: self.reasoning_tokens + other.reasoning_tokens,
            cached_input_tokens: self.cached_input_tokens + other.cached_input_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        *self = *self + other;
    }
}

/// Outcome of one [`ToolHandle`] invocation within a [`Step`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries: u32,
}

/// One complete provider turn, plus any tool calls it initiated and their results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub number: u32,
    pub text: String,
    pub tool_calls: Vec<ToolExecution>,
    pub usage: Usage,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
    pub duration_ms: u64,
    pub model: String,
}

impl Step {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Current epoch milliseconds, used to stamp [`Step`] timing fields.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Canonical chat request, independent of any wire format.
#[derive(Clone)]
pub struct Request {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub tools: Vec<ToolHandle>,
    pub tool_choice: ToolChoice,
    pub provider_options: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub stop_when: StopCondition,
    pub on_stop: Option<std::sync::Arc<dyn crate::runner::finalizer::Finalizer>>,
}

impl Request {
    /// A bare request with no tools, no finalizer, and a single-step stop condition.
    ///
    /// Callers (the request builder) are expected to override `stop_when`/`on_stop`.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            provider_options: HashMap::new(),
            metadata: HashMap::new(),
            stop_when: StopCondition::max_steps(1),
            on_stop: None,
        }
    }
}

/// Final, buffered result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResult {
    pub text: String,
    pub steps: Vec<Step>,
    pub usage: Usage,
    pub finish_reason: StopReason,
    pub provider: String,
    pub model: String,
    pub warnings: Vec<String>,
}

/// Result of a single `generate_object` round-trip (JSON mode, §4.1/§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectResult {
    pub json: Value,
    pub usage: Usage,
    pub model: String,
    pub warnings: Vec<String>,
}

/// Mutable record of a run in progress, visible to stop-conditions and the finalizer.
#[derive(Debug, Clone, Default)]
pub struct RunnerState {
    pub messages: Vec<Message>,
    pub steps: Vec<Step>,
    pub usage: Usage,
}

impl RunnerState {
    pub fn last_text(&self) -> &str {
        self.steps.last().map(|step| step.text.as_str()).unwrap_or("")
    }

    pub fn push_step(&mut self, step: Step) {
        self.usage += step.usage;
        self.steps.push(step);
    }
}
