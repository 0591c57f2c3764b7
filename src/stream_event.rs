//! The unified, provider-agnostic streaming event — the wire format for both
//! the client-facing NDJSON stream and the server-side [`crate::runner::accumulator`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Usage;
use crate::runner::stop::StopReason;

/// Composite, step-scoped tool-call identifier. See [`crate::runner::ids`].
pub type ToolCallId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Start,
    #[serde(rename = "text.delta")]
    TextDelta,
    #[serde(rename = "reasoning.delta")]
    ReasoningDelta,
    #[serde(rename = "reasoning.summary")]
    ReasoningSummary,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "step.finish")]
    StepFinish,
    Finish,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: ToolCallId,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub id: ToolCallId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single unit of the unified event stream. `seq` is strictly monotonic and
/// starts at 0; `step_id` is non-decreasing across the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventType,
    pub step_id: u32,
    pub seq: u64,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ext: HashMap<String, Value>,
}

impl StreamEvent {
    /// Minimal constructor; callers set only the fields relevant to `kind`.
    pub fn new(kind: StreamEventType, step_id: u32, seq: u64) -> Self {
        Self {
            kind,
            step_id,
            seq,
            timestamp: crate::model::now_ms(),
            model: None,
            provider: None,
            text_delta: None,
            reasoning_delta: None,
            reasoning_summary: None,
            tool_call: None,
            tool_result: None,
            usage: None,
            finish_reason: None,
            error: None,
            ext: HashMap::new(),
        }
    }

    pub fn with_original_id(mut self, original_id: &str) -> Self {
        self.ext.insert(
            "original_id".to_string(),
            Value::from(original_id.to_string()),
        );
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StreamEventType::Finish | StreamEventType::Error)
    }
}

/// Sequence-number generator held by a single runner driver task.
///
/// Not `Clone`: exactly one task owns the monotonic counter for a stream.
#[derive(Debug, Default)]
pub struct SeqCounter(u64);

impl SeqCounter {
    pub fn next(&mut self) -> u64 {
        let seq = self.0;
        self.0 += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_counter_starts_at_zero_and_increments() {
        let mut counter = SeqCounter::default();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn event_serializes_type_with_dotted_name() {
        let event = StreamEvent::new(StreamEventType::TextDelta, 1, 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text.delta");
    }

    #[test]
    fn empty_optional_fields_are_omitted() {
        let event = StreamEvent::new(StreamEventType::Start, 1, 0);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("text_delta").is_none());
        assert!(json.get("tool_call").is_none());
    }
}
