//! Event accumulator (SPEC_FULL.md §4.9): a side-effect-free reducer over the
//! unified stream event sequence, used for post-hoc observability logging.
//!
//! Per the Open Question resolution in SPEC_FULL.md §9, this is not wired up
//! as a broadcast tee — the streaming HTTP handler folds events through this
//! accumulator synchronously while forwarding them to the client, then logs
//! the summary once the forward loop ends.

use std::collections::HashMap;

use crate::model::Usage;
use crate::runner::stop::StopReason;
use crate::stream_event::{StreamEvent, StreamEventType};

#[derive(Debug, Clone, Default)]
pub struct ToolRecord {
    pub id: String,
    pub name: String,
    pub input: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct Accumulator {
    text: String,
    reasoning: String,
    usage: Usage,
    tool_records: Vec<ToolRecord>,
    tool_index: HashMap<String, usize>,
    warnings: Vec<String>,
    error: Option<String>,
    finish_reason: Option<StopReason>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event into the running summary. Never blocks, never mutates
    /// the event, never fails — the accumulator must not be able to stall the
    /// stream it observes.
    pub fn fold(&mut self, event: &StreamEvent) {
        match event.kind {
            StreamEventType::TextDelta => {
                if let Some(delta) = &event.text_delta {
                    self.text.push_str(delta);
                }
            }
            StreamEventType::ReasoningDelta => {
                if let Some(delta) = &event.reasoning_delta {
                    self.reasoning.push_str(delta);
                }
            }
            StreamEventType::ToolCall => {
                if let Some(call) = &event.tool_call {
                    let index = self.tool_records.len();
                    self.tool_index.insert(call.id.clone(), index);
                    self.tool_records.push(ToolRecord {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: Some(call.input.clone()),
                        result: None,
                        error: None,
                    });
                }
            }
            StreamEventType::ToolResult => {
                if let Some(result) = &event.tool_result {
                    if let Some(&index) = self.tool_index.get(&result.id) {
                        self.tool_records[index].result = result.result.clone();
                        self.tool_records[index].error = result.error.clone();
                    }
                }
            }
            StreamEventType::StepFinish => {
                if let Some(usage) = event.usage {
                    self.usage += usage;
                }
            }
            StreamEventType::Finish => {
                if let Some(usage) = event.usage {
                    self.usage = usage;
                }
                self.finish_reason = event.finish_reason.clone();
            }
            StreamEventType::Error => {
                self.error = event.error.clone();
            }
            StreamEventType::Start | StreamEventType::ReasoningSummary => {}
        }
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn into_summary(self) -> AccumulatedSummary {
        AccumulatedSummary {
            text: self.text,
            reasoning: self.reasoning,
            usage: self.usage,
            tool_records: self.tool_records,
            warnings: self.warnings,
            error: self.error,
            finish_reason: self.finish_reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccumulatedSummary {
    pub text: String,
    pub reasoning: String,
    pub usage: Usage,
    pub tool_records: Vec<ToolRecord>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub finish_reason: Option<StopReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_event::{ToolCallPayload, ToolResultPayload};

    #[test]
    fn pairs_tool_call_with_result_by_id() {
        let mut acc = Accumulator::new();
        let mut call = StreamEvent::new(StreamEventType::ToolCall, 1, 0);
        call.tool_call = Some(ToolCallPayload {
            id: "1:call_1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "echo hi"}),
        });
        acc.fold(&call);

        let mut result = StreamEvent::new(StreamEventType::ToolResult, 1, 1);
        result.tool_result = Some(ToolResultPayload {
            id: "1:call_1".into(),
            name: "bash".into(),
            result: Some(serde_json::json!("hi")),
            error: None,
        });
        acc.fold(&result);

        let summary = acc.into_summary();
        assert_eq!(summary.tool_records.len(), 1);
        assert_eq!(summary.tool_records[0].result, Some(serde_json::json!("hi")));
    }

    #[test]
    fn concatenates_text_deltas_in_order() {
        let mut acc = Accumulator::new();
        for chunk in ["hel", "lo "] {
            let mut event = StreamEvent::new(StreamEventType::TextDelta, 1, 0);
            event.text_delta = Some(chunk.to_string());
            acc.fold(&event);
        }
        assert_eq!(acc.into_summary().text, "hello ");
    }
}
