//! Deterministic in-memory provider used by the test suite and local
//! development when no API key is configured. Scripted turn-by-turn, the way
//! the teacher's tests drove `LLMProvider` through a stub rather than a live
//! API.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::{now_ms, ObjectResult, Request, Step, ToolExecution, Usage};
use crate::provider::{Capabilities, Provider, StreamHandle, TurnResult};
use crate::stream_event::{StreamEvent, StreamEventType, ToolCallPayload};

/// One scripted provider turn: text, plus any tool calls the mock "requests".
/// Tool calls are emitted unexecuted — the runner's registry executes them,
/// exactly as a real provider's calls would be.
#[derive(Debug, Clone)]
pub struct MockTurn {
    pub text: String,
    pub tool_calls: Vec<(String, String, Value)>, // (id, name, input)
    pub usage: Usage,
}

impl MockTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
        }
    }

    pub fn with_tool_call(mut self, id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push((id.into(), name.into(), input));
        self
    }
}

/// A scripted provider: each call to `generate_text`/`stream_text` pops the
/// next [`MockTurn`] off the queue. Calling past the end of the script is a
/// test-author bug and panics with a clear message, rather than silently
/// looping.
pub struct MockProvider {
    model: String,
    script: Mutex<std::collections::VecDeque<MockTurn>>,
}

impl MockProvider {
    pub fn new(script: Vec<MockTurn>) -> Self {
        Self {
            model: "mock-1".to_string(),
            script: Mutex::new(script.into()),
        }
    }

    fn pop(&self) -> MockTurn {
        self.script
            .lock()
            .expect("mock provider mutex poisoned")
            .pop_front()
            .expect("MockProvider script exhausted: test drove more steps than scripted")
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            provider: "mock".to_string(),
            streaming: true,
            parallel_tool_calls: true,
            strict_json: false,
            images: false,
            reasoning: false,
            max_input: 128_000,
            max_output: 8_192,
            default_model: self.model.clone(),
            models: vec![self.model.clone()],
        }
    }

    async fn generate_text(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<TurnResult, AppError> {
        let turn = self.pop();
        let started = now_ms();
        let tool_calls = turn
            .tool_calls
            .into_iter()
            .map(|(id, name, input)| ToolExecution {
                call_id: id,
                tool_name: name,
                input,
                result: None,
                error: None,
                duration_ms: 0,
                retries: 0,
            })
            .collect();
        Ok(TurnResult {
            step: Step {
                number: 0,
                text: turn.text,
                tool_calls,
                usage: turn.usage,
                started_at_ms: started,
                completed_at_ms: now_ms(),
                duration_ms: 0,
                model: self.model.clone(),
            },
            warnings: Vec::new(),
        })
    }

    async fn stream_text(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<StreamHandle, AppError> {
        let turn = self.pop();
        let model = self.model.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut event = StreamEvent::new(StreamEventType::Start, 0, 0);
            event.model = Some(model.clone());
            event.provider = Some("mock".to_string());
            if tx.send(event).await.is_err() {
                return;
            }

            for word in turn.text.split_inclusive(' ') {
                let mut delta = StreamEvent::new(StreamEventType::TextDelta, 0, 0);
                delta.text_delta = Some(word.to_string());
                if tx.send(delta).await.is_err() {
                    return;
                }
            }

            for (id, name, input) in turn.tool_calls {
                let mut call = StreamEvent::new(StreamEventType::ToolCall, 0, 0);
                call.tool_call = Some(ToolCallPayload { id, name, input });
                if tx.send(call).await.is_err() {
                    return;
                }
            }

            let mut finish = StreamEvent::new(StreamEventType::StepFinish, 0, 0);
            finish.usage = Some(turn.usage);
            let _ = tx.send(finish).await;
        });

        Ok(StreamHandle { events: rx })
    }

    /// Test/dev support for JSON mode: the scripted turn's text is parsed as
    /// JSON if it parses, otherwise wrapped as `{"text": ...}` so a plain
    /// scripted reply still produces a usable object.
    async fn generate_object(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<ObjectResult, AppError> {
        let turn = self.pop();
        let json = serde_json::from_str(&turn.text).unwrap_or_else(|_| serde_json::json!({ "text": turn.text }));
        Ok(ObjectResult {
            json,
            usage: turn.usage,
            model: self.model.clone(),
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Request;

    #[tokio::test]
    async fn replays_scripted_turn() {
        let provider = MockProvider::new(vec![MockTurn::text("hello")]);
        let request = Request::new(vec![]);
        let cancel = CancellationToken::new();
        let result = provider.generate_text(&request, &cancel).await.unwrap();
        assert_eq!(result.step.text, "hello");
    }

    #[tokio::test]
    #[should_panic(expected = "script exhausted")]
    async fn panics_when_script_runs_dry() {
        let provider = MockProvider::new(vec![MockTurn::text("only one")]);
        let request = Request::new(vec![]);
        let cancel = CancellationToken::new();
        let _ = provider.generate_text(&request, &cancel).await;
        let _ = provider.generate_text(&request, &cancel).await;
    }
}
