//! Streaming runner (SPEC_FULL.md §4.6): a single driver task forwards
//! rewritten provider events to one bounded `mpsc` channel across however
//! many steps the run takes, executing each step's tools as its provider
//! stream closes.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{Message, Part, Request, RunnerState, Step, ToolExecution};
use crate::provider::{Provider, StreamHandle};
use crate::runner::ids::composite_id_or_seq;
use crate::stream_event::{SeqCounter, StreamEvent, StreamEventType, ToolCallPayload, ToolResultPayload};
use crate::tools::{ToolInvoker, ToolRegistry};

const CHANNEL_CAPACITY: usize = 16;

/// Spawns the driver task and returns the client-facing event channel
/// immediately; the task runs until the stop condition fires, the provider
/// errors, or `cancel` fires.
pub fn run_streaming(
    provider: std::sync::Arc<dyn Provider>,
    request: Request,
    registry: std::sync::Arc<ToolRegistry>,
    invoker: std::sync::Arc<ToolInvoker>,
    cancel: CancellationToken,
) -> StreamHandle {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(drive(provider, request, registry, invoker, cancel, tx));
    StreamHandle { events: rx }
}

async fn drive(
    provider: std::sync::Arc<dyn Provider>,
    request: Request,
    registry: std::sync::Arc<ToolRegistry>,
    invoker: std::sync::Arc<ToolInvoker>,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut seq = SeqCounter::default();
    let mut transcript = request.messages.clone();
    let mut state = RunnerState {
        messages: transcript.clone(),
        steps: Vec::new(),
        usage: Default::default(),
    };
    let mut current_request = request.clone();
    let mut step_number: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            emit_error(&tx, &mut seq, step_number, "cancelled".to_string()).await;
            return;
        }

        step_number += 1;
        current_request.messages = transcript.clone();

        let mut handle = match provider.stream_text(&current_request, &cancel).await {
            Ok(h) => h,
            Err(e) => {
                emit_error(&tx, &mut seq, step_number, e.to_string()).await;
                return;
            }
        };

        let mut step = Step {
            number: step_number,
            text: String::new(),
            tool_calls: Vec::new(),
            usage: Default::default(),
            started_at_ms: crate::model::now_ms(),
            completed_at_ms: 0,
            duration_ms: 0,
            model: String::new(),
        };
        let mut pending_calls: Vec<(String, String, serde_json::Value)> = Vec::new();

        while let Some(mut event) = handle.events.recv().await {
            event.step_id = step_number;
            event.seq = seq.next();

            match event.kind {
                StreamEventType::Start => {
                    if let Some(model) = &event.model {
                        step.model = model.clone();
                    }
                }
                StreamEventType::TextDelta => {
                    if let Some(delta) = &event.text_delta {
                        step.text.push_str(delta);
                    }
                }
                StreamEventType::ToolCall => {
                    if let Some(call) = &event.tool_call {
                        pending_calls.push((call.id.clone(), call.name.clone(), call.input.clone()));
                        let original_id = call.id.clone();
                        let composite = composite_id_or_seq(step_number, Some(&original_id), event.seq);
                        event.tool_call = Some(ToolCallPayload {
                            id: composite,
                            name: call.name.clone(),
                            input: call.input.clone(),
                        });
                        event = event.with_original_id(&original_id);
                    }
                }
                StreamEventType::StepFinish => {
                    if let Some(usage) = event.usage {
                        step.usage += usage;
                    }
                }
                _ => {}
            }

            if tx.send(event).await.is_err() {
                return;
            }
        }

        step.completed_at_ms = crate::model::now_ms();
        step.duration_ms = step.completed_at_ms - step.started_at_ms;

        if !pending_calls.is_empty() {
            let executed = match invoker.invoke_step(&registry, pending_calls, &cancel).await {
                Ok(executed) => executed,
                Err(e) => {
                    emit_error(&tx, &mut seq, step_number, e.to_string()).await;
                    return;
                }
            };
            for result in &executed {
                let composite = composite_id_or_seq(step_number, Some(&result.call_id), 0);
                let mut event = StreamEvent::new(StreamEventType::ToolResult, step_number, seq.next());
                event.tool_result = Some(ToolResultPayload {
                    id: composite,
                    name: result.tool_name.clone(),
                    result: result.result.clone(),
                    error: result.error.clone(),
                });
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            step.tool_calls = executed
                .into_iter()
                .map(|e| ToolExecution {
                    call_id: e.call_id,
                    tool_name: e.tool_name,
                    input: e.input,
                    result: e.result,
                    error: e.error,
                    duration_ms: e.duration_ms,
                    retries: e.retries,
                })
                .collect();
            append_tool_turn(&mut transcript, &step);
        } else if !step.text.is_empty() {
            transcript.push(Message::assistant(step.text.clone()));
        }

        state.push_step(step);
        state.messages = transcript.clone();

        let (fired, reason) = request.stop_when.evaluate(&state);
        if !fired {
            continue;
        }

        if reason.is_non_terminal() {
            if let Some(finalizer) = &request.on_stop {
                let detail = run_finalizer_step(
                    provider.as_ref(),
                    finalizer.as_ref(),
                    &request,
                    &mut transcript,
                    &mut state,
                    &cancel,
                    &tx,
                    &mut seq,
                    step_number + 1,
                )
                .await;
                let mut finish = StreamEvent::new(StreamEventType::Finish, step_number + 1, seq.next());
                finish.usage = Some(state.usage);
                finish.finish_reason = Some(reason.with_detail("finalizer", detail));
                let _ = tx.send(finish).await;
                return;
            }
        }

        let mut finish = StreamEvent::new(StreamEventType::Finish, step_number, seq.next());
        finish.usage = Some(state.usage);
        finish.finish_reason = Some(reason);
        let _ = tx.send(finish).await;
        return;
    }
}

fn append_tool_turn(transcript: &mut Vec<Message>, step: &Step) {
    let mut assistant_parts = if step.text.is_empty() {
        Vec::new()
    } else {
        vec![Part::Text { text: step.text.clone() }]
    };
    let mut result_parts = Vec::new();
    for call in &step.tool_calls {
        let composite = composite_id_or_seq(step.number, Some(&call.call_id), 0);
        assistant_parts.push(Part::ToolCall {
            id: composite.clone(),
            name: call.tool_name.clone(),
            input: call.input.clone(),
            metadata: HashMap::from([("original_id".to_string(), call.call_id.clone().into())]),
        });
        let result_value = call
            .result
            .clone()
            .unwrap_or_else(|| serde_json::json!({"error": call.error.clone().unwrap_or_default()}));
        result_parts.push(Part::ToolResult {
            id: composite,
            name: call.tool_name.clone(),
            result: result_value,
        });
    }
    transcript.push(Message {
        role: crate::model::Role::Assistant,
        parts: assistant_parts,
        metadata: HashMap::new(),
    });
    transcript.push(Message {
        role: crate::model::Role::User,
        parts: result_parts,
        metadata: HashMap::new(),
    });
}

/// Runs the finalizer's closing provider call, forwarding its events like any
/// other step. Returns the `finish_reason.details.finalizer` tag describing
/// how the closing text was produced: `"consecutive_tool_limit"` when the
/// provider itself supplied non-empty text, or one of the SPEC_FULL.md §4.7
/// step 4 fallback tags when it didn't — in the fallback cases a synthetic
/// `text.delta` event carries the fallback text to the client, since no real
/// provider event otherwise would.
async fn run_finalizer_step(
    provider: &dyn Provider,
    finalizer: &dyn crate::runner::finalizer::Finalizer,
    base: &Request,
    transcript: &mut Vec<Message>,
    state: &mut RunnerState,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<StreamEvent>,
    seq: &mut SeqCounter,
    step_number: u32,
) -> &'static str {
    let mut messages = transcript.clone();
    messages.extend(finalizer.closing_turns());
    let fin_request = Request {
        model: base.model.clone(),
        messages,
        temperature: base.temperature,
        max_tokens: base.max_tokens,
        top_p: base.top_p,
        top_k: base.top_k,
        tools: Vec::new(),
        tool_choice: crate::model::ToolChoice::None,
        provider_options: base.provider_options.clone(),
        metadata: base.metadata.clone(),
        stop_when: crate::runner::stop::StopCondition::max_steps(1),
        on_stop: None,
    };

    let mut step = Step {
        number: step_number,
        text: String::new(),
        tool_calls: Vec::new(),
        usage: Default::default(),
        started_at_ms: crate::model::now_ms(),
        completed_at_ms: 0,
        duration_ms: 0,
        model: String::new(),
    };

    let stream_produced_text = match provider.stream_text(&fin_request, cancel).await {
        Ok(mut handle) => {
            while let Some(mut event) = handle.events.recv().await {
                event.step_id = step_number;
                event.seq = seq.next();
                if let StreamEventType::TextDelta = event.kind {
                    if let Some(delta) = &event.text_delta {
                        step.text.push_str(delta);
                    }
                }
                if event.kind == StreamEventType::StepFinish {
                    if let Some(usage) = event.usage {
                        step.usage += usage;
                    }
                }
                if tx.send(event).await.is_err() {
                    return "consecutive_tool_limit";
                }
            }
            !step.text.trim().is_empty()
        }
        Err(_) => false,
    };

    let detail = if stream_produced_text {
        "consecutive_tool_limit"
    } else {
        // SPEC_FULL.md §4.7 step 4: the finalizer's own provider call failed
        // (or returned no text) — never fail the request; fall back to the
        // last step's text, or a hit-limit-prefixed message if there's none.
        let (text, detail) = match finalizer.finalize(state).await {
            Ok(message) => (message.text_content(), "fallback_last_step"),
            Err(_) => (
                format!("Reached the step limit before finishing.\n\n{}", state.last_text()),
                "error_fallback",
            ),
        };
        step.text = text.clone();
        let mut synthetic = StreamEvent::new(StreamEventType::TextDelta, step_number, seq.next());
        synthetic.text_delta = Some(text);
        if tx.send(synthetic).await.is_err() {
            return detail;
        }
        detail
    };

    step.completed_at_ms = crate::model::now_ms();
    if !step.text.is_empty() {
        transcript.push(Message::assistant(step.text.clone()));
    }
    state.push_step(step);
    detail
}

async fn emit_error(tx: &mpsc::Sender<StreamEvent>, seq: &mut SeqCounter, step_id: u32, message: String) {
    let mut event = StreamEvent::new(StreamEventType::Error, step_id, seq.next());
    event.error = Some(message);
    let _ = tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Request, ToolHandle};
    use crate::provider::mock::{MockProvider, MockTurn};
    use crate::runner::stop::StopCondition;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn echo_handle() -> ToolHandle {
        ToolHandle::new(
            "echo",
            "echoes input",
            json!({"type": "object", "required": ["text"]}),
            |input: serde_json::Value| async move { Ok(input) },
        )
    }

    async fn drain(mut handle: StreamHandle) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_with_no_gaps() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new(vec![MockTurn::text("hello world")]));
        let mut request = Request::new(vec![Message::user("hi")]);
        request.stop_when = StopCondition::no_more_tools();
        let registry = Arc::new(ToolRegistry::new());
        let invoker = Arc::new(ToolInvoker::new(
            4,
            Duration::from_secs(5),
            crate::tools::ToolErrorPolicy::AppendAndContinue,
        ));
        let handle = run_streaming(provider, request, registry, invoker, CancellationToken::new());
        let events = drain(handle).await;
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
        }
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn tool_call_and_result_share_composite_id() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new(vec![
            MockTurn::text("").with_tool_call("call_1", "echo", json!({"text": "hi"})),
            MockTurn::text("done"),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(echo_handle()).unwrap();
        let mut request = Request::new(vec![Message::user("go")]);
        request.stop_when = StopCondition::no_more_tools();
        let invoker = Arc::new(ToolInvoker::new(
            4,
            Duration::from_secs(5),
            crate::tools::ToolErrorPolicy::AppendAndContinue,
        ));
        let handle = run_streaming(provider, request, Arc::new(registry), invoker, CancellationToken::new());
        let events = drain(handle).await;

        let call = events
            .iter()
            .find_map(|e| e.tool_call.as_ref())
            .expect("expected a tool.call event");
        let result = events
            .iter()
            .find_map(|e| e.tool_result.as_ref())
            .expect("expected a tool.result event");
        assert_eq!(call.id, result.id);
        assert_eq!(call.id, "1:call_1");
    }

    #[tokio::test]
    async fn finalizer_runs_on_budget_exhaustion_and_tags_the_finish_reason() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new(vec![
            MockTurn::text("").with_tool_call("call_1", "echo", json!({"text": "a"})),
            MockTurn::text("final summary"),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(echo_handle()).unwrap();
        let mut request = Request::new(vec![Message::user("go")]);
        request.stop_when = StopCondition::max_consecutive_tool_steps(1);
        request.on_stop = Some(Arc::new(crate::runner::finalizer::ClosingTurnFinalizer::default()));
        let invoker = Arc::new(ToolInvoker::new(
            4,
            Duration::from_secs(5),
            crate::tools::ToolErrorPolicy::AppendAndContinue,
        ));
        let handle = run_streaming(provider, request, Arc::new(registry), invoker, CancellationToken::new());
        let events = drain(handle).await;

        let finish = events.last().expect("stream should close with a finish event");
        assert_eq!(finish.kind, StreamEventType::Finish);
        let reason = finish.finish_reason.as_ref().expect("finish carries a reason");
        assert_eq!(reason.details.get("finalizer"), Some(&json!("consecutive_tool_limit")));

        let closing_text: String = events
            .iter()
            .filter(|e| e.kind == StreamEventType::TextDelta)
            .filter_map(|e| e.text_delta.clone())
            .collect();
        assert!(closing_text.contains("final summary"));
    }

    #[tokio::test]
    async fn stop_on_error_policy_emits_a_terminal_error_event() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new(vec![
            MockTurn::text("").with_tool_call("call_1", "explode", json!({})),
        ]));
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolHandle::new(
                "explode",
                "always fails",
                json!({"type": "object"}),
                |_input: serde_json::Value| async move { Err("boom".to_string()) },
            ))
            .unwrap();
        let mut request = Request::new(vec![Message::user("go")]);
        request.stop_when = StopCondition::no_more_tools();
        let invoker = Arc::new(ToolInvoker::new(
            4,
            Duration::from_secs(5),
            crate::tools::ToolErrorPolicy::StopOnError,
        ));
        let handle = run_streaming(provider, request, Arc::new(registry), invoker, CancellationToken::new());
        let events = drain(handle).await;
        let last = events.last().expect("stream should close with an event");
        assert_eq!(last.kind, StreamEventType::Error);
    }
}
