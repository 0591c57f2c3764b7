//! Buffered runner (SPEC_FULL.md §4.5): drives the multi-step loop to
//! completion and returns a single [`TextResult`].
//!
//! Grounded in the teacher's `chat_loop_with_tools` (`llm/helpers.rs`), which
//! looped on `ChatLoopHandle::next()` matching `LoopStep` variants up to
//! `max_rounds`; here the loop is generalized to the composable
//! [`crate::runner::stop::StopCondition`] machine and a provider-call-per-step
//! shape instead of one long-lived handle.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::{Message, Part, Request, RunnerState, Step, TextResult};
use crate::provider::Provider;
use crate::runner::ids::composite_id_or_seq;
use crate::tools::{ToolInvoker, ToolRegistry};

/// Executes a completed step's tool calls and appends the resulting
/// assistant/user turn to `transcript`. Returns the step with `tool_calls`
/// populated with results, in call order. Under `ToolErrorPolicy::StopOnError`
/// a failing call aborts the whole request (SPEC_FULL.md §4.2) instead of
/// being appended to the transcript.
async fn run_step_tools(
    step: &mut Step,
    transcript: &mut Vec<Message>,
    registry: &ToolRegistry,
    invoker: &ToolInvoker,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if step.tool_calls.is_empty() {
        return Ok(());
    }

    let calls: Vec<_> = step
        .tool_calls
        .iter()
        .map(|call| (call.call_id.clone(), call.tool_name.clone(), call.input.clone()))
        .collect();
    let executed = invoker.invoke_step(registry, calls, cancel).await?;
    let mut by_id: HashMap<String, _> = executed.into_iter().map(|e| (e.call_id.clone(), e)).collect();

    let mut assistant_parts = Vec::new();
    let mut result_parts = Vec::new();
    for call in step.tool_calls.iter_mut() {
        let composite = composite_id_or_seq(step.number, Some(&call.call_id), 0);
        assistant_parts.push(Part::ToolCall {
            id: composite.clone(),
            name: call.tool_name.clone(),
            input: call.input.clone(),
            metadata: HashMap::from([("original_id".to_string(), call.call_id.clone().into())]),
        });

        if let Some(executed) = by_id.remove(&call.call_id) {
            call.result = executed.result.clone();
            call.error = executed.error.clone();
            call.duration_ms = executed.duration_ms;
            call.retries = executed.retries;
        }

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

    if !step.text.is_empty() || !assistant_parts.is_empty() {
        let mut parts = if step.text.is_empty() {
            Vec::new()
        } else {
            vec![Part::Text { text: step.text.clone() }]
        };
        parts.extend(assistant_parts);
        transcript.push(Message {
            role: crate::model::Role::Assistant,
            parts,
            metadata: HashMap::new(),
        });
    }
    transcript.push(Message {
        role: crate::model::Role::User,
        parts: result_parts,
        metadata: HashMap::new(),
    });
    Ok(())
}

/// Builds the finalizer's provider request: the full transcript plus the
/// closing turns, with tools forced off so the finalizer cannot restart
/// the loop (SPEC_FULL.md §9).
fn finalizer_request(base: &Request, transcript: Vec<Message>, closing_turns: Vec<Message>) -> Request {
    let mut messages = transcript;
    messages.extend(closing_turns);
    Request {
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
    }
}

pub async fn run_buffered(
    provider: &dyn Provider,
    request: Request,
    registry: &ToolRegistry,
    invoker: &ToolInvoker,
    cancel: &CancellationToken,
) -> Result<TextResult, AppError> {
    let provider_name = provider.capabilities().provider;
    let mut transcript = request.messages.clone();
    let mut state = RunnerState {
        messages: transcript.clone(),
        steps: Vec::new(),
        usage: Default::default(),
    };
    let mut warnings = Vec::new();
    let mut current_request = request.clone();

    let final_reason = loop {
        current_request.messages = transcript.clone();
        let turn = provider.generate_text(&current_request, cancel).await?;
        warnings.extend(turn.warnings);

        let mut step = turn.step;
        step.number = state.steps.len() as u32 + 1;
        run_step_tools(&mut step, &mut transcript, registry, invoker, cancel).await?;

        if step.tool_calls.is_empty() && !step.text.is_empty() {
            transcript.push(Message::assistant(step.text.clone()));
        }

        state.push_step(step);
        state.messages = transcript.clone();

        let (fired, reason) = request.stop_when.evaluate(&state);
        if fired {
            break reason;
        }
    };

    let (text, final_reason) = if final_reason.is_non_terminal() {
        if let Some(finalizer) = &request.on_stop {
            let closing_turns = finalizer.closing_turns();
            let fin_request = finalizer_request(&request, transcript.clone(), closing_turns);
            match provider.generate_text(&fin_request, cancel).await {
                Ok(turn) => {
                    let mut step = turn.step;
                    step.number = state.steps.len() as u32 + 1;
                    let text = if step.text.trim().is_empty() {
                        state.last_text().to_string()
                    } else {
                        step.text.clone()
                    };
                    state.push_step(step);
                    let reason = final_reason.with_detail("finalizer", "consecutive_tool_limit");
                    (text, reason)
                }
                Err(_) => match finalizer.finalize(&state).await {
                    Ok(message) => {
                        let reason = final_reason.with_detail("finalizer", "fallback_last_step");
                        (message.text_content(), reason)
                    }
                    Err(_) => {
                        let text = format!(
                            "Reached the step limit before finishing.\n\n{}",
                            state.last_text()
                        );
                        let reason = final_reason.with_detail("finalizer", "error_fallback");
                        (text, reason)
                    }
                },
            }
        } else {
            (state.last_text().to_string(), final_reason)
        }
    } else {
        (state.last_text().to_string(), final_reason)
    };

    Ok(TextResult {
        text,
        steps: state.steps,
        usage: state.usage,
        finish_reason: final_reason,
        provider: provider_name,
        model: current_request.model.unwrap_or_default(),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolHandle;
    use crate::provider::mock::{MockProvider, MockTurn};
    use crate::runner::finalizer::ClosingTurnFinalizer;
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

    fn invoker() -> ToolInvoker {
        ToolInvoker::new(4, Duration::from_secs(5), crate::tools::ToolErrorPolicy::AppendAndContinue)
    }

    #[tokio::test]
    async fn static_reply_never_touches_tools() {
        let provider = MockProvider::new(vec![MockTurn::text("hi there")]);
        let mut request = Request::new(vec![Message::user("hello")]);
        request.stop_when = StopCondition::no_more_tools();
        let registry = ToolRegistry::new();
        let result = run_buffered(&provider, request, &registry, &invoker(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "hi there");
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn single_tool_round_trip_appends_result_and_stops() {
        let provider = MockProvider::new(vec![
            MockTurn::text("").with_tool_call("call_1", "echo", json!({"text": "ping"})),
            MockTurn::text("done"),
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(echo_handle()).unwrap();
        let mut request = Request::new(vec![Message::user("go")]);
        request.stop_when = StopCondition::no_more_tools();
        let result = run_buffered(&provider, request, &registry, &invoker(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "done");
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].tool_calls[0].result, Some(json!({"text": "ping"})));
    }

    #[tokio::test]
    async fn budget_exhaustion_runs_finalizer() {
        let provider = MockProvider::new(vec![
            MockTurn::text("").with_tool_call("call_1", "echo", json!({"text": "a"})),
            MockTurn::text("final summary"),
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(echo_handle()).unwrap();
        let mut request = Request::new(vec![Message::user("go")]);
        request.stop_when = StopCondition::max_consecutive_tool_steps(1);
        request.on_stop = Some(Arc::new(ClosingTurnFinalizer::default()));
        let result = run_buffered(&provider, request, &registry, &invoker(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "final summary");
        assert_eq!(
            result.finish_reason.details.get("finalizer"),
            Some(&json!("consecutive_tool_limit"))
        );
    }

    #[tokio::test]
    async fn stop_on_error_policy_aborts_the_request() {
        let provider = MockProvider::new(vec![
            MockTurn::text("").with_tool_call("call_1", "explode", json!({})),
        ]);
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
        let stop_on_error_invoker =
            ToolInvoker::new(4, Duration::from_secs(5), crate::tools::ToolErrorPolicy::StopOnError);
        let err = run_buffered(&provider, request, &registry, &stop_on_error_invoker, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tool_invocation_failed");
    }
}
