//! Composable stop-condition machine.
//!
//! A [`StopCondition`] is a pure predicate over [`RunnerState`]: it must never
//! mutate the runner, call a provider, or otherwise have side effects. This
//! mirrors how `LoopDetector` in the teacher crate classified tool-call
//! history without touching it; here the classification is generalized from
//! "is this a loop" to "should the runner stop".

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RunnerState;

/// Why the runner stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopReason {
    #[serde(rename = "type")]
    pub kind: StopReasonKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReasonKind {
    ProviderFinish,
    MaxSteps,
    NoMoreTools,
    Custom,
}

impl StopReason {
    pub fn provider_finish() -> Self {
        Self {
            kind: StopReasonKind::ProviderFinish,
            description: "provider emitted a finished turn with no further tool calls".into(),
            details: HashMap::new(),
        }
    }

    /// Non-terminal stop reasons are eligible for a [`crate::runner::finalizer::Finalizer`] pass.
    pub fn is_non_terminal(&self) -> bool {
        matches!(self.kind, StopReasonKind::MaxSteps)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// A pure predicate `(&RunnerState) -> (bool, StopReason)`, composable via
/// [`StopCondition::any`] / [`StopCondition::all`].
#[derive(Clone)]
pub struct StopCondition {
    check: Arc<dyn Fn(&RunnerState) -> (bool, StopReason) + Send + Sync>,
}

impl StopCondition {
    fn from_fn(f: impl Fn(&RunnerState) -> (bool, StopReason) + Send + Sync + 'static) -> Self {
        Self { check: Arc::new(f) }
    }

    /// Evaluates this condition against the current state. Must be called only
    /// after a step has been fully appended (including its tool results).
    pub fn evaluate(&self, state: &RunnerState) -> (bool, StopReason) {
        (self.check)(state)
    }

    /// Fires once `steps.len() >= n`.
    pub fn max_steps(n: u32) -> Self {
        Self::from_fn(move |state| {
            let fired = state.steps.len() as u32 >= n;
            let reason = StopReason {
                kind: StopReasonKind::MaxSteps,
                description: format!("reached the maximum of {n} step(s)"),
                details: HashMap::from([("limit".to_string(), Value::from(n))]),
            };
            (fired, reason)
        })
    }

    /// Fires when the last step has no tool calls and non-empty text.
    pub fn no_more_tools() -> Self {
        Self::from_fn(|state| {
            let fired = state
                .steps
                .last()
                .map(|step| !step.has_tool_calls() && !step.text.trim().is_empty())
                .unwrap_or(false);
            (fired, StopReason::provider_finish())
        })
    }

    /// Fires when the last `n` steps all contain at least one tool call.
    ///
    /// A step whose only tool call failed input validation still counts as a
    /// tool-bearing step, by design (see SPEC_FULL.md §9).
    pub fn max_consecutive_tool_steps(n: u32) -> Self {
        Self::from_fn(move |state| {
            if n == 0 || (state.steps.len() as u32) < n {
                return (false, StopReason::provider_finish());
            }
            let consecutive = state
                .steps
                .iter()
                .rev()
                .take(n as usize)
                .all(|step| step.has_tool_calls());
            let reason = StopReason {
                kind: StopReasonKind::MaxSteps,
                description: format!("{n} consecutive steps contained tool calls"),
                details: HashMap::from([
                    ("limit".to_string(), Value::from(n)),
                    ("consecutive".to_string(), Value::from(n)),
                ]),
            };
            (consecutive, reason)
        })
    }

    /// Fires as soon as any child fires; returns that child's reason.
    pub fn any(conditions: Vec<StopCondition>) -> Self {
        Self::from_fn(move |state| {
            for condition in &conditions {
                let (fired, reason) = condition.evaluate(state);
                if fired {
                    return (true, reason);
                }
            }
            (false, StopReason::provider_finish())
        })
    }

    /// Fires only once every child fires; returns the last child's reason.
    pub fn all(conditions: Vec<StopCondition>) -> Self {
        Self::from_fn(move |state| {
            let mut last_reason = StopReason::provider_finish();
            for condition in &conditions {
                let (fired, reason) = condition.evaluate(state);
                last_reason = reason;
                if !fired {
                    return (false, last_reason);
                }
            }
            (true, last_reason)
        })
    }

    /// Wraps an arbitrary closure as a custom stop condition.
    pub fn custom(
        description: impl Into<String>,
        f: impl Fn(&RunnerState) -> bool + Send + Sync + 'static,
    ) -> Self {
        let description = description.into();
        Self::from_fn(move |state| {
            let fired = f(state);
            (
                fired,
                StopReason {
                    kind: StopReasonKind::Custom,
                    description: description.clone(),
                    details: HashMap::new(),
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    fn step_with_tool_call(number: u32) -> Step {
        Step {
            number,
            text: String::new(),
            tool_calls: vec![crate::model::ToolExecution {
                call_id: format!("call_{number}"),
                tool_name: "bash".into(),
                input: Value::Null,
                result: Some(Value::from("ok")),
                error: None,
                duration_ms: 1,
                retries: 0,
            }],
            usage: Default::default(),
            started_at_ms: 0,
            completed_at_ms: 0,
            duration_ms: 0,
            model: "mock".into(),
        }
    }

    fn text_step(number: u32, text: &str) -> Step {
        Step {
            number,
            text: text.to_string(),
            tool_calls: Vec::new(),
            usage: Default::default(),
            started_at_ms: 0,
            completed_at_ms: 0,
            duration_ms: 0,
            model: "mock".into(),
        }
    }

    #[test]
    fn max_steps_fires_at_threshold() {
        let cond = StopCondition::max_steps(2);
        let mut state = RunnerState::default();
        assert!(!cond.evaluate(&state).0);
        state.push_step(text_step(1, "hi"));
        assert!(!cond.evaluate(&state).0);
        state.push_step(text_step(2, "hi"));
        assert!(cond.evaluate(&state).0);
    }

    #[test]
    fn no_more_tools_requires_text_and_no_calls() {
        let cond = StopCondition::no_more_tools();
        let mut state = RunnerState::default();
        state.push_step(step_with_tool_call(1));
        assert!(!cond.evaluate(&state).0);
        state.push_step(text_step(2, ""));
        assert!(!cond.evaluate(&state).0, "empty text should not satisfy no_more_tools");
        state.push_step(text_step(3, "done"));
        assert!(cond.evaluate(&state).0);
    }

    #[test]
    fn max_consecutive_tool_steps_never_fires_before_n() {
        let cond = StopCondition::max_consecutive_tool_steps(4);
        let mut state = RunnerState::default();
        for n in 1..=3 {
            state.push_step(step_with_tool_call(n));
            assert!(!cond.evaluate(&state).0, "should not fire before step 4");
        }
        state.push_step(step_with_tool_call(4));
        let (fired, reason) = cond.evaluate(&state);
        assert!(fired);
        assert_eq!(reason.details.get("limit"), Some(&Value::from(4)));
    }

    #[test]
    fn any_returns_first_firing_reason() {
        let cond = StopCondition::any(vec![
            StopCondition::max_steps(10),
            StopCondition::no_more_tools(),
        ]);
        let mut state = RunnerState::default();
        state.push_step(text_step(1, "done"));
        let (fired, reason) = cond.evaluate(&state);
        assert!(fired);
        assert_eq!(reason.kind, StopReasonKind::ProviderFinish);
    }

    #[test]
    fn all_requires_every_child() {
        let cond = StopCondition::all(vec![
            StopCondition::max_steps(1),
            StopCondition::max_steps(2),
        ]);
        let mut state = RunnerState::default();
        state.push_step(text_step(1, "a"));
        assert!(!cond.evaluate(&state).0);
        state.push_step(text_step(2, "b"));
        assert!(cond.evaluate(&state).0);
    }
}
