//! Finalization hook: the closing turn issued when a run stops for a
//! non-terminal reason (budget exhaustion) rather than because the provider
//! itself decided it was done.
//!
//! Grounded in the teacher's `ChatLoopConfig::max_rounds` cutoff, which simply
//! truncated the loop; the spec asks for one more provider call instead, with
//! tools forced off, so the model can summarize whatever it has so far.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AppError;
use crate::model::{Message, Part, Role, RunnerState};

/// Produces a final, user-facing message once the runner has decided to stop
/// but the provider never emitted a natural, tool-free turn.
///
/// Implementations must not invoke tools: the finalizer's own request is built
/// with `tools = []` and `tool_choice = none` regardless of what the
/// implementation sets, so a misbehaving finalizer can't restart the loop.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// The turns appended to the transcript before the finalizer's own
    /// provider call (SPEC_FULL.md §4.7 step 1): a synthesized system turn
    /// plus the literal user turn asking for a complete answer now.
    fn closing_turns(&self) -> Vec<Message>;

    async fn finalize(&self, state: &RunnerState) -> Result<Message, AppError>;
}

/// Default finalizer: asks the same provider/model for one more turn, with a
/// system turn rendered from the `tool_limit_finalizer` template (carrying
/// the step limit that triggered it) and the spec's literal follow-up user
/// turn.
pub struct ClosingTurnFinalizer {
    pub system_prompt: String,
    pub user_prompt: String,
}

impl Default for ClosingTurnFinalizer {
    /// Used only where no rendered template is available (e.g. constructing a
    /// finalizer outside of `request_builder::build_request`). Production
    /// requests get `ClosingTurnFinalizer::new` with the `tool_limit_finalizer`
    /// template actually rendered against the configured limit.
    fn default() -> Self {
        Self::new(
            "You have reached the step limit for this conversation. \
                Using only the information already gathered, give the user your best \
                final answer now. Do not request further tool calls.",
        )
    }
}

impl ClosingTurnFinalizer {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: "Respond to the user now with a complete answer.".to_string(),
        }
    }
}

#[async_trait]
impl Finalizer for ClosingTurnFinalizer {
    fn closing_turns(&self) -> Vec<Message> {
        vec![
            Message {
                role: Role::System,
                parts: vec![Part::Text { text: self.system_prompt.clone() }],
                metadata: HashMap::new(),
            },
            Message::user(self.user_prompt.clone()),
        ]
    }

    /// This default implementation has no provider access of its own; the
    /// runner drives the actual closing-turn call and only falls back to this
    /// path (synthesizing a message from the last step's text) if the
    /// finalizer is used directly without a provider in scope, e.g. in tests.
    async fn finalize(&self, state: &RunnerState) -> Result<Message, AppError> {
        let text = state.last_text();
        if text.trim().is_empty() {
            return Err(AppError::FinalizerError(
                "no prior step text to fall back on".to_string(),
            ));
        }
        Ok(Message::assistant(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    #[tokio::test]
    async fn falls_back_to_last_step_text() {
        let finalizer = ClosingTurnFinalizer::default();
        let mut state = RunnerState::default();
        state.push_step(Step {
            number: 1,
            text: "partial answer".into(),
            tool_calls: Vec::new(),
            usage: Default::default(),
            started_at_ms: 0,
            completed_at_ms: 0,
            duration_ms: 0,
            model: "mock".into(),
        });
        let message = finalizer.finalize(&state).await.unwrap();
        assert_eq!(message.text_content(), "partial answer");
    }

    #[tokio::test]
    async fn errors_when_nothing_to_fall_back_on() {
        let finalizer = ClosingTurnFinalizer::default();
        let state = RunnerState::default();
        assert!(finalizer.finalize(&state).await.is_err());
    }

    #[test]
    fn closing_turns_are_a_system_turn_then_the_spec_user_turn() {
        let finalizer = ClosingTurnFinalizer::new("you hit the limit of 4 tool steps");
        let turns = finalizer.closing_turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[0].text_content(), "you hit the limit of 4 tool steps");
        assert_eq!(turns[1].role, Role::User);
        assert_eq!(turns[1].text_content(), "Respond to the user now with a complete answer.");
    }
}
