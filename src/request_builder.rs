//! Request builder (SPEC_FULL.md §4.3): translates a wire [`ChatRequestDto`]
//! into a canonical [`Request`], resolving the provider, assembling exactly
//! one system message, attaching tools, and installing the default
//! stop-condition/finalizer pair.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::codec::{decode_message, ChatRequestDto};
use crate::error::AppError;
use crate::model::{Message, Part, Request, Role};
use crate::prompt::PromptRegistry;
use crate::provider::Provider;
use crate::runner::finalizer::{ClosingTurnFinalizer, Finalizer};
use crate::runner::stop::StopCondition;
use crate::tools::ToolRegistry;

/// Providers keyed by DTO `provider` string, plus the tool and prompt
/// registries every request is built against.
pub struct BuildContext<'a> {
    pub providers: &'a HashMap<String, Arc<dyn Provider>>,
    pub tools: &'a ToolRegistry,
    pub prompts: &'a PromptRegistry,
    pub max_consecutive_tool_steps: u32,
}

/// Resolves the provider for `provider_id`, or an `unknown_provider` error.
pub fn resolve_provider(
    providers: &HashMap<String, Arc<dyn Provider>>,
    provider_id: &str,
) -> Result<Arc<dyn Provider>, AppError> {
    providers
        .get(provider_id)
        .cloned()
        .ok_or_else(|| AppError::UnknownProvider(provider_id.to_string()))
}

/// Ensures exactly one canonical system message at index 0 (SPEC_FULL.md
/// §4.3 step 3): merges into an existing matching leading system message, or
/// prepends a new one, or leaves `messages` untouched if `prompt_text` is
/// empty.
fn assemble_system_message(mut messages: Vec<Message>, prompt_text: &str, metadata: HashMap<String, Value>) -> Vec<Message> {
    if prompt_text.is_empty() {
        return messages;
    }
    if let Some(first) = messages.first_mut() {
        if first.role == Role::System && first.text_content() == prompt_text {
            first.metadata.extend(metadata);
            return messages;
        }
    }
    let system = Message {
        role: Role::System,
        parts: vec![Part::Text { text: prompt_text.to_string() }],
        metadata,
    };
    messages.insert(0, system);
    messages
}

/// Builds the canonical [`Request`] for one `/api/chat` or `/api/chat/stream`
/// call. Fails with `unknown_provider` or `invalid_part`/`invalid_role`
/// (propagated from [`decode_message`]); never fails on tool-selection
/// mismatches (an unknown name is simply dropped, since the model — not the
/// caller — is what ultimately requests a tool by name).
pub fn build_request(ctx: &BuildContext<'_>, dto: ChatRequestDto) -> Result<(Arc<dyn Provider>, Request), AppError> {
    if dto.messages.is_empty() {
        return Err(AppError::MissingMessages);
    }
    let provider = resolve_provider(ctx.providers, &dto.provider)?;
    let messages = dto
        .messages
        .into_iter()
        .map(decode_message)
        .collect::<Result<Vec<_>, _>>()?;

    let rendered = ctx.prompts.render("chat_system", &HashMap::new());
    let prompt_metadata: HashMap<String, Value> = if rendered.text.is_empty() {
        HashMap::new()
    } else {
        HashMap::from([
            ("prompt_name".to_string(), Value::from(rendered.name.clone())),
            ("prompt_version".to_string(), Value::from(rendered.version.clone())),
            ("prompt_fingerprint".to_string(), Value::from(rendered.fingerprint.clone())),
        ])
    };
    let messages = assemble_system_message(messages, &rendered.text, prompt_metadata.clone());

    let tools = ctx.tools.select(&dto.tools);
    let stop_when = StopCondition::any(vec![
        StopCondition::max_consecutive_tool_steps(ctx.max_consecutive_tool_steps),
        StopCondition::no_more_tools(),
    ]);

    // SPEC_FULL.md §4.7 step 1: the finalizer's closing system turn is the
    // `tool_limit_finalizer` template rendered against the limit that would
    // trigger it, not a hard-coded string.
    let limit_data = HashMap::from([("limit".to_string(), ctx.max_consecutive_tool_steps.to_string())]);
    let finalizer_prompt = ctx.prompts.render("tool_limit_finalizer", &limit_data);
    let on_stop: Option<Arc<dyn Finalizer>> = Some(Arc::new(ClosingTurnFinalizer::new(finalizer_prompt.text)));

    let request_id = uuid::Uuid::new_v4().to_string();
    let mut metadata = prompt_metadata;
    metadata.insert("request_id".to_string(), Value::from(request_id));

    let request = Request {
        model: dto.model,
        messages,
        temperature: dto.temperature,
        max_tokens: dto.max_output_tokens,
        top_p: None,
        top_k: None,
        tools,
        tool_choice: dto.tool_choice.into(),
        provider_options: dto.provider_options,
        metadata,
        stop_when,
        on_stop,
    };
    Ok((provider, request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MessageDto, PartDto, ToolChoiceDto};
    use crate::provider::mock::{MockProvider, MockTurn};

    fn ctx_with_mock() -> (HashMap<String, Arc<dyn Provider>>, ToolRegistry, PromptRegistry) {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(
            "mock".to_string(),
            Arc::new(MockProvider::new(vec![MockTurn::text("hi")])),
        );
        (providers, ToolRegistry::new(), PromptRegistry::new(None))
    }

    fn dto(provider: &str) -> ChatRequestDto {
        ChatRequestDto {
            provider: provider.to_string(),
            model: None,
            mode: crate::codec::Mode::Text,
            messages: vec![MessageDto {
                role: "user".to_string(),
                parts: vec![PartDto::Text { text: "hi".to_string() }],
                metadata: HashMap::new(),
            }],
            temperature: None,
            max_output_tokens: None,
            tool_choice: ToolChoiceDto::Auto,
            tools: Vec::new(),
            provider_options: HashMap::new(),
        }
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let (providers, tools, prompts) = ctx_with_mock();
        let ctx = BuildContext { providers: &providers, tools: &tools, prompts: &prompts, max_consecutive_tool_steps: 8 };
        let err = build_request(&ctx, dto("nope")).unwrap_err();
        assert!(matches!(err, AppError::UnknownProvider(_)));
    }

    #[test]
    fn prepends_exactly_one_system_message_with_identity() {
        let (providers, tools, prompts) = ctx_with_mock();
        let ctx = BuildContext { providers: &providers, tools: &tools, prompts: &prompts, max_consecutive_tool_steps: 8 };
        let (_provider, request) = build_request(&ctx, dto("mock")).unwrap();
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[0].metadata.contains_key("prompt_name"));
        assert!(request.metadata.contains_key("request_id"));
        let system_count = request.messages.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn empty_messages_is_rejected() {
        let (providers, tools, prompts) = ctx_with_mock();
        let ctx = BuildContext { providers: &providers, tools: &tools, prompts: &prompts, max_consecutive_tool_steps: 8 };
        let mut d = dto("mock");
        d.messages = Vec::new();
        let err = build_request(&ctx, d).unwrap_err();
        assert!(matches!(err, AppError::MissingMessages));
    }
}
