//! Wire codec (SPEC_FULL.md §4.10, §6.2–§6.3): canonical ↔ DTO mapping for
//! the HTTP surface. Decode failures map to `invalid_part`/`invalid_role`;
//! the caller turns those into HTTP 400 via [`crate::error::AppError`].

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::model::{Message, Part, Role, Step, ToolChoice, ToolExecution, Usage};
use crate::runner::stop::StopReason;

#[derive(Debug, Deserialize)]
pub struct ChatRequestDto {
    pub provider: String,
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    pub messages: Vec<MessageDto>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub tool_choice: ToolChoiceDto,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub provider_options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceDto {
    #[default]
    Auto,
    None,
    Required,
}

impl From<ToolChoiceDto> for ToolChoice {
    fn from(value: ToolChoiceDto) -> Self {
        match value {
            ToolChoiceDto::Auto => ToolChoice::Auto,
            ToolChoiceDto::None => ToolChoice::None,
            ToolChoiceDto::Required => ToolChoice::Required,
        }
    }
}

impl From<ToolChoice> for ToolChoiceDto {
    fn from(value: ToolChoice) -> Self {
        match value {
            ToolChoice::Auto => ToolChoiceDto::Auto,
            ToolChoice::None => ToolChoiceDto::None,
            ToolChoice::Required => ToolChoiceDto::Required,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MessageDto {
    pub role: String,
    pub parts: Vec<PartDto>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartDto {
    Text {
        text: String,
    },
    ImageBase64 {
        data: String,
        mime: String,
    },
    ImageUrl {
        url: String,
        mime: String,
    },
    FunctionCall {
        id: String,
        mime: String, // tool name, named to mirror function_response's field
        text: String, // JSON-encoded arguments
    },
    FunctionResponse {
        id: String,
        mime: String,
        text: String, // JSON-encoded result
    },
}

pub fn decode_role(role: &str) -> Result<Role, AppError> {
    match role {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(AppError::InvalidRole(other.to_string())),
    }
}

pub fn encode_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

pub fn decode_part(part: PartDto) -> Result<Part, AppError> {
    Ok(match part {
        PartDto::Text { text } => Part::Text { text },
        PartDto::ImageBase64 { data, mime } => Part::Image {
            bytes: BASE64.decode(&data).map_err(|e| AppError::InvalidPart(e.to_string()))?,
            mime,
        },
        PartDto::ImageUrl { url, mime } => Part::ImageUrl { url, mime },
        PartDto::FunctionCall { id, mime, text } => Part::ToolCall {
            id,
            name: mime,
            input: serde_json::from_str(&text).map_err(|e| AppError::InvalidPart(e.to_string()))?,
            metadata: HashMap::new(),
        },
        PartDto::FunctionResponse { id, mime, text } => Part::ToolResult {
            id,
            name: mime,
            result: serde_json::from_str(&text).map_err(|e| AppError::InvalidPart(e.to_string()))?,
        },
    })
}

pub fn encode_part(part: &Part) -> PartDto {
    match part {
        Part::Text { text } => PartDto::Text { text: text.clone() },
        Part::Image { bytes, mime } => PartDto::ImageBase64 {
            data: BASE64.encode(bytes),
            mime: mime.clone(),
        },
        Part::ImageUrl { url, mime } => PartDto::ImageUrl {
            url: url.clone(),
            mime: mime.clone(),
        },
        Part::ToolCall { id, name, input, .. } => PartDto::FunctionCall {
            id: id.clone(),
            mime: name.clone(),
            text: input.to_string(),
        },
        Part::ToolResult { id, name, result } => PartDto::FunctionResponse {
            id: id.clone(),
            mime: name.clone(),
            text: result.to_string(),
        },
    }
}

pub fn decode_message(dto: MessageDto) -> Result<Message, AppError> {
    let role = decode_role(&dto.role)?;
    let parts = dto.parts.into_iter().map(decode_part).collect::<Result<Vec<_>, _>>()?;
    Ok(Message {
        role,
        parts,
        metadata: dto.metadata,
    })
}

pub fn encode_message(message: &Message) -> MessageDto {
    MessageDto {
        role: encode_role(message.role).to_string(),
        parts: message.parts.iter().map(encode_part).collect(),
        metadata: message.metadata.clone(),
    }
}

#[derive(Debug, Serialize)]
pub struct ToolCallDto {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries: u32,
}

impl From<&ToolExecution> for ToolCallDto {
    fn from(exec: &ToolExecution) -> Self {
        Self {
            id: exec.call_id.clone(),
            name: exec.tool_name.clone(),
            input: exec.input.clone(),
            result: exec.result.clone(),
            error: exec.error.clone(),
            duration_ms: exec.duration_ms,
            retries: exec.retries,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StepDto {
    pub number: u32,
    pub text: String,
    pub model: String,
    pub duration_ms: u64,
    pub tool_calls: Vec<ToolCallDto>,
}

impl From<&Step> for StepDto {
    fn from(step: &Step) -> Self {
        Self {
            number: step.number,
            text: step.text.clone(),
            model: step.model.clone(),
            duration_ms: step.duration_ms,
            tool_calls: step.tool_calls.iter().map(ToolCallDto::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponseDto {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
    pub finish_reason: StopReason,
    pub steps: Vec<StepDto>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_encode_round_trips_a_text_message() {
        let dto = MessageDto {
            role: "user".to_string(),
            parts: vec![PartDto::Text { text: "hi".to_string() }],
            metadata: HashMap::new(),
        };
        let message = decode_message(dto).unwrap();
        let dto2 = encode_message(&message);
        let message2 = decode_message(dto2).unwrap();
        assert_eq!(message, message2);
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(decode_role("narrator").is_err());
    }

    #[test]
    fn base64_round_trips() {
        let data = b"the quick brown fox jumps";
        let encoded = BASE64.encode(data);
        let decoded = BASE64.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn function_call_round_trips_through_tool_call_part() {
        let dto = PartDto::FunctionCall {
            id: "call_1".to_string(),
            mime: "bash".to_string(),
            text: "{\"command\":\"ls\"}".to_string(),
        };
        let part = decode_part(dto).unwrap();
        match &part {
            Part::ToolCall { name, input, .. } => {
                assert_eq!(name, "bash");
                assert_eq!(input["command"], "ls");
            }
            _ => panic!("expected ToolCall"),
        }
        let back = encode_part(&part);
        match back {
            PartDto::FunctionCall { mime, .. } => assert_eq!(mime, "bash"),
            _ => panic!("expected FunctionCall dto"),
        }
    }
}
