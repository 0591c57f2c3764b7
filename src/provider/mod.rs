//! Provider adapter contract and the concrete adapters implementing it.
//!
//! Modeled on the teacher's `LLMProvider` async_trait (`chat()` /
//! `chat_loop()`), generalized so the runner drives the multi-step loop
//! itself instead of the adapter: an adapter here only ever makes one
//! provider round-trip per call.

pub mod anthropic;
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::{ObjectResult, Request, Step};
use crate::stream_event::StreamEvent;

/// Static, provider-reported feature set, surfaced verbatim on `GET /api/providers`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Capabilities {
    pub provider: String,
    pub streaming: bool,
    pub parallel_tool_calls: bool,
    pub strict_json: bool,
    pub images: bool,
    pub reasoning: bool,
    pub max_input: u32,
    pub max_output: u32,
    pub default_model: String,
    pub models: Vec<String>,
}

/// A single provider turn, handed back to the runner for it to drive the
/// step/tool-call loop. Adapters never loop internally.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub step: Step,
    pub warnings: Vec<String>,
}

/// A running streamed turn: a receiver of already-rewritten [`StreamEvent`]s
/// plus metadata populated once the stream closes.
pub struct StreamHandle {
    pub events: tokio::sync::mpsc::Receiver<StreamEvent>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// One non-streaming round-trip. Must return a single [`Step`] (with
    /// `tool_calls` left unexecuted — the runner invokes them).
    async fn generate_text(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AppError>;

    /// One streaming round-trip. The returned events are already shaped like
    /// [`StreamEvent`] but carry step-local, not yet step-scoped, IDs and a
    /// placeholder `seq`/`step_id` of 0 — the runner driver rewrites both
    /// before forwarding to the client.
    async fn stream_text(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, AppError>;

    /// Single non-streaming structured-object round-trip (JSON mode only,
    /// SPEC_FULL.md §4.1/§1 Non-goals). Adapters that don't implement strict
    /// JSON output inherit this default, which rejects the request outright
    /// rather than silently downgrading to a free-text response.
    async fn generate_object(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<ObjectResult, AppError> {
        Err(AppError::UnsupportedMode(format!(
            "{} does not support json mode",
            self.capabilities().provider
        )))
    }
}
