//! Tool registry and invoker (SPEC_FULL.md §4.2).
//!
//! Grounded in the teacher's `ToolRegistry`/`ToolProvider` split
//! (`llm/registry.rs`): a `ToolProvider` describes and executes a tool; the
//! registry turns providers into canonical [`ToolHandle`]s and the invoker
//! runs a step's calls concurrently, bounded by a semaphore, the way the
//! teacher's `BashTool` bounded a single call with `tokio::time::timeout`.

pub mod bash;
pub mod web_search;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::{now_ms, ToolExecution, ToolHandle};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Describes and executes one tool. Implementations are turned into a
/// [`ToolHandle`] via [`ToolProvider::into_handle`] before being registered,
/// so the runner only ever deals with the closure-based canonical type.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn call(&self, input: Value) -> Result<Value, String>;
}

pub trait ToolProviderExt: ToolProvider + Sized + 'static {
    fn into_handle(self) -> ToolHandle {
        let schema = self.input_schema();
        let provider = Arc::new(self);
        ToolHandle::new(
            provider.name().to_string(),
            provider.description().to_string(),
            schema,
            move |input| {
                let provider = provider.clone();
                async move { provider.call(input).await }
            },
        )
    }
}

impl<T: ToolProvider + Sized + 'static> ToolProviderExt for T {}

/// Read-mostly collection of [`ToolHandle`]s, built once at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handles: HashMap<String, ToolHandle>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ToolHandle) -> Result<(), AppError> {
        if self.handles.contains_key(&handle.name) {
            return Err(AppError::DuplicateTool(handle.name.clone()));
        }
        self.handles.insert(handle.name.clone(), handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandle> {
        self.handles.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.keys().map(String::as_str).collect()
    }

    /// Selects handles by name; an empty `names` selects every registered tool.
    pub fn select(&self, names: &[String]) -> Vec<ToolHandle> {
        if names.is_empty() {
            return self.handles.values().cloned().collect();
        }
        names.iter().filter_map(|n| self.handles.get(n).cloned()).collect()
    }
}

/// What happens to the step when a tool call errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorPolicy {
    /// Record the error on the `ToolResult` and let the runner continue.
    AppendAndContinue,
    /// Abort the whole request as soon as one tool call errors.
    StopOnError,
    /// Retry up to `max_retries` times with jittered backoff, then append.
    RetryThenAppend { max_retries: u32 },
}

impl Default for ToolErrorPolicy {
    fn default() -> Self {
        ToolErrorPolicy::AppendAndContinue
    }
}

/// Runs one step's tool calls concurrently, bounded by a semaphore, with a
/// per-call timeout and a configurable error policy.
pub struct ToolInvoker {
    pub concurrency: Arc<Semaphore>,
    pub timeout: Duration,
    pub policy: ToolErrorPolicy,
}

impl ToolInvoker {
    pub fn new(concurrency_limit: usize, timeout: Duration, policy: ToolErrorPolicy) -> Self {
        Self {
            concurrency: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            timeout,
            policy,
        }
    }

    /// Validates `input` against the handle's declared schema. Only checks
    /// `required` top-level properties are present — there's no JSON Schema
    /// validator crate in the dependency stack, and the runner's contract only
    /// needs "did the model omit a required field", not full schema coverage.
    fn validate(handle: &ToolHandle, input: &Value) -> Result<(), String> {
        let Some(required) = handle.input_schema.get("required").and_then(Value::as_array) else {
            return Ok(());
        };
        let object = input.as_object();
        for field in required {
            let Some(field) = field.as_str() else { continue };
            let present = object.map(|o| o.contains_key(field)).unwrap_or(false);
            if !present {
                return Err(format!("missing required field `{field}`"));
            }
        }
        Ok(())
    }

    async fn invoke_one(
        &self,
        handle: ToolHandle,
        call_id: String,
        input: Value,
        cancel: &CancellationToken,
    ) -> ToolExecution {
        let started = now_ms();
        if let Err(e) = Self::validate(&handle, &input) {
            return ToolExecution {
                call_id,
                tool_name: handle.name.clone(),
                input,
                result: None,
                error: Some(format!("invalid_input: {e}")),
                duration_ms: now_ms() - started,
                retries: 0,
            };
        }

        let mut retries_used = 0;
        let max_retries = match self.policy {
            ToolErrorPolicy::RetryThenAppend { max_retries } => max_retries,
            _ => 0,
        };

        loop {
            let _permit = self.concurrency.acquire().await.expect("semaphore closed");
            // Races the tool call against the request's cancellation token
            // (SPEC_FULL.md §5: in-flight tool invocations observe request
            // cancellation, not just their own per-call timeout) alongside the
            // per-call timeout.
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(self.timeout, handle.invoke(input.clone())) => Some(res),
            };
            drop(_permit);

            match outcome {
                None => {
                    return ToolExecution {
                        call_id,
                        tool_name: handle.name.clone(),
                        input,
                        result: None,
                        error: Some("cancelled".to_string()),
                        duration_ms: now_ms() - started,
                        retries: retries_used,
                    };
                }
                Some(Ok(Ok(result))) => {
                    return ToolExecution {
                        call_id,
                        tool_name: handle.name.clone(),
                        input,
                        result: Some(result),
                        error: None,
                        duration_ms: now_ms() - started,
                        retries: retries_used,
                    };
                }
                Some(Ok(Err(error))) if retries_used < max_retries => {
                    retries_used += 1;
                    tokio::time::sleep(Duration::from_millis(100 * retries_used as u64)).await;
                    continue;
                }
                Some(Ok(Err(error))) => {
                    return ToolExecution {
                        call_id,
                        tool_name: handle.name.clone(),
                        input,
                        result: None,
                        error: Some(error),
                        duration_ms: now_ms() - started,
                        retries: retries_used,
                    };
                }
                Some(Err(_)) if retries_used < max_retries => {
                    retries_used += 1;
                    continue;
                }
                Some(Err(_)) => {
                    return ToolExecution {
                        call_id,
                        tool_name: handle.name.clone(),
                        input,
                        result: None,
                        error: Some("tool_timeout".to_string()),
                        duration_ms: now_ms() - started,
                        retries: retries_used,
                    };
                }
            }
        }
    }

    /// Runs every call of one step in parallel and returns results in the
    /// same order the calls were requested, regardless of finish order.
    ///
    /// `registry` resolves each call's tool; a call naming an unregistered
    /// tool produces a `tool_invocation_failed` result rather than panicking,
    /// since the model, not the caller, chose the name.
    ///
    /// Under `ToolErrorPolicy::StopOnError` the whole step's calls still run
    /// to completion (so their durations are accurate), but if any of them
    /// errored the step's results are discarded and `Err` is returned instead
    /// — the caller aborts the request rather than appending the turn to the
    /// transcript (SPEC_FULL.md §4.2).
    pub async fn invoke_step(
        &self,
        registry: &ToolRegistry,
        calls: Vec<(String, String, Value)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolExecution>, AppError> {
        let futures: Vec<_> = calls
            .into_iter()
            .map(|(call_id, name, input)| {
                let handle = registry.get(&name).cloned();
                async move {
                    match handle {
                        Some(handle) => self.invoke_one(handle, call_id, input, cancel).await,
                        None => ToolExecution {
                            call_id,
                            tool_name: name.clone(),
                            input,
                            result: None,
                            error: Some(format!("tool_invocation_failed: unknown tool `{name}`")),
                            duration_ms: 0,
                            retries: 0,
                        },
                    }
                }
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        if matches!(self.policy, ToolErrorPolicy::StopOnError) {
            if let Some(failed) = results.iter().find(|r| r.error.is_some()) {
                return Err(AppError::ToolInvocationFailed(format!(
                    "{}: {}",
                    failed.tool_name,
                    failed.error.clone().unwrap_or_default()
                )));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolProvider for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "required": ["text"]})
        }
        async fn call(&self, input: Value) -> Result<Value, String> {
            Ok(input)
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolProvider for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "always errors"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn call(&self, _input: Value) -> Result<Value, String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn registers_and_invokes() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool.into_handle()).unwrap();
        let invoker = ToolInvoker::new(4, Duration::from_secs(1), ToolErrorPolicy::AppendAndContinue);
        let results = invoker
            .invoke_step(&registry, vec![("1".into(), "echo".into(), json!({"text": "hi"}))], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_none());
    }

    #[tokio::test]
    async fn rejects_duplicate_registration() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool.into_handle()).unwrap();
        let err = registry.register(EchoTool.into_handle()).unwrap_err();
        assert!(matches!(err, AppError::DuplicateTool(_)));
    }

    #[tokio::test]
    async fn validation_failure_skips_invocation() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool.into_handle()).unwrap();
        let invoker = ToolInvoker::new(4, Duration::from_secs(1), ToolErrorPolicy::AppendAndContinue);
        let results = invoker
            .invoke_step(&registry, vec![("1".into(), "echo".into(), json!({}))], &CancellationToken::new())
            .await
            .unwrap();
        assert!(results[0].error.as_ref().unwrap().starts_with("invalid_input"));
    }

    #[tokio::test]
    async fn unknown_tool_produces_error_result() {
        let registry = ToolRegistry::new();
        let invoker = ToolInvoker::new(4, Duration::from_secs(1), ToolErrorPolicy::AppendAndContinue);
        let results = invoker
            .invoke_step(&registry, vec![("1".into(), "nope".into(), json!({}))], &CancellationToken::new())
            .await
            .unwrap();
        assert!(results[0].error.as_ref().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn stop_on_error_policy_aborts_the_step() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool.into_handle()).unwrap();
        let invoker = ToolInvoker::new(4, Duration::from_secs(1), ToolErrorPolicy::StopOnError);
        let err = invoker
            .invoke_step(&registry, vec![("1".into(), "fail".into(), json!({}))], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ToolInvocationFailed(_)));
    }

    #[tokio::test]
    async fn append_and_continue_policy_does_not_abort_on_error() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool.into_handle()).unwrap();
        let invoker = ToolInvoker::new(4, Duration::from_secs(1), ToolErrorPolicy::AppendAndContinue);
        let results = invoker
            .invoke_step(&registry, vec![("1".into(), "fail".into(), json!({}))], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancelling_the_token_stops_an_in_flight_tool_call() {
        struct SleepyTool;
        #[async_trait]
        impl ToolProvider for SleepyTool {
            fn name(&self) -> &str {
                "sleepy"
            }
            fn description(&self) -> &str {
                "sleeps past the test's patience"
            }
            fn input_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn call(&self, _input: Value) -> Result<Value, String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(SleepyTool.into_handle()).unwrap();
        let invoker = ToolInvoker::new(4, Duration::from_secs(60), ToolErrorPolicy::AppendAndContinue);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let results = invoker
            .invoke_step(&registry, vec![("1".into(), "sleepy".into(), json!({}))], &cancel)
            .await
            .unwrap();
        assert_eq!(results[0].error.as_deref(), Some("cancelled"));
    }
}
