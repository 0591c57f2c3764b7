//! Typed, env-assembled configuration (SPEC_FULL.md §3A, §4.13, §6.4).
//!
//! Grounded in the teacher's `ChatLoopConfig`/provider-selection pattern
//! (`llm/helpers.rs`), generalized from one hard-coded provider to a table of
//! optional API keys: a missing key simply drops that provider from the
//! registry instead of failing startup.

use std::env;

/// Recognized `GATEWAY_LOG_FORMAT` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Assembled once at process startup from environment variables. Missing
/// optional variables degrade gracefully; see field docs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` if `OPENAI_API_KEY` is unset — the provider is simply not registered.
    pub openai_api_key: Option<String>,
    /// `None` if `ANTHROPIC_API_KEY` is unset.
    pub anthropic_api_key: Option<String>,
    /// `GATEWAY_LISTEN_ADDR`, default `127.0.0.1:8080`.
    pub listen_addr: String,
    /// `GATEWAY_PROMPT_DIR`, optional override directory for prompt templates.
    pub prompt_dir: Option<String>,
    /// `GATEWAY_WEB_SEARCH_API_KEY`, optional.
    pub web_search_api_key: Option<String>,
    /// `GATEWAY_LOG_FORMAT`, default [`LogFormat::Pretty`].
    pub log_format: LogFormat,
    /// Per-tool-call timeout in seconds, default 25 (SPEC_FULL.md §4.2).
    pub tool_timeout_secs: u64,
    /// Tool invocation concurrency limit, default 4 (SPEC_FULL.md §5).
    pub tool_concurrency: usize,
    /// Consecutive tool-bearing steps before the finalizer runs, default 8.
    pub max_consecutive_tool_steps: u32,
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let log_format = match env::var("GATEWAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            openai_api_key: non_empty("OPENAI_API_KEY"),
            anthropic_api_key: non_empty("ANTHROPIC_API_KEY"),
            listen_addr: non_empty("GATEWAY_LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            prompt_dir: non_empty("GATEWAY_PROMPT_DIR"),
            web_search_api_key: non_empty("GATEWAY_WEB_SEARCH_API_KEY"),
            log_format,
            tool_timeout_secs: 25,
            tool_concurrency: 4,
            max_consecutive_tool_steps: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("GATEWAY_LISTEN_ADDR");
        env::remove_var("OPENAI_API_KEY");
        let config = AppConfig::from_env();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn blank_api_key_is_treated_as_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("OPENAI_API_KEY", "   ");
        let config = AppConfig::from_env();
        assert!(config.openai_api_key.is_none());
        env::remove_var("OPENAI_API_KEY");
    }
}
