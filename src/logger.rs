//! Structured logging setup (SPEC_FULL.md §4.13): a single `tracing_subscriber`
//! init at process startup, in the format named by `GATEWAY_LOG_FORMAT`.
//! Every request is wrapped in a span carrying `request_id`/`provider`/`model`
//! (see `http::chat`/`http::chat_stream`); tool calls and provider calls log
//! start/stop/duration at `debug` from within the runner and adapters.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Initializes the global `tracing` subscriber. Must be called exactly once,
/// before the first log line — calling it twice panics, matching
/// `tracing_subscriber`'s own global-dispatcher contract.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}
