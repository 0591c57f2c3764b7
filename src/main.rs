use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use llm_gateway_runner::config::AppConfig;
use llm_gateway_runner::http::{build_router, AppState};
use llm_gateway_runner::logger;
use llm_gateway_runner::prompt::PromptRegistry;
use llm_gateway_runner::provider::anthropic::AnthropicProvider;
use llm_gateway_runner::provider::mock::{MockProvider, MockTurn};
use llm_gateway_runner::provider::openai::OpenAiProvider;
use llm_gateway_runner::provider::Provider;
use llm_gateway_runner::tools::bash::BashTool;
use llm_gateway_runner::tools::web_search::WebSearchTool;
use llm_gateway_runner::tools::{ToolErrorPolicy, ToolInvoker, ToolProviderExt, ToolRegistry};

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env();
    logger::init(config.log_format);

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    if let Some(key) = &config.openai_api_key {
        providers.insert("openai".to_string(), Arc::new(OpenAiProvider::new(key.clone(), "gpt-4o-mini")));
    }
    if let Some(key) = &config.anthropic_api_key {
        providers.insert(
            "anthropic".to_string(),
            Arc::new(AnthropicProvider::new(key.clone(), "claude-3-5-sonnet-20241022")),
        );
    }
    if providers.is_empty() {
        tracing::warn!("no provider API keys configured; registering the mock provider for local development");
        providers.insert(
            "mock".to_string(),
            Arc::new(MockProvider::new(vec![MockTurn::text(
                "This is the mock provider; set OPENAI_API_KEY or ANTHROPIC_API_KEY to talk to a real model.",
            )])),
        );
    }

    let mut tools = ToolRegistry::new();
    tools
        .register(BashTool::new().into_handle())
        .expect("bash is the first tool registered");
    tools
        .register(WebSearchTool::new(config.web_search_api_key.clone()).into_handle())
        .expect("web_search is the second tool registered");

    let invoker = ToolInvoker::new(
        config.tool_concurrency,
        Duration::from_secs(config.tool_timeout_secs),
        ToolErrorPolicy::AppendAndContinue,
    );

    let prompts = PromptRegistry::new(config.prompt_dir.clone());
    let listen_addr = config.listen_addr.clone();

    let state = Arc::new(AppState {
        config,
        providers,
        tools: Arc::new(tools),
        prompts,
        invoker: Arc::new(invoker),
    });

    let app = build_router(state);

    tracing::info!(addr = %listen_addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {listen_addr}: {e}"));
    axum::serve(listener, app).await.expect("server exited unexpectedly");
}
