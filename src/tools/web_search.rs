//! Web search tool: calls a configurable external search endpoint.
//!
//! The real search backend is an external collaborator (SPEC_FULL.md §4.2);
//! without an API key the tool degrades to a typed "not configured" error
//! rather than failing registration, so `GET /api/providers` can still list
//! it as a known tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ToolProvider;

const DEFAULT_ENDPOINT: &str = "https://api.bing.microsoft.com/v7.0/search";

pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "webPages", default)]
    web_pages: Option<WebPages>,
}

#[derive(Debug, Deserialize)]
struct WebPages {
    #[serde(default)]
    value: Vec<WebPage>,
}

#[derive(Debug, Deserialize)]
struct WebPage {
    name: String,
    url: String,
    snippet: String,
}

#[async_trait]
impl ToolProvider for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top matching pages with title, URL, and snippet."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query."}
            },
            "required": ["query"]
        })
    }

    async fn call(&self, input: Value) -> Result<Value, String> {
        let Some(api_key) = &self.api_key else {
            return Err("web_search not configured: no GATEWAY_WEB_SEARCH_API_KEY set".to_string());
        };
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .ok_or("missing 'query' argument")?;

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .header("Ocp-Apim-Subscription-Key", api_key)
            .send()
            .await
            .map_err(|e| format!("web search request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("web search returned HTTP {}", response.status()));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| format!("failed to parse web search response: {e}"))?;

        let results = parsed
            .web_pages
            .map(|pages| pages.value)
            .unwrap_or_default()
            .into_iter()
            .map(|page| json!({"title": page.name, "url": page.url, "snippet": page.snippet}))
            .collect::<Vec<_>>();

        Ok(json!({"results": results}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn errors_clearly_when_not_configured() {
        let tool = WebSearchTool::new(None);
        let err = tool.call(json!({"query": "rust async"})).await.unwrap_err();
        assert!(err.contains("not configured"));
    }

    #[tokio::test]
    async fn requires_query_argument() {
        let tool = WebSearchTool::new(Some("key".to_string()));
        assert!(tool.call(json!({})).await.is_err());
    }
}
