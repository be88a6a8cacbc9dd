// Tool Gateway
// Thin adapters over the external search, fetch, chat and embedding
// endpoints. Each adapter records latency and error counters and translates
// HTTP failures into typed errors; the pipeline stays agnostic of transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ToolEndpoints;
use crate::error::{FathomError, Result};
use crate::metrics::Metrics;
use crate::packer;

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// A fetched document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub max_tokens: i64,
    pub temperature: f32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.3,
        }
    }
}

/// External tool surface consumed by the pipeline executor.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Run the search tool chain; the hint leads the priority list.
    async fn search(&self, query: &str, hint: Option<&str>) -> Result<Vec<SearchResult>>;

    /// Fetch one document, preferring the workflow endpoint.
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;

    async fn chat(&self, messages: &[ChatMessage], opts: ChatOptions) -> Result<String>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Search tools tried in order until one returns a non-empty result set.
pub fn search_priority(hint: Option<&str>) -> Vec<String> {
    let mut tools: Vec<String> = Vec::new();
    if let Some(hint) = hint {
        let hint = hint.trim().to_lowercase();
        if !hint.is_empty() {
            tools.push(hint);
        }
    }
    for fallback in ["searxng", "workflow"] {
        if !tools.iter().any(|t| t == fallback) {
            tools.push(fallback.to_string());
        }
    }
    tools
}

/// Strip script/style blocks and tags, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let script = regex::Regex::new(r"(?is)<script.*?</script>").expect("script pattern");
    let style = regex::Regex::new(r"(?is)<style.*?</style>").expect("style pattern");
    let tag = regex::Regex::new(r"(?s)<[^>]+>").expect("tag pattern");

    let without_script = script.replace_all(html, " ");
    let without_style = style.replace_all(&without_script, " ");
    let without_tags = tag.replace_all(&without_style, " ");

    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the `<title>` text of an HTML document, if present.
pub fn extract_title(html: &str) -> Option<String> {
    let title = regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title pattern");
    title
        .captures(html)
        .map(|c| c[1].split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

/// True when an embedding rejection indicates the payload is too large.
pub fn is_token_exceeded_error(status: Option<u16>, message: &str) -> bool {
    if status == Some(413) {
        return true;
    }
    let lower = message.to_lowercase();
    lower.contains("token") || lower.contains("less than 512")
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Gateway over real HTTP endpoints.
pub struct HttpToolGateway {
    http: reqwest::Client,
    endpoints: ToolEndpoints,
    metrics: Arc<Metrics>,
}

impl HttpToolGateway {
    pub fn new(endpoints: ToolEndpoints, metrics: Arc<Metrics>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
            metrics,
        }
    }

    async fn search_with_tool(&self, tool: &str, query: &str) -> Result<Vec<SearchResult>> {
        match tool {
            "workflow" => {
                let url = self
                    .endpoints
                    .workflow_search_url
                    .as_deref()
                    .ok_or_else(|| FathomError::Tool("workflow search not configured".into()))?;
                let response = self
                    .http
                    .post(url)
                    .json(&serde_json::json!({ "query": query, "k": 10 }))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(FathomError::Tool(format!(
                        "workflow search returned {}",
                        response.status()
                    )));
                }
                Ok(response.json::<Vec<SearchResult>>().await?)
            }
            // searxng-compatible JSON API; also the default for unknown hints.
            _ => {
                let url = self
                    .endpoints
                    .search_url
                    .as_deref()
                    .ok_or_else(|| FathomError::Tool("search not configured".into()))?;
                let response = self
                    .http
                    .get(url)
                    .query(&[("q", query), ("format", "json")])
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(FathomError::Tool(format!(
                        "search returned {}",
                        response.status()
                    )));
                }
                #[derive(Deserialize)]
                struct SearxResponse {
                    #[serde(default)]
                    results: Vec<SearxResult>,
                }
                #[derive(Deserialize)]
                struct SearxResult {
                    #[serde(default)]
                    title: String,
                    url: String,
                    #[serde(default)]
                    content: String,
                }
                let parsed: SearxResponse = response.json().await?;
                Ok(parsed
                    .results
                    .into_iter()
                    .map(|r| SearchResult {
                        title: r.title,
                        url: r.url,
                        snippet: r.content,
                    })
                    .collect())
            }
        }
    }

    async fn fetch_direct(&self, url: &str) -> Result<FetchedPage> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FathomError::Tool(format!(
                "direct fetch of {} returned {}",
                url,
                response.status()
            )));
        }
        let body = response.text().await?;
        Ok(FetchedPage {
            url: url.to_string(),
            title: extract_title(&body).unwrap_or_default(),
            content: strip_html(&body),
        })
    }
}

#[async_trait]
impl ToolGateway for HttpToolGateway {
    async fn search(&self, query: &str, hint: Option<&str>) -> Result<Vec<SearchResult>> {
        let started = Instant::now();
        for tool in search_priority(hint) {
            match self.search_with_tool(&tool, query).await {
                Ok(results) if !results.is_empty() => {
                    self.metrics
                        .record_tool_latency("search", started.elapsed().as_millis());
                    return Ok(results);
                }
                Ok(_) => {
                    tracing::debug!(tool = tool.as_str(), "search returned no results");
                }
                Err(err) => {
                    self.metrics.record_tool_error("search");
                    tracing::warn!(tool = tool.as_str(), error = %err, "search tool failed");
                }
            }
        }
        self.metrics
            .record_tool_latency("search", started.elapsed().as_millis());
        // Exhaustion is not an error; the step turns partial.
        Ok(Vec::new())
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let started = Instant::now();

        if let Some(endpoint) = self.endpoints.fetch_url.as_deref() {
            let attempt = async {
                let response = self
                    .http
                    .post(endpoint)
                    .json(&serde_json::json!({ "url": url }))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(FathomError::Tool(format!(
                        "fetch workflow returned {}",
                        response.status()
                    )));
                }
                Ok::<FetchedPage, FathomError>(response.json::<FetchedPage>().await?)
            };
            match attempt.await {
                Ok(page) => {
                    self.metrics
                        .record_tool_latency("fetch", started.elapsed().as_millis());
                    return Ok(page);
                }
                Err(err) => {
                    self.metrics.record_tool_error("fetch");
                    tracing::warn!(url = url, error = %err, "fetch workflow failed, trying direct");
                }
            }
        }

        let result = self.fetch_direct(url).await;
        if result.is_err() {
            self.metrics.record_tool_error("fetch");
        }
        self.metrics
            .record_tool_latency("fetch", started.elapsed().as_millis());
        result
    }

    async fn chat(&self, messages: &[ChatMessage], opts: ChatOptions) -> Result<String> {
        let base = self
            .endpoints
            .llm_url
            .as_deref()
            .ok_or_else(|| FathomError::Tool("chat endpoint not configured".into()))?;
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.endpoints.llm_model.as_deref().unwrap_or("default"),
            "messages": messages,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
        });

        let started = Instant::now();
        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = self.endpoints.llm_api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|err| {
            self.metrics.record_tool_error("chat");
            FathomError::Tool(err.to_string())
        })?;
        if !response.status().is_success() {
            self.metrics.record_tool_error("chat");
            return Err(FathomError::Tool(format!(
                "chat returned {}",
                response.status()
            )));
        }
        let parsed: serde_json::Value = response.json().await?;
        self.metrics
            .record_tool_latency("chat", started.elapsed().as_millis());

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        Ok(content)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = self
            .endpoints
            .embed_url
            .as_deref()
            .ok_or_else(|| FathomError::Tool("embed endpoint not configured".into()))?;

        let started = Instant::now();
        let mut payload = packer::clamp_for_embedding(text);

        // Up to four attempts, shrinking the payload whenever the service
        // signals a token-size rejection.
        let mut last_err = FathomError::Tool("embed failed".into());
        for _ in 0..4 {
            let response = self
                .http
                .post(url)
                .json(&serde_json::json!({ "input": payload }))
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: serde_json::Value = response.json().await?;
                        self.metrics
                            .record_tool_latency("embed", started.elapsed().as_millis());
                        let vector = parsed["data"][0]["embedding"]
                            .as_array()
                            .or_else(|| parsed["embedding"].as_array())
                            .map(|values| {
                                values
                                    .iter()
                                    .filter_map(|v| v.as_f64())
                                    .map(|v| v as f32)
                                    .collect::<Vec<f32>>()
                            })
                            .unwrap_or_default();
                        if vector.is_empty() {
                            return Err(FathomError::Tool("embed response had no vector".into()));
                        }
                        return Ok(vector);
                    }

                    let message = response.text().await.unwrap_or_default();
                    self.metrics.record_tool_error("embed");
                    if is_token_exceeded_error(Some(status.as_u16()), &message) {
                        payload = packer::shrink_once(&payload);
                        last_err =
                            FathomError::Tool(format!("embed rejected payload: {}", message));
                        continue;
                    }
                    return Err(FathomError::Tool(format!(
                        "embed returned {}: {}",
                        status, message
                    )));
                }
                Err(err) => {
                    self.metrics.record_tool_error("embed");
                    return Err(FathomError::Tool(err.to_string()));
                }
            }
        }
        Err(last_err)
    }
}

// ============================================================================
// Tests
// ============================================================================
