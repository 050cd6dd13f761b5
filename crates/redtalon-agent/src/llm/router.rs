//! Multi-provider LLM failover router.
//!
//! One operation: [`LlmRouter::chat`].  Providers are tried in priority
//! order; within a provider the call is retried through transient failures
//! (429 with extracted retry delays, 5xx, timeouts) and adapted around
//! capability gaps (prompt-based tool calling for endpoints without native
//! tool support, adaptive `max_tokens` on context rejections).  Only when a
//! provider's retry budget is exhausted does the router move down the
//! chain; when the chain is exhausted the caller gets one aggregated error.
//!
//! Before every request the conversation is auto-compacted against the
//! target model's context window and repaired for tool-call consistency.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::llm::compaction::auto_compact;
use crate::llm::consistency::fix_message_list;
use crate::llm::limits::context_limit;
use crate::llm::prompt_tools::{inject_tool_instructions, parse_tool_calls};
use crate::llm::types::{
    ChatMessage, ChatOutcome, ProviderConfig, Role, ToolCall, ToolSchema, Usage,
};

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// A raw HTTP reply: status plus body text.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// HTTP layer behind the router.  Production uses [`HttpTransport`]; tests
/// script status-code sequences.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// POST a JSON body, returning status and body text.
    async fn post_json(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
        timeout: Duration,
    ) -> Result<HttpReply>;

    /// GET a URL (health checks).
    async fn get(&self, url: &str, api_key: Option<&str>, timeout: Duration) -> Result<HttpReply>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Http {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let mut request = self.client.post(url).timeout(timeout).json(body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::HttpTimeout {
                    seconds: timeout.as_secs(),
                }
            } else {
                AgentError::Http {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpReply { status, body })
    }

    async fn get(&self, url: &str, api_key: Option<&str>, timeout: Duration) -> Result<HttpReply> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::HttpTimeout {
                    seconds: timeout.as_secs(),
                }
            } else {
                AgentError::Http {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpReply { status, body })
    }
}

// ---------------------------------------------------------------------------
// Retry-delay extraction
// ---------------------------------------------------------------------------

static RETRY_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Rr]etry[_-]?[Aa]fter[\s:]+(\d+)").expect("valid regex"));
static WAIT_SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)wait\s+(\d+)\s+seconds?").expect("valid regex"));
static BARE_SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)s\b").expect("valid regex"));
static MILLISECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*m(?:illi)?s(?:econds?)?\b").expect("valid regex"));
static INPUT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*input\s*tokens").expect("valid regex"));

/// Pull a retry delay (seconds) out of a rate-limit error body.
pub fn extract_retry_delay(body: &str, default: u64) -> u64 {
    if let Some(c) = RETRY_AFTER.captures(body) {
        if let Ok(n) = c[1].parse() {
            return n;
        }
    }
    if let Some(c) = WAIT_SECONDS.captures(body) {
        if let Ok(n) = c[1].parse() {
            return n;
        }
    }
    if let Some(c) = BARE_SECONDS.captures(body) {
        if let Ok(n) = c[1].parse() {
            return n;
        }
    }
    if let Some(c) = MILLISECONDS.captures(body) {
        if let Ok(n) = c[1].parse::<u64>() {
            return (n / 1000).max(1);
        }
    }
    default
}

fn is_rate_limit_body(lower: &str) -> bool {
    ["rate_limit", "rate limit", "ratelimit", "too many requests", "quota", "throttl"]
        .iter()
        .any(|kw| lower.contains(kw))
}

/// Sub-second jitter from the wall clock; avoids a dependency on a PRNG for
/// what is only backoff de-synchronization.
fn jitter_secs(max: u64) -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (f64::from(nanos) / f64::from(u32::MAX)) * max as f64
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Token bucket refilled continuously at `rpm / 60` tokens per second.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

async fn acquire_token(bucket: &tokio::sync::Mutex<TokenBucket>, rpm_limit: u32) {
    let rate = f64::from(rpm_limit) / 60.0;
    let mut b = bucket.lock().await;

    let elapsed = b.last_refill.elapsed().as_secs_f64();
    b.last_refill = Instant::now();
    b.tokens = (b.tokens + elapsed * rate).min(f64::from(rpm_limit));

    if b.tokens >= 1.0 {
        b.tokens -= 1.0;
        return;
    }

    let wait = (1.0 - b.tokens) / rate;
    debug!(wait_secs = wait, "rate limiter waiting for token");
    // Hold the bucket while waiting so callers on the same provider queue up.
    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
    b.tokens = 0.0;
    b.last_refill = Instant::now();
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// Per-call metrics retained on the router.
#[derive(Debug, Clone)]
pub struct CallMetrics {
    pub provider: String,
    pub model: String,
    pub latency: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub success: bool,
    pub error: Option<String>,
}

/// Router-level counters.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// The provider that served the most recent successful call.
    pub active_provider: Option<String>,
    pub request_count: u64,
    pub token_count: u64,
}

/// Reachability of one provider endpoint.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub reachable: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

const ADAPTIVE_MAX_TOKENS_RETRIES: u32 = 2;
const MAX_TOKENS_FLOOR: u32 = 256;
const CONTEXT_SAFETY_MARGIN: u32 = 64;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered, retrying, rate-limited chat client over one or more OpenAI-style
/// endpoints.
pub struct LlmRouter {
    providers: Vec<ProviderConfig>,
    transport: Arc<dyn ChatTransport>,
    buckets: HashMap<String, Arc<tokio::sync::Mutex<TokenBucket>>>,
    stats: Mutex<RouterStats>,
    metrics: Mutex<Vec<CallMetrics>>,
}

impl LlmRouter {
    /// Build a router over `providers` with the production HTTP transport.
    pub fn new(providers: Vec<ProviderConfig>) -> Result<Self> {
        Ok(Self::with_transport(
            providers,
            Arc::new(HttpTransport::new()?),
        ))
    }

    /// Build a router with an explicit transport (tests).
    pub fn with_transport(mut providers: Vec<ProviderConfig>, transport: Arc<dyn ChatTransport>) -> Self {
        providers.sort_by_key(|p| p.priority);
        let buckets = providers
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    Arc::new(tokio::sync::Mutex::new(TokenBucket {
                        tokens: f64::from(p.rpm_limit),
                        last_refill: Instant::now(),
                    })),
                )
            })
            .collect();
        Self {
            providers,
            transport,
            buckets,
            stats: Mutex::new(RouterStats::default()),
            metrics: Mutex::new(Vec::new()),
        }
    }

    /// The configured provider chain in failover order.
    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Send a chat request with automatic failover across the provider
    /// chain.  With `tools`, the model may answer with tool calls.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatOutcome> {
        if self.providers.is_empty() {
            return Err(AgentError::NoProviders);
        }

        let mut failures: Vec<String> = Vec::new();

        for provider in &self.providers {
            debug!(provider = %provider.name, model = %provider.model, "trying provider");
            match self.call_provider(provider, messages, tools).await {
                Ok(outcome) => {
                    self.record_success(provider, &outcome);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(provider = %provider.name, error = %e, "provider failed, trying next");
                    self.record_failure(provider, &e);
                    failures.push(format!("{}: {e}", provider.name));
                }
            }
        }

        Err(AgentError::AllProvidersFailed {
            count: self.providers.len(),
            details: failures.join("\n"),
        })
    }

    /// One provider's full retry loop.
    async fn call_provider(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatOutcome> {
        let url = format!("{}/chat/completions", provider.normalized_endpoint());
        let timeout = Duration::from_secs(provider.timeout_secs);

        let mut max_tokens = provider.max_tokens;
        let mut max_tokens_retries = 0u32;
        let mut last_error = AgentError::ProviderRejected {
            provider: provider.name.clone(),
            reason: "no attempts made".to_string(),
        };

        let mut attempt = 0u32;
        while attempt < provider.retry_count.max(1) {
            attempt += 1;

            if let Some(bucket) = self.buckets.get(&provider.name) {
                acquire_token(bucket, provider.rpm_limit).await;
            }

            // Fit the conversation to this model and repair consistency.
            let (compacted, _) = auto_compact(messages, &provider.model);
            let prepared = fix_message_list(compacted);

            let body = build_request_body(provider, &prepared, tools, max_tokens);
            let started = Instant::now();

            let reply = self
                .transport
                .post_json(&url, provider.api_key.as_deref(), &body, timeout)
                .await;

            match reply {
                Ok(reply) if reply.status == 200 => {
                    return parse_chat_response(
                        &reply.body,
                        &provider.model,
                        started.elapsed().as_secs_f64(),
                    );
                }

                Ok(reply) if reply.status == 400 => {
                    let lower = reply.body.to_lowercase();

                    // Endpoint lacks native tool calling — same provider,
                    // prompt-based mode.
                    if tools.is_some() && (lower.contains("tool") || lower.contains("auto")) {
                        info!(
                            provider = %provider.name,
                            "native tool calling unavailable, switching to prompt-based mode"
                        );
                        return self
                            .call_prompt_tools(provider, &prepared, tools.unwrap_or_default())
                            .await;
                    }

                    // Response budget too large for the context.
                    if lower.contains("max_tokens") || lower.contains("max_completion_tokens") {
                        if max_tokens_retries < ADAPTIVE_MAX_TOKENS_RETRIES {
                            max_tokens_retries += 1;
                            max_tokens = adaptive_max_tokens(&reply.body, &provider.model, max_tokens);
                            info!(provider = %provider.name, max_tokens, "retrying with reduced max_tokens");
                            continue;
                        }
                    }

                    return Err(AgentError::ProviderRejected {
                        provider: provider.name.clone(),
                        reason: format!("HTTP 400: {}", excerpt(&reply.body)),
                    });
                }

                Ok(reply) if reply.status == 404 => {
                    let lower = reply.body.to_lowercase();
                    if tools.is_some()
                        && (lower.contains("tool use") || lower.contains("endpoints"))
                    {
                        info!(
                            provider = %provider.name,
                            "model does not support tool use (404), switching to prompt-based mode"
                        );
                        return self
                            .call_prompt_tools(provider, &prepared, tools.unwrap_or_default())
                            .await;
                    }
                    return Err(AgentError::ProviderRejected {
                        provider: provider.name.clone(),
                        reason: format!("HTTP 404: {}", excerpt(&reply.body)),
                    });
                }

                Ok(reply)
                    if reply.status == 429 || is_rate_limit_body(&reply.body.to_lowercase()) =>
                {
                    let delay = extract_retry_delay(&reply.body, 60);
                    let sleep_secs =
                        (delay.saturating_mul(u64::from(attempt))).min(300) as f64 + jitter_secs(10);
                    warn!(
                        provider = %provider.name,
                        attempt,
                        sleep_secs,
                        "rate limited, backing off"
                    );
                    last_error = AgentError::ProviderRejected {
                        provider: provider.name.clone(),
                        reason: format!("rate limited (HTTP {})", reply.status),
                    };
                    tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
                }

                Ok(reply) if reply.status >= 500 => {
                    let backoff = f64::from(2u32.saturating_pow(attempt)) + jitter_secs(1);
                    warn!(
                        provider = %provider.name,
                        status = reply.status,
                        attempt,
                        backoff,
                        "server error, backing off"
                    );
                    last_error = AgentError::ProviderRejected {
                        provider: provider.name.clone(),
                        reason: format!("HTTP {}: {}", reply.status, excerpt(&reply.body)),
                    };
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                }

                Ok(reply) => {
                    // Unexpected status — abandon this provider.
                    return Err(AgentError::ProviderRejected {
                        provider: provider.name.clone(),
                        reason: format!("HTTP {}: {}", reply.status, excerpt(&reply.body)),
                    });
                }

                Err(AgentError::HttpTimeout { seconds }) => {
                    let backoff = f64::from(2u32.saturating_pow(attempt)) + jitter_secs(1);
                    warn!(provider = %provider.name, attempt, backoff, "request timed out, backing off");
                    last_error = AgentError::HttpTimeout { seconds };
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                }

                Err(e) => {
                    // Connection-level failure — abandon this provider.
                    return Err(e);
                }
            }
        }

        Err(last_error)
    }

    /// Prompt-based tool-calling path for providers without native support.
    async fn call_prompt_tools(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatOutcome> {
        let url = format!("{}/chat/completions", provider.normalized_endpoint());
        let timeout = Duration::from_secs(provider.timeout_secs);
        let prompted = inject_tool_instructions(messages, tools);

        // Start conservative; the inner loop adapts on max_tokens rejections.
        let mut max_tokens = provider.max_tokens.min(1024);
        let started = Instant::now();

        for _ in 0..=ADAPTIVE_MAX_TOKENS_RETRIES {
            let body = build_request_body(provider, &prompted, None, max_tokens);
            let reply = self
                .transport
                .post_json(&url, provider.api_key.as_deref(), &body, timeout)
                .await?;

            if reply.status == 400 {
                let lower = reply.body.to_lowercase();
                if lower.contains("max_tokens") || lower.contains("max_completion_tokens") {
                    max_tokens = adaptive_max_tokens(&reply.body, &provider.model, max_tokens);
                    info!(provider = %provider.name, max_tokens, "prompt-tools adaptive max_tokens retry");
                    continue;
                }
                return Err(AgentError::ProviderRejected {
                    provider: provider.name.clone(),
                    reason: format!("HTTP 400 (prompt-tools): {}", excerpt(&reply.body)),
                });
            }
            if reply.status != 200 {
                return Err(AgentError::ProviderRejected {
                    provider: provider.name.clone(),
                    reason: format!("HTTP {} (prompt-tools): {}", reply.status, excerpt(&reply.body)),
                });
            }

            let outcome =
                parse_chat_response(&reply.body, &provider.model, started.elapsed().as_secs_f64())?;

            // Pull tool calls out of the free text and strip them (plus any
            // hallucinated tool responses) from the content.
            let (cleaned, calls) = parse_tool_calls(&outcome.content);
            return Ok(ChatOutcome {
                content: cleaned,
                tool_calls: calls,
                ..outcome
            });
        }

        Err(AgentError::ProviderRejected {
            provider: provider.name.clone(),
            reason: "prompt-tools: max_tokens could not fit within the context window".to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Health and stats
    // -----------------------------------------------------------------------

    /// Probe `GET {endpoint}/models` for every provider.
    pub async fn health_check(&self) -> HashMap<String, ProviderHealth> {
        let mut results = HashMap::new();
        for provider in &self.providers {
            let url = format!("{}/models", provider.normalized_endpoint());
            let health = match self
                .transport
                .get(&url, provider.api_key.as_deref(), HEALTH_CHECK_TIMEOUT)
                .await
            {
                Ok(reply) => ProviderHealth {
                    reachable: reply.status == 200,
                    status: Some(reply.status),
                    error: None,
                },
                Err(e) => ProviderHealth {
                    reachable: false,
                    status: None,
                    error: Some(e.to_string()),
                },
            };
            results.insert(provider.name.clone(), health);
        }
        results
    }

    /// Router-level counters.
    pub fn stats(&self) -> RouterStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Per-call metrics log.
    pub fn metrics(&self) -> Vec<CallMetrics> {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn record_success(&self, provider: &ProviderConfig, outcome: &ChatOutcome) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.active_provider = Some(provider.name.clone());
            stats.request_count += 1;
            stats.token_count += u64::from(outcome.usage.total_tokens);
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.push(CallMetrics {
                provider: provider.name.clone(),
                model: outcome.model.clone(),
                latency: outcome.latency,
                prompt_tokens: outcome.usage.prompt_tokens,
                completion_tokens: outcome.usage.completion_tokens,
                success: true,
                error: None,
            });
        }
    }

    fn record_failure(&self, provider: &ProviderConfig, error: &AgentError) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.push(CallMetrics {
                provider: provider.name.clone(),
                model: provider.model.clone(),
                latency: 0.0,
                prompt_tokens: 0,
                completion_tokens: 0,
                success: false,
                error: Some(error.to_string()),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response translation
// ---------------------------------------------------------------------------

fn build_request_body(
    provider: &ProviderConfig,
    messages: &[ChatMessage],
    tools: Option<&[ToolSchema]>,
    max_tokens: u32,
) -> Value {
    let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();

    let mut body = json!({
        "model": provider.model,
        "messages": wire_messages,
        "max_tokens": max_tokens,
        "temperature": provider.temperature,
        "stream": false,
    });

    if let Some(tools) = tools {
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolSchema::to_wire).collect());
            body["tool_choice"] = json!("auto");
        }
    }

    body
}

fn message_to_wire(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        },
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": msg.content,
                "tool_calls": calls,
            })
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
        _ => json!({
            "role": msg.role.as_str(),
            "content": msg.content,
        }),
    }
}

fn parse_chat_response(body: &str, fallback_model: &str, latency: f64) -> Result<ChatOutcome> {
    let v: Value = serde_json::from_str(body).map_err(|e| AgentError::ParseFailed {
        reason: format!("invalid JSON response: {e}"),
    })?;

    let choice = v["choices"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or_else(|| AgentError::ParseFailed {
            reason: "missing `choices` in response".to_string(),
        })?;
    let message = &choice["message"];

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for tc in calls {
            let arguments_raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(arguments_raw).unwrap_or(Value::Object(Default::default()));
            tool_calls.push(ToolCall {
                id: tc["id"].as_str().unwrap_or_default().to_string(),
                name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments,
            });
        }
    }

    let usage = Usage {
        prompt_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: v["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: v["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(ChatOutcome {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        finish_reason: choice["finish_reason"].as_str().unwrap_or_default().to_string(),
        usage,
        model: v["model"].as_str().unwrap_or(fallback_model).to_string(),
        latency,
    })
}

/// Next `max_tokens` after a context rejection: derived from the reported
/// input-token count when the body reveals it, otherwise halved.
fn adaptive_max_tokens(body: &str, model: &str, current: u32) -> u32 {
    if let Some(c) = INPUT_TOKENS.captures(body) {
        if let Ok(input) = c[1].parse::<u32>() {
            let limit = context_limit(model) as u32;
            return limit
                .saturating_sub(input)
                .saturating_sub(CONTEXT_SAFETY_MARGIN)
                .max(MAX_TOKENS_FLOOR);
        }
    }
    (current / 2).max(MAX_TOKENS_FLOOR)
}

fn excerpt(body: &str) -> String {
    body.chars().take(200).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
