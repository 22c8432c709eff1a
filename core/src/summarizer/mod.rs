//! Summarizer client.
//!
//! Turns a (tool name, raw content, optional user query, model) tuple into
//! a summary string via an HTTP backend: either the dedicated compression
//! service or a vanilla chat endpoint of a configured provider. The client
//! owns both throughput limits (in-flight semaphore, token-bucket rate
//! limiter); callers just fan out.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use shadowgate_protocol::CompressionStrategy;
use shadowgate_protocol::ProviderConfig;
use shadowgate_protocol::ToolOutputPipeConfig;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::error::excerpt;
use crate::http_util::read_body_capped;

mod rate_limit;

pub use rate_limit::RateLimiter;

/// Default cap on concurrent summarizer calls.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Default sustained call rate (per second) and burst capacity.
pub const DEFAULT_RATE_PER_SEC: f64 = 20.0;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// System prompt for direct-provider summarization calls.
const SUMMARIZE_SYSTEM_PROMPT: &str = "You compress tool output for an AI coding agent. \
Produce a dense, factual summary that preserves identifiers, paths, error messages, and \
counts. Do not add commentary. Do not mention that this is a summary.";

/// One summarization request.
#[derive(Debug, Clone, Copy)]
pub struct SummarizeRequest<'a> {
    pub tool_name: &'a str,
    pub content: &'a str,
    pub user_query: Option<&'a str>,
    pub source_provider: &'a str,
    pub model: &'a str,
    pub max_tokens: Option<u32>,
}

/// A produced summary plus backend-reported metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub content: String,
    pub cache_hit: bool,
    pub processing_time_ms: Option<u64>,
}

/// Seam between the pipe and the HTTP world; tests substitute a mock.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        request: SummarizeRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Summary>;
}

/// Which HTTP shape the client talks to.
#[derive(Debug, Clone)]
pub enum SummarizerBackend {
    /// Dedicated compression service speaking the JSON envelope protocol.
    CompressionService { endpoint: String, api_key: String },
    /// One-turn chat call against a provider endpoint.
    DirectProvider {
        endpoint: String,
        api_key: String,
        dialect: ProviderDialect,
        model: String,
    },
}

/// Wire dialect of a direct-provider summarization endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderDialect {
    Anthropic,
    OpenAiChat,
}

impl ProviderDialect {
    /// Infer the dialect from an endpoint URL when config leaves it unset.
    pub fn infer(url: &str) -> Self {
        if url.contains("/messages") {
            ProviderDialect::Anthropic
        } else {
            ProviderDialect::OpenAiChat
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "anthropic" => Some(ProviderDialect::Anthropic),
            "openai" | "openai_chat" => Some(ProviderDialect::OpenAiChat),
            _ => None,
        }
    }
}

pub struct SummarizerClient {
    http: reqwest::Client,
    backend: SummarizerBackend,
    call_timeout: Duration,
    query_agnostic: bool,
    max_retries: u32,
    semaphore: Semaphore,
    limiter: RateLimiter,
}

impl SummarizerClient {
    pub fn new(backend: SummarizerBackend, call_timeout: Duration, query_agnostic: bool) -> Self {
        Self::with_limits(
            backend,
            call_timeout,
            query_agnostic,
            0,
            DEFAULT_MAX_IN_FLIGHT,
            DEFAULT_RATE_PER_SEC,
        )
    }

    pub fn with_limits(
        backend: SummarizerBackend,
        call_timeout: Duration,
        query_agnostic: bool,
        max_retries: u32,
        max_in_flight: usize,
        rate_per_sec: f64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            backend,
            call_timeout,
            query_agnostic,
            max_retries,
            semaphore: Semaphore::new(max_in_flight),
            limiter: RateLimiter::new(rate_per_sec, rate_per_sec),
        }
    }

    /// Build a client from the pipe config and the named-provider table.
    pub fn from_config(
        pipe: &ToolOutputPipeConfig,
        compression_service_url: &str,
        providers: &HashMap<String, ProviderConfig>,
    ) -> Result<Self> {
        let use_direct = pipe.strategy == CompressionStrategy::ExternalProvider;
        let backend = match pipe.provider.as_ref().filter(|_| use_direct) {
            Some(name) => {
                let provider = providers.get(name).ok_or_else(|| GatewayErr::Config {
                    field: "pipes.tool_output.provider".to_string(),
                    cause: format!("unknown provider '{name}'"),
                })?;
                let dialect = match provider.dialect.as_deref() {
                    Some(dialect_name) => {
                        ProviderDialect::parse(dialect_name).ok_or_else(|| GatewayErr::Config {
                            field: format!("providers.{name}.dialect"),
                            cause: format!("unknown dialect '{dialect_name}'"),
                        })?
                    }
                    None => ProviderDialect::infer(&provider.base_url),
                };
                SummarizerBackend::DirectProvider {
                    endpoint: provider.base_url.clone(),
                    api_key: provider.api_key.clone(),
                    dialect,
                    model: provider.model.clone(),
                }
            }
            None => {
                let endpoint = if pipe.api.endpoint.is_empty() {
                    format!("{}/compress", compression_service_url.trim_end_matches('/'))
                } else {
                    pipe.api.endpoint.clone()
                };
                SummarizerBackend::CompressionService {
                    endpoint,
                    api_key: pipe.api.api_key.clone(),
                }
            }
        };
        Ok(Self::with_limits(
            backend,
            Duration::from_secs(pipe.api.timeout_secs),
            pipe.api.query_agnostic,
            pipe.api.max_retries,
            DEFAULT_MAX_IN_FLIGHT,
            DEFAULT_RATE_PER_SEC,
        ))
    }

    async fn call_backend(&self, request: SummarizeRequest<'_>) -> Result<Summary> {
        match &self.backend {
            SummarizerBackend::CompressionService { endpoint, api_key } => {
                self.call_compression_service(endpoint, api_key, request).await
            }
            SummarizerBackend::DirectProvider {
                endpoint,
                api_key,
                dialect,
                model,
            } => {
                self.call_direct_provider(endpoint, api_key, *dialect, model, request)
                    .await
            }
        }
    }

    async fn call_compression_service(
        &self,
        endpoint: &str,
        api_key: &str,
        request: SummarizeRequest<'_>,
    ) -> Result<Summary> {
        let user_query = if self.query_agnostic {
            None
        } else {
            request.user_query
        };
        let envelope = CompressEnvelope {
            content: request.content,
            tool_name: request.tool_name,
            user_query,
            source_provider: request.source_provider,
            model: request.model,
            max_tokens: request.max_tokens,
        };

        let mut builder = self.http.post(endpoint).json(&envelope);
        if !api_key.is_empty() {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayErr::Compression(format!("transport: {e}")))?;

        let status = response.status();
        let body = read_body_capped(response)
            .await
            .map_err(|e| GatewayErr::Compression(e.to_string()))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(GatewayErr::Compression(format!(
                "service returned {status}: {}",
                excerpt(&text)
            )));
        }

        let parsed: CompressResponse = serde_json::from_slice(&body)
            .map_err(|e| GatewayErr::Compression(format!("invalid service response: {e}")))?;
        if !parsed.success {
            let reason = parsed.error.unwrap_or_else(|| "unspecified error".to_string());
            return Err(GatewayErr::Compression(reason));
        }
        let data = parsed
            .data
            .ok_or_else(|| GatewayErr::Compression("success without data".to_string()))?;
        validate_summary(&data.content, request.content)?;
        Ok(Summary {
            content: data.content,
            cache_hit: data.cache_hit.unwrap_or(false),
            processing_time_ms: data.processing_time_ms,
        })
    }

    async fn call_direct_provider(
        &self,
        endpoint: &str,
        api_key: &str,
        dialect: ProviderDialect,
        model: &str,
        request: SummarizeRequest<'_>,
    ) -> Result<Summary> {
        let user_content = build_user_content(request, self.query_agnostic);
        let max_tokens = request.max_tokens.unwrap_or(1024);
        let payload = match dialect {
            ProviderDialect::Anthropic => json!({
                "model": model,
                "max_tokens": max_tokens,
                "temperature": 0,
                "system": SUMMARIZE_SYSTEM_PROMPT,
                "messages": [{"role": "user", "content": user_content}],
            }),
            ProviderDialect::OpenAiChat => json!({
                "model": model,
                "max_tokens": max_tokens,
                "temperature": 0,
                "messages": [
                    {"role": "system", "content": SUMMARIZE_SYSTEM_PROMPT},
                    {"role": "user", "content": user_content},
                ],
            }),
        };

        let mut builder = self.http.post(endpoint).json(&payload);
        builder = match dialect {
            ProviderDialect::Anthropic => builder
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
            ProviderDialect::OpenAiChat => builder.bearer_auth(api_key),
        };
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayErr::Compression(format!("transport: {e}")))?;

        let status = response.status();
        let body = read_body_capped(response)
            .await
            .map_err(|e| GatewayErr::Compression(e.to_string()))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(GatewayErr::Compression(format!(
                "provider returned {status}: {}",
                excerpt(&text)
            )));
        }

        let parsed: JsonValue = serde_json::from_slice(&body)
            .map_err(|e| GatewayErr::Compression(format!("invalid provider response: {e}")))?;
        let content = extract_assistant_text(&parsed, dialect);
        validate_summary(&content, request.content)?;
        Ok(Summary {
            content,
            cache_hit: false,
            processing_time_ms: None,
        })
    }
}

#[async_trait]
impl Summarizer for SummarizerClient {
    async fn summarize(
        &self,
        request: SummarizeRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Summary> {
        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => {
                permit.map_err(|_| GatewayErr::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(GatewayErr::Cancelled),
        };
        self.limiter.acquire(cancel).await?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                result = timeout(self.call_timeout, self.call_backend(request)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(GatewayErr::Timeout),
                    }
                }
                _ = cancel.cancelled() => return Err(GatewayErr::Cancelled),
            };
            match outcome {
                Ok(summary) => return Ok(summary),
                Err(err) if attempt < self.max_retries && retryable(&err) => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %err, "retrying summarizer call");
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn retryable(err: &GatewayErr) -> bool {
    match err {
        GatewayErr::Timeout => true,
        GatewayErr::Compression(reason) => reason.starts_with("transport:"),
        _ => false,
    }
}

fn build_user_content(request: SummarizeRequest<'_>, query_agnostic: bool) -> String {
    let mut content = String::new();
    if !query_agnostic
        && let Some(query) = request.user_query
        && !query.is_empty()
    {
        content.push_str(&format!("User query: {query}\n\n"));
    }
    content.push_str(&format!("Tool: {}\n\n{}", request.tool_name, request.content));
    content
}

fn extract_assistant_text(response: &JsonValue, dialect: ProviderDialect) -> String {
    match dialect {
        ProviderDialect::Anthropic => response["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default(),
        ProviderDialect::OpenAiChat => response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    }
}

fn validate_summary(summary: &str, original: &str) -> Result<()> {
    if summary.trim().is_empty() {
        return Err(GatewayErr::Compression("empty summary".to_string()));
    }
    if summary.len() >= original.len() {
        return Err(GatewayErr::Compression(
            "summary not smaller than original".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CompressEnvelope<'a> {
    content: &'a str,
    tool_name: &'a str,
    user_query: Option<&'a str>,
    source_provider: &'a str,
    model: &'a str,
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompressResponse {
    success: bool,
    #[serde(default)]
    data: Option<CompressData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompressData {
    content: String,
    #[serde(default)]
    #[allow(dead_code)]
    original_size: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    compressed_size: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    compression_ratio: Option<f64>,
    #[serde(default)]
    cache_hit: Option<bool>,
    #[serde(default)]
    processing_time_ms: Option<u64>,
}
