//! Configuration type tree for the gateway.
//!
//! Loaded from YAML after environment-variable expansion; every field that
//! has a sensible default carries one so a minimal config file stays small.
//! Validation is explicit (`GatewayConfig::validate`) and reports the
//! offending field path so misconfiguration surfaces at startup, not on the
//! first request.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub server: ServerConfig,

    pub urls: UrlsConfig,

    #[serde(default)]
    pub pipes: PipesConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Named upstream providers referenced by `pipes.tool_output.provider`.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl GatewayConfig {
    /// Validate the whole tree, returning the first offending field path.
    pub fn validate(&self) -> Result<(), ConfigFieldError> {
        self.server.validate()?;
        self.pipes.tool_output.validate()?;
        self.store.validate()?;
        if let Some(name) = &self.pipes.tool_output.provider
            && self.pipes.tool_output.strategy == CompressionStrategy::ExternalProvider
            && !self.providers.contains_key(name)
        {
            return Err(ConfigFieldError {
                field: "pipes.tool_output.provider".to_string(),
                cause: format!("references unknown provider '{name}'"),
            });
        }
        Ok(())
    }
}

/// A config validation failure: which field, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFieldError {
    pub field: String,
    pub cause: String,
}

impl std::fmt::Display for ConfigFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid config field {}: {}", self.field, self.cause)
    }
}

impl std::error::Error for ConfigFieldError {}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub port: u16,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigFieldError> {
        if self.write_timeout_secs == 0 {
            return Err(ConfigFieldError {
                field: "server.write_timeout_secs".to_string(),
                cause: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    600
}

/// Self and upstream-service URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UrlsConfig {
    /// The gateway's own externally-visible URL.
    pub gateway: String,

    /// Base URL of the external compression service.
    #[serde(default)]
    pub compression_service: String,
}

/// Pipe configuration container; today only the tool-output pipe exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipesConfig {
    #[serde(default)]
    pub tool_output: ToolOutputPipeConfig,
}

/// How tool outputs get compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Pipe disabled: bodies pass through untouched.
    Passthrough,
    /// Compression service endpoint (`pipes.tool_output.api`).
    Api,
    /// Direct chat call against a configured provider.
    ExternalProvider,
    /// Deterministic word-count truncation, no network.
    Simple,
}

/// What to do when a compression attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Passthrough,
    Simple,
}

/// How phantom-tool calls are honored on the response side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStrategy {
    /// Extra round trip through the model with tool results appended.
    Inline,
    /// Rewrite the compressed tool results in place and re-forward.
    HistoryRewrite,
}

/// Tool-output pipe settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutputPipeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_strategy")]
    pub strategy: CompressionStrategy,

    #[serde(default = "default_fallback_strategy")]
    pub fallback_strategy: FallbackStrategy,

    /// Contents below this byte size pass through uncompressed.
    #[serde(default = "default_min_bytes")]
    pub min_bytes: usize,

    /// Contents above this byte size pass through uncompressed.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Requested summary size as a fraction of the original.
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,

    #[serde(default = "default_true")]
    pub enable_expand_context: bool,

    /// Append a one-line expansion hint after each summary.
    #[serde(default = "default_true")]
    pub include_expand_hint: bool,

    #[serde(default = "default_expansion_strategy")]
    pub expansion_strategy: ExpansionStrategy,

    /// Generic skip categories, resolved to per-provider tool names.
    #[serde(default = "default_skip_tools")]
    pub skip_tools: Vec<String>,

    #[serde(default)]
    pub api: ApiConfig,

    /// Name into the `providers` section for `external_provider`.
    #[serde(default)]
    pub provider: Option<String>,
}

impl Default for ToolOutputPipeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_strategy(),
            fallback_strategy: default_fallback_strategy(),
            min_bytes: default_min_bytes(),
            max_bytes: default_max_bytes(),
            target_ratio: default_target_ratio(),
            enable_expand_context: true,
            include_expand_hint: true,
            expansion_strategy: default_expansion_strategy(),
            skip_tools: default_skip_tools(),
            api: ApiConfig::default(),
            provider: None,
        }
    }
}

impl ToolOutputPipeConfig {
    pub fn validate(&self) -> Result<(), ConfigFieldError> {
        if self.min_bytes >= self.max_bytes {
            return Err(ConfigFieldError {
                field: "pipes.tool_output.min_bytes".to_string(),
                cause: format!(
                    "must be below max_bytes ({} >= {})",
                    self.min_bytes, self.max_bytes
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.target_ratio) {
            return Err(ConfigFieldError {
                field: "pipes.tool_output.target_ratio".to_string(),
                cause: format!("must be within [0, 1], got {}", self.target_ratio),
            });
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigFieldError {
                field: "pipes.tool_output.api.timeout_secs".to_string(),
                cause: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_strategy() -> CompressionStrategy {
    CompressionStrategy::Api
}

fn default_fallback_strategy() -> FallbackStrategy {
    FallbackStrategy::Passthrough
}

fn default_expansion_strategy() -> ExpansionStrategy {
    ExpansionStrategy::Inline
}

fn default_min_bytes() -> usize {
    2048
}

fn default_max_bytes() -> usize {
    65536
}

fn default_target_ratio() -> f64 {
    0.5
}

fn default_skip_tools() -> Vec<String> {
    vec!["file_read".to_string(), "file_edit".to_string()]
}

/// Compression-service API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_api_model")]
    pub model: String,

    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,

    /// When set, the user query is withheld and the summarizer produces a
    /// structural summary.
    #[serde(default = "default_true")]
    pub query_agnostic: bool,

    /// In-process retries are off by default; the external service applies
    /// its own backoff policy.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: default_api_model(),
            timeout_secs: default_api_timeout_secs(),
            query_agnostic: true,
            max_retries: 0,
        }
    }
}

fn default_api_model() -> String {
    "compression-default".to_string()
}

fn default_api_timeout_secs() -> u64 {
    30
}

/// One named upstream provider, used for direct summarization calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub model: String,

    /// Wire dialect; inferred from `base_url` when absent.
    #[serde(default)]
    pub dialect: Option<String>,
}

/// Shadow store selection and TTLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default, rename = "type")]
    pub kind: StoreKind,

    #[serde(default = "default_original_ttl_secs")]
    pub original_ttl_secs: u64,

    #[serde(default = "default_compressed_ttl_secs")]
    pub compressed_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            original_ttl_secs: default_original_ttl_secs(),
            compressed_ttl_secs: default_compressed_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), ConfigFieldError> {
        if self.original_ttl_secs == 0 || self.compressed_ttl_secs == 0 {
            return Err(ConfigFieldError {
                field: "store.original_ttl_secs".to_string(),
                cause: "TTLs must be positive".to_string(),
            });
        }
        if self.sweep_interval_secs < 60 {
            return Err(ConfigFieldError {
                field: "store.sweep_interval_secs".to_string(),
                cause: format!("sweep period must be >= 60s, got {}", self.sweep_interval_secs),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
}

fn default_original_ttl_secs() -> u64 {
    300
}

fn default_compressed_ttl_secs() -> u64 {
    86400
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Telemetry (per-tool-output JSONL records).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub file: Option<PathBuf>,
}
