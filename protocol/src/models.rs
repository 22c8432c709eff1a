//! Value types shared by the pipe, the expander, and the gateway.

use serde::Deserialize;
use serde::Serialize;

/// How a tool result carries its content on the wire.
///
/// Providers either store a plain string or a list of structured content
/// blocks; adapters record which shape they extracted from so a replacement
/// can be spliced back in the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Blocks,
}

/// One tool output extracted from a request body.
///
/// `position` is the record's index in extraction order; it is how a
/// replacement finds its way back to the right spot even when the same
/// tool-call id occurs more than once in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The model's tool-call id (opaque; Gemini uses the function name).
    pub id: String,
    pub tool_name: String,
    pub kind: ContentKind,
    pub content: String,
    pub position: usize,
}

/// Replacement content for one extracted tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub id: String,
    pub position: usize,
    pub content: String,
}

/// A parsed `expand_context` call from a model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionCall {
    /// Tool-use id the response must be attributed to.
    pub tool_use_id: String,
    pub shadow_id: String,
}

/// Token usage reported by an upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Per-tool-output outcome of one pipe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStatus {
    /// Cached summary reused; summarizer not contacted.
    Hit,
    /// Cache miss whose compression attempt failed; fallback applied.
    Miss,
    /// Summarizer produced a fresh summary.
    Compressed,
    PassthroughSmall,
    PassthroughLarge,
    SkippedByToolName,
}

impl CompressionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionStatus::Hit => "hit",
            CompressionStatus::Miss => "miss",
            CompressionStatus::Compressed => "compressed",
            CompressionStatus::PassthroughSmall => "passthrough_small",
            CompressionStatus::PassthroughLarge => "passthrough_large",
            CompressionStatus::SkippedByToolName => "skipped_by_tool_name",
        }
    }
}

/// One line of the pipe's outcome ledger, also the telemetry record shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionRecord {
    /// Absent for records that never reached hashing (skips, size band).
    pub shadow_id: Option<String>,
    pub tool_name: String,
    pub status: CompressionStatus,
    pub original_size: usize,
    pub compressed_size: Option<usize>,
    pub cache_hit: bool,
    pub latency_ms: Option<u64>,
}
