//! Provider adapter system.
//!
//! Adapters isolate all wire-format knowledge behind a fixed capability
//! set: extracting and splicing tool outputs, recognizing and filtering the
//! phantom `expand_context` tool, rebuilding conversation history for
//! expansion round trips, and classifying streaming events. The gateway
//! selects an adapter at the edge and hands it downstream as data; nothing
//! in the pipe or expander branches on a provider name.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use serde_json::json;

use shadowgate_protocol::ExpansionCall;
use shadowgate_protocol::Replacement;
use shadowgate_protocol::TokenUsage;
use shadowgate_protocol::ToolOutput;

pub mod anthropic;
pub mod gemini;
pub mod openai_chat;
pub mod openai_responses;
pub mod registry;
mod util;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai_chat::OpenAiChatAdapter;
pub use openai_responses::OpenAiResponsesAdapter;
pub use registry::get_adapter;
pub use registry::list_adapters;
pub use registry::register_adapter;

/// Name of the phantom tool injected into outbound requests.
pub const PHANTOM_TOOL_NAME: &str = "expand_context";

/// Description shown to the model.
pub const PHANTOM_TOOL_DESCRIPTION: &str = "Retrieve the full, uncompressed content behind a \
compressed tool output. Tool outputs that were compressed start with a <<<SHADOW:shadow_...>>> \
marker; pass that shadow id as `id` to get the original content.";

/// JSON-schema parameters object shared by every dialect's phantom shape.
pub fn phantom_parameters() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "id": {
                "type": "string",
                "description": "The shadow id from the <<<SHADOW:...>>> prefix"
            }
        },
        "required": ["id"]
    })
}

/// Classification of one SSE data payload with respect to tool-use blocks.
///
/// Dialects that stream tool arguments incrementally produce the
/// start/delta/stop triple; dialects that ship a whole call in one event
/// (Gemini) produce `ToolUseComplete`. Everything else is `Other` and
/// passes through the stream filter untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEventKind {
    ToolUseStart {
        index: Option<i64>,
        id: String,
        name: String,
        /// Some dialects carry the first argument fragment on the opener.
        fragment: Option<String>,
    },
    ToolUseDelta {
        index: Option<i64>,
        fragment: String,
    },
    ToolUseStop {
        index: Option<i64>,
    },
    ToolUseComplete {
        id: String,
        name: String,
        arguments: JsonValue,
    },
    Done,
    Other,
}

/// One provider wire format.
///
/// Every operation is total: malformed JSON or missing fields yield empty
/// extractions and unchanged bodies, never a panic. Duplicate tool-call ids
/// within one request are treated independently, which is why replacements
/// are addressed by extraction position rather than id.
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Stable adapter name ("anthropic", "openai_chat", ...).
    fn name(&self) -> &'static str;

    /// Extract tool-result payloads from a request body, in body order.
    fn extract_tool_outputs(&self, body: &JsonValue) -> Vec<ToolOutput>;

    /// Splice replacement contents back into a request body.
    ///
    /// A replacement whose content equals the extracted content leaves the
    /// body untouched at that position.
    fn apply_tool_outputs(&self, body: &JsonValue, replacements: &[Replacement]) -> JsonValue;

    /// Most recent user turn's concatenated text (empty if not determinable).
    fn extract_user_query(&self, body: &JsonValue) -> String;

    fn extract_model(&self, body: &JsonValue) -> String;

    /// Token usage from an upstream response.
    fn extract_usage(&self, response: &JsonValue) -> TokenUsage;

    /// Remove phantom tool-use blocks from a response, preserving the order
    /// of everything else. Returns the filtered response and whether
    /// anything was removed.
    fn filter_phantom(&self, response: &JsonValue) -> (JsonValue, bool);

    /// Parse `expand_context` calls out of a response.
    fn parse_phantom_calls(&self, response: &JsonValue) -> Vec<ExpansionCall>;

    /// Add the phantom tool to the request's tool list. Idempotent: a
    /// no-op when the phantom is already present under either this
    /// dialect's tool-schema shape or its chat-function shape.
    fn inject_phantom_tool(&self, body: &JsonValue) -> JsonValue;

    /// Whether the request body already carries a tool list.
    fn has_tools(&self, body: &JsonValue) -> bool;

    /// Classify one SSE data payload (without the `data: ` prefix).
    fn classify_sse_event(&self, data: &str) -> SseEventKind;

    /// The assistant-turn history items representing an upstream response,
    /// in the shape this dialect appends to a request.
    fn history_items_from_response(&self, response: &JsonValue) -> Vec<JsonValue>;

    /// Batch expansion results per this dialect's convention: one combined
    /// user message with many tool-result blocks, or one tool-role message
    /// per call.
    fn build_tool_result_messages(&self, results: &[(ExpansionCall, String)]) -> Vec<JsonValue>;

    /// Append history items to the request body.
    fn append_messages(&self, body: &JsonValue, messages: &[JsonValue]) -> JsonValue;

    /// Selective history rewrite: replace the tool results whose
    /// `<<<SHADOW:id>>>` prefix names a key of `originals` with the mapped
    /// original content. Returns the rewritten body and the ids replaced.
    fn rewrite_compressed_results(
        &self,
        body: &JsonValue,
        originals: &HashMap<String, String>,
    ) -> (JsonValue, Vec<String>);

    /// Remove phantom tool-use blocks from the trailing assistant turn,
    /// dropping the turn entirely when the phantom was its only content.
    fn strip_phantom_from_history(&self, body: &JsonValue) -> JsonValue;
}
