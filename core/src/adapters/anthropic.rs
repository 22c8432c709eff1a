//! Anthropic Messages API dialect.
//!
//! Tool results live in user messages as `tool_result` content blocks that
//! reference the assistant's `tool_use` block by id. Streaming uses
//! `content_block_start` / `content_block_delta` (`input_json_delta`) /
//! `content_block_stop` events correlated by block index.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use serde_json::json;

use shadowgate_protocol::ContentKind;
use shadowgate_protocol::ExpansionCall;
use shadowgate_protocol::Replacement;
use shadowgate_protocol::TokenUsage;
use shadowgate_protocol::ToolOutput;

use super::PHANTOM_TOOL_DESCRIPTION;
use super::PHANTOM_TOOL_NAME;
use super::ProviderAdapter;
use super::SseEventKind;
use super::phantom_parameters;
use super::util::by_position;
use super::util::text_from_blocks;
use super::util::tool_result_text;
use super::util::tools_contain;
use crate::shadow_format::parse_shadow_ref;

#[derive(Debug, Clone, Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Map of tool_use id → tool name across all assistant turns.
    fn tool_names(messages: &[JsonValue]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for message in messages {
            if message["role"].as_str() != Some("assistant") {
                continue;
            }
            let Some(blocks) = message["content"].as_array() else {
                continue;
            };
            for block in blocks {
                if block["type"].as_str() == Some("tool_use")
                    && let (Some(id), Some(name)) = (block["id"].as_str(), block["name"].as_str())
                {
                    names.insert(id.to_string(), name.to_string());
                }
            }
        }
        names
    }

    /// Visit every tool_result block in body order, mutably.
    fn for_each_tool_result(body: &mut JsonValue, mut visit: impl FnMut(usize, &mut JsonValue)) {
        let Some(messages) = body.get_mut("messages").and_then(JsonValue::as_array_mut) else {
            return;
        };
        let mut position = 0usize;
        for message in messages {
            if message["role"].as_str() != Some("user") {
                continue;
            }
            let Some(blocks) = message.get_mut("content").and_then(JsonValue::as_array_mut)
            else {
                continue;
            };
            for block in blocks {
                if block["type"].as_str() == Some("tool_result")
                    && block["tool_use_id"].is_string()
                    && tool_result_text(&block["content"]).is_some()
                {
                    visit(position, block);
                    position += 1;
                }
            }
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn extract_tool_outputs(&self, body: &JsonValue) -> Vec<ToolOutput> {
        let Some(messages) = body["messages"].as_array() else {
            return Vec::new();
        };
        let names = Self::tool_names(messages);

        let mut outputs = Vec::new();
        let mut scratch = body.clone();
        Self::for_each_tool_result(&mut scratch, |position, block| {
            let id = block["tool_use_id"].as_str().unwrap_or_default().to_string();
            if let Some((content, is_blocks)) = tool_result_text(&block["content"]) {
                outputs.push(ToolOutput {
                    tool_name: names.get(&id).cloned().unwrap_or_default(),
                    id,
                    kind: if is_blocks { ContentKind::Blocks } else { ContentKind::Text },
                    content,
                    position,
                });
            }
        });
        outputs
    }

    fn apply_tool_outputs(&self, body: &JsonValue, replacements: &[Replacement]) -> JsonValue {
        let indexed = by_position(replacements);
        let mut rewritten = body.clone();
        Self::for_each_tool_result(&mut rewritten, |position, block| {
            let Some(replacement) = indexed.get(&position) else {
                return;
            };
            let Some((existing, is_blocks)) = tool_result_text(&block["content"]) else {
                return;
            };
            if existing == replacement.content {
                return;
            }
            block["content"] = if is_blocks {
                json!([{"type": "text", "text": replacement.content}])
            } else {
                json!(replacement.content)
            };
        });
        rewritten
    }

    fn extract_user_query(&self, body: &JsonValue) -> String {
        let Some(messages) = body["messages"].as_array() else {
            return String::new();
        };
        for message in messages.iter().rev() {
            if message["role"].as_str() != Some("user") {
                continue;
            }
            let text = match &message["content"] {
                JsonValue::String(text) => text.clone(),
                JsonValue::Array(blocks) => text_from_blocks(blocks, "text"),
                _ => String::new(),
            };
            if !text.is_empty() {
                return text;
            }
        }
        String::new()
    }

    fn extract_model(&self, body: &JsonValue) -> String {
        body["model"].as_str().unwrap_or_default().to_string()
    }

    fn extract_usage(&self, response: &JsonValue) -> TokenUsage {
        let input = response["usage"]["input_tokens"].as_i64().unwrap_or(0);
        let output = response["usage"]["output_tokens"].as_i64().unwrap_or(0);
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    }

    fn filter_phantom(&self, response: &JsonValue) -> (JsonValue, bool) {
        let mut filtered = response.clone();
        let Some(blocks) = filtered.get_mut("content").and_then(JsonValue::as_array_mut) else {
            return (filtered, false);
        };
        let before = blocks.len();
        blocks.retain(|block| {
            !(block["type"].as_str() == Some("tool_use")
                && block["name"].as_str() == Some(PHANTOM_TOOL_NAME))
        });
        let modified = blocks.len() != before;
        let tool_use_left = blocks
            .iter()
            .any(|block| block["type"].as_str() == Some("tool_use"));
        if modified
            && !tool_use_left
            && filtered["stop_reason"].as_str() == Some("tool_use")
        {
            filtered["stop_reason"] = json!("end_turn");
        }
        (filtered, modified)
    }

    fn parse_phantom_calls(&self, response: &JsonValue) -> Vec<ExpansionCall> {
        let Some(blocks) = response["content"].as_array() else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|block| {
                block["type"].as_str() == Some("tool_use")
                    && block["name"].as_str() == Some(PHANTOM_TOOL_NAME)
            })
            .filter_map(|block| {
                let tool_use_id = block["id"].as_str()?.to_string();
                let shadow_id = block["input"]["id"].as_str()?.to_string();
                Some(ExpansionCall {
                    tool_use_id,
                    shadow_id,
                })
            })
            .collect()
    }

    fn inject_phantom_tool(&self, body: &JsonValue) -> JsonValue {
        if tools_contain(&body["tools"], PHANTOM_TOOL_NAME) {
            return body.clone();
        }
        if !body.is_object() {
            return body.clone();
        }
        let mut injected = body.clone();
        let descriptor = json!({
            "name": PHANTOM_TOOL_NAME,
            "description": PHANTOM_TOOL_DESCRIPTION,
            "input_schema": phantom_parameters(),
        });
        if !injected["tools"].is_array() {
            injected["tools"] = json!([]);
        }
        if let Some(tools) = injected.get_mut("tools").and_then(JsonValue::as_array_mut) {
            tools.push(descriptor);
        }
        injected
    }

    fn has_tools(&self, body: &JsonValue) -> bool {
        body["tools"].as_array().is_some_and(|tools| !tools.is_empty())
    }

    fn classify_sse_event(&self, data: &str) -> SseEventKind {
        let Ok(event) = serde_json::from_str::<JsonValue>(data) else {
            return SseEventKind::Other;
        };
        match event["type"].as_str() {
            Some("content_block_start") if event["content_block"]["type"].as_str() == Some("tool_use") => {
                SseEventKind::ToolUseStart {
                    index: event["index"].as_i64(),
                    id: event["content_block"]["id"].as_str().unwrap_or_default().to_string(),
                    name: event["content_block"]["name"].as_str().unwrap_or_default().to_string(),
                    fragment: None,
                }
            }
            Some("content_block_delta") if event["delta"]["type"].as_str() == Some("input_json_delta") => {
                SseEventKind::ToolUseDelta {
                    index: event["index"].as_i64(),
                    fragment: event["delta"]["partial_json"].as_str().unwrap_or_default().to_string(),
                }
            }
            Some("content_block_stop") => SseEventKind::ToolUseStop {
                index: event["index"].as_i64(),
            },
            _ => SseEventKind::Other,
        }
    }

    fn history_items_from_response(&self, response: &JsonValue) -> Vec<JsonValue> {
        match response.get("content") {
            Some(content) => vec![json!({"role": "assistant", "content": content.clone()})],
            None => Vec::new(),
        }
    }

    fn build_tool_result_messages(&self, results: &[(ExpansionCall, String)]) -> Vec<JsonValue> {
        // Anthropic batches: one user message, many tool_result blocks.
        let blocks: Vec<JsonValue> = results
            .iter()
            .map(|(call, content)| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": call.tool_use_id,
                    "content": [{"type": "text", "text": content}],
                })
            })
            .collect();
        if blocks.is_empty() {
            return Vec::new();
        }
        vec![json!({"role": "user", "content": blocks})]
    }

    fn append_messages(&self, body: &JsonValue, messages: &[JsonValue]) -> JsonValue {
        if !body.is_object() {
            return body.clone();
        }
        let mut appended = body.clone();
        if !appended["messages"].is_array() {
            appended["messages"] = json!([]);
        }
        if let Some(existing) = appended.get_mut("messages").and_then(JsonValue::as_array_mut) {
            existing.extend(messages.iter().cloned());
        }
        appended
    }

    fn rewrite_compressed_results(
        &self,
        body: &JsonValue,
        originals: &HashMap<String, String>,
    ) -> (JsonValue, Vec<String>) {
        let mut rewritten = body.clone();
        let mut replaced = Vec::new();
        Self::for_each_tool_result(&mut rewritten, |_, block| {
            let Some((text, is_blocks)) = tool_result_text(&block["content"]) else {
                return;
            };
            let Some(id) = parse_shadow_ref(&text) else {
                return;
            };
            let Some(original) = originals.get(id) else {
                return;
            };
            replaced.push(id.to_string());
            block["content"] = if is_blocks {
                json!([{"type": "text", "text": original}])
            } else {
                json!(original)
            };
        });
        (rewritten, replaced)
    }

    fn strip_phantom_from_history(&self, body: &JsonValue) -> JsonValue {
        let mut stripped = body.clone();
        let Some(messages) = stripped.get_mut("messages").and_then(JsonValue::as_array_mut)
        else {
            return stripped;
        };
        let Some(last_assistant) = messages
            .iter()
            .rposition(|message| message["role"].as_str() == Some("assistant"))
        else {
            return stripped;
        };
        let mut remove_message = false;
        if let Some(blocks) = messages[last_assistant]
            .get_mut("content")
            .and_then(JsonValue::as_array_mut)
        {
            blocks.retain(|block| {
                !(block["type"].as_str() == Some("tool_use")
                    && block["name"].as_str() == Some(PHANTOM_TOOL_NAME))
            });
            remove_message = blocks.is_empty();
        }
        if remove_message {
            messages.remove(last_assistant);
        }
        stripped
    }
}
