//! OpenAI Chat Completions dialect.
//!
//! Tool results are `tool`-role messages referencing the assistant's
//! `tool_calls` entry by `tool_call_id`. Streaming deltas carry tool-call
//! fragments under `choices[0].delta.tool_calls`, with the function name on
//! the opening fragment and argument text accumulated across the rest.

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
pub struct OpenAiChatAdapter;

impl OpenAiChatAdapter {
    pub fn new() -> Self {
        Self
    }

    fn tool_names(messages: &[JsonValue]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for message in messages {
            let Some(calls) = message["tool_calls"].as_array() else {
                continue;
            };
            for call in calls {
                if let (Some(id), Some(name)) =
                    (call["id"].as_str(), call["function"]["name"].as_str())
                {
                    names.insert(id.to_string(), name.to_string());
                }
            }
        }
        names
    }

    fn for_each_tool_message(body: &mut JsonValue, mut visit: impl FnMut(usize, &mut JsonValue)) {
        let Some(messages) = body.get_mut("messages").and_then(JsonValue::as_array_mut) else {
            return;
        };
        let mut position = 0usize;
        for message in messages {
            if message["role"].as_str() == Some("tool")
                && message["tool_call_id"].is_string()
                && tool_result_text(&message["content"]).is_some()
            {
                visit(position, message);
                position += 1;
            }
        }
    }

    fn is_phantom_call(call: &JsonValue) -> bool {
        call["function"]["name"].as_str() == Some(PHANTOM_TOOL_NAME)
    }
}

impl ProviderAdapter for OpenAiChatAdapter {
    fn name(&self) -> &'static str {
        "openai_chat"
    }

    fn extract_tool_outputs(&self, body: &JsonValue) -> Vec<ToolOutput> {
        let Some(messages) = body["messages"].as_array() else {
            return Vec::new();
        };
        let names = Self::tool_names(messages);

        let mut outputs = Vec::new();
        let mut scratch = body.clone();
        Self::for_each_tool_message(&mut scratch, |position, message| {
            let id = message["tool_call_id"].as_str().unwrap_or_default().to_string();
            if let Some((content, is_blocks)) = tool_result_text(&message["content"]) {
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
        Self::for_each_tool_message(&mut rewritten, |position, message| {
            let Some(replacement) = indexed.get(&position) else {
                return;
            };
            let Some((existing, is_blocks)) = tool_result_text(&message["content"]) else {
                return;
            };
            if existing == replacement.content {
                return;
            }
            message["content"] = if is_blocks {
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
                JsonValue::Array(parts) => text_from_blocks(parts, "text"),
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
        TokenUsage {
            input_tokens: response["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            output_tokens: response["usage"]["completion_tokens"].as_i64().unwrap_or(0),
            total_tokens: response["usage"]["total_tokens"].as_i64().unwrap_or(0),
        }
    }

    fn filter_phantom(&self, response: &JsonValue) -> (JsonValue, bool) {
        let mut filtered = response.clone();
        let mut modified = false;
        let Some(choices) = filtered.get_mut("choices").and_then(JsonValue::as_array_mut) else {
            return (filtered, false);
        };
        for choice in choices {
            let Some(calls) = choice
                .get_mut("message")
                .and_then(|message| message.get_mut("tool_calls"))
                .and_then(JsonValue::as_array_mut)
            else {
                continue;
            };
            let before = calls.len();
            calls.retain(|call| !Self::is_phantom_call(call));
            if calls.len() == before {
                continue;
            }
            modified = true;
            if calls.is_empty() {
                if let Some(message) = choice.get_mut("message").and_then(JsonValue::as_object_mut) {
                    message.shift_remove("tool_calls");
                }
                if choice["finish_reason"].as_str() == Some("tool_calls") {
                    choice["finish_reason"] = json!("stop");
                }
            }
        }
        (filtered, modified)
    }

    fn parse_phantom_calls(&self, response: &JsonValue) -> Vec<ExpansionCall> {
        let Some(calls) = response["choices"][0]["message"]["tool_calls"].as_array() else {
            return Vec::new();
        };
        calls
            .iter()
            .filter(|call| Self::is_phantom_call(call))
            .filter_map(|call| {
                let tool_use_id = call["id"].as_str()?.to_string();
                let arguments = call["function"]["arguments"].as_str()?;
                let parsed: JsonValue = serde_json::from_str(arguments).ok()?;
                let shadow_id = parsed["id"].as_str()?.to_string();
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
            "type": "function",
            "function": {
                "name": PHANTOM_TOOL_NAME,
                "description": PHANTOM_TOOL_DESCRIPTION,
                "parameters": phantom_parameters(),
            }
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
        let choice = &event["choices"][0];
        if choice["finish_reason"].as_str() == Some("tool_calls") {
            return SseEventKind::ToolUseStop { index: None };
        }
        let Some(calls) = choice["delta"]["tool_calls"].as_array() else {
            return SseEventKind::Other;
        };
        let Some(call) = calls.first() else {
            return SseEventKind::Other;
        };
        let index = call["index"].as_i64();
        if let Some(name) = call["function"]["name"].as_str() {
            let fragment = call["function"]["arguments"]
                .as_str()
                .filter(|args| !args.is_empty())
                .map(str::to_string);
            return SseEventKind::ToolUseStart {
                index,
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: name.to_string(),
                fragment,
            };
        }
        if let Some(arguments) = call["function"]["arguments"].as_str() {
            return SseEventKind::ToolUseDelta {
                index,
                fragment: arguments.to_string(),
            };
        }
        SseEventKind::Other
    }

    fn history_items_from_response(&self, response: &JsonValue) -> Vec<JsonValue> {
        match response["choices"][0].get("message") {
            Some(message) if message.is_object() => vec![message.clone()],
            _ => Vec::new(),
        }
    }

    fn build_tool_result_messages(&self, results: &[(ExpansionCall, String)]) -> Vec<JsonValue> {
        // Chat Completions wants one tool-role message per call.
        results
            .iter()
            .map(|(call, content)| {
                json!({
                    "role": "tool",
                    "tool_call_id": call.tool_use_id,
                    "content": content,
                })
            })
            .collect()
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
        Self::for_each_tool_message(&mut rewritten, |_, message| {
            let Some((text, is_blocks)) = tool_result_text(&message["content"]) else {
                return;
            };
            let Some(id) = parse_shadow_ref(&text) else {
                return;
            };
            let Some(original) = originals.get(id) else {
                return;
            };
            replaced.push(id.to_string());
            message["content"] = if is_blocks {
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
        if let Some(message) = messages.get_mut(last_assistant) {
            let mut emptied = false;
            if let Some(calls) = message.get_mut("tool_calls").and_then(JsonValue::as_array_mut)
            {
                calls.retain(|call| !Self::is_phantom_call(call));
                emptied = calls.is_empty();
            }
            if emptied {
                if let Some(object) = message.as_object_mut() {
                    object.shift_remove("tool_calls");
                }
                remove_message = match &message["content"] {
                    JsonValue::Null => true,
                    JsonValue::String(text) => text.is_empty(),
                    _ => false,
                };
            }
        }
        if remove_message {
            messages.remove(last_assistant);
        }
        stripped
    }
}
