//! OpenAI Responses API dialect.
//!
//! The conversation is a flat `input[]` item list: role-bearing message
//! items plus `function_call` / `function_call_output` items correlated by
//! `call_id`. Tool descriptors are flat objects (`{type: "function", name,
//! parameters}`) rather than the chat API's nested function shape.

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
use super::util::tools_contain;
use crate::shadow_format::parse_shadow_ref;

#[derive(Debug, Clone, Default)]
pub struct OpenAiResponsesAdapter;

impl OpenAiResponsesAdapter {
    pub fn new() -> Self {
        Self
    }

    fn tool_names(items: &[JsonValue]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for item in items {
            if item["type"].as_str() == Some("function_call")
                && let (Some(call_id), Some(name)) =
                    (item["call_id"].as_str(), item["name"].as_str())
            {
                names.insert(call_id.to_string(), name.to_string());
            }
        }
        names
    }

    /// Output text of a `function_call_output` item, plus whether it used
    /// the content-part array shape.
    fn output_text(output: &JsonValue) -> Option<(String, bool)> {
        match output {
            JsonValue::String(text) => Some((text.clone(), false)),
            JsonValue::Array(parts) => {
                let text = parts
                    .iter()
                    .filter(|part| {
                        matches!(part["type"].as_str(), Some("output_text") | Some("text"))
                    })
                    .filter_map(|part| part["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                Some((text, true))
            }
            _ => None,
        }
    }

    fn for_each_call_output(body: &mut JsonValue, mut visit: impl FnMut(usize, &mut JsonValue)) {
        let Some(items) = body.get_mut("input").and_then(JsonValue::as_array_mut) else {
            return;
        };
        let mut position = 0usize;
        for item in items {
            if item["type"].as_str() == Some("function_call_output")
                && item["call_id"].is_string()
                && Self::output_text(&item["output"]).is_some()
            {
                visit(position, item);
                position += 1;
            }
        }
    }

    fn is_phantom_item(item: &JsonValue) -> bool {
        item["type"].as_str() == Some("function_call")
            && item["name"].as_str() == Some(PHANTOM_TOOL_NAME)
    }
}

impl ProviderAdapter for OpenAiResponsesAdapter {
    fn name(&self) -> &'static str {
        "openai_responses"
    }

    fn extract_tool_outputs(&self, body: &JsonValue) -> Vec<ToolOutput> {
        let Some(items) = body["input"].as_array() else {
            return Vec::new();
        };
        let names = Self::tool_names(items);

        let mut outputs = Vec::new();
        let mut scratch = body.clone();
        Self::for_each_call_output(&mut scratch, |position, item| {
            let id = item["call_id"].as_str().unwrap_or_default().to_string();
            if let Some((content, is_blocks)) = Self::output_text(&item["output"]) {
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
        Self::for_each_call_output(&mut rewritten, |position, item| {
            let Some(replacement) = indexed.get(&position) else {
                return;
            };
            let Some((existing, is_blocks)) = Self::output_text(&item["output"]) else {
                return;
            };
            if existing == replacement.content {
                return;
            }
            item["output"] = if is_blocks {
                json!([{"type": "output_text", "text": replacement.content}])
            } else {
                json!(replacement.content)
            };
        });
        rewritten
    }

    fn extract_user_query(&self, body: &JsonValue) -> String {
        match &body["input"] {
            JsonValue::String(text) => text.clone(),
            JsonValue::Array(items) => {
                for item in items.iter().rev() {
                    if item["role"].as_str() != Some("user") {
                        continue;
                    }
                    let text = match &item["content"] {
                        JsonValue::String(text) => text.clone(),
                        JsonValue::Array(parts) => parts
                            .iter()
                            .filter(|part| {
                                matches!(part["type"].as_str(), Some("input_text") | Some("text"))
                            })
                            .filter_map(|part| part["text"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n"),
                        _ => String::new(),
                    };
                    if !text.is_empty() {
                        return text;
                    }
                }
                String::new()
            }
            _ => String::new(),
        }
    }

    fn extract_model(&self, body: &JsonValue) -> String {
        body["model"].as_str().unwrap_or_default().to_string()
    }

    fn extract_usage(&self, response: &JsonValue) -> TokenUsage {
        TokenUsage {
            input_tokens: response["usage"]["input_tokens"].as_i64().unwrap_or(0),
            output_tokens: response["usage"]["output_tokens"].as_i64().unwrap_or(0),
            total_tokens: response["usage"]["total_tokens"].as_i64().unwrap_or(0),
        }
    }

    fn filter_phantom(&self, response: &JsonValue) -> (JsonValue, bool) {
        let mut filtered = response.clone();
        let Some(items) = filtered.get_mut("output").and_then(JsonValue::as_array_mut) else {
            return (filtered, false);
        };
        let before = items.len();
        items.retain(|item| !Self::is_phantom_item(item));
        let modified = items.len() != before;
        (filtered, modified)
    }

    fn parse_phantom_calls(&self, response: &JsonValue) -> Vec<ExpansionCall> {
        let Some(items) = response["output"].as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter(|item| Self::is_phantom_item(item))
            .filter_map(|item| {
                let tool_use_id = item["call_id"].as_str()?.to_string();
                let arguments = item["arguments"].as_str()?;
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
            "name": PHANTOM_TOOL_NAME,
            "description": PHANTOM_TOOL_DESCRIPTION,
            "parameters": phantom_parameters(),
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
            Some("response.output_item.added")
                if event["item"]["type"].as_str() == Some("function_call") =>
            {
                let fragment = event["item"]["arguments"]
                    .as_str()
                    .filter(|args| !args.is_empty())
                    .map(str::to_string);
                SseEventKind::ToolUseStart {
                    index: event["output_index"].as_i64(),
                    id: event["item"]["call_id"].as_str().unwrap_or_default().to_string(),
                    name: event["item"]["name"].as_str().unwrap_or_default().to_string(),
                    fragment,
                }
            }
            Some("response.function_call_arguments.delta") => SseEventKind::ToolUseDelta {
                index: event["output_index"].as_i64(),
                fragment: event["delta"].as_str().unwrap_or_default().to_string(),
            },
            Some("response.output_item.done")
                if event["item"]["type"].as_str() == Some("function_call") =>
            {
                SseEventKind::ToolUseStop {
                    index: event["output_index"].as_i64(),
                }
            }
            _ => SseEventKind::Other,
        }
    }

    fn history_items_from_response(&self, response: &JsonValue) -> Vec<JsonValue> {
        response["output"]
            .as_array()
            .map(|items| items.iter().filter(|item| item.is_object()).cloned().collect())
            .unwrap_or_default()
    }

    fn build_tool_result_messages(&self, results: &[(ExpansionCall, String)]) -> Vec<JsonValue> {
        // Flat items, one per call.
        results
            .iter()
            .map(|(call, content)| {
                json!({
                    "type": "function_call_output",
                    "call_id": call.tool_use_id,
                    "output": content,
                })
            })
            .collect()
    }

    fn append_messages(&self, body: &JsonValue, messages: &[JsonValue]) -> JsonValue {
        if !body.is_object() {
            return body.clone();
        }
        let mut appended = body.clone();
        // A string input is the shorthand for a single user message; lift
        // it into item form before appending.
        if let Some(text) = appended["input"].as_str().map(str::to_string) {
            appended["input"] = json!([{"role": "user", "content": text}]);
        }
        if !appended["input"].is_array() {
            appended["input"] = json!([]);
        }
        if let Some(items) = appended.get_mut("input").and_then(JsonValue::as_array_mut) {
            items.extend(messages.iter().cloned());
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
        Self::for_each_call_output(&mut rewritten, |_, item| {
            let Some((text, is_blocks)) = Self::output_text(&item["output"]) else {
                return;
            };
            let Some(id) = parse_shadow_ref(&text) else {
                return;
            };
            let Some(original) = originals.get(id) else {
                return;
            };
            replaced.push(id.to_string());
            item["output"] = if is_blocks {
                json!([{"type": "output_text", "text": original}])
            } else {
                json!(original)
            };
        });
        (rewritten, replaced)
    }

    fn strip_phantom_from_history(&self, body: &JsonValue) -> JsonValue {
        let mut stripped = body.clone();
        if let Some(items) = stripped.get_mut("input").and_then(JsonValue::as_array_mut) {
            items.retain(|item| !Self::is_phantom_item(item));
        }
        stripped
    }
}
