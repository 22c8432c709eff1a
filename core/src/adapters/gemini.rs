//! Google Gemini generateContent dialect.
//!
//! The conversation is `contents[]` of role-tagged parts. Tool calls are
//! `functionCall` parts and tool results `functionResponse` parts; the wire
//! format has no call ids, so the function name correlates the two and
//! stands in as the opaque id. Streaming chunks carry whole parts, so a
//! phantom call arrives as a single complete event rather than a
//! start/delta/stop triple.

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

/// How a `functionResponse.response` object carried its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseShape {
    /// Bare string (tolerated; the wire format sends objects).
    Raw,
    /// Single wrapper key holding a string (`output`, `result`, `content`).
    Wrapped(&'static str),
    /// Arbitrary object; serialized to JSON text for compression.
    Serialized,
}

const WRAPPER_KEYS: [&str; 3] = ["output", "result", "content"];

#[derive(Debug, Clone, Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        Self
    }

    fn response_text(response: &JsonValue) -> Option<(String, ResponseShape)> {
        match response {
            JsonValue::String(text) => Some((text.clone(), ResponseShape::Raw)),
            JsonValue::Object(map) => {
                for key in WRAPPER_KEYS {
                    if map.len() == 1
                        && let Some(JsonValue::String(text)) = map.get(key)
                    {
                        return Some((text.clone(), ResponseShape::Wrapped(key)));
                    }
                }
                serde_json::to_string(response)
                    .ok()
                    .map(|text| (text, ResponseShape::Serialized))
            }
            _ => None,
        }
    }

    fn rebuild_response(shape: ResponseShape, content: &str) -> JsonValue {
        match shape {
            ResponseShape::Raw => json!(content),
            ResponseShape::Wrapped(key) => json!({key: content}),
            // The replacement is summary text, not JSON; wrap it.
            ResponseShape::Serialized => json!({"output": content}),
        }
    }

    fn for_each_function_response(
        body: &mut JsonValue,
        mut visit: impl FnMut(usize, &mut JsonValue),
    ) {
        let Some(contents) = body.get_mut("contents").and_then(JsonValue::as_array_mut) else {
            return;
        };
        let mut position = 0usize;
        for content in contents {
            let Some(parts) = content.get_mut("parts").and_then(JsonValue::as_array_mut) else {
                continue;
            };
            for part in parts {
                if part["functionResponse"]["name"].is_string()
                    && Self::response_text(&part["functionResponse"]["response"]).is_some()
                {
                    visit(position, part);
                    position += 1;
                }
            }
        }
    }

    fn is_phantom_part(part: &JsonValue) -> bool {
        part["functionCall"]["name"].as_str() == Some(PHANTOM_TOOL_NAME)
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn extract_tool_outputs(&self, body: &JsonValue) -> Vec<ToolOutput> {
        let mut outputs = Vec::new();
        let mut scratch = body.clone();
        Self::for_each_function_response(&mut scratch, |position, part| {
            let name = part["functionResponse"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            if let Some((content, shape)) =
                Self::response_text(&part["functionResponse"]["response"])
            {
                outputs.push(ToolOutput {
                    id: name.clone(),
                    tool_name: name,
                    kind: if shape == ResponseShape::Raw {
                        ContentKind::Text
                    } else {
                        ContentKind::Blocks
                    },
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
        Self::for_each_function_response(&mut rewritten, |position, part| {
            let Some(replacement) = indexed.get(&position) else {
                return;
            };
            let Some((existing, shape)) =
                Self::response_text(&part["functionResponse"]["response"])
            else {
                return;
            };
            if existing == replacement.content {
                return;
            }
            part["functionResponse"]["response"] =
                Self::rebuild_response(shape, &replacement.content);
        });
        rewritten
    }

    fn extract_user_query(&self, body: &JsonValue) -> String {
        let Some(contents) = body["contents"].as_array() else {
            return String::new();
        };
        for content in contents.iter().rev() {
            if content["role"].as_str() != Some("user") {
                continue;
            }
            let Some(parts) = content["parts"].as_array() else {
                continue;
            };
            let text = parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                return text;
            }
        }
        String::new()
    }

    fn extract_model(&self, body: &JsonValue) -> String {
        // Gemini names the model in the URL, not the body.
        body["model"].as_str().unwrap_or_default().to_string()
    }

    fn extract_usage(&self, response: &JsonValue) -> TokenUsage {
        TokenUsage {
            input_tokens: response["usageMetadata"]["promptTokenCount"].as_i64().unwrap_or(0),
            output_tokens: response["usageMetadata"]["candidatesTokenCount"]
                .as_i64()
                .unwrap_or(0),
            total_tokens: response["usageMetadata"]["totalTokenCount"].as_i64().unwrap_or(0),
        }
    }

    fn filter_phantom(&self, response: &JsonValue) -> (JsonValue, bool) {
        let mut filtered = response.clone();
        let mut modified = false;
        if let Some(candidates) = filtered.get_mut("candidates").and_then(JsonValue::as_array_mut)
        {
            for candidate in candidates {
                let Some(parts) = candidate
                    .get_mut("content")
                    .and_then(|content| content.get_mut("parts"))
                    .and_then(JsonValue::as_array_mut)
                else {
                    continue;
                };
                let before = parts.len();
                parts.retain(|part| !Self::is_phantom_part(part));
                modified |= parts.len() != before;
            }
        }
        (filtered, modified)
    }

    fn parse_phantom_calls(&self, response: &JsonValue) -> Vec<ExpansionCall> {
        let Some(parts) = response["candidates"][0]["content"]["parts"].as_array() else {
            return Vec::new();
        };
        parts
            .iter()
            .filter(|part| Self::is_phantom_part(part))
            .filter_map(|part| {
                let shadow_id = part["functionCall"]["args"]["id"].as_str()?.to_string();
                Some(ExpansionCall {
                    tool_use_id: PHANTOM_TOOL_NAME.to_string(),
                    shadow_id,
                })
            })
            .collect()
    }

    fn inject_phantom_tool(&self, body: &JsonValue) -> JsonValue {
        if !body.is_object() || tools_contain(&body["tools"], PHANTOM_TOOL_NAME) {
            return body.clone();
        }
        let declared = body["tools"].as_array().is_some_and(|tools| {
            tools.iter().any(|tool| {
                tool["functionDeclarations"].as_array().is_some_and(|decls| {
                    decls
                        .iter()
                        .any(|decl| decl["name"].as_str() == Some(PHANTOM_TOOL_NAME))
                })
            })
        });
        if declared {
            return body.clone();
        }

        let mut injected = body.clone();
        let declaration = json!({
            "name": PHANTOM_TOOL_NAME,
            "description": PHANTOM_TOOL_DESCRIPTION,
            "parameters": phantom_parameters(),
        });
        let mut pushed = false;
        if let Some(tools) = injected.get_mut("tools").and_then(JsonValue::as_array_mut) {
            let slot = tools
                .iter()
                .position(|tool| tool["functionDeclarations"].is_array());
            match slot {
                Some(index) => {
                    if let Some(declarations) = tools[index]["functionDeclarations"].as_array_mut()
                    {
                        declarations.push(declaration.clone());
                    }
                }
                None => tools.push(json!({"functionDeclarations": [declaration.clone()]})),
            }
            pushed = true;
        }
        if !pushed {
            injected["tools"] = json!([{"functionDeclarations": [declaration]}]);
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
        let Some(parts) = event["candidates"][0]["content"]["parts"].as_array() else {
            return SseEventKind::Other;
        };
        for part in parts {
            if let Some(name) = part["functionCall"]["name"].as_str() {
                return SseEventKind::ToolUseComplete {
                    id: name.to_string(),
                    name: name.to_string(),
                    arguments: part["functionCall"]["args"].clone(),
                };
            }
        }
        SseEventKind::Other
    }

    fn history_items_from_response(&self, response: &JsonValue) -> Vec<JsonValue> {
        match response["candidates"][0].get("content") {
            Some(content) if content.is_object() => vec![content.clone()],
            _ => Vec::new(),
        }
    }

    fn build_tool_result_messages(&self, results: &[(ExpansionCall, String)]) -> Vec<JsonValue> {
        // One user turn carrying every functionResponse part.
        let parts: Vec<JsonValue> = results
            .iter()
            .map(|(call, content)| {
                json!({
                    "functionResponse": {
                        "name": call.tool_use_id,
                        "response": {"output": content},
                    }
                })
            })
            .collect();
        if parts.is_empty() {
            return Vec::new();
        }
        vec![json!({"role": "user", "parts": parts})]
    }

    fn append_messages(&self, body: &JsonValue, messages: &[JsonValue]) -> JsonValue {
        if !body.is_object() {
            return body.clone();
        }
        let mut appended = body.clone();
        if !appended["contents"].is_array() {
            appended["contents"] = json!([]);
        }
        if let Some(contents) = appended.get_mut("contents").and_then(JsonValue::as_array_mut) {
            contents.extend(messages.iter().cloned());
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
        Self::for_each_function_response(&mut rewritten, |_, part| {
            let Some((text, shape)) = Self::response_text(&part["functionResponse"]["response"])
            else {
                return;
            };
            let Some(id) = parse_shadow_ref(&text) else {
                return;
            };
            let Some(original) = originals.get(id) else {
                return;
            };
            replaced.push(id.to_string());
            part["functionResponse"]["response"] = Self::rebuild_response(shape, original);
        });
        (rewritten, replaced)
    }

    fn strip_phantom_from_history(&self, body: &JsonValue) -> JsonValue {
        let mut stripped = body.clone();
        let Some(contents) = stripped.get_mut("contents").and_then(JsonValue::as_array_mut)
        else {
            return stripped;
        };
        let Some(last_model) = contents
            .iter()
            .rposition(|content| content["role"].as_str() == Some("model"))
        else {
            return stripped;
        };
        let mut remove_content = false;
        if let Some(parts) = contents[last_model]
            .get_mut("parts")
            .and_then(JsonValue::as_array_mut)
        {
            parts.retain(|part| !Self::is_phantom_part(part));
            remove_content = parts.is_empty();
        }
        if remove_content {
            contents.remove(last_model);
        }
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request_with_function_response() -> JsonValue {
        json!({
            "contents": [
                {"role": "user", "parts": [{"text": "search the codebase"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "search_files", "args": {"query": "todo"}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "search_files",
                     "response": {"output": "twelve matches"}}}
                ]}
            ]
        })
    }

    #[test]
    fn extracts_function_responses_by_name() {
        let adapter = GeminiAdapter::new();
        let outputs = adapter.extract_tool_outputs(&request_with_function_response());
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, "search_files");
        assert_eq!(outputs[0].tool_name, "search_files");
        assert_eq!(outputs[0].content, "twelve matches");
    }

    #[test]
    fn apply_preserves_wrapper_key() {
        let adapter = GeminiAdapter::new();
        let rewritten = adapter.apply_tool_outputs(
            &request_with_function_response(),
            &[Replacement {
                id: "search_files".to_string(),
                position: 0,
                content: "summary".to_string(),
            }],
        );
        assert_eq!(
            rewritten["contents"][2]["parts"][0]["functionResponse"]["response"]["output"],
            "summary"
        );
    }

    #[test]
    fn apply_same_content_is_identity() {
        let adapter = GeminiAdapter::new();
        let body = request_with_function_response();
        let rewritten = adapter.apply_tool_outputs(
            &body,
            &[Replacement {
                id: "search_files".to_string(),
                position: 0,
                content: "twelve matches".to_string(),
            }],
        );
        assert_eq!(rewritten, body);
    }

    #[test]
    fn arbitrary_response_object_is_serialized() {
        let adapter = GeminiAdapter::new();
        let body = json!({
            "contents": [
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "fetch",
                     "response": {"status": 200, "body": "ok"}}}
                ]}
            ]
        });
        let outputs = adapter.extract_tool_outputs(&body);
        assert_eq!(outputs.len(), 1);
        let parsed: JsonValue =
            serde_json::from_str(&outputs[0].content).expect("serialized object");
        assert_eq!(parsed["status"], 200);
    }

    #[test]
    fn user_query_skips_function_responses() {
        let adapter = GeminiAdapter::new();
        assert_eq!(
            adapter.extract_user_query(&request_with_function_response()),
            "search the codebase"
        );
    }

    #[test]
    fn filter_phantom_removes_parts() {
        let adapter = GeminiAdapter::new();
        let response = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "expanding"},
                    {"functionCall": {"name": "expand_context", "args": {"id": "shadow_x"}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let (filtered, modified) = adapter.filter_phantom(&response);
        assert!(modified);
        let parts = filtered["candidates"][0]["content"]["parts"]
            .as_array()
            .expect("parts");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "expanding");
    }

    #[test]
    fn parse_phantom_uses_function_name_as_id() {
        let adapter = GeminiAdapter::new();
        let response = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "expand_context", "args": {"id": "shadow_abc"}}}
                ]}
            }]
        });
        let calls = adapter.parse_phantom_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_use_id, PHANTOM_TOOL_NAME);
        assert_eq!(calls[0].shadow_id, "shadow_abc");
    }

    #[test]
    fn inject_phantom_appends_declaration() {
        let adapter = GeminiAdapter::new();
        let body = json!({
            "contents": [],
            "tools": [{"functionDeclarations": [{"name": "search_files"}]}]
        });
        let once = adapter.inject_phantom_tool(&body);
        let declarations = once["tools"][0]["functionDeclarations"]
            .as_array()
            .expect("declarations");
        assert_eq!(declarations.len(), 2);
        assert_eq!(declarations[1]["name"], PHANTOM_TOOL_NAME);
        assert_eq!(adapter.inject_phantom_tool(&once), once);
    }

    #[test]
    fn inject_phantom_creates_tools_when_absent() {
        let adapter = GeminiAdapter::new();
        let injected = adapter.inject_phantom_tool(&json!({"contents": []}));
        assert_eq!(
            injected["tools"][0]["functionDeclarations"][0]["name"],
            PHANTOM_TOOL_NAME
        );
    }

    #[test]
    fn classify_whole_part_event() {
        let adapter = GeminiAdapter::new();
        let event = adapter.classify_sse_event(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"expand_context","args":{"id":"shadow_x"}}}]}}]}"#,
        );
        assert_eq!(
            event,
            SseEventKind::ToolUseComplete {
                id: "expand_context".to_string(),
                name: "expand_context".to_string(),
                arguments: json!({"id": "shadow_x"}),
            }
        );

        let text = adapter.classify_sse_event(
            r#"{"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}"#,
        );
        assert_eq!(text, SseEventKind::Other);
    }

    #[test]
    fn usage_from_usage_metadata() {
        let adapter = GeminiAdapter::new();
        let usage = adapter.extract_usage(&json!({
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10}
        }));
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn strip_phantom_drops_empty_model_turn() {
        let adapter = GeminiAdapter::new();
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "expand_context", "args": {"id": "shadow_x"}}}
                ]}
            ]
        });
        let stripped = adapter.strip_phantom_from_history(&body);
        assert_eq!(stripped["contents"].as_array().map(Vec::len), Some(1));
    }
}
