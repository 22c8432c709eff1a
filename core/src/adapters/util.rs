//! JSON helpers shared by the dialect adapters.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use shadowgate_protocol::Replacement;

/// Concatenated `text` fields of a content-block array, newline-joined.
pub(crate) fn text_from_blocks(blocks: &[JsonValue], text_type: &str) -> String {
    blocks
        .iter()
        .filter(|block| block["type"].as_str() == Some(text_type))
        .filter_map(|block| block["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tool-result content in either wire shape: a plain string or a block
/// array whose text blocks get concatenated.
pub(crate) fn tool_result_text(content: &JsonValue) -> Option<(String, bool)> {
    match content {
        JsonValue::String(text) => Some((text.clone(), false)),
        JsonValue::Array(blocks) => Some((text_from_blocks(blocks, "text"), true)),
        _ => None,
    }
}

/// Index replacements by extraction position.
pub(crate) fn by_position(replacements: &[Replacement]) -> HashMap<usize, &Replacement> {
    replacements.iter().map(|r| (r.position, r)).collect()
}

/// Whether any entry of a tools array carries the given name, under either
/// the flat `{name}` shape or the nested `{function: {name}}` shape.
pub(crate) fn tools_contain(tools: &JsonValue, name: &str) -> bool {
    tools
        .as_array()
        .is_some_and(|entries| {
            entries.iter().any(|entry| {
                entry["name"].as_str() == Some(name)
                    || entry["function"]["name"].as_str() == Some(name)
            })
        })
}
