//! The compressed-payload wire format.
//!
//! Every compressed tool-result content begins with the ASCII delimiter
//! `<<<SHADOW:{id}>>>` followed by a newline, then the summary. The
//! delimiter is fixed: no surrounding whitespace, no variant brackets.
//! Models that compute prompt-prefix caches reuse them only if these bytes
//! are stable, so any change here is a correctness regression, not a
//! cosmetic one.

use crate::store::is_shadow_id;

pub const SHADOW_OPEN: &str = "<<<SHADOW:";
pub const SHADOW_CLOSE: &str = ">>>";

/// Wrap a summary in the shadow delimiter.
pub fn wrap_summary(shadow_id: &str, summary: &str) -> String {
    format!("{SHADOW_OPEN}{shadow_id}{SHADOW_CLOSE}\n{summary}")
}

/// One-line hint appended after a summary when `include_expand_hint` is on.
pub fn expand_hint(shadow_id: &str) -> String {
    format!("[call expand_context with id {shadow_id} to retrieve the full output]")
}

/// Parse the shadow id out of a compressed payload, if the content starts
/// with a well-formed delimiter.
pub fn parse_shadow_ref(content: &str) -> Option<&str> {
    let rest = content.strip_prefix(SHADOW_OPEN)?;
    let end = rest.find(SHADOW_CLOSE)?;
    let id = &rest[..end];
    if is_shadow_id(id) { Some(id) } else { None }
}
