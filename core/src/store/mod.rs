//! Shadow store: content-addressed originals, summaries, and expansion
//! records with independent expiries.
//!
//! The store is the only mutable state shared across requests. Entries are
//! pure data; nothing in here holds references back into the pipeline, so
//! an in-memory implementation and a remote one are interchangeable behind
//! [`ShadowStore`].

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::Digest;
use sha2::Sha256;

mod memory;

pub use memory::MemoryShadowStore;
pub use memory::spawn_sweeper;

/// Prefix of every shadow identifier.
pub const SHADOW_ID_PREFIX: &str = "shadow_";

/// Hex digits carried by a shadow identifier (first 16 bytes of SHA-256).
const SHADOW_ID_HEX_LEN: usize = 32;

/// Derive the shadow id for a blob of tool-output content.
///
/// Pure function of the bytes: the same content yields the same id across
/// processes and restarts, which is what keeps the model's prompt-prefix
/// cache warm across turns.
pub fn shadow_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex = hex::encode(&digest[..SHADOW_ID_HEX_LEN / 2]);
    format!("{SHADOW_ID_PREFIX}{hex}")
}

/// Whether a string is a well-formed shadow id (`shadow_` + 32 hex chars).
pub fn is_shadow_id(candidate: &str) -> bool {
    match candidate.strip_prefix(SHADOW_ID_PREFIX) {
        Some(hex) => {
            hex.len() == SHADOW_ID_HEX_LEN && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        }
        None => false,
    }
}

/// The message-envelope pair captured the first time an id is expanded.
///
/// Stored so identical history can be reconstructed on follow-up turns
/// after the original entry has expired. The envelopes are opaque JSON in
/// whatever shape the adapter produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionRecord {
    /// The assistant turn that carried the phantom tool-use.
    pub assistant_message: JsonValue,
    /// The tool-result message carrying the original content.
    pub tool_result_message: JsonValue,
}

/// Keyed map with two TTL classes plus an expansion-record slot per key.
///
/// `set` refreshes expiry; `get` never returns an expired entry (callers
/// treat a missing original as a cache miss). `original` and `compressed`
/// are independently sweepable: losing one never invalidates the other.
pub trait ShadowStore: Send + Sync {
    fn set_original(&self, id: &str, content: String);
    fn get_original(&self, id: &str) -> Option<String>;
    fn delete_original(&self, id: &str);

    fn set_compressed(&self, id: &str, summary: String);
    fn get_compressed(&self, id: &str) -> Option<String>;
    fn delete_compressed(&self, id: &str);

    fn set_expansion_record(&self, id: &str, record: ExpansionRecord);
    fn get_expansion_record(&self, id: &str) -> Option<ExpansionRecord>;
    fn delete_expansion_record(&self, id: &str);

    /// Remove expired entries from all three tables.
    fn sweep(&self);
}
