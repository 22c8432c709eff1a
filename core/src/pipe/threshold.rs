//! The per-request compression-threshold ladder.
//!
//! Clients pick from a fixed ladder of token counts via the
//! `X-Compression-Threshold` header; each rung maps to a byte
//! approximation at four bytes per token. `off` disables compression for
//! the request; unknown values silently fall back to the configured
//! default.

const BYTES_PER_TOKEN: usize = 4;

/// Resolved threshold for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Compression disabled for this request.
    Off,
    /// Compress contents larger than this many bytes.
    MinBytes(usize),
}

/// Parse a ladder value. Returns `None` for unknown values.
pub fn parse_threshold(value: &str) -> Option<Threshold> {
    let tokens = match value {
        "off" => return Some(Threshold::Off),
        "256" => 256,
        "1k" => 1024,
        "2k" => 2048,
        "4k" => 4096,
        "8k" => 8192,
        "16k" => 16384,
        "32k" => 32768,
        "64k" => 65536,
        "128k" => 131072,
        _ => return None,
    };
    Some(Threshold::MinBytes(tokens * BYTES_PER_TOKEN))
}

/// Resolve the request threshold: header rung if valid, configured
/// `min_bytes` otherwise.
pub fn resolve_threshold(header: Option<&str>, configured_min_bytes: usize) -> Threshold {
    header
        .and_then(parse_threshold)
        .unwrap_or(Threshold::MinBytes(configured_min_bytes))
}
