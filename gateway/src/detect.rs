//! Provider detection and target-URL resolution.
//!
//! Adapter choice priority: an explicit client-supplied selection header,
//! then inbound-path signals, then the shape of provider-specific auth
//! headers. The `X-Target-URL` header overrides the compiled default host;
//! when neither resolves, the gateway answers 502.

use http::HeaderMap;

/// Explicit provider selection header.
pub const PROVIDER_HEADER: &str = "x-shadowgate-provider";

/// Upstream host override.
pub const TARGET_URL_HEADER: &str = "x-target-url";

/// Per-request compression-threshold ladder value.
pub const THRESHOLD_HEADER: &str = "x-compression-threshold";

/// Determine which adapter should handle a request.
pub fn detect_provider(path: &str, headers: &HeaderMap) -> Option<&'static str> {
    if let Some(forced) = headers
        .get(PROVIDER_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return match forced {
            "anthropic" => Some("anthropic"),
            "openai" | "openai_chat" => Some("openai_chat"),
            "openai_responses" => Some("openai_responses"),
            "gemini" => Some("gemini"),
            _ => None,
        };
    }

    if path.contains("/chat/completions") {
        return Some("openai_chat");
    }
    if path.ends_with("/responses") {
        return Some("openai_responses");
    }
    if path.ends_with("/messages") {
        return Some("anthropic");
    }
    if path.contains(":generateContent") || path.contains(":streamGenerateContent") {
        return Some("gemini");
    }

    if headers.contains_key("x-api-key") && headers.contains_key("anthropic-version") {
        return Some("anthropic");
    }
    if headers.contains_key("x-goog-api-key") {
        return Some("gemini");
    }
    if headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer "))
    {
        return Some("openai_chat");
    }
    None
}

/// Compiled default host per provider.
pub fn default_target(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("https://api.anthropic.com"),
        "openai_chat" | "openai_responses" => Some("https://api.openai.com"),
        "gemini" => Some("https://generativelanguage.googleapis.com"),
        _ => None,
    }
}

/// Full upstream URL for a request, or `None` when unresolvable.
pub fn resolve_target_url(
    headers: &HeaderMap,
    provider: Option<&str>,
    path_and_query: &str,
) -> Option<String> {
    let base = match headers
        .get(TARGET_URL_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(target) => target.trim_end_matches('/').to_string(),
        None => default_target(provider?)?.to_string(),
    };
    Some(format!("{base}{path_and_query}"))
}
