//! Error taxonomy for the proxy pipeline.
//!
//! Compression failures are a normal outcome, not an exception: the pipe
//! catches [`GatewayErr::Compression`] and applies its fallback strategy.
//! Only unrecoverable I/O errors bubble up as top-level request errors.

use thiserror::Error;

/// Cap applied to upstream error-body excerpts embedded in messages.
pub const ERROR_BODY_EXCERPT_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum GatewayErr {
    /// The summarizer could not produce a usable summary. Swallowed by the
    /// pipe's fallback path; never fails the overall request.
    #[error("compression failed: {0}")]
    Compression(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// No upstream URL could be determined for the inbound path.
    #[error("no upstream target resolvable for request")]
    TargetUnresolved,

    #[error("adapter not found: {0}")]
    UnknownAdapter(String),

    #[error("invalid config field {field}: {cause}")]
    Config { field: String, cause: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayErr>;

/// Truncate an upstream error body for inclusion in an error message.
pub fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_EXCERPT_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
