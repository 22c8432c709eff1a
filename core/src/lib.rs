//! Shadowgate core: the tool-output compression pipeline.
//!
//! A transparent proxy core that rewrites LLM-bound requests to replace
//! bulky tool outputs with short summaries, keeps the originals
//! addressable through the phantom `expand_context` tool, and stays
//! coherent across concurrent requests, streamed responses, and multi-turn
//! conversations via the dual-TTL shadow store.
//!
//! Request flow: the gateway selects a [`adapters::ProviderAdapter`],
//! drives [`pipe::ToolOutputPipe`] over the body, forwards upstream, then
//! drives [`expand::Expander`] (or [`stream::StreamFilter`] for SSE) over
//! the response.

pub mod adapters;
pub mod config;
pub mod error;
pub mod expand;
pub mod http_util;
pub mod metrics;
pub mod pipe;
pub mod shadow_format;
pub mod store;
pub mod stream;
pub mod summarizer;
pub mod telemetry;

pub use error::GatewayErr;
pub use error::Result;
