//! Shadowgate HTTP surface.
//!
//! Identifies the provider, selects an adapter, drives the tool-output
//! pipe over the request, forwards to the upstream, and drives the
//! expander (or the stream filter for SSE) over the response.

pub mod detect;
pub mod handler;
pub mod state;

pub use handler::build_router;
pub use state::AppState;
