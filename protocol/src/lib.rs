//! Shared data model for the shadowgate proxy.
//!
//! This crate holds the value types passed between the gateway, the
//! tool-output pipe, and the expander, together with the configuration
//! type tree. It has no I/O and no async surface.

pub mod config_types;
pub mod models;

pub use config_types::ApiConfig;
pub use config_types::CompressionStrategy;
pub use config_types::ExpansionStrategy;
pub use config_types::FallbackStrategy;
pub use config_types::GatewayConfig;
pub use config_types::PipesConfig;
pub use config_types::ProviderConfig;
pub use config_types::ServerConfig;
pub use config_types::StoreConfig;
pub use config_types::StoreKind;
pub use config_types::TelemetryConfig;
pub use config_types::ToolOutputPipeConfig;
pub use config_types::UrlsConfig;
pub use models::CompressionRecord;
pub use models::CompressionStatus;
pub use models::ContentKind;
pub use models::ExpansionCall;
pub use models::Replacement;
pub use models::TokenUsage;
pub use models::ToolOutput;
