//! Configuration loading.
//!
//! YAML with `${VAR}` / `${VAR:-default}` expansion applied to the raw
//! text before parsing, so secrets stay out of config files.

use std::path::Path;
use std::sync::LazyLock;

use regex::Captures;
use regex::Regex;

use shadowgate_protocol::GatewayConfig;

use crate::error::GatewayErr;
use crate::error::Result;

#[allow(clippy::expect_used)]
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("static pattern compiles")
});

/// Expand `${VAR}` and `${VAR:-default}` references.
///
/// Unset variables without a default expand to the empty string.
pub fn expand_env(raw: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(raw, |caps: &Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => value,
                _ => caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Load, expand, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)?;
    parse_config(&raw)
}

/// Parse and validate config from a YAML string.
pub fn parse_config(raw: &str) -> Result<GatewayConfig> {
    let expanded = expand_env(raw);
    let config: GatewayConfig =
        serde_yaml::from_str(&expanded).map_err(|e| GatewayErr::Config {
            field: "<root>".to_string(),
            cause: e.to_string(),
        })?;
    config.validate().map_err(|e| GatewayErr::Config {
        field: e.field,
        cause: e.cause,
    })?;
    Ok(config)
}
