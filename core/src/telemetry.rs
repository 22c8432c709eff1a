//! Per-request compression telemetry.
//!
//! One newline-delimited JSON record per tool output, appended to a
//! configured file. The `SHADOWGATE_TELEMETRY_FILE` environment variable
//! overrides the configured destination; nothing here affects pipeline
//! semantics.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

use shadowgate_protocol::CompressionRecord;
use shadowgate_protocol::TelemetryConfig;

use crate::error::Result;

/// Environment variable overriding the telemetry file destination.
pub const TELEMETRY_FILE_ENV: &str = "SHADOWGATE_TELEMETRY_FILE";

#[derive(Debug, Serialize)]
struct TelemetryLine<'a> {
    ts: String,
    provider: &'a str,
    model: &'a str,
    #[serde(flatten)]
    record: &'a CompressionRecord,
}

pub struct TelemetryWriter {
    file: Mutex<File>,
}

impl TelemetryWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Build a writer from config, honoring the env-var override. Returns
    /// `None` when telemetry is disabled or no destination is set.
    pub fn from_config(config: &TelemetryConfig) -> Result<Option<Self>> {
        let destination = std::env::var(TELEMETRY_FILE_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| config.file.clone());
        match destination {
            Some(path) if config.enabled => Ok(Some(Self::open(&path)?)),
            _ => Ok(None),
        }
    }

    pub fn record(&self, provider: &str, model: &str, record: &CompressionRecord) {
        let line = TelemetryLine {
            ts: chrono::Utc::now().to_rfc3339(),
            provider,
            model,
            record,
        };
        let Ok(mut serialized) = serde_json::to_string(&line) else {
            return;
        };
        serialized.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(error) = file.write_all(serialized.as_bytes()) {
            tracing::warn!(%error, "failed to write telemetry record");
        }
    }
}
