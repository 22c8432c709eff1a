//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use shadowgate_core::Result;
use shadowgate_core::expand::Expander;
use shadowgate_core::metrics::PipeMetrics;
use shadowgate_core::pipe::ToolOutputPipe;
use shadowgate_core::store::MemoryShadowStore;
use shadowgate_core::store::ShadowStore;
use shadowgate_core::store::spawn_sweeper;
use shadowgate_core::summarizer::SummarizerClient;
use shadowgate_core::telemetry::TelemetryWriter;
use shadowgate_protocol::GatewayConfig;

pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<MemoryShadowStore>,
    pub pipe: ToolOutputPipe,
    pub expander: Expander,
    pub metrics: Arc<PipeMetrics>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn from_config(config: GatewayConfig) -> Result<Arc<Self>> {
        let store = Arc::new(MemoryShadowStore::new(
            Duration::from_secs(config.store.original_ttl_secs),
            Duration::from_secs(config.store.compressed_ttl_secs),
        ));
        let store_dyn: Arc<dyn ShadowStore> = store.clone();
        let metrics = Arc::new(PipeMetrics::new());

        let summarizer = Arc::new(SummarizerClient::from_config(
            &config.pipes.tool_output,
            &config.urls.compression_service,
            &config.providers,
        )?);
        let telemetry = TelemetryWriter::from_config(&config.telemetry)?.map(Arc::new);
        let pipe = ToolOutputPipe::new(
            config.pipes.tool_output.clone(),
            store_dyn.clone(),
            summarizer,
            metrics.clone(),
        )
        .with_telemetry(telemetry);
        let expander = Expander::new(store_dyn, metrics.clone());

        Ok(Arc::new(Self {
            config,
            store,
            pipe,
            expander,
            metrics,
            http: reqwest::Client::new(),
        }))
    }

    /// Start the periodic store sweeper.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        spawn_sweeper(
            self.store.clone(),
            Duration::from_secs(self.config.store.sweep_interval_secs),
        )
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.write_timeout_secs)
    }
}
