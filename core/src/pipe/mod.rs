//! The tool-output pipe: request-side orchestration.
//!
//! Invoked once per inbound request body. Decides per tool output whether
//! to compress, consults the shadow store, fans the summarizer calls out
//! concurrently, splices the `<<<SHADOW:id>>>` replacements back into the
//! body, and injects the phantom tool when anything was replaced.
//!
//! Compression failures never fail the request: they surface as tagged
//! outcomes in the per-record ledger and the configured fallback decides
//! what the model sees instead.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use shadowgate_protocol::CompressionRecord;
use shadowgate_protocol::CompressionStatus;
use shadowgate_protocol::CompressionStrategy;
use shadowgate_protocol::FallbackStrategy;
use shadowgate_protocol::Replacement;
use shadowgate_protocol::ToolOutput;
use shadowgate_protocol::ToolOutputPipeConfig;

use crate::adapters::ProviderAdapter;
use crate::error::GatewayErr;
use crate::metrics::PipeMetrics;
use crate::shadow_format::expand_hint;
use crate::shadow_format::parse_shadow_ref;
use crate::shadow_format::wrap_summary;
use crate::store::ShadowStore;
use crate::store::shadow_id;
use crate::summarizer::SummarizeRequest;
use crate::summarizer::Summarizer;
use crate::telemetry::TelemetryWriter;

mod skip_tools;
mod threshold;

pub use skip_tools::resolve_skip_set;
pub use threshold::Threshold;
pub use threshold::parse_threshold;
pub use threshold::resolve_threshold;

/// Per-request scratch produced by the pipe and consumed by the expander.
#[derive(Clone)]
pub struct PipeContext {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub original_body: JsonValue,
    /// Shadow ids newly produced by this request.
    pub new_shadow_ids: Vec<String>,
    /// Resolved minimum-size threshold in bytes; `None` when compression
    /// was off for this request.
    pub threshold: Option<usize>,
    pub records: Vec<CompressionRecord>,
    pub was_compressed: bool,
    pub tools_filtered: bool,
}

impl PipeContext {
    fn new(adapter: Arc<dyn ProviderAdapter>, original_body: JsonValue) -> Self {
        Self {
            adapter,
            original_body,
            new_shadow_ids: Vec::new(),
            threshold: None,
            records: Vec::new(),
            was_compressed: false,
            tools_filtered: false,
        }
    }
}

/// What happened to one tool output during classification and execution.
enum Plan {
    /// No replacement; record only.
    Keep(CompressionRecord),
    /// Replace with a wrapped summary.
    Replace(CompressionRecord, String),
    /// Awaiting a summarizer call.
    Pending,
}

struct PendingTask {
    output_index: usize,
    shadow_id: String,
    tool_name: String,
    content: String,
}

pub struct ToolOutputPipe {
    config: ToolOutputPipeConfig,
    store: Arc<dyn ShadowStore>,
    summarizer: Arc<dyn Summarizer>,
    metrics: Arc<PipeMetrics>,
    telemetry: Option<Arc<TelemetryWriter>>,
}

impl ToolOutputPipe {
    pub fn new(
        config: ToolOutputPipeConfig,
        store: Arc<dyn ShadowStore>,
        summarizer: Arc<dyn Summarizer>,
        metrics: Arc<PipeMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            summarizer,
            metrics,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Option<Arc<TelemetryWriter>>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ToolOutputPipeConfig {
        &self.config
    }

    /// Run the pipe over one request body.
    ///
    /// Never fails the request: the worst outcome is an unchanged body.
    pub async fn process(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        body: &JsonValue,
        header_threshold: Option<&str>,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> (JsonValue, PipeContext) {
        let mut ctx = PipeContext::new(adapter.clone(), body.clone());
        if !self.config.enabled || self.config.strategy == CompressionStrategy::Passthrough {
            return (body.clone(), ctx);
        }

        let outputs = adapter.extract_tool_outputs(body);
        if outputs.is_empty() {
            return (body.clone(), ctx);
        }

        let min_bytes = match resolve_threshold(header_threshold, self.config.min_bytes) {
            Threshold::Off => return (body.clone(), ctx),
            Threshold::MinBytes(bytes) => bytes,
        };
        ctx.threshold = Some(min_bytes);

        let skip_set = resolve_skip_set(&self.config.skip_tools, adapter.name());
        let model = adapter.extract_model(body);
        let user_query = adapter.extract_user_query(body);

        let (mut plans, pending) = self.classify(&outputs, min_bytes, &skip_set, &mut ctx);
        self.run_pending(&pending, &model, &user_query, adapter.name(), cancel, &mut plans, &mut ctx)
            .await;

        let mut replacements = Vec::new();
        for (output, plan) in outputs.iter().zip(plans.iter()) {
            match plan {
                Plan::Keep(record) => self.finish_record(&mut ctx, adapter.name(), &model, record),
                Plan::Replace(record, summary) => {
                    self.finish_record(&mut ctx, adapter.name(), &model, record);
                    let id = record.shadow_id.clone().unwrap_or_default();
                    replacements.push(Replacement {
                        id: output.id.clone(),
                        position: output.position,
                        content: self.wrap(&id, summary),
                    });
                }
                // Unreachable: run_pending resolves every pending plan.
                Plan::Pending => {}
            }
        }

        if replacements.is_empty() {
            return (body.clone(), ctx);
        }
        ctx.was_compressed = true;

        let mut rewritten = adapter.apply_tool_outputs(body, &replacements);
        // Some wire formats reject tool definitions introduced on a
        // streaming request; skip injection rather than break the stream.
        let may_inject = !streaming || adapter.has_tools(body);
        if self.config.enable_expand_context && may_inject {
            rewritten = adapter.inject_phantom_tool(&rewritten);
            ctx.tools_filtered = true;
        }
        (rewritten, ctx)
    }

    fn classify(
        &self,
        outputs: &[ToolOutput],
        min_bytes: usize,
        skip_set: &HashSet<String>,
        ctx: &mut PipeContext,
    ) -> (Vec<Plan>, Vec<PendingTask>) {
        let mut plans = Vec::with_capacity(outputs.len());
        let mut pending = Vec::new();

        for (output_index, output) in outputs.iter().enumerate() {
            // Already-compressed content (a rerun over the pipe's own
            // output) is a warm hit: refresh the TTL, change nothing.
            if let Some(id) = parse_shadow_ref(&output.content) {
                if let Some(summary) = self.store.get_compressed(id) {
                    self.store.set_compressed(id, summary);
                }
                plans.push(Plan::Keep(CompressionRecord {
                    shadow_id: Some(id.to_string()),
                    tool_name: output.tool_name.clone(),
                    status: CompressionStatus::Hit,
                    original_size: output.content.len(),
                    compressed_size: Some(output.content.len()),
                    cache_hit: true,
                    latency_ms: None,
                }));
                continue;
            }

            let size = output.content.len();
            if skip_set.contains(&output.tool_name) {
                plans.push(Plan::Keep(self.keep_record(output, CompressionStatus::SkippedByToolName)));
                continue;
            }
            if size <= min_bytes {
                plans.push(Plan::Keep(self.keep_record(output, CompressionStatus::PassthroughSmall)));
                continue;
            }
            if size > self.config.max_bytes {
                plans.push(Plan::Keep(self.keep_record(output, CompressionStatus::PassthroughLarge)));
                continue;
            }

            let id = shadow_id(&output.content);
            if let Some(summary) = self.store.get_compressed(&id) {
                // Keep expansion possible within this session.
                if self.store.get_original(&id).is_none() {
                    self.store.set_original(&id, output.content.clone());
                }
                ctx.new_shadow_ids.push(id.clone());
                plans.push(Plan::Replace(
                    CompressionRecord {
                        shadow_id: Some(id),
                        tool_name: output.tool_name.clone(),
                        status: CompressionStatus::Hit,
                        original_size: size,
                        compressed_size: Some(summary.len()),
                        cache_hit: true,
                        latency_ms: None,
                    },
                    summary,
                ));
                continue;
            }

            if self.config.strategy == CompressionStrategy::Simple {
                let summary = simple_truncate(&output.content, self.config.target_ratio);
                self.store.set_original(&id, output.content.clone());
                self.store.set_compressed(&id, summary.clone());
                ctx.new_shadow_ids.push(id.clone());
                plans.push(Plan::Replace(
                    CompressionRecord {
                        shadow_id: Some(id),
                        tool_name: output.tool_name.clone(),
                        status: CompressionStatus::Compressed,
                        original_size: size,
                        compressed_size: Some(summary.len()),
                        cache_hit: false,
                        latency_ms: None,
                    },
                    summary,
                ));
                continue;
            }

            pending.push(PendingTask {
                output_index,
                shadow_id: id,
                tool_name: output.tool_name.clone(),
                content: output.content.clone(),
            });
            plans.push(Plan::Pending);
        }

        (plans, pending)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pending(
        &self,
        pending: &[PendingTask],
        model: &str,
        user_query: &str,
        provider: &str,
        cancel: &CancellationToken,
        plans: &mut [Plan],
        ctx: &mut PipeContext,
    ) {
        if pending.is_empty() {
            return;
        }

        // Independent calls, no ordering requirement; the summarizer client
        // owns the semaphore and rate limit.
        let results = futures::future::join_all(pending.iter().map(|task| {
            let query = if user_query.is_empty() { None } else { Some(user_query) };
            let max_tokens = summary_token_budget(task.content.len(), self.config.target_ratio);
            async move {
                let started = Instant::now();
                let result = self
                    .summarizer
                    .summarize(
                        SummarizeRequest {
                            tool_name: &task.tool_name,
                            content: &task.content,
                            user_query: query,
                            source_provider: provider,
                            model,
                            max_tokens: Some(max_tokens),
                        },
                        cancel,
                    )
                    .await;
                (started.elapsed().as_millis() as u64, result)
            }
        }))
        .await;

        for (task, (latency_ms, result)) in pending.iter().zip(results) {
            let plan = match result {
                Ok(summary) => {
                    self.store.set_original(&task.shadow_id, task.content.clone());
                    self.store.set_compressed(&task.shadow_id, summary.content.clone());
                    ctx.new_shadow_ids.push(task.shadow_id.clone());
                    Plan::Replace(
                        CompressionRecord {
                            shadow_id: Some(task.shadow_id.clone()),
                            tool_name: task.tool_name.clone(),
                            status: CompressionStatus::Compressed,
                            original_size: task.content.len(),
                            compressed_size: Some(summary.content.len()),
                            cache_hit: summary.cache_hit,
                            latency_ms: Some(latency_ms),
                        },
                        summary.content,
                    )
                }
                Err(GatewayErr::Cancelled) => {
                    tracing::debug!(shadow_id = %task.shadow_id, "compression cancelled");
                    Plan::Keep(CompressionRecord {
                        shadow_id: Some(task.shadow_id.clone()),
                        tool_name: task.tool_name.clone(),
                        status: CompressionStatus::Miss,
                        original_size: task.content.len(),
                        compressed_size: None,
                        cache_hit: false,
                        latency_ms: Some(latency_ms),
                    })
                }
                Err(error) => {
                    tracing::warn!(
                        shadow_id = %task.shadow_id,
                        tool_name = %task.tool_name,
                        %error,
                        "compression failed, applying fallback"
                    );
                    self.fallback_plan(task, latency_ms)
                }
            };
            plans[task.output_index] = plan;
        }
    }

    fn fallback_plan(&self, task: &PendingTask, latency_ms: u64) -> Plan {
        let record = CompressionRecord {
            shadow_id: Some(task.shadow_id.clone()),
            tool_name: task.tool_name.clone(),
            status: CompressionStatus::Miss,
            original_size: task.content.len(),
            compressed_size: None,
            cache_hit: false,
            latency_ms: Some(latency_ms),
        };
        match self.config.fallback_strategy {
            FallbackStrategy::Passthrough => Plan::Keep(record),
            FallbackStrategy::Simple => {
                let summary = simple_truncate(&task.content, self.config.target_ratio);
                self.store.set_original(&task.shadow_id, task.content.clone());
                self.store.set_compressed(&task.shadow_id, summary.clone());
                let record = CompressionRecord {
                    compressed_size: Some(summary.len()),
                    ..record
                };
                Plan::Replace(record, summary)
            }
        }
    }

    fn keep_record(&self, output: &ToolOutput, status: CompressionStatus) -> CompressionRecord {
        CompressionRecord {
            shadow_id: None,
            tool_name: output.tool_name.clone(),
            status,
            original_size: output.content.len(),
            compressed_size: None,
            cache_hit: false,
            latency_ms: None,
        }
    }

    fn finish_record(
        &self,
        ctx: &mut PipeContext,
        provider: &str,
        model: &str,
        record: &CompressionRecord,
    ) {
        self.metrics.record(record.status);
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(provider, model, record);
        }
        ctx.records.push(record.clone());
    }

    fn wrap(&self, id: &str, summary: &str) -> String {
        let mut content = wrap_summary(id, summary);
        if self.config.include_expand_hint {
            content.push('\n');
            content.push_str(&expand_hint(id));
        }
        content
    }
}

/// Deterministic word-count truncation used by the `simple` strategy and
/// fallback.
fn simple_truncate(content: &str, target_ratio: f64) -> String {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return String::new();
    }
    let keep = ((words.len() as f64) * target_ratio) as usize;
    let keep = keep.clamp(1, words.len());
    let mut truncated = words[..keep].join(" ");
    if keep < words.len() {
        truncated.push_str(" ...");
    }
    truncated
}

fn summary_token_budget(content_len: usize, target_ratio: f64) -> u32 {
    let tokens = (content_len as f64 / 4.0) * target_ratio;
    (tokens as u32).max(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use crate::adapters::AnthropicAdapter;
    use crate::error::Result;
    use crate::store::MemoryShadowStore;
    use crate::summarizer::Summary;

    struct MockSummarizer {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockSummarizer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Summarizer for MockSummarizer {
        async fn summarize(
            &self,
            request: SummarizeRequest<'_>,
            _cancel: &CancellationToken,
        ) -> Result<Summary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayErr::Compression("mock failure".to_string()));
            }
            Ok(Summary {
                content: format!("summary of {} bytes", request.content.len()),
                cache_hit: false,
                processing_time_ms: Some(1),
            })
        }
    }

    fn body_with_content(content: &str) -> JsonValue {
        json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "do the thing"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": content}
                ]}
            ]
        })
    }

    fn test_config() -> ToolOutputPipeConfig {
        ToolOutputPipeConfig {
            min_bytes: 256,
            ..ToolOutputPipeConfig::default()
        }
    }

    struct Fixture {
        pipe: ToolOutputPipe,
        store: Arc<MemoryShadowStore>,
        summarizer: Arc<MockSummarizer>,
        metrics: Arc<PipeMetrics>,
    }

    fn fixture(config: ToolOutputPipeConfig, summarizer: MockSummarizer) -> Fixture {
        let store = Arc::new(MemoryShadowStore::default());
        let summarizer = Arc::new(summarizer);
        let metrics = Arc::new(PipeMetrics::new());
        let pipe = ToolOutputPipe::new(
            config,
            store.clone(),
            summarizer.clone(),
            metrics.clone(),
        );
        Fixture {
            pipe,
            store,
            summarizer,
            metrics,
        }
    }

    async fn run(fixture: &Fixture, body: &JsonValue) -> (JsonValue, PipeContext) {
        run_with_threshold(fixture, body, None).await
    }

    async fn run_with_threshold(
        fixture: &Fixture,
        body: &JsonValue,
        header: Option<&str>,
    ) -> (JsonValue, PipeContext) {
        let cancel = CancellationToken::new();
        fixture
            .pipe
            .process(
                Arc::new(AnthropicAdapter::new()),
                body,
                header,
                false,
                &cancel,
            )
            .await
    }

    #[tokio::test]
    async fn small_output_passes_through() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = body_with_content(r#"{"status":"ok","count":42}"#);
        let (rewritten, ctx) = run(&fixture, &body).await;
        assert_eq!(rewritten, body);
        assert_eq!(ctx.records.len(), 1);
        assert_eq!(ctx.records[0].status, CompressionStatus::PassthroughSmall);
        assert!(!ctx.was_compressed);
        assert_eq!(fixture.summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn boundary_at_min_bytes_not_compressed() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let (_, ctx) = run(&fixture, &body_with_content(&"x".repeat(256))).await;
        assert_eq!(ctx.records[0].status, CompressionStatus::PassthroughSmall);

        let (_, ctx) = run(&fixture, &body_with_content(&"x".repeat(257))).await;
        assert_eq!(ctx.records[0].status, CompressionStatus::Compressed);
    }

    #[tokio::test]
    async fn boundary_above_max_bytes_passes_through() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let (rewritten, ctx) = run(&fixture, &body_with_content(&"x".repeat(65537))).await;
        assert_eq!(ctx.records[0].status, CompressionStatus::PassthroughLarge);
        assert_eq!(rewritten, body_with_content(&"x".repeat(65537)));
        assert_eq!(fixture.summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn large_output_gets_compressed_and_stored() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let content = "word ".repeat(200);
        let (rewritten, ctx) = run(&fixture, &body_with_content(&content)).await;

        assert!(ctx.was_compressed);
        assert_eq!(ctx.records[0].status, CompressionStatus::Compressed);
        let id = ctx.records[0].shadow_id.clone().expect("shadow id");
        assert_eq!(fixture.store.get_original(&id).as_deref(), Some(content.as_str()));
        assert!(fixture.store.get_compressed(&id).is_some());

        let spliced = rewritten["messages"][2]["content"][0]["content"]
            .as_str()
            .expect("spliced text");
        assert!(spliced.starts_with(&format!("<<<SHADOW:{id}>>>\n")));
        // Phantom injected since something was replaced.
        assert_eq!(rewritten["tools"][0]["name"], "expand_context");
        assert!(ctx.tools_filtered);
    }

    #[tokio::test]
    async fn second_run_hits_cache_without_summarizer_call() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = body_with_content(&"word ".repeat(200));

        let (first, _) = run(&fixture, &body).await;
        assert_eq!(fixture.summarizer.calls(), 1);
        assert_eq!(fixture.metrics.cache_hits(), 0);

        let (second, ctx) = run(&fixture, &body).await;
        assert_eq!(fixture.summarizer.calls(), 1);
        assert_eq!(fixture.metrics.cache_hits(), 1);
        assert_eq!(ctx.records[0].status, CompressionStatus::Hit);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn identical_summaries_give_identical_bodies_across_fresh_caches() {
        let body = body_with_content(&"word ".repeat(200));
        let fixture_a = fixture(test_config(), MockSummarizer::new());
        let fixture_b = fixture(test_config(), MockSummarizer::new());
        let (rewritten_a, _) = run(&fixture_a, &body).await;
        let (rewritten_b, _) = run(&fixture_b, &body).await;
        assert_eq!(rewritten_a, rewritten_b);
    }

    #[tokio::test]
    async fn rerun_over_own_output_is_a_no_op() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = body_with_content(&"word ".repeat(200));
        let (rewritten, _) = run(&fixture, &body).await;
        let (again, ctx) = run(&fixture, &rewritten).await;
        assert_eq!(again, rewritten);
        assert_eq!(ctx.records[0].status, CompressionStatus::Hit);
        assert_eq!(fixture.summarizer.calls(), 1);
    }

    #[tokio::test]
    async fn threshold_header_off_disables_compression() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = body_with_content(&"word ".repeat(5000));
        let (rewritten, ctx) = run_with_threshold(&fixture, &body, Some("off")).await;
        assert_eq!(rewritten, body);
        assert!(ctx.records.is_empty());
        assert_eq!(fixture.summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn threshold_header_overrides_configured_minimum() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        // 1500 bytes: above the configured 256, below the 1k rung (4096).
        let body = body_with_content(&"x".repeat(1500));
        let (_, ctx) = run_with_threshold(&fixture, &body, Some("1k")).await;
        assert_eq!(ctx.records[0].status, CompressionStatus::PassthroughSmall);
    }

    #[tokio::test]
    async fn unknown_threshold_header_falls_back() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = body_with_content(&"x".repeat(1500));
        let (_, ctx) = run_with_threshold(&fixture, &body, Some("3k")).await;
        assert_eq!(ctx.records[0].status, CompressionStatus::Compressed);
    }

    #[tokio::test]
    async fn skip_tools_by_resolved_name() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1",
                     "content": "x".repeat(5000)}
                ]}
            ]
        });
        let (rewritten, ctx) = run(&fixture, &body).await;
        assert_eq!(rewritten, body);
        assert_eq!(ctx.records[0].status, CompressionStatus::SkippedByToolName);
        assert_eq!(fixture.summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn failure_with_passthrough_fallback_keeps_original() {
        let fixture = fixture(test_config(), MockSummarizer::failing());
        let body = body_with_content(&"word ".repeat(200));
        let (rewritten, ctx) = run(&fixture, &body).await;
        assert_eq!(rewritten, body);
        assert_eq!(ctx.records[0].status, CompressionStatus::Miss);
        assert!(!ctx.was_compressed);
        let id = ctx.records[0].shadow_id.clone().expect("shadow id");
        assert!(fixture.store.get_compressed(&id).is_none());
    }

    #[tokio::test]
    async fn failure_with_simple_fallback_truncates() {
        let config = ToolOutputPipeConfig {
            min_bytes: 256,
            fallback_strategy: FallbackStrategy::Simple,
            ..ToolOutputPipeConfig::default()
        };
        let fixture = fixture(config, MockSummarizer::failing());
        let content = "word ".repeat(200);
        let (rewritten, ctx) = run(&fixture, &body_with_content(&content)).await;
        assert_eq!(ctx.records[0].status, CompressionStatus::Miss);
        assert!(ctx.was_compressed);
        let spliced = rewritten["messages"][2]["content"][0]["content"]
            .as_str()
            .expect("spliced text");
        assert!(spliced.starts_with("<<<SHADOW:"));
        assert!(spliced.contains("word word"));
        assert!(spliced.contains("..."));
    }

    #[tokio::test]
    async fn simple_strategy_never_calls_the_summarizer() {
        let config = ToolOutputPipeConfig {
            min_bytes: 256,
            strategy: CompressionStrategy::Simple,
            ..ToolOutputPipeConfig::default()
        };
        let fixture = fixture(config, MockSummarizer::new());
        let (rewritten, ctx) = run(&fixture, &body_with_content(&"word ".repeat(200))).await;
        assert_eq!(fixture.summarizer.calls(), 0);
        assert_eq!(ctx.records[0].status, CompressionStatus::Compressed);
        assert!(
            rewritten["messages"][2]["content"][0]["content"]
                .as_str()
                .expect("spliced")
                .starts_with("<<<SHADOW:")
        );
    }

    #[tokio::test]
    async fn passthrough_strategy_disables_the_pipe() {
        let config = ToolOutputPipeConfig {
            strategy: CompressionStrategy::Passthrough,
            ..ToolOutputPipeConfig::default()
        };
        let fixture = fixture(config, MockSummarizer::new());
        let body = body_with_content(&"word ".repeat(5000));
        let (rewritten, ctx) = run(&fixture, &body).await;
        assert_eq!(rewritten, body);
        assert!(ctx.records.is_empty());
    }

    #[tokio::test]
    async fn streaming_without_tools_skips_injection() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let body = body_with_content(&"word ".repeat(200));
        let cancel = CancellationToken::new();
        let (rewritten, ctx) = fixture
            .pipe
            .process(Arc::new(AnthropicAdapter::new()), &body, None, true, &cancel)
            .await;
        assert!(ctx.was_compressed);
        assert!(!ctx.tools_filtered);
        assert!(rewritten.get("tools").is_none());
    }

    #[tokio::test]
    async fn expand_hint_appended_when_enabled() {
        let fixture = fixture(test_config(), MockSummarizer::new());
        let (rewritten, _) = run(&fixture, &body_with_content(&"word ".repeat(200))).await;
        let spliced = rewritten["messages"][2]["content"][0]["content"]
            .as_str()
            .expect("spliced");
        assert!(spliced.contains("[call expand_context with id shadow_"));
    }

    #[test]
    fn simple_truncate_is_deterministic() {
        let content = "one two three four five six seven eight";
        let a = simple_truncate(content, 0.5);
        let b = simple_truncate(content, 0.5);
        assert_eq!(a, b);
        assert_eq!(a, "one two three four ...");
    }
}
