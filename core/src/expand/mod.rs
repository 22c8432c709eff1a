//! The expander: response-side orchestration of `expand_context` calls.
//!
//! Two strategies share the phantom-detection logic and diverge on how
//! they re-forward:
//!
//! - **inline** runs follow-up round trips through the model, feeding it
//!   the originals as tool results until it stops asking (bounded);
//! - **selective history rewrite** splices the originals into the request
//!   history in place and hands the body back for one re-forward, leaving
//!   non-expanded ids compressed so the prompt prefix stays cacheable.
//!
//! Every expanded id gets an expansion record written and its compressed
//! entry deleted: the client's next turn will carry the true original, and
//! rewriting it back to a possibly-lossy summary would be wrong.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use shadowgate_protocol::ExpansionCall;

use crate::adapters::ProviderAdapter;
use crate::error::Result;
use crate::metrics::PipeMetrics;
use crate::store::ExpansionRecord;
use crate::store::ShadowStore;

/// Hard cap on follow-up round trips per request.
pub const MAX_EXPANSION_ROUNDS: usize = 5;

/// The literal error content a model sees for an unknown or expired id.
pub fn not_found_message(shadow_id: &str) -> String {
    format!("shadow reference '{shadow_id}' not found or expired")
}

/// Seam over the gateway's upstream forwarding, so the loop is testable
/// without a network.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, body: &JsonValue) -> Result<JsonValue>;
}

pub struct Expander {
    store: Arc<dyn ShadowStore>,
    metrics: Arc<PipeMetrics>,
    max_rounds: usize,
}

impl Expander {
    pub fn new(store: Arc<dyn ShadowStore>, metrics: Arc<PipeMetrics>) -> Self {
        Self {
            store,
            metrics,
            max_rounds: MAX_EXPANSION_ROUNDS,
        }
    }

    /// Inline expansion loop over a complete (non-streaming) response.
    ///
    /// Returns the final client-facing response, phantom-free.
    pub async fn run_inline(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        request_body: &JsonValue,
        mut response: JsonValue,
        upstream: &dyn Upstream,
    ) -> Result<JsonValue> {
        let mut body = request_body.clone();
        let mut expanded: HashSet<String> = HashSet::new();
        let mut rounds = 0usize;

        loop {
            let calls = adapter.parse_phantom_calls(&response);
            let fresh: Vec<ExpansionCall> = calls
                .into_iter()
                .filter(|call| {
                    if expanded.contains(&call.shadow_id) {
                        tracing::warn!(
                            shadow_id = %call.shadow_id,
                            "dropping repeated expansion request"
                        );
                        false
                    } else {
                        true
                    }
                })
                .collect();
            if fresh.is_empty() {
                break;
            }
            if rounds >= self.max_rounds {
                tracing::warn!(
                    rounds,
                    remaining = fresh.len(),
                    "expansion loop bound reached, remaining requests not honored"
                );
                break;
            }
            rounds += 1;

            let assistant_items = adapter.history_items_from_response(&response);
            let mut results: Vec<(ExpansionCall, String)> = Vec::new();
            let mut found = 0usize;
            let mut missing = 0usize;
            for call in &fresh {
                match self.store.get_original(&call.shadow_id) {
                    Some(original) => {
                        found += 1;
                        self.record_expansion(adapter, &assistant_items, call, &original);
                        results.push((call.clone(), original));
                    }
                    None => {
                        missing += 1;
                        results.push((call.clone(), not_found_message(&call.shadow_id)));
                    }
                }
                expanded.insert(call.shadow_id.clone());
            }
            tracing::debug!(round = rounds, found, missing, "expanding shadow references");

            let tool_messages = adapter.build_tool_result_messages(&results);
            body = adapter.append_messages(&body, &assistant_items);
            body = adapter.append_messages(&body, &tool_messages);
            response = upstream.forward(&body).await?;
        }

        let (filtered, _) = adapter.filter_phantom(&response);
        Ok(filtered)
    }

    /// Selective history rewrite: replace only the requested ids' tool
    /// results with their originals and strip the phantom from the last
    /// assistant turn. Non-expanded ids stay compressed. Returns the
    /// rewritten body (ready to re-forward) and the ids actually replaced.
    pub fn rewrite_history(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        request_body: &JsonValue,
        response: Option<&JsonValue>,
        calls: &[ExpansionCall],
    ) -> (JsonValue, Vec<String>) {
        let assistant_items = response
            .map(|r| adapter.history_items_from_response(r))
            .unwrap_or_default();

        let mut originals: HashMap<String, String> = HashMap::new();
        for call in calls {
            if originals.contains_key(&call.shadow_id) {
                continue;
            }
            match self.store.get_original(&call.shadow_id) {
                Some(original) => {
                    originals.insert(call.shadow_id.clone(), original);
                }
                None => tracing::warn!(
                    shadow_id = %call.shadow_id,
                    "original not found or expired, leaving summary in place"
                ),
            }
        }

        let (rewritten, replaced) = adapter.rewrite_compressed_results(request_body, &originals);
        let stripped = adapter.strip_phantom_from_history(&rewritten);

        for id in &replaced {
            if let Some(call) = calls.iter().find(|call| &call.shadow_id == id)
                && let Some(original) = originals.get(id)
            {
                self.record_expansion(adapter, &assistant_items, call, original);
            }
        }
        (stripped, replaced)
    }

    /// Strip any phantom artifacts from a client-facing response.
    pub fn finalize(&self, adapter: &Arc<dyn ProviderAdapter>, response: &JsonValue) -> JsonValue {
        adapter.filter_phantom(response).0
    }

    fn record_expansion(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        assistant_items: &[JsonValue],
        call: &ExpansionCall,
        original: &str,
    ) {
        let assistant_message = match assistant_items {
            [] => JsonValue::Null,
            [single] => single.clone(),
            many => JsonValue::Array(many.to_vec()),
        };
        let tool_result_message = adapter
            .build_tool_result_messages(&[(call.clone(), original.to_string())])
            .into_iter()
            .next()
            .unwrap_or(JsonValue::Null);
        self.store.set_expansion_record(
            &call.shadow_id,
            ExpansionRecord {
                assistant_message,
                tool_result_message,
            },
        );
        // The client's next turn carries the real original; serving the
        // stale summary back to it would silently lose information.
        self.store.delete_compressed(&call.shadow_id);
        self.metrics.record_expansion();
    }
}
