//! The proxy handler: G in the request flow.
//!
//! client → detect provider → pipe (compress + rewrite) → forward →
//! expander (JSON) or stream-filter rounds (SSE) → client.
//!
//! Inbound bodies that fail JSON parsing are forwarded unchanged; the
//! proxy never synthesizes 4xx for them. Only an unresolvable target
//! yields a gateway-originated error (502).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use http::header;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use shadowgate_core::GatewayErr;
use shadowgate_core::adapters::ProviderAdapter;
use shadowgate_core::adapters::get_adapter;
use shadowgate_core::error::excerpt;
use shadowgate_core::expand::MAX_EXPANSION_ROUNDS;
use shadowgate_core::expand::Upstream;
use shadowgate_core::http_util::read_body_capped;
use shadowgate_core::stream::LineBuffer;
use shadowgate_core::stream::StreamFilter;
use shadowgate_protocol::ExpansionStrategy;

use crate::detect::PROVIDER_HEADER;
use crate::detect::TARGET_URL_HEADER;
use crate::detect::THRESHOLD_HEADER;
use crate::detect::detect_provider;
use crate::detect::resolve_target_url;
use crate::state::AppState;

/// Cap on inbound request bodies read into memory.
const MAX_INBOUND_BYTES: usize = 64 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(proxy)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body_bytes = match axum::body::to_bytes(body, MAX_INBOUND_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                &format!("failed to read request body: {error}"),
            );
        }
    };

    let provider = detect_provider(&path_and_query, &parts.headers);
    let Some(target_url) = resolve_target_url(&parts.headers, provider, &path_and_query) else {
        return error_response(StatusCode::BAD_GATEWAY, "no upstream target resolvable");
    };

    let adapter = provider.and_then(|name| get_adapter(name).ok());
    let parsed = if parts.method == Method::POST {
        serde_json::from_slice::<JsonValue>(&body_bytes).ok()
    } else {
        None
    };
    let forward_headers = filtered_headers(&parts.headers);

    match (parsed, adapter) {
        (Some(body_json), Some(adapter)) => {
            proxy_json(state, adapter, &parts.headers, forward_headers, target_url, body_json).await
        }
        _ => passthrough(state, parts.method, forward_headers, target_url, body_bytes).await,
    }
}

/// Rewrite, forward, and expand a JSON request through the pipeline.
async fn proxy_json(
    state: Arc<AppState>,
    adapter: Arc<dyn ProviderAdapter>,
    inbound_headers: &HeaderMap,
    forward_headers: HeaderMap,
    target_url: String,
    body_json: JsonValue,
) -> Response {
    let threshold = inbound_headers
        .get(THRESHOLD_HEADER)
        .and_then(|value| value.to_str().ok());
    let streaming = body_json["stream"].as_bool() == Some(true)
        || target_url.contains(":streamGenerateContent");

    let cancel = CancellationToken::new();
    let _cancel_guard = cancel.clone().drop_guard();

    tracing::debug!(
        provider = adapter.name(),
        model = %adapter.extract_model(&body_json),
        streaming,
        "proxying request"
    );

    let (rewritten, ctx) = state
        .pipe
        .process(adapter.clone(), &body_json, threshold, streaming, &cancel)
        .await;
    if ctx.was_compressed {
        tracing::debug!(
            records = ctx.records.len(),
            new_ids = ctx.new_shadow_ids.len(),
            "request rewritten"
        );
    }

    let upstream_response = match send_upstream(
        &state.http,
        &target_url,
        &forward_headers,
        &rewritten,
        state.forward_timeout(),
    )
    .await
    {
        Ok(response) => response,
        Err(error) => return error_response(StatusCode::BAD_GATEWAY, &error.to_string()),
    };

    let status = upstream_response.status();
    let content_type = upstream_response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !status.is_success() {
        return mirror_response(status, &content_type, upstream_response).await;
    }

    if content_type.contains("text/event-stream") {
        return stream_rounds(
            state,
            adapter,
            rewritten,
            forward_headers,
            target_url,
            upstream_response,
        );
    }

    let bytes = match read_body_capped(upstream_response).await {
        Ok(bytes) => bytes,
        Err(error) => return error_response(StatusCode::BAD_GATEWAY, &error.to_string()),
    };
    let Ok(response_json) = serde_json::from_slice::<JsonValue>(&bytes) else {
        return bytes_response(status, Some(&content_type), bytes);
    };

    let final_json = expand_response(&state, &adapter, &rewritten, response_json, &forward_headers, &target_url).await;
    let usage = adapter.extract_usage(&final_json);
    tracing::debug!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens,
        "upstream response complete"
    );
    match serde_json::to_vec(&final_json) {
        Ok(serialized) => bytes_response(status, Some("application/json"), Bytes::from(serialized)),
        Err(error) => error_response(StatusCode::BAD_GATEWAY, &error.to_string()),
    }
}

/// Drive the configured expansion strategy over a complete JSON response.
async fn expand_response(
    state: &Arc<AppState>,
    adapter: &Arc<dyn ProviderAdapter>,
    request_body: &JsonValue,
    response: JsonValue,
    forward_headers: &HeaderMap,
    target_url: &str,
) -> JsonValue {
    if !state.pipe.config().enable_expand_context {
        return state.expander.finalize(adapter, &response);
    }

    let upstream = HttpUpstream {
        client: state.http.clone(),
        url: target_url.to_string(),
        headers: forward_headers.clone(),
        timeout: state.forward_timeout(),
    };

    match state.pipe.config().expansion_strategy {
        ExpansionStrategy::Inline => {
            let fallback = response.clone();
            match state
                .expander
                .run_inline(adapter, request_body, response, &upstream)
                .await
            {
                Ok(final_response) => final_response,
                Err(error) => {
                    tracing::warn!(%error, "inline expansion failed, returning filtered response");
                    state.expander.finalize(adapter, &fallback)
                }
            }
        }
        ExpansionStrategy::HistoryRewrite => {
            let mut body = request_body.clone();
            let mut current = response;
            for _ in 0..MAX_EXPANSION_ROUNDS {
                let calls = adapter.parse_phantom_calls(&current);
                if calls.is_empty() {
                    break;
                }
                let (new_body, replaced) =
                    state
                        .expander
                        .rewrite_history(adapter, &body, Some(&current), &calls);
                if replaced.is_empty() {
                    // Nothing substitutable (originals expired); stop
                    // rather than re-ask the model forever.
                    break;
                }
                body = new_body;
                match upstream.forward(&body).await {
                    Ok(next) => current = next,
                    Err(error) => {
                        tracing::warn!(%error, "re-forward after history rewrite failed");
                        break;
                    }
                }
            }
            state.expander.finalize(adapter, &current)
        }
    }
}

/// Stream an SSE response through the phantom filter, running selective
/// history-rewrite rounds when the model asked for expansion.
fn stream_rounds(
    state: Arc<AppState>,
    adapter: Arc<dyn ProviderAdapter>,
    request_body: JsonValue,
    forward_headers: HeaderMap,
    target_url: String,
    first_response: reqwest::Response,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut body = request_body;
        let mut response = first_response;
        let mut rounds = 0usize;

        loop {
            let mut filter = StreamFilter::new(adapter.clone());
            let mut buffer = LineBuffer::new();
            let mut byte_stream = response.bytes_stream();
            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for line in buffer.push(&bytes) {
                            for out in filter.process_line(&line) {
                                if send_line(&tx, out).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "upstream stream error");
                        break;
                    }
                }
            }
            if let Some(rest) = buffer.remainder() {
                for out in filter.process_line(&rest) {
                    if send_line(&tx, out).await.is_err() {
                        return;
                    }
                }
            }

            if filter.has_suppressed() && rounds < MAX_EXPANSION_ROUNDS {
                rounds += 1;
                let calls: Vec<_> = filter
                    .take_suppressed()
                    .into_iter()
                    .filter_map(shadowgate_core::stream::SuppressedCall::into_expansion_call)
                    .collect();
                let (new_body, replaced) =
                    state.expander.rewrite_history(&adapter, &body, None, &calls);
                if replaced.is_empty() {
                    for line in filter.finish() {
                        if send_line(&tx, line).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
                body = new_body;
                tracing::debug!(round = rounds, expanded = replaced.len(), "streaming expansion round");
                match send_upstream(
                    &state.http,
                    &target_url,
                    &forward_headers,
                    &body,
                    state.forward_timeout(),
                )
                .await
                {
                    Ok(next) if next.status().is_success() => {
                        response = next;
                        continue;
                    }
                    Ok(next) => {
                        tracing::warn!(status = %next.status(), "streaming re-forward rejected");
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "streaming re-forward failed");
                        return;
                    }
                }
            }

            for line in filter.finish() {
                if send_line(&tx, line).await.is_err() {
                    return;
                }
            }
            return;
        }
    });

    let stream_body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(stream_body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn send_line(
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    line: String,
) -> Result<(), ()> {
    let mut framed = line;
    framed.push('\n');
    tx.send(Ok(Bytes::from(framed))).await.map_err(|_| ())
}

/// Forward a request we could not (or should not) rewrite.
async fn passthrough(
    state: Arc<AppState>,
    method: Method,
    forward_headers: HeaderMap,
    target_url: String,
    body_bytes: Bytes,
) -> Response {
    let request = state
        .http
        .request(method, &target_url)
        .headers(forward_headers)
        .body(body_bytes);
    let response = match tokio::time::timeout(state.forward_timeout(), request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => return error_response(StatusCode::BAD_GATEWAY, &error.to_string()),
        Err(_) => return error_response(StatusCode::BAD_GATEWAY, "upstream timed out"),
    };
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    mirror_response(status, &content_type, response).await
}

async fn mirror_response(
    status: StatusCode,
    content_type: &str,
    response: reqwest::Response,
) -> Response {
    match read_body_capped(response).await {
        Ok(bytes) => bytes_response(status, Some(content_type), bytes),
        Err(error) => error_response(StatusCode::BAD_GATEWAY, &error.to_string()),
    }
}

async fn send_upstream(
    client: &reqwest::Client,
    url: &str,
    headers: &HeaderMap,
    body: &JsonValue,
    timeout: Duration,
) -> shadowgate_core::Result<reqwest::Response> {
    let future = client.post(url).headers(headers.clone()).json(body).send();
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => Err(GatewayErr::Transport(error.to_string())),
        Err(_) => Err(GatewayErr::Timeout),
    }
}

/// Upstream seam for the inline expander, bound to one target URL.
struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, body: &JsonValue) -> shadowgate_core::Result<JsonValue> {
        let response =
            send_upstream(&self.client, &self.url, &self.headers, body, self.timeout).await?;
        let status = response.status();
        let bytes = read_body_capped(response).await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(GatewayErr::Upstream {
                status: status.as_u16(),
                body: excerpt(&text).to_string(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Strip hop-by-hop and gateway-control headers before forwarding.
fn filtered_headers(headers: &HeaderMap) -> HeaderMap {
    let skip = [
        header::HOST.as_str(),
        header::CONTENT_LENGTH.as_str(),
        header::CONNECTION.as_str(),
        header::TRANSFER_ENCODING.as_str(),
        header::ACCEPT_ENCODING.as_str(),
        header::EXPECT.as_str(),
        PROVIDER_HEADER,
        TARGET_URL_HEADER,
        THRESHOLD_HEADER,
    ];
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if skip.iter().any(|skipped| name.as_str().eq_ignore_ascii_case(skipped)) {
            continue;
        }
        filtered.insert(name.clone(), value.clone());
    }
    filtered
}

fn bytes_response(status: StatusCode, content_type: Option<&str>, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type
        && !content_type.is_empty()
    {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({"error": message});
    bytes_response(
        status,
        Some("application/json"),
        Bytes::from(body.to_string()),
    )
}
