//! End-to-end proxy tests against mock upstream and compression servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq;
use serde_json::Value as JsonValue;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Respond;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

use shadowgate_core::config::parse_config;
use shadowgate_core::store::ShadowStore;
use shadowgate_core::store::shadow_id;
use shadowgate_gateway::AppState;
use shadowgate_gateway::build_router;
use shadowgate_protocol::GatewayConfig;

fn test_config(compression_url: &str, extra_pipe_yaml: &str) -> GatewayConfig {
    let yaml = format!(
        "server:\n  port: 0\nurls:\n  gateway: http://localhost\n  compression_service: {compression_url}\npipes:\n  tool_output:\n    min_bytes: 64\n{extra_pipe_yaml}    api:\n      timeout_secs: 5\n"
    );
    parse_config(&yaml).expect("test config parses")
}

async fn spawn_gateway(config: GatewayConfig) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::from_config(config).expect("state builds");
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (addr, state)
}

fn mount_compression(summary: &str) -> Mock {
    Mock::given(method("POST")).and(path("/compress")).respond_with(
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"content": summary}
        })),
    )
}

fn anthropic_body(tool_content: &str) -> JsonValue {
    json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "messages": [
            {"role": "user", "content": "inspect the build output"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "make"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": tool_content}
            ]}
        ]
    })
}

fn text_response(text: &str) -> JsonValue {
    json!({
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 10, "output_tokens": 2}
    })
}

fn phantom_response(tool_use_id: &str, shadow_ref: &str) -> JsonValue {
    json!({
        "content": [
            {"type": "tool_use", "id": tool_use_id, "name": "expand_context",
             "input": {"id": shadow_ref}}
        ],
        "stop_reason": "tool_use"
    })
}

async fn post_messages(
    addr: SocketAddr,
    target: &str,
    body: &JsonValue,
    extra_headers: &[(&str, &str)],
) -> reqwest::Response {
    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("http://{addr}/v1/messages"))
        .header("x-target-url", target)
        .header("x-api-key", "test-key")
        .header("anthropic-version", "2023-06-01")
        .json(body);
    for (name, value) in extra_headers {
        request = request.header(*name, *value);
    }
    request.send().await.expect("gateway reachable")
}

async fn upstream_bodies(upstream: &MockServer) -> Vec<JsonValue> {
    upstream
        .received_requests()
        .await
        .expect("recorded requests")
        .iter()
        .map(|req| serde_json::from_slice(&req.body).expect("json body"))
        .collect()
}

/// A fixed-size hex id usable in `<<<SHADOW:...>>>` markers.
fn sid(fill: char) -> String {
    format!("shadow_{}", fill.to_string().repeat(32))
}

#[tokio::test]
async fn health_endpoint_answers_without_upstream() {
    let config = test_config("http://unused.invalid", "");
    let (addr, _state) = spawn_gateway(config).await;
    let response = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health reachable");
    assert_eq!(response.status(), 200);
    let body: JsonValue = response.json().await.expect("json");
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn unresolvable_target_yields_502() {
    let config = test_config("http://unused.invalid", "");
    let (addr, _state) = spawn_gateway(config).await;
    // No provider-specific headers, no X-Target-URL, unknown path.
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/some/opaque/path"))
        .json(&json!({"hello": 1}))
        .send()
        .await
        .expect("gateway reachable");
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn small_tool_output_passes_through_verbatim() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("never used").expect(0).mount(&compression).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok")))
        .mount(&upstream)
        .await;

    let config = test_config(&format!("{}/", compression.uri()), "");
    let (addr, _state) = spawn_gateway(config).await;

    // 28 bytes, under min_bytes=64: upstream sees the exact same body.
    let body = anthropic_body(r#"{"status":"ok","count":42}"#);
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(response.status(), 200);

    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0], body);

    let returned: JsonValue = response.json().await.expect("json");
    assert_eq!(returned["content"][0]["text"], "ok");
}

#[tokio::test]
async fn repeated_request_hits_cache_and_skips_summarizer() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    // Exactly one summarizer call across both requests.
    mount_compression("build log summary").expect(1).mount(&compression).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok")))
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, state) = spawn_gateway(config).await;

    let body = anthropic_body(&"error: undefined reference to `foo` ".repeat(40));
    let first = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(first.status(), 200);
    assert_eq!(state.metrics.snapshot().cache_hits, 0);

    let second = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(second.status(), 200);
    assert_eq!(state.metrics.snapshot().cache_hits, 1);

    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 2);
    // Byte-identical rewritten bodies across the two requests.
    assert_eq!(bodies[0], bodies[1]);
    let rewritten = bodies[0]["messages"][2]["content"][0]["content"]
        .as_str()
        .expect("rewritten content");
    assert!(rewritten.starts_with("<<<SHADOW:shadow_"));
    assert!(rewritten.contains("build log summary"));
    // Phantom tool injected alongside the compressed payload.
    assert!(
        bodies[0]["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .any(|tool| tool["name"] == "expand_context")
    );
}

#[tokio::test]
async fn expand_loop_replaces_phantom_with_original() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("File summary").mount(&compression).await;

    let content = format!("original content {}", "x".repeat(100));
    let id = shadow_id(&content);

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(phantom_response("toolu_9", &id)))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("Done")))
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, state) = spawn_gateway(config).await;

    let response = post_messages(addr, &upstream.uri(), &anthropic_body(&content), &[]).await;
    assert_eq!(response.status(), 200);
    let returned: JsonValue = response.json().await.expect("json");
    assert_eq!(returned["content"][0]["text"], "Done");
    assert!(!returned.to_string().contains("expand_context"));

    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 2);
    // The follow-up body pairs the original bytes with the tool-use id.
    let follow_up = bodies[1].to_string();
    assert!(follow_up.contains(&content));
    assert!(follow_up.contains("toolu_9"));

    // Compressed entry invalidated so the next turn is not rewritten back
    // to the summary.
    assert_eq!(state.store.get_compressed(&id), None);
    assert!(state.store.get_expansion_record(&id).is_some());
}

#[tokio::test]
async fn expansion_of_unknown_id_reports_not_found() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").expect(0).mount(&compression).await;

    let missing = sid('f');
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(phantom_response("toolu_1", &missing)))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("proceeding without it")))
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, _state) = spawn_gateway(config).await;

    // Mid-conversation body whose tool result is already compressed; the
    // store knows nothing about the id.
    let body = anthropic_body(&format!("<<<SHADOW:{missing}>>>\nsome summary"));
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(response.status(), 200);
    let returned: JsonValue = response.json().await.expect("json");
    assert_eq!(returned["content"][0]["text"], "proceeding without it");

    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 2);
    assert!(
        bodies[1]
            .to_string()
            .contains(&format!("shadow reference '{missing}' not found or expired"))
    );
}

#[tokio::test]
async fn selective_rewrite_expands_only_requested_id() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").expect(0).mount(&compression).await;

    let ids = [sid('a'), sid('b'), sid('c')];
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(phantom_response("toolu_9", &ids[1])))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("Done")))
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "    expansion_strategy: history_rewrite\n");
    let (addr, state) = spawn_gateway(config).await;
    for id in &ids {
        state.store.set_original(id, format!("full original for {id}"));
        state.store.set_compressed(id, "summary".to_string());
    }

    let body = json!({
        "model": "claude-sonnet-4-5",
        "messages": [
            {"role": "user", "content": "analyze all three"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_a", "name": "Bash", "input": {}},
                {"type": "tool_use", "id": "toolu_b", "name": "Bash", "input": {}},
                {"type": "tool_use", "id": "toolu_c", "name": "Bash", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_a",
                 "content": format!("<<<SHADOW:{}>>>\nsummary a", ids[0])},
                {"type": "tool_result", "tool_use_id": "toolu_b",
                 "content": format!("<<<SHADOW:{}>>>\nsummary b", ids[1])},
                {"type": "tool_result", "tool_use_id": "toolu_c",
                 "content": format!("<<<SHADOW:{}>>>\nsummary c", ids[2])}
            ]}
        ]
    });
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(response.status(), 200);

    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 2);
    let reforwarded = bodies[1].to_string();
    assert!(reforwarded.contains(&format!("<<<SHADOW:{}>>>", ids[0])));
    assert!(reforwarded.contains(&format!("full original for {}", ids[1])));
    assert!(reforwarded.contains(&format!("<<<SHADOW:{}>>>", ids[2])));

    assert!(state.store.get_compressed(&ids[0]).is_some());
    assert_eq!(state.store.get_compressed(&ids[1]), None);
    assert!(state.store.get_compressed(&ids[2]).is_some());
}

#[tokio::test]
async fn expansion_loop_bound_still_returns_clean_response() {
    struct EndlessPhantom {
        counter: AtomicUsize,
    }

    impl Respond for EndlessPhantom {
        fn respond(&self, _: &wiremock::Request) -> ResponseTemplate {
            let i = self.counter.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "tool_use", "id": format!("toolu_{i}"), "name": "expand_context",
                     "input": {"id": format!("shadow_{i}")}}
                ],
                "stop_reason": "tool_use"
            }))
        }
    }

    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").expect(0).mount(&compression).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(EndlessPhantom {
            counter: AtomicUsize::new(0),
        })
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, state) = spawn_gateway(config).await;
    for i in 0..10 {
        state.store.set_original(&format!("shadow_{i}"), format!("original {i}"));
    }

    let body = anthropic_body(&format!("<<<SHADOW:{}>>>\nsummary", sid('a')));
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(response.status(), 200);
    let returned: JsonValue = response.json().await.expect("json");
    // Phantom stripped even though the model never stopped asking.
    assert!(!returned.to_string().contains("expand_context"));

    // Initial forward plus the five bounded rounds.
    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 6);
}

#[tokio::test]
async fn threshold_header_off_suppresses_compression() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").expect(0).mount(&compression).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok")))
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, _state) = spawn_gateway(config).await;

    let body = anthropic_body(&"large output ".repeat(100));
    let response = post_messages(
        addr,
        &upstream.uri(),
        &body,
        &[("x-compression-threshold", "off")],
    )
    .await;
    assert_eq!(response.status(), 200);

    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies[0], body);
}

#[tokio::test]
async fn upstream_error_status_is_mirrored() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").mount(&compression).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({"error": {"type": "rate_limit"}})),
        )
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, _state) = spawn_gateway(config).await;

    let body = anthropic_body("small");
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(response.status(), 429);
    let returned: JsonValue = response.json().await.expect("json");
    assert_eq!(returned["error"]["type"], "rate_limit");
}

#[tokio::test]
async fn streaming_phantom_events_are_suppressed() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").expect(0).mount(&compression).await;

    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n",
        "\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"expand_context\",\"input\":{}}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"id\\\":\\\"shadow_x\\\"}\"}}\n",
        "\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, _state) = spawn_gateway(config).await;

    let mut body = anthropic_body("small");
    body["stream"] = json!(true);
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    assert_eq!(response.status(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"))
    );

    let streamed = response.text().await.expect("stream body");
    assert!(streamed.contains("Hello"));
    assert!(streamed.contains(" world"));
    assert!(!streamed.contains("expand_context"));
    assert!(!streamed.contains("shadow_x"));
}

#[tokio::test]
async fn streaming_expansion_reforwards_with_original() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("unused").expect(0).mount(&compression).await;

    let id = sid('d');
    let phantom_sse = format!(
        concat!(
            "data: {{\"type\":\"content_block_start\",\"index\":0,\"content_block\":",
            "{{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"expand_context\",\"input\":{{}}}}}}\n",
            "\n",
            "data: {{\"type\":\"content_block_delta\",\"index\":0,\"delta\":",
            "{{\"type\":\"input_json_delta\",\"partial_json\":\"{{\\\"id\\\":\\\"{id}\\\"}}\"}}}}\n",
            "\n",
            "data: {{\"type\":\"content_block_stop\",\"index\":0}}\n",
            "\n",
        ),
        id = id
    );
    let followup_sse = concat!(
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"After expansion\"}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(phantom_sse.as_bytes().to_vec(), "text/event-stream"),
        )
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(followup_sse.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, state) = spawn_gateway(config).await;
    state.store.set_original(&id, "the full original".to_string());
    state.store.set_compressed(&id, "summary".to_string());

    let mut body = anthropic_body(&format!("<<<SHADOW:{id}>>>\nsummary"));
    body["stream"] = json!(true);
    let response = post_messages(addr, &upstream.uri(), &body, &[]).await;
    let streamed = response.text().await.expect("stream body");
    assert!(streamed.contains("After expansion"));
    assert!(!streamed.contains("expand_context"));

    // The re-forwarded request carried the original in place of the summary.
    let bodies = upstream_bodies(&upstream).await;
    assert_eq!(bodies.len(), 2);
    assert!(bodies[1].to_string().contains("the full original"));
    assert_eq!(state.store.get_compressed(&id), None);
}

#[tokio::test]
async fn openai_chat_dialect_compresses_tool_messages() {
    let upstream = MockServer::start().await;
    let compression = MockServer::start().await;
    mount_compression("test run summary").mount(&compression).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        })))
        .mount(&upstream)
        .await;

    let config = test_config(&compression.uri(), "");
    let (addr, _state) = spawn_gateway(config).await;

    let body = json!({
        "model": "gpt-5.1",
        "messages": [
            {"role": "user", "content": "run the tests"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "run_tests", "arguments": "{}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_1",
             "content": "test output line ".repeat(40)}
        ]
    });
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("x-target-url", upstream.uri())
        .header("authorization", "Bearer sk-test")
        .json(&body)
        .send()
        .await
        .expect("gateway reachable");
    assert_eq!(response.status(), 200);

    let bodies = upstream_bodies(&upstream).await;
    let rewritten = bodies[0]["messages"][2]["content"]
        .as_str()
        .expect("tool content");
    assert!(rewritten.starts_with("<<<SHADOW:shadow_"));
    assert!(rewritten.contains("test run summary"));
    assert!(
        bodies[0]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .any(|tool| tool["function"]["name"] == "expand_context")
    );
}
