mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use relay_llm::gateway::http::{router, AppState};
use relay_llm::types::{ProviderId, Usage};
use support::{test_config, FailingModel, SleepyModel, StaticModel};

fn chat_request(payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-request-id", "req-test-1")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn simple_payload(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": "2+2?" }],
        "stream": stream,
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn happy_path_returns_the_openai_envelope_with_cost_headers() {
    let config = test_config(&[ProviderId::OpenAi]);
    let state = AppState::new(&config).with_model(Arc::new(StaticModel::new(
        ProviderId::OpenAi,
        "4",
        Usage::new(5, 1),
    )));
    let app = router(state);

    let response = app
        .oneshot(chat_request(simple_payload("gpt-4o", false)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-test-1"
    );
    let cost: f64 = response
        .headers()
        .get("x-cost-usd")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((cost - 0.000_022_5).abs() < 1e-10);
    assert_eq!(response.headers().get("x-input-tokens").unwrap(), "5");
    assert_eq!(response.headers().get("x-output-tokens").unwrap(), "1");

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "4");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 5);
    assert_eq!(body["usage"]["completion_tokens"], 1);
    assert_eq!(body["usage"]["total_tokens"], 6);
    assert_eq!(body["metadata"]["cached"], false);
    assert_eq!(body["metadata"]["provider"], "openai");
}

#[tokio::test]
async fn failing_primary_falls_back_to_the_secondary_provider() {
    let config = test_config(&[ProviderId::OpenAi, ProviderId::Anthropic]);
    let openai = FailingModel::new(ProviderId::OpenAi, 500);
    let openai_calls = openai.calls.clone();
    let anthropic = StaticModel::new(ProviderId::Anthropic, "4", Usage::new(5, 1));
    let anthropic_calls = anthropic.calls.clone();

    let state = AppState::new(&config)
        .with_model(Arc::new(openai))
        .with_model(Arc::new(anthropic));
    let app = router(state);

    let response = app
        .oneshot(chat_request(simple_payload("gpt-4o", false)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "4");
    assert_eq!(body["metadata"]["provider"], "anthropic");
    // openai twice (one retry), anthropic once.
    assert_eq!(body["metadata"]["attempts"], 3);
    assert_eq!(openai_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(anthropic_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_providers_surface_as_503_provider_error() {
    let config = test_config(&[ProviderId::OpenAi, ProviderId::Anthropic]);
    let state = AppState::new(&config)
        .with_model(Arc::new(FailingModel::new(ProviderId::OpenAi, 500)))
        .with_model(Arc::new(FailingModel::new(ProviderId::Anthropic, 503)));
    let app = router(state);

    let response = app
        .oneshot(chat_request(simple_payload("gpt-4o", false)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "provider_error");
    let providers = body["error"]["providers_tried"].as_array().unwrap();
    assert_eq!(providers.len(), 2);
    assert!(body["error"]["last_error"].as_str().unwrap().contains("status"));
}

#[tokio::test]
async fn timeout_header_short_circuits_with_408() {
    let config = test_config(&[ProviderId::OpenAi]);
    let state = AppState::new(&config).with_model(Arc::new(SleepyModel {
        provider: ProviderId::OpenAi,
        delay: Duration::from_millis(500),
    }));
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-timeout-ms", "50")
        .body(Body::from(simple_payload("gpt-4o", false).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "timeout_error");
    assert_eq!(body["error"]["timeout_ms"], 50);
}

#[tokio::test]
async fn invalid_bodies_are_rejected_with_400() {
    let config = test_config(&[ProviderId::OpenAi]);
    let state = AppState::new(&config).with_model(Arc::new(StaticModel::new(
        ProviderId::OpenAi,
        "4",
        Usage::new(1, 1),
    )));
    let app = router(state);

    let missing_messages = chat_request(json!({ "model": "gpt-4o", "messages": [] }));
    let response = app.clone().oneshot(missing_messages).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let bad_temperature = chat_request(json!({
        "model": "gpt-4o",
        "messages": [{ "role": "user", "content": "hi" }],
        "temperature": 9.0,
    }));
    let response = app.oneshot(bad_temperature).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streaming_emits_chunks_stop_and_done() {
    let config = test_config(&[ProviderId::OpenAi]);
    let state = AppState::new(&config).with_model(Arc::new(StaticModel::new(
        ProviderId::OpenAi,
        "hi",
        Usage::new(3, 2),
    )));
    let app = router(state);

    let response = app
        .oneshot(chat_request(simple_payload("gpt-4o", true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();
    let events: Vec<&str> = text
        .split("\n\n")
        .filter(|event| !event.is_empty())
        .collect();

    // one chunk per character, then the stop chunk, then the sentinel.
    assert_eq!(events.len(), 4);
    assert!(events[0].starts_with("data: {"));
    let first: Value = serde_json::from_str(&events[0][6..]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "h");

    let stop: Value = serde_json::from_str(&events[2][6..]).unwrap();
    assert_eq!(stop["choices"][0]["delta"], json!({}));
    assert_eq!(stop["choices"][0]["finish_reason"], "stop");

    assert_eq!(events[3], "data: [DONE]");
}

#[tokio::test]
async fn streaming_records_cost_after_the_stream_completes() {
    let config = test_config(&[ProviderId::OpenAi]);
    let state = AppState::new(&config).with_model(Arc::new(StaticModel::new(
        ProviderId::OpenAi,
        "hi",
        Usage::new(3, 2),
    )));
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(chat_request(simple_payload("gpt-4o", true)))
        .await
        .unwrap();
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    // Finalization runs inside the body stream, so totals are visible once
    // the body has been drained.
    let costs = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics/costs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let summary = body_json(costs).await;
    assert!(summary["total_usd"].as_f64().unwrap() > 0.0);
    assert_eq!(summary["total_input_tokens"], 3);
    assert_eq!(summary["total_output_tokens"], 2);
    assert_eq!(summary["recent"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_model_with_no_capable_provider_is_503() {
    let config = test_config(&[ProviderId::OpenAi]);
    let state = AppState::new(&config).with_model(Arc::new(StaticModel::new(
        ProviderId::OpenAi,
        "4",
        Usage::new(1, 1),
    )));
    let app = router(state);

    let response = app
        .oneshot(chat_request(simple_payload("mystery-model", false)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "provider_error");
}
