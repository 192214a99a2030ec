//! Chat Completions backend against a mock server.

use std::sync::Arc;
use std::time::Duration;

use envoy_core::{CallOptions, Coordinator, LocalModelMatcher};
use envoy_providers::{
    ApiKey, GenerateOptions, GenerateRequest, ModelProvider, OpenAiCompatConfig,
    OpenAiCompatProvider, ProviderError, ProviderRouter, TokenUsage,
};
use url::Url;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{SlowEchoProvider, mount_chat_completion, mount_chat_error, temp_ledger};

fn provider_for(server: &MockServer) -> OpenAiCompatProvider {
    let base = Url::parse(&format!("{}/v1", server.uri())).unwrap();
    OpenAiCompatProvider::new(OpenAiCompatConfig::new(base)).unwrap()
}

#[tokio::test]
async fn parses_text_and_usage() {
    let server = MockServer::start().await;
    mount_chat_completion(&server, "A PAR H", Some((12, 3))).await;

    let handle = provider_for(&server).resolve("llama3").unwrap();
    let generation = handle
        .generate("Your orders?", &GenerateRequest::default())
        .await
        .unwrap();
    assert_eq!(generation.text(), "A PAR H");
    assert_eq!(generation.usage().unwrap(), TokenUsage::new(12, 3));
}

#[tokio::test]
async fn sends_model_messages_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-4o-mini",
            "stream": false,
            "temperature": 0.5,
            "messages": [
                { "role": "system", "content": "You are Austria." },
                { "role": "user", "content": "Orders?" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "ok" } }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let base = Url::parse(&format!("{}/v1/", server.uri())).unwrap();
    let provider = OpenAiCompatProvider::new(
        OpenAiCompatConfig::new(base)
            .with_api_key(ApiKey::new("sk-test"))
            .with_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    let request = GenerateRequest {
        system_prompt: Some("You are Austria.".to_string()),
        tools: Vec::new(),
        options: GenerateOptions::default().with_temperature(0.5),
    };
    let generation = provider
        .resolve("gpt-4o-mini")
        .unwrap()
        .generate("Orders?", &request)
        .await
        .unwrap();
    assert_eq!(generation.text(), "ok");
}

#[tokio::test]
async fn error_status_surfaces_as_http_error() {
    let server = MockServer::start().await;
    mount_chat_error(&server, 429, "rate limited").await;

    let handle = provider_for(&server).resolve("llama3").unwrap();
    let err = handle
        .generate("hi", &GenerateRequest::default())
        .await
        .unwrap_err();
    match err {
        ProviderError::Http { status, body, model } => {
            assert_eq!(status, 429);
            assert!(body.contains("rate limited"));
            assert_eq!(model, "llama3");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn non_json_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = provider_for(&server)
        .resolve("llama3")
        .unwrap()
        .generate("hi", &GenerateRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::MalformedResponse { .. }));
}

#[tokio::test]
async fn router_strips_prefix_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({ "model": "llama3" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "{\"orders\": [\"F LON - NTH\"]}" } }],
            "usage": { "prompt_tokens": 30, "completion_tokens": 8 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let router = ProviderRouter::new().route("ollama/", Arc::new(provider_for(&server)), true);
    let (_dir, ledger) = temp_ledger();
    let coordinator = Coordinator::new(Arc::new(router), ledger, LocalModelMatcher::default());

    let map = coordinator
        .call_json(
            "orders?",
            "ollama/llama3",
            "ENGLAND",
            CallOptions::default()
                .with_game("g-wire")
                .with_expected_fields(["orders"]),
        )
        .await
        .unwrap();
    assert_eq!(map["orders"][0], "F LON - NTH");

    coordinator.drain_pending_writes().await;
    let rows = coordinator.ledger().records("g-wire");
    assert_eq!(rows.len(), 1);
    // The ledger keeps the caller's id, not the upstream one.
    assert_eq!(rows[0].record.model_id, "ollama/llama3");
    assert_eq!(rows[0].record.usage, TokenUsage::new(30, 8));
}

#[test]
fn unrouted_model_is_unknown() {
    let router = ProviderRouter::new();
    let err = router.resolve("gpt-4o").err().unwrap();
    assert!(matches!(err, ProviderError::UnknownModel { .. }));
}

#[test]
fn router_and_gate_fold_case_alike() {
    let prefixes = ["ollama/", "Équipe/"];
    let matcher = LocalModelMatcher::new(prefixes);
    let router = prefixes.iter().fold(ProviderRouter::new(), |router, prefix| {
        router.route(
            *prefix,
            Arc::new(SlowEchoProvider::new(Duration::from_millis(1))),
            true,
        )
    });

    for id in [
        "ollama/llama3",
        "OLLAMA/llama3",
        "Équipe/mistral",
        "ÉQUIPE/mistral",
        "équipe/mistral",
        "gpt-4o",
    ] {
        assert_eq!(
            router.resolve(id).is_ok(),
            matcher.is_local(id),
            "routing and local classification disagree on {id}"
        );
    }
}
