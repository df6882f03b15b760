//! HTTP client tests against a wiremock upstream

use modelgate::client::HttpProviderClient;
use modelgate::error::GatewayError;
use modelgate::provider::{ChatMessage, ChatRequest, ProviderClient};
use serde_json::json;
use std::time::Duration;
use tokio_test::assert_ok;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, api_key: Option<String>) -> HttpProviderClient {
    HttpProviderClient::new(
        "openai",
        format!("{}/v1", server.uri()),
        "gpt-4o-mini",
        api_key,
        Duration::from_secs(5),
    )
    .expect("client should build")
}

fn chat(prompt: &str) -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        model: None,
        temperature: None,
        max_tokens: None,
        stream: false,
        tenant_id: "acme".to_string(),
    }
}

#[tokio::test]
async fn test_complete_parses_content_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Hello there"}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        })))
        .mount(&server)
        .await;

    let completion = assert_ok!(client_for(&server, None).complete(&chat("hi")).await);
    assert_eq!(completion.content, "Hello there");
    assert_eq!(completion.usage.total_tokens, 12);
}

#[tokio::test]
async fn test_bearer_token_sent_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let completion = client_for(&server, Some("sk-test".to_string()))
        .complete(&chat("hi"))
        .await
        .expect("authorized request should succeed");
    assert_eq!(completion.content, "ok");
    // Missing usage block falls back to zeroes
    assert_eq!(completion.usage.total_tokens, 0);
}

#[tokio::test]
async fn test_429_maps_to_upstream_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = client_for(&server, None).complete(&chat("hi")).await.unwrap_err();
    match err {
        GatewayError::UpstreamRateLimited { ref provider, ref reason } => {
            assert_eq!(provider, "openai");
            assert!(reason.contains("slow down"));
        }
        other => panic!("expected UpstreamRateLimited, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_5xx_maps_to_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client_for(&server, None).complete(&chat("hi")).await.unwrap_err();
    assert!(matches!(err, GatewayError::ProviderTransient { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_4xx_maps_to_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let err = client_for(&server, None).complete(&chat("hi")).await.unwrap_err();
    assert!(matches!(err, GatewayError::ProviderFatal { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_empty_choices_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let err = client_for(&server, None).complete(&chat("hi")).await.unwrap_err();
    assert!(matches!(err, GatewayError::ProviderTransient { .. }));
}

#[tokio::test]
async fn test_stream_collects_deltas_until_done() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let deltas = assert_ok!(client_for(&server, None).stream(&chat("hi")).await);
    assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
}

#[tokio::test]
async fn test_health_check_reflects_upstream_status() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    assert!(client_for(&server, None).health_check().await);

    let down = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&down)
        .await;
    assert!(!client_for(&down, None).health_check().await);
}
