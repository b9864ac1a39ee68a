//! OpenAI-compatible extraction against a local chat completions endpoint.

use std::sync::Arc;

use argos_client::OpenAiCompatibleProvider;
use argos_core::ai_fallback::AiFallbackDecider;
use argos_core::error::AppError;
use argos_core::extraction::{
    AiBudget, ExtractionOutcome, ExtractionRequest, ProviderSpec, TargetSchema,
};
use argos_core::traits::ExtractionProvider;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
}

fn provider(server: &MockServer, name: &str, priority: u32) -> OpenAiCompatibleProvider {
    let spec = ProviderSpec::new(name, priority, 0.0).with_model("test-model");
    OpenAiCompatibleProvider::new(spec, "test-key", &format!("{}/v1", server.uri())).unwrap()
}

#[tokio::test]
async fn sends_schema_prompt_and_returns_raw_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(r#"{"nct_id":"NCT1"}"#)))
        .expect(1)
        .mount(&server)
        .await;

    let value = provider(&server, "local", 0)
        .extract("Study NCT1", &TargetSchema::ClinicalTrial, &AiBudget::default())
        .await
        .unwrap();

    assert_eq!(value, json!(r#"{"nct_id":"NCT1"}"#));
}

#[tokio::test]
async fn rate_limit_is_retryable_llm_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({ "error": { "message": "Rate limit reached" } })),
        )
        .mount(&server)
        .await;

    let err = provider(&server, "local", 0)
        .extract("x", &TargetSchema::Patent, &AiBudget::default())
        .await
        .unwrap_err();

    match err {
        AppError::LlmError {
            status_code,
            retryable,
            message,
        } => {
            assert_eq!(status_code, 429);
            assert!(retryable);
            assert_eq!(message, "Rate limit reached");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn decider_moves_past_failing_provider_and_unwraps_fences() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&failing)
        .await;
    let working = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "```json\n{\"publication_number\": \"WO2016162604A1\", \"title\": \"Crystalline form\"}\n```",
        )))
        .mount(&working)
        .await;

    let decider = AiFallbackDecider::new(
        vec![
            Arc::new(provider(&working, "second", 1)) as Arc<dyn ExtractionProvider>,
            Arc::new(provider(&failing, "first", 0)),
        ],
        AiBudget::default(),
    );
    let request = ExtractionRequest::new("Patent WO2016162604A1", TargetSchema::Patent);

    let outcome = decider.maybe_extract(&request, &CancellationToken::new()).await;

    let result = match outcome {
        ExtractionOutcome::Extracted(result) => result,
        other => panic!("expected an extraction, got {other:?}"),
    };
    assert_eq!(result.provider, "second");
    assert_eq!(result.data["title"], "Crystalline form");
    assert_eq!(result.audit.len(), 2);
}
