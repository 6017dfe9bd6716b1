//! Integration tests for the HTTP OCR backend against a mock server.
//!
//! Verifies the wire contract and that service failures are classified
//! into retryable and terminal errors.

use std::time::Duration;

use rollcall_core::Error;
use rollcall_inference::{HttpOcrBackend, OcrBackend};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer, api_key: Option<&str>) -> HttpOcrBackend {
    HttpOcrBackend::new(
        server.uri(),
        api_key.map(str::to_string),
        Duration::from_millis(500),
    )
}

#[tokio::test]
async fn test_tokens_are_parsed() {
    let mock_server = MockServer::start().await;

    let body = serde_json::json!({
        "text": "101 Ali Khan A\n102 Sara Malik P",
        "width": 1600.0,
        "tokens": [
            {"text": "101", "bbox": [40, 100, 60, 30], "confidence": 0.97},
            {"text": "A", "bbox": [1300, 102, 25, 28], "confidence": 0.81},
            {"text": "  ", "bbox": [0, 0, 1, 1]}
        ]
    });

    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .and(header("Authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let output = backend(&mock_server, Some("secret"))
        .extract_text(b"fake-image", "image/jpeg")
        .await
        .unwrap();

    assert_eq!(output.page_width, Some(1600.0));
    // Blank tokens are dropped.
    assert_eq!(output.tokens.len(), 2);
    assert_eq!(output.tokens[0].text, "101");
    assert_eq!(output.tokens[1].bbox.x, 1300.0);
    assert!(output.raw_text.contains("Sara Malik"));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&mock_server)
        .await;

    let err = backend(&mock_server, None)
        .extract_text(b"img", "image/png")
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {:?}", err);
}

#[tokio::test]
async fn test_quota_is_transient() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&mock_server)
        .await;

    let err = backend(&mock_server, None)
        .extract_text(b"img", "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransientService(_)));
}

#[tokio::test]
async fn test_unprocessable_is_parse_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(ResponseTemplate::new(422).set_body_string("no text found"))
        .mount(&mock_server)
        .await;

    let err = backend(&mock_server, None)
        .extract_text(b"img", "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ParseFailure(_)));
}

#[tokio::test]
async fn test_garbage_body_is_parse_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&mock_server)
        .await;

    let err = backend(&mock_server, None)
        .extract_text(b"img", "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ParseFailure(_)));
}

#[tokio::test]
async fn test_slow_service_times_out_as_transient() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"text": "", "tokens": []}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&mock_server)
        .await;

    let err = backend(&mock_server, None)
        .extract_text(b"img", "image/png")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("timed out"));
}
