//! OCR backend traits and the HTTP implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use rollcall_core::{BoundingBox, Error, OcrOutput, OcrToken, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::to_pipeline_error;

/// Backend that turns a register photo into positioned text tokens.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Extract text and token boxes from an image.
    ///
    /// Transport failures, timeouts, quota and 5xx responses surface as
    /// `TransientService`; a response with no usable structure as
    /// `ParseFailure`.
    async fn extract_text(&self, image_data: &[u8], mime_type: &str) -> Result<OcrOutput>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

/// OCR service reached over HTTP.
///
/// Wire contract: `POST {base}/v1/ocr` with a JSON body carrying the
/// base64 image; the reply lists tokens with pixel bounding boxes.
pub struct HttpOcrBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpOcrBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        }
    }

    /// Create from environment variables (`OCR_BASE_URL`, `OCR_API_KEY`,
    /// `OCR_TIMEOUT_SECS`).
    pub fn from_env() -> Self {
        let base_url = std::env::var("OCR_BASE_URL")
            .unwrap_or_else(|_| rollcall_core::defaults::OCR_URL.to_string());
        let api_key = std::env::var("OCR_API_KEY").ok().filter(|k| !k.is_empty());
        let timeout = std::env::var("OCR_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(rollcall_core::defaults::OCR_TIMEOUT_SECS);
        Self::new(base_url, api_key, Duration::from_secs(timeout))
    }
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    image: String,
    mime_type: &'a str,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    width: Option<f32>,
    #[serde(default)]
    tokens: Vec<OcrResponseToken>,
}

#[derive(Deserialize)]
struct OcrResponseToken {
    text: String,
    bbox: [f32; 4],
    #[serde(default)]
    confidence: Option<f32>,
}

impl From<OcrResponseToken> for OcrToken {
    fn from(t: OcrResponseToken) -> Self {
        let [x, y, width, height] = t.bbox;
        OcrToken {
            text: t.text,
            bbox: BoundingBox::new(x, y, width, height),
            confidence: t.confidence.map(|c| c.clamp(0.0, 1.0)),
        }
    }
}

#[async_trait]
impl OcrBackend for HttpOcrBackend {
    async fn extract_text(&self, image_data: &[u8], mime_type: &str) -> Result<OcrOutput> {
        let start = Instant::now();
        let request = OcrRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image_data),
            mime_type,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/ocr", self.base_url))
            .timeout(self.timeout)
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::TransientService(format!("ocr timed out after {:?}", self.timeout))
            } else {
                Error::TransientService(format!("ocr request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, "OCR service returned an error");
            return Err(to_pipeline_error("ocr", status, &body));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| Error::ParseFailure(format!("ocr response is not valid JSON: {}", e)))?;

        let tokens: Vec<OcrToken> = parsed
            .tokens
            .into_iter()
            .filter(|t| !t.text.trim().is_empty())
            .map(OcrToken::from)
            .collect();

        debug!(
            token_count = tokens.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "OCR extraction complete"
        );

        Ok(OcrOutput {
            raw_text: parsed.text,
            tokens,
            page_width: parsed.width,
        })
    }

    fn name(&self) -> &str {
        "http-ocr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_trailing_slash() {
        let backend = HttpOcrBackend::new("http://ocr:8090/", None, Duration::from_secs(5));
        assert_eq!(backend.base_url, "http://ocr:8090");
        assert_eq!(backend.name(), "http-ocr");
    }

    #[test]
    fn test_response_token_conversion_clamps_confidence() {
        let json = r#"{"text": "101 A", "tokens": [{"text": "101", "bbox": [1, 2, 30, 12], "confidence": 1.4}]}"#;
        let response: OcrResponse = serde_json::from_str(json).unwrap();
        let token = OcrToken::from(response.tokens.into_iter().next().unwrap());
        assert_eq!(token.bbox, BoundingBox::new(1.0, 2.0, 30.0, 12.0));
        assert_eq!(token.confidence, Some(1.0));
    }

    #[test]
    fn test_request_serialization() {
        let request = OcrRequest {
            image: "aGVsbG8=".to_string(),
            mime_type: "image/png",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["image"], "aGVsbG8=");
        assert_eq!(json["mime_type"], "image/png");
    }
}
