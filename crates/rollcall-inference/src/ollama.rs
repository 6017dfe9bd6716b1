//! Ollama generation backend (chat API).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use rollcall_core::{Error, Result};

use crate::error::to_pipeline_error;
use crate::generation::GenerationBackend;

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = rollcall_core::defaults::OLLAMA_URL;

/// Default reasoning model.
pub const DEFAULT_GEN_MODEL: &str = rollcall_core::defaults::REASONING_MODEL;

/// Ollama generation backend.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    gen_model: String,
    gen_timeout: Duration,
}

impl OllamaBackend {
    pub fn new(base_url: String, gen_model: String, gen_timeout: Duration) -> Self {
        info!(
            "Initializing Ollama backend: url={}, gen={}",
            base_url, gen_model
        );
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            gen_model,
            gen_timeout,
        }
    }

    /// Create from environment variables (`OLLAMA_BASE`, `REASONING_MODEL`,
    /// `REASONING_TIMEOUT_SECS`).
    pub fn from_env() -> Self {
        let base_url = std::env::var("OLLAMA_BASE")
            .or_else(|_| std::env::var("OLLAMA_URL"))
            .unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        let gen_model =
            std::env::var("REASONING_MODEL").unwrap_or_else(|_| DEFAULT_GEN_MODEL.to_string());
        let timeout = std::env::var("REASONING_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(rollcall_core::defaults::REASONING_TIMEOUT_SECS);
        Self::new(base_url, gen_model, Duration::from_secs(timeout))
    }

    /// One non-streaming chat turn constrained to JSON output.
    async fn chat_json(&self, system: &str, prompt: &str) -> Result<String> {
        let start = Instant::now();
        let request = ChatRequest {
            model: self.gen_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            format: Some(serde_json::json!("json")),
            think: Some(false),
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.gen_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::TransientService(format!("reasoning request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(to_pipeline_error("reasoning", status, &body));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::ParseFailure(format!("reasoning envelope unreadable: {}", e)))?;
        let content = strip_thinking(&reply.message.content);

        let elapsed = start.elapsed();
        debug!(
            response_len = content.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Reasoning reply received"
        );
        if elapsed > self.gen_timeout / 2 {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                timeout_secs = self.gen_timeout.as_secs(),
                prompt_len = prompt.len(),
                "Slow reasoning reply"
            );
        }
        Ok(content)
    }
}

/// Drop `<think>...</think>` blocks some models emit even when asked not to.
/// An unclosed block swallows the rest of the response.
pub fn strip_thinking(response: &str) -> String {
    let mut answer = String::new();
    let mut rest = response;
    while let Some(start) = rest.find("<think>") {
        answer.push_str(&rest[..start]);
        let after = &rest[start + "<think>".len()..];
        match after.find("</think>") {
            Some(end) => rest = &after[end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    answer.push_str(rest);
    answer.trim().to_string()
}

/// Chat API message for `/api/chat`.
#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Request payload for the Ollama `/api/chat` endpoint.
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    /// Ollama format enforcement. Set to `"json"` for guaranteed valid JSON output.
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
    /// Suppresses chain-of-thought for models that support it.
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

/// Response from the Ollama `/api/chat` endpoint.
#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    #[instrument(skip(self, system, prompt), fields(subsystem = "inference", component = "ollama", op = "generate_json", model = %self.gen_model, prompt_len = prompt.len()))]
    async fn generate_json_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        self.chat_json(system, prompt).await
    }

    fn model_name(&self) -> &str {
        &self.gen_model
    }
}
