//! Text generation backend abstraction.

use async_trait::async_trait;
use rollcall_core::Result;

/// Backend for structured text generation.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate a JSON-formatted response with a system prompt.
    async fn generate_json_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}
