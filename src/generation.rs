//! Text generation abstraction.
//!
//! Agents talk to a [`Generator`]; the production implementation is
//! [`OllamaClient`](crate::ollama::OllamaClient).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RagResult;

/// Model selection and sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub name: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
}

impl ModelConfig {
    /// A model with the sampling parameters shared by most default agents.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temperature: 0.5,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.0,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a complete response for `prompt`.
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> RagResult<String>;

    /// Generate while reporting the accumulated text after every fragment.
    ///
    /// The default implementation reports once, with the full response.
    async fn generate_streaming(
        &self,
        prompt: &str,
        model: &ModelConfig,
        on_progress: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> RagResult<String> {
        let text = self.generate(prompt, model).await?;
        on_progress(&text);
        Ok(text)
    }
}
