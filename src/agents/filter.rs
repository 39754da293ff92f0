//! Ingest-time content filter. Drops chunks the LLM judges to be
//! outside the knowledge base's domain.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Agent, AgentConfig, AgentKind, AgentMessage, AgentOutput};
use crate::error::RagResult;
use crate::generation::Generator;
use crate::models::Chunk;

pub const DEFAULT_PROMPT: &str = "Your task is to decide whether the following content contains \
substantive domain knowledge worth keeping in a knowledge base:
---
{text}
---

Reply Y if it does, otherwise reply N. Do not output anything else.";

#[derive(Debug, Clone)]
pub struct FilterInput {
    pub chunk: Chunk,
    /// 0-based position of the chunk's file in the batch.
    pub file_index: usize,
    pub total_files: usize,
}

pub struct ContentFilterAgent {
    generator: Arc<dyn Generator>,
}

impl ContentFilterAgent {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

/// Whether a filter response accepts the chunk.
pub fn accepts(response: &str) -> bool {
    let answer = response.trim().to_uppercase();
    answer.contains("YES") || answer == "Y" || answer == "<YES>"
}

#[async_trait]
impl Agent for ContentFilterAgent {
    type Input = FilterInput;
    type Output = Chunk;

    fn kind(&self) -> AgentKind {
        AgentKind::ContentFilter
    }

    async fn process(&self, config: &AgentConfig, input: FilterInput) -> RagResult<AgentOutput<Chunk>> {
        let prompt = config
            .prompt_template
            .render(&[("text", input.chunk.content.as_str())]);
        let response = self.generator.generate(&prompt, &config.model_config).await?;
        let message = AgentMessage::for_file(config, input.file_index, input.total_files, input.chunk.content.clone());

        let output = if accepts(&response) {
            AgentOutput::keep(input.chunk)
        } else {
            debug!(chunk_id = %input.chunk.id, response = %response.trim(), "content filter dropped chunk");
            AgentOutput::drop_item()
        };
        Ok(output.with_message(message))
    }
}
