//! Answer generation from the question and the assembled knowledge.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, AgentConfig, AgentKind, AgentOutput};
use crate::error::RagResult;
use crate::generation::Generator;
use crate::models::RetrievedChunk;

pub const DEFAULT_PROMPT: &str = "Your task is to answer the user's question using the reference material.

---
Question:
{question}
---
Reference material:
{knowledge}
---

Reply with the answer only and nothing else.";

#[derive(Debug, Clone)]
pub struct AnswerInput {
    pub question: String,
    pub knowledge: Vec<RetrievedChunk>,
}

impl AnswerInput {
    fn prompt(&self, config: &AgentConfig) -> String {
        let knowledge = self
            .knowledge
            .iter()
            .map(|r| r.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        config
            .prompt_template
            .render(&[("question", self.question.as_str()), ("knowledge", knowledge.as_str())])
    }
}

pub struct AnswerGenerationAgent {
    generator: Arc<dyn Generator>,
}

impl AnswerGenerationAgent {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// Like [`Agent::process`], reporting the partial answer as it grows.
    pub async fn stream(
        &self,
        config: &AgentConfig,
        input: &AnswerInput,
        on_progress: &mut (dyn FnMut(&str) + Send),
    ) -> RagResult<String> {
        let prompt = input.prompt(config);
        self.generator
            .generate_streaming(&prompt, &config.model_config, on_progress)
            .await
    }
}

#[async_trait]
impl Agent for AnswerGenerationAgent {
    type Input = AnswerInput;
    type Output = String;

    fn kind(&self) -> AgentKind {
        AgentKind::AnswerGeneration
    }

    async fn process(&self, config: &AgentConfig, input: AnswerInput) -> RagResult<AgentOutput<String>> {
        let prompt = input.prompt(config);
        let answer = self.generator.generate(&prompt, &config.model_config).await?;
        Ok(AgentOutput::keep(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::ScriptedGenerator;
    use crate::index::tests::chunk;

    fn input() -> AnswerInput {
        AnswerInput {
            question: "How do I share data between threads?".to_string(),
            knowledge: vec![
                RetrievedChunk::new(chunk("a", "Arc shares ownership"), 0.1),
                RetrievedChunk::new(chunk("b", "Mutex guards mutation"), 0.2),
            ],
        }
    }

    #[tokio::test]
    async fn joins_knowledge_with_newlines() {
        let generator = Arc::new(ScriptedGenerator::always("Use Arc<Mutex<T>>."));
        let agent = AnswerGenerationAgent::new(generator.clone());
        let config = AgentKind::AnswerGeneration.default_config();

        let out = agent.process(&config, input()).await.unwrap();
        assert_eq!(out.result.as_deref(), Some("Use Arc<Mutex<T>>."));
        let prompts = generator.prompts();
        assert!(prompts[0].contains("Arc shares ownership\nMutex guards mutation"));
        assert!(prompts[0].contains("How do I share data between threads?"));
    }

    #[tokio::test]
    async fn stream_reports_progress() {
        let agent = AnswerGenerationAgent::new(Arc::new(ScriptedGenerator::always("done")));
        let config = AgentKind::AnswerGeneration.default_config();
        let mut seen = Vec::new();
        let answer = agent
            .stream(&config, &input(), &mut |partial: &str| seen.push(partial.to_string()))
            .await
            .unwrap();
        assert_eq!(answer, "done");
        assert_eq!(seen, vec!["done"]);
    }
}
