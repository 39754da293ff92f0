//! Divergent thinking: ask the LLM for questions the user did not ask,
//! and search with each of them to widen what the answer can draw on.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Agent, AgentConfig, AgentKind, AgentOutput};
use crate::error::RagResult;
use crate::generation::Generator;
use crate::models::RetrievedChunk;
use crate::search::KnowledgeSearch;

pub const DEFAULT_PROMPT: &str = "Based on the user's query and the knowledge found so far, \
ask one brand-new question that explores a different angle of the topic.

User query:
{query}

Knowledge found so far:
{knowledge}

Questions already asked (do not repeat any of them):
- {questions}

Reply with the new question only and nothing else.";

#[derive(Debug, Clone)]
pub struct DivergeInput {
    pub query: String,
    pub knowledge: Vec<RetrievedChunk>,
    /// Upper bound on generated questions.
    pub divergent_num: usize,
    pub top_k: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DivergeOutput {
    /// Distinct questions, in generation order.
    pub questions: Vec<String>,
    pub docs: Vec<RetrievedChunk>,
}

pub struct DivergentThinkingAgent {
    generator: Arc<dyn Generator>,
    search: KnowledgeSearch,
}

impl DivergentThinkingAgent {
    pub fn new(generator: Arc<dyn Generator>, search: KnowledgeSearch) -> Self {
        Self { generator, search }
    }
}

#[async_trait]
impl Agent for DivergentThinkingAgent {
    type Input = DivergeInput;
    type Output = DivergeOutput;

    fn kind(&self) -> AgentKind {
        AgentKind::DivergentThinking
    }

    async fn process(&self, config: &AgentConfig, input: DivergeInput) -> RagResult<AgentOutput<DivergeOutput>> {
        let knowledge = input
            .knowledge
            .iter()
            .map(|r| r.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut out = DivergeOutput::default();

        // Sequential: each prompt lists every question generated before it.
        for round in 0..input.divergent_num {
            let questions = out.questions.join("\n- ");
            let prompt = config.prompt_template.render(&[
                ("query", input.query.as_str()),
                ("knowledge", knowledge.as_str()),
                ("questions", questions.as_str()),
            ]);

            let question = match self.generator.generate(&prompt, &config.model_config).await {
                Ok(text) => text.trim().to_string(),
                Err(e) => {
                    warn!(round, error = %e, "divergent question generation failed");
                    break;
                }
            };
            if question.is_empty() {
                break;
            }
            if out.questions.contains(&question) {
                debug!(round, question = %question, "repeated divergent question skipped");
                continue;
            }

            let docs = self.search.search(&question, input.top_k).await;
            debug!(round, question = %question, results = docs.len(), "divergent search");
            out.questions.push(question);
            out.docs.extend(docs);
        }

        Ok(AgentOutput::keep(out))
    }
}
