//! Query refinement: search with the user's words, then again with an
//! LLM rewrite that takes the conversation into account.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Agent, AgentConfig, AgentKind, AgentOutput};
use crate::error::RagResult;
use crate::generation::Generator;
use crate::models::{RetrievedChunk, ThreadMessage};
use crate::search::{merge_distinct, KnowledgeSearch};

pub const DEFAULT_PROMPT: &str = "Your task is to turn the user's query into a more precise description \
of what they are looking for, using the conversation so far as context.

Conversation:
{history}

User query:
{query}

Reply with the improved query only and nothing else.";

#[derive(Debug, Clone)]
pub struct RefineInput {
    pub query: String,
    pub history: Vec<ThreadMessage>,
    pub top_k: usize,
}

pub struct QueryRefinementAgent {
    generator: Arc<dyn Generator>,
    search: KnowledgeSearch,
}

impl QueryRefinementAgent {
    pub fn new(generator: Arc<dyn Generator>, search: KnowledgeSearch) -> Self {
        Self { generator, search }
    }

    /// Plain search with the raw query, used when refinement is off.
    pub async fn direct(&self, input: &RefineInput) -> Vec<RetrievedChunk> {
        self.search.search(&input.query, input.top_k).await
    }
}

fn format_history(history: &[ThreadMessage]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Agent for QueryRefinementAgent {
    type Input = RefineInput;
    type Output = Vec<RetrievedChunk>;

    fn kind(&self) -> AgentKind {
        AgentKind::QueryRefinement
    }

    async fn process(&self, config: &AgentConfig, input: RefineInput) -> RagResult<AgentOutput<Vec<RetrievedChunk>>> {
        let mut results = self.direct(&input).await;

        let history = format_history(&input.history);
        let prompt = config
            .prompt_template
            .render(&[("query", input.query.as_str()), ("history", history.as_str())]);

        match self.generator.generate(&prompt, &config.model_config).await {
            Ok(refined) => {
                let refined = refined.trim();
                if !refined.is_empty() && refined != input.query.trim() {
                    let more = self.search.search(refined, input.top_k).await;
                    let added = merge_distinct(&mut results, more);
                    debug!(query = %input.query, refined, added, "refined query");
                }
            }
            Err(e) => {
                warn!(query = %input.query, error = %e, "query refinement failed, using raw query results");
            }
        }

        Ok(AgentOutput::keep(results))
    }
}
