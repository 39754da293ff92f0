//! Relevance judgement of one retrieved chunk against the query that
//! found it.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, AgentConfig, AgentKind, AgentOutput};
use crate::error::RagResult;
use crate::generation::Generator;

pub const DEFAULT_PROMPT: &str = "Your task is to decide whether the text below helps answer the user's query.

User query:
{query}

Text:
{text}

If it helps, reply \"RELEVANT\" followed by one sentence explaining why. \
Otherwise reply \"NO\" and nothing else.";

#[derive(Debug, Clone)]
pub struct RelevanceInput {
    pub query: String,
    pub text: String,
}

pub struct RelevanceJudgementAgent {
    generator: Arc<dyn Generator>,
}

impl RelevanceJudgementAgent {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

/// The verdict to keep, or `None` when the response rejects the text.
///
/// Rejection is a plain substring check, so a response that merely
/// mentions "NO" also drops the chunk.
pub fn parse_verdict(response: &str) -> Option<String> {
    let verdict = response.trim();
    if verdict.is_empty() || verdict.contains("NO") || verdict.contains("不相关") {
        None
    } else {
        Some(verdict.to_string())
    }
}

#[async_trait]
impl Agent for RelevanceJudgementAgent {
    type Input = RelevanceInput;
    type Output = String;

    fn kind(&self) -> AgentKind {
        AgentKind::RelevanceJudgement
    }

    async fn process(&self, config: &AgentConfig, input: RelevanceInput) -> RagResult<AgentOutput<String>> {
        let prompt = config
            .prompt_template
            .render(&[("query", input.query.as_str()), ("text", input.text.as_str())]);
        let response = self.generator.generate(&prompt, &config.model_config).await?;
        Ok(match parse_verdict(&response) {
            Some(verdict) => AgentOutput::keep(verdict),
            None => AgentOutput::drop_item(),
        })
    }
}
