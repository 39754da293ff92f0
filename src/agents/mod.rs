//! LLM-driven transformation steps.
//!
//! Every agent is configured by an [`AgentConfig`] stored under the
//! agent's own key, so prompts and models can be changed while the
//! process runs. Agents never read their config themselves: callers go
//! through [`AgentRunner`], which re-reads the config before each call
//! and refuses to run a disabled agent.
//!
//! | Agent | Module | Default |
//! |-------|--------|---------|
//! | Query refinement | [`refine`] | enabled |
//! | Divergent thinking | [`divergent`] | enabled |
//! | Relevance judgement | [`relevance`] | disabled |
//! | Answer generation | [`answer`] | enabled |
//! | Content filter | [`filter`] | disabled |

pub mod answer;
pub mod divergent;
pub mod filter;
pub mod refine;
pub mod relevance;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RagError, RagResult};
use crate::generation::ModelConfig;
use crate::kv::{get_json, put_json, KeyValueStore};

pub use answer::AnswerGenerationAgent;
pub use divergent::DivergentThinkingAgent;
pub use filter::ContentFilterAgent;
pub use refine::QueryRefinementAgent;
pub use relevance::RelevanceJudgementAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    QueryRefinement,
    DivergentThinking,
    RelevanceJudgement,
    AnswerGeneration,
    ContentFilter,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::QueryRefinement,
        AgentKind::DivergentThinking,
        AgentKind::RelevanceJudgement,
        AgentKind::AnswerGeneration,
        AgentKind::ContentFilter,
    ];

    /// Key the config is stored under. These are stable across releases.
    pub fn storage_key(self) -> &'static str {
        match self {
            AgentKind::QueryRefinement => "QueryRefinementAgentPromptTemplate",
            AgentKind::DivergentThinking => "DivergentThinkingAgentPromptTemplate",
            AgentKind::RelevanceJudgement => "relevanceJudgementAgentPromptTemplate",
            AgentKind::AnswerGeneration => "AnswerGenerationAgentPromptTemplate",
            AgentKind::ContentFilter => "FilterAgentPromptTemplate",
        }
    }

    /// Short name used on the command line and in HTTP paths.
    pub fn slug(self) -> &'static str {
        match self {
            AgentKind::QueryRefinement => "query-refinement",
            AgentKind::DivergentThinking => "divergent-thinking",
            AgentKind::RelevanceJudgement => "relevance-judgement",
            AgentKind::AnswerGeneration => "answer-generation",
            AgentKind::ContentFilter => "content-filter",
        }
    }

    /// Placeholders a template for this agent must contain.
    pub fn required_placeholders(self) -> &'static [&'static str] {
        match self {
            AgentKind::QueryRefinement => &["query"],
            AgentKind::DivergentThinking => &["query"],
            AgentKind::RelevanceJudgement => &["query", "text"],
            AgentKind::AnswerGeneration => &["question", "knowledge"],
            AgentKind::ContentFilter => &["text"],
        }
    }

    pub fn default_config(self) -> AgentConfig {
        match self {
            AgentKind::QueryRefinement => AgentConfig {
                enabled: true,
                name: "QueryRefinementAgent".to_string(),
                emoji: "🔍".to_string(),
                model_config: ModelConfig::named("qwen2.5:7b"),
                prompt_template: PromptTemplate::new(refine::DEFAULT_PROMPT),
            },
            AgentKind::DivergentThinking => AgentConfig {
                enabled: true,
                name: "DivergentThinkingAgent".to_string(),
                emoji: "💡".to_string(),
                model_config: ModelConfig::named("qwen2.5:3b"),
                prompt_template: PromptTemplate::new(divergent::DEFAULT_PROMPT),
            },
            AgentKind::RelevanceJudgement => AgentConfig {
                enabled: false,
                name: "Relevance Judgement Agent".to_string(),
                emoji: "🔍".to_string(),
                model_config: ModelConfig {
                    top_k: 20,
                    repeat_penalty: 0.5,
                    ..ModelConfig::named("qwen2.5:7b")
                },
                prompt_template: PromptTemplate::new(relevance::DEFAULT_PROMPT),
            },
            AgentKind::AnswerGeneration => AgentConfig {
                enabled: true,
                name: "AnswerGenerationAgent".to_string(),
                emoji: "💬".to_string(),
                model_config: ModelConfig::named("qwen2.5:latest"),
                prompt_template: PromptTemplate::new(answer::DEFAULT_PROMPT),
            },
            AgentKind::ContentFilter => AgentConfig {
                enabled: false,
                name: "Filter Agent".to_string(),
                emoji: "🦾".to_string(),
                model_config: ModelConfig::named("qwen2.5:latest"),
                prompt_template: PromptTemplate::new(filter::DEFAULT_PROMPT),
            },
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for AgentKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        AgentKind::ALL
            .into_iter()
            .find(|k| k.slug() == wanted || k.storage_key().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| RagError::InvalidConfig(format!("unknown agent: {}", s)))
    }
}

// ============ Templates ============

/// A prompt with `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptTemplate(String);

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Distinct placeholder names in the template.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            match placeholder_at(after) {
                Some(name) => {
                    names.insert(name.to_string());
                    rest = &after[name.len() + 1..];
                }
                None => rest = after,
            }
        }
        names
    }

    /// Fails with [`RagError::Template`] naming every missing placeholder.
    pub fn validate(&self, required: &[&str]) -> RagResult<()> {
        let present = self.placeholders();
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !present.contains(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RagError::Template(format!(
                "missing placeholder(s): {}",
                missing
                    .iter()
                    .map(|m| format!("{{{}}}", m))
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    /// Substitute every occurrence of each known placeholder.
    ///
    /// Unknown placeholders stay verbatim. Substituted values are never
    /// scanned again, so a value containing `{query}` is inserted as is.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let value = placeholder_at(after)
                .and_then(|name| vars.iter().find(|(k, _)| *k == name).map(|(k, v)| (k.len(), *v)));
            match value {
                Some((len, v)) => {
                    out.push_str(v);
                    rest = &after[len + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// The identifier at the start of `s` if it is directly followed by `}`.
fn placeholder_at(s: &str) -> Option<&str> {
    let end = s.find('}')?;
    let name = &s[..end];
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

// ============ Config ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub enabled: bool,
    pub name: String,
    pub emoji: String,
    pub model_config: ModelConfig,
    pub prompt_template: PromptTemplate,
}

impl AgentConfig {
    /// `"{emoji} {name}"`, used as the title of progress messages.
    pub fn title(&self) -> String {
        format!("{} {}", self.emoji, self.name)
    }
}

/// Where agent configs live between invocations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The stored config, or the kind's default when none is stored.
    async fn get(&self, kind: AgentKind) -> RagResult<AgentConfig>;

    /// Validate the template, then store. Last writer wins.
    async fn put(&self, kind: AgentKind, config: &AgentConfig) -> RagResult<()>;

    /// Forget the stored config so the default applies again.
    async fn reset(&self, kind: AgentKind) -> RagResult<()>;
}

/// [`ConfigStore`] over the process-wide keyed storage.
pub struct KvConfigStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvConfigStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl ConfigStore for KvConfigStore {
    async fn get(&self, kind: AgentKind) -> RagResult<AgentConfig> {
        match get_json::<AgentConfig>(self.kv.as_ref(), kind.storage_key()).await {
            Ok(Some(config)) => Ok(config),
            Ok(None) => Ok(kind.default_config()),
            Err(RagError::Json(e)) => {
                warn!(agent = %kind, error = %e, "stored agent config is unreadable, using default");
                Ok(kind.default_config())
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, kind: AgentKind, config: &AgentConfig) -> RagResult<()> {
        config.prompt_template.validate(kind.required_placeholders())?;
        put_json(self.kv.as_ref(), kind.storage_key(), config).await?;
        debug!(agent = %kind, enabled = config.enabled, model = %config.model_config.name, "saved agent config");
        Ok(())
    }

    async fn reset(&self, kind: AgentKind) -> RagResult<()> {
        self.kv.delete(kind.storage_key()).await
    }
}

// ============ Agents ============

/// Side-channel notice produced while an agent works through items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub title: String,
    pub subtitle: String,
    pub content: String,
}

impl AgentMessage {
    /// Message for item `index` (0-based) of `total` files.
    pub fn for_file(config: &AgentConfig, index: usize, total: usize, content: impl Into<String>) -> Self {
        Self {
            title: config.title(),
            subtitle: format!("file {}/{}", index + 1, total),
            content: content.into(),
        }
    }
}

/// What an agent returns. `result: None` means "exclude this item"; it
/// is not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput<T> {
    pub result: Option<T>,
    pub message: Option<AgentMessage>,
}

impl<T> AgentOutput<T> {
    pub fn keep(result: T) -> Self {
        Self {
            result: Some(result),
            message: None,
        }
    }

    pub fn drop_item() -> Self {
        Self {
            result: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: AgentMessage) -> Self {
        self.message = Some(message);
        self
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn kind(&self) -> AgentKind;

    /// Run once with an already-resolved config.
    async fn process(&self, config: &AgentConfig, input: Self::Input) -> RagResult<AgentOutput<Self::Output>>;
}

/// Outcome of [`AgentRunner::invoke`].
#[derive(Debug)]
pub enum Invocation<I, O> {
    /// The agent is disabled; the input comes back untouched.
    Disabled(I),
    Ran(AgentOutput<O>),
}

/// Invocation wrapper that owns the enabled check.
#[derive(Clone)]
pub struct AgentRunner {
    configs: Arc<dyn ConfigStore>,
}

impl AgentRunner {
    pub fn new(configs: Arc<dyn ConfigStore>) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &Arc<dyn ConfigStore> {
        &self.configs
    }

    /// Current config of `kind`, freshly read.
    pub async fn config(&self, kind: AgentKind) -> RagResult<AgentConfig> {
        self.configs.get(kind).await
    }

    /// Re-read the agent's config and run it, unless it is disabled.
    pub async fn invoke<A: Agent>(&self, agent: &A, input: A::Input) -> RagResult<Invocation<A::Input, A::Output>> {
        let config = self.configs.get(agent.kind()).await?;
        self.invoke_with(agent, &config, input).await
    }

    /// [`invoke`](Self::invoke) with a config the caller already read,
    /// for loops that must see one config for the whole batch.
    pub async fn invoke_with<A: Agent>(
        &self,
        agent: &A,
        config: &AgentConfig,
        input: A::Input,
    ) -> RagResult<Invocation<A::Input, A::Output>> {
        if !config.enabled {
            debug!(agent = %agent.kind(), "agent disabled, passing input through");
            return Ok(Invocation::Disabled(input));
        }
        agent.process(config, input).await.map(Invocation::Ran)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::generation::Generator;
    use crate::kv::MemoryKvStore;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&str, usize) -> Option<String> + Send + Sync>;

    /// Generator whose replies come from a closure of `(prompt, call index)`.
    /// `None` makes the call fail.
    pub(crate) struct ScriptedGenerator {
        script: Script,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub fn new(script: impl Fn(&str, usize) -> Option<String> + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn always(reply: &str) -> Self {
            let reply = reply.to_string();
            Self::new(move |_, _| Some(reply.clone()))
        }

        /// Replies in order, repeating the last one.
        pub fn sequence(replies: &[&str]) -> Self {
            let replies: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
            Self::new(move |_, n| replies.get(n).or(replies.last()).cloned())
        }

        pub fn failing() -> Self {
            Self::new(|_, _| None)
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, prompt: &str, _model: &ModelConfig) -> RagResult<String> {
            let n = {
                let mut prompts = self.prompts.lock().unwrap();
                prompts.push(prompt.to_string());
                prompts.len() - 1
            };
            (self.script)(prompt, n).ok_or_else(|| RagError::AgentInvocationFailure("scripted failure".to_string()))
        }
    }

    pub(crate) fn config_store() -> Arc<KvConfigStore> {
        Arc::new(KvConfigStore::new(Arc::new(MemoryKvStore::new())))
    }

    pub(crate) async fn set_enabled(store: &dyn ConfigStore, kind: AgentKind, enabled: bool) {
        let mut config = store.get(kind).await.unwrap();
        config.enabled = enabled;
        store.put(kind, &config).await.unwrap();
    }

    #[test]
    fn render_replaces_every_occurrence_and_keeps_unknown() {
        let t = PromptTemplate::new("Q: {query} / again {query} / {unknown} / {not a name}");
        let out = t.render(&[("query", "rust"), ("text", "ignored")]);
        assert_eq!(out, "Q: rust / again rust / {unknown} / {not a name}");
    }

    #[test]
    fn render_does_not_rescan_substituted_values() {
        let t = PromptTemplate::new("{query} | {text}");
        let out = t.render(&[("query", "{text}"), ("text", "body")]);
        assert_eq!(out, "{text} | body");
    }

    #[test]
    fn render_handles_stray_braces() {
        let t = PromptTemplate::new("{ {{query}} }{");
        assert_eq!(t.render(&[("query", "x")]), "{ {x} }{");
    }

    #[test]
    fn validate_lists_missing_placeholders() {
        let t = PromptTemplate::new("Judge {text}");
        let err = t.validate(&["query", "text"]).unwrap_err();
        match err {
            RagError::Template(msg) => assert!(msg.contains("{query}") && !msg.contains("{text}")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(t.validate(&["text"]).is_ok());
    }

    #[test]
    fn default_templates_are_valid() {
        for kind in AgentKind::ALL {
            let config = kind.default_config();
            config
                .prompt_template
                .validate(kind.required_placeholders())
                .unwrap();
        }
        assert!(!AgentKind::RelevanceJudgement.default_config().enabled);
        assert!(!AgentKind::ContentFilter.default_config().enabled);
        assert_eq!(AgentKind::RelevanceJudgement.default_config().model_config.top_k, 20);
    }

    #[test]
    fn kind_parses_from_slug_and_storage_key() {
        assert_eq!("content-filter".parse::<AgentKind>().unwrap(), AgentKind::ContentFilter);
        assert_eq!(
            "FilterAgentPromptTemplate".parse::<AgentKind>().unwrap(),
            AgentKind::ContentFilter
        );
        assert!("nope".parse::<AgentKind>().is_err());
    }

    #[tokio::test]
    async fn config_store_falls_back_validates_and_resets() {
        let store = config_store();
        let kind = AgentKind::RelevanceJudgement;
        assert_eq!(store.get(kind).await.unwrap(), kind.default_config());

        let mut bad = kind.default_config();
        bad.prompt_template = PromptTemplate::new("only {text}");
        assert!(matches!(store.put(kind, &bad).await, Err(RagError::Template(_))));
        assert_eq!(store.get(kind).await.unwrap(), kind.default_config());

        let mut good = kind.default_config();
        good.enabled = true;
        store.put(kind, &good).await.unwrap();
        assert!(store.get(kind).await.unwrap().enabled);

        store.reset(kind).await.unwrap();
        assert!(!store.get(kind).await.unwrap().enabled);
    }

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        type Input = String;
        type Output = String;

        fn kind(&self) -> AgentKind {
            AgentKind::ContentFilter
        }

        async fn process(&self, config: &AgentConfig, input: String) -> RagResult<AgentOutput<String>> {
            Ok(AgentOutput::keep(format!("{}:{}", config.name, input)))
        }
    }

    #[tokio::test]
    async fn runner_rereads_config_before_each_call() {
        let store = config_store();
        let runner = AgentRunner::new(store.clone());

        match runner.invoke(&Echo, "x".to_string()).await.unwrap() {
            Invocation::Disabled(input) => assert_eq!(input, "x"),
            Invocation::Ran(_) => panic!("disabled agent ran"),
        }

        let mut config = AgentKind::ContentFilter.default_config();
        config.enabled = true;
        config.name = "Renamed".to_string();
        store.put(AgentKind::ContentFilter, &config).await.unwrap();

        match runner.invoke(&Echo, "y".to_string()).await.unwrap() {
            Invocation::Ran(out) => assert_eq!(out.result.as_deref(), Some("Renamed:y")),
            Invocation::Disabled(_) => panic!("enabled agent skipped"),
        }
    }
}
