//! Retrieval-augmented generation for one chat turn.
//!
//! [`RagOrchestrator::run`] walks a fixed sequence of stages:
//!
//! ```text
//! Idle → Refining → Diverging → Merging → ThresholdFilter
//!      → RelevanceFilter → ContextAssembled → Done
//! ```
//!
//! There are no backward transitions. Every stage degrades instead of
//! failing, so a turn always ends with some (possibly empty) context.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agents::divergent::DivergeInput;
use crate::agents::refine::RefineInput;
use crate::agents::relevance::RelevanceInput;
use crate::agents::{
    AgentRunner, DivergentThinkingAgent, Invocation, QueryRefinementAgent, RelevanceJudgementAgent,
};
use crate::config::RetrievalConfig;
use crate::error::RagResult;
use crate::kv::{get_json, put_json, KeyValueStore};
use crate::models::{RetrievedChunk, ThreadMessage};
use crate::search::merge_distinct;

/// Keyed-storage key of the per-thread result cache.
pub const RAG_HISTORY_KEY: &str = "rag_results_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RagStage {
    Idle,
    Refining,
    Diverging,
    Merging,
    ThresholdFilter,
    RelevanceFilter,
    ContextAssembled,
    Done,
}

/// How many chunks were held when a stage finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: RagStage,
    pub kept: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagOutcome {
    /// Contents of `docs`, newline-joined.
    pub context: String,
    pub docs: Vec<RetrievedChunk>,
    /// Questions the divergent step searched with.
    pub questions: Vec<String>,
    pub trace: Vec<StageRecord>,
}

/// Search sizes and the distance cut-off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RagSettings {
    pub refine_top_k: usize,
    pub divergent_top_k: usize,
    pub divergent_num: usize,
    /// Chunks with a larger distance are dropped; equal is kept.
    pub similarity_threshold: f32,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            refine_top_k: 10,
            divergent_top_k: 2,
            divergent_num: 3,
            similarity_threshold: 0.4,
        }
    }
}

impl From<&RetrievalConfig> for RagSettings {
    fn from(c: &RetrievalConfig) -> Self {
        Self {
            refine_top_k: c.refine_top_k,
            divergent_top_k: c.divergent_top_k,
            divergent_num: c.divergent_num,
            similarity_threshold: c.similarity_threshold,
        }
    }
}

pub struct RagOrchestrator {
    runner: AgentRunner,
    refine: QueryRefinementAgent,
    divergent: DivergentThinkingAgent,
    relevance: RelevanceJudgementAgent,
    settings: RagSettings,
    history: Option<RagHistory>,
}

impl RagOrchestrator {
    pub fn new(
        runner: AgentRunner,
        refine: QueryRefinementAgent,
        divergent: DivergentThinkingAgent,
        relevance: RelevanceJudgementAgent,
        settings: RagSettings,
    ) -> Self {
        Self {
            runner,
            refine,
            divergent,
            relevance,
            settings,
            history: None,
        }
    }

    /// Cache each thread's outcome in `history`.
    pub fn with_history(mut self, history: RagHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn history(&self) -> Option<&RagHistory> {
        self.history.as_ref()
    }

    pub fn settings(&self) -> RagSettings {
        self.settings
    }

    /// Run the pipeline for `query`. Never fails.
    pub async fn run(&self, thread_id: Option<&str>, query: &str, history: &[ThreadMessage]) -> RagOutcome {
        let mut trace = vec![StageRecord {
            stage: RagStage::Idle,
            kept: 0,
        }];
        let mut record = |stage: RagStage, kept: usize| {
            debug!(?stage, kept, "rag stage finished");
            trace.push(StageRecord { stage, kept });
        };

        let refined = self.refining(query, history).await;
        record(RagStage::Refining, refined.len());

        let (questions, divergent) = self.diverging(query, &refined).await;
        record(RagStage::Diverging, divergent.len());

        let mut merged = Vec::with_capacity(refined.len() + divergent.len());
        merge_distinct(&mut merged, refined);
        merge_distinct(&mut merged, divergent);
        record(RagStage::Merging, merged.len());

        apply_threshold(&mut merged, self.settings.similarity_threshold);
        record(RagStage::ThresholdFilter, merged.len());

        let docs = self.relevance_filter(query, merged).await;
        record(RagStage::RelevanceFilter, docs.len());

        let context = docs
            .iter()
            .map(|r| r.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        record(RagStage::ContextAssembled, docs.len());
        record(RagStage::Done, docs.len());

        let outcome = RagOutcome {
            context,
            docs,
            questions,
            trace,
        };
        info!(query, docs = outcome.docs.len(), "rag context assembled");

        if let (Some(thread_id), Some(store)) = (thread_id, self.history.as_ref()) {
            if let Err(e) = store.record(thread_id, &outcome).await {
                warn!(thread_id, error = %e, "failed to cache rag results");
            }
        }
        outcome
    }

    async fn refining(&self, query: &str, history: &[ThreadMessage]) -> Vec<RetrievedChunk> {
        let input = RefineInput {
            query: query.to_string(),
            history: history.to_vec(),
            top_k: self.settings.refine_top_k,
        };
        match self.runner.invoke(&self.refine, input.clone()).await {
            Ok(Invocation::Disabled(input)) => self.refine.direct(&input).await,
            Ok(Invocation::Ran(out)) => out.result.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "query refinement unavailable, searching with the raw query");
                self.refine.direct(&input).await
            }
        }
    }

    async fn diverging(&self, query: &str, refined: &[RetrievedChunk]) -> (Vec<String>, Vec<RetrievedChunk>) {
        let input = DivergeInput {
            query: query.to_string(),
            knowledge: refined.to_vec(),
            divergent_num: self.settings.divergent_num,
            top_k: self.settings.divergent_top_k,
        };
        match self.runner.invoke(&self.divergent, input).await {
            Ok(Invocation::Disabled(_)) => (Vec::new(), Vec::new()),
            Ok(Invocation::Ran(out)) => out
                .result
                .map(|r| (r.questions, r.docs))
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "divergent thinking failed");
                (Vec::new(), Vec::new())
            }
        }
    }

    async fn relevance_filter(&self, query: &str, candidates: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        let mut kept = Vec::with_capacity(candidates.len());
        for mut doc in candidates {
            let input = RelevanceInput {
                query: doc
                    .chunk
                    .metadata
                    .dbquery
                    .clone()
                    .unwrap_or_else(|| query.to_string()),
                text: doc.chunk.content.clone(),
            };
            match self.runner.invoke(&self.relevance, input).await {
                Ok(Invocation::Disabled(_)) => kept.push(doc),
                Ok(Invocation::Ran(out)) => match out.result {
                    Some(verdict) => {
                        doc.chunk.metadata.relevance = Some(verdict);
                        kept.push(doc);
                    }
                    None => debug!(chunk_id = %doc.chunk.id, "judged not relevant"),
                },
                Err(e) => {
                    warn!(chunk_id = %doc.chunk.id, error = %e, "relevance judgement failed, keeping chunk");
                    kept.push(doc);
                }
            }
        }
        kept
    }
}

/// Drop results farther than `threshold`. A distance equal to the
/// threshold is kept.
pub fn apply_threshold(docs: &mut Vec<RetrievedChunk>, threshold: f32) {
    docs.retain(|r| r.distance <= threshold);
}

// ============ Per-thread cache ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagHistoryEntry {
    pub thread_id: String,
    pub docs: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RagHistoryQueue {
    items: Vec<RagHistoryEntry>,
    max_size: usize,
}

/// Most recent RAG results per thread, bounded, oldest evicted first.
#[derive(Clone)]
pub struct RagHistory {
    kv: Arc<dyn KeyValueStore>,
    capacity: usize,
}

impl RagHistory {
    pub fn new(kv: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self {
            kv,
            capacity: capacity.max(1),
        }
    }

    async fn load(&self) -> RagResult<RagHistoryQueue> {
        Ok(get_json(self.kv.as_ref(), RAG_HISTORY_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Replace the thread's entry in place, or append it and evict the
    /// oldest entries beyond capacity.
    pub async fn record(&self, thread_id: &str, outcome: &RagOutcome) -> RagResult<()> {
        let mut queue = self.load().await?;
        queue.max_size = self.capacity;
        match queue.items.iter_mut().find(|e| e.thread_id == thread_id) {
            Some(entry) => entry.docs = outcome.docs.clone(),
            None => {
                queue.items.push(RagHistoryEntry {
                    thread_id: thread_id.to_string(),
                    docs: outcome.docs.clone(),
                });
                let overflow = queue.items.len().saturating_sub(self.capacity);
                queue.items.drain(..overflow);
            }
        }
        put_json(self.kv.as_ref(), RAG_HISTORY_KEY, &queue).await
    }

    pub async fn get(&self, thread_id: &str) -> RagResult<Option<RagHistoryEntry>> {
        Ok(self
            .load()
            .await?
            .items
            .into_iter()
            .find(|e| e.thread_id == thread_id))
    }

    /// Thread ids, oldest first.
    pub async fn threads(&self) -> RagResult<Vec<String>> {
        Ok(self.load().await?.items.into_iter().map(|e| e.thread_id).collect())
    }
}

/// The user message the chat model finally sees.
///
/// With knowledge and prior context both present, the model is told to
/// answer from them or say nothing relevant was found. With knowledge
/// only, the knowledge is prepended. Without knowledge the message is
/// returned unchanged.
pub fn build_final_prompt(message: &str, knowledge: &str, existing_context: Option<&str>) -> String {
    if knowledge.is_empty() {
        return message.to_string();
    }
    match existing_context.filter(|c| !c.is_empty()) {
        Some(existing) => format!(
            "Answer the user's question using the knowledge and context below. \
If the knowledge is not related to the question, reply \"No relevant information found.\"\n\
----------------\n\
Knowledge: {knowledge}\n\
Context: {existing}\n\
----------------\n\
Question: {message}\n\
----------------\n\
Helpful answer:"
        ),
        None => format!(
            "Reference material\n---\n{knowledge}\n---\n\n\
Answer the question below based on the material above, as completely and in as much detail as possible.\n\n\
Question: {message}\n"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::{config_store, set_enabled, ScriptedGenerator};
    use crate::agents::{AgentKind, KvConfigStore};
    use crate::files::KnowledgeFiles;
    use crate::index::tests::{chunk, WordHashEmbedder};
    use crate::index::{IndexParams, KnowledgeIndex};
    use crate::kv::MemoryKvStore;
    use crate::models::KnowledgeFileRecord;
    use crate::search::KnowledgeSearch;

    /// One generator for every agent, answering by prompt shape.
    fn scripted() -> ScriptedGenerator {
        ScriptedGenerator::new(|prompt, _| {
            let reply = if prompt.contains("improved query") {
                "delta epsilon zeta"
            } else if prompt.contains("brand-new question") {
                if prompt.contains("- alpha beta gamma") {
                    ""
                } else if prompt.contains("- eta theta iota") {
                    "alpha beta gamma"
                } else {
                    "eta theta iota"
                }
            } else if prompt.contains("helps answer") {
                if prompt.contains("delta epsilon zeta") {
                    "NO"
                } else {
                    "RELEVANT: on topic"
                }
            } else {
                "unexpected"
            };
            Some(reply.to_string())
        })
    }

    async fn orchestrator(dir: &std::path::Path, top_k: usize) -> (RagOrchestrator, Arc<KvConfigStore>, RagHistory) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let files = KnowledgeFiles::new(kv.clone());
        files
            .add(KnowledgeFileRecord {
                id: "f".to_string(),
                name: "f.txt".to_string(),
                size: 1,
                created_at: String::new(),
                enabled: true,
            })
            .await
            .unwrap();
        let index = Arc::new(KnowledgeIndex::new(
            dir.join("index"),
            IndexParams::default(),
            Arc::new(WordHashEmbedder::new()),
        ));
        index
            .upsert(vec![
                chunk("f", "alpha beta gamma"),
                chunk("f", "delta epsilon zeta"),
                chunk("f", "eta theta iota"),
            ])
            .await
            .unwrap();

        let search = KnowledgeSearch::new(index, files);
        let generator: Arc<ScriptedGenerator> = Arc::new(scripted());
        let configs = config_store();
        let history = RagHistory::new(kv, 10);
        let settings = RagSettings {
            refine_top_k: top_k,
            divergent_top_k: 1,
            ..RagSettings::default()
        };
        let rag = RagOrchestrator::new(
            AgentRunner::new(configs.clone()),
            QueryRefinementAgent::new(generator.clone(), search.clone()),
            DivergentThinkingAgent::new(generator.clone(), search),
            RelevanceJudgementAgent::new(generator),
            settings,
        )
        .with_history(history.clone());
        (rag, configs, history)
    }

    fn contents(outcome: &RagOutcome) -> Vec<&str> {
        outcome.docs.iter().map(|r| r.chunk.content.as_str()).collect()
    }

    fn outcome(content: &str) -> RagOutcome {
        RagOutcome {
            docs: vec![RetrievedChunk::new(chunk("f", content), 0.1)],
            ..RagOutcome::default()
        }
    }

    #[tokio::test]
    async fn history_updates_in_place_and_evicts_oldest() {
        let history = RagHistory::new(Arc::new(MemoryKvStore::new()), 2);
        history.record("t1", &outcome("first")).await.unwrap();
        history.record("t2", &outcome("second")).await.unwrap();
        history.record("t1", &outcome("first again")).await.unwrap();
        assert_eq!(history.threads().await.unwrap(), vec!["t1", "t2"]);
        assert_eq!(
            history.get("t1").await.unwrap().unwrap().docs[0].chunk.content,
            "first again"
        );

        history.record("t3", &outcome("third")).await.unwrap();
        assert_eq!(history.threads().await.unwrap(), vec!["t2", "t3"]);
        assert!(history.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merges_refined_and_divergent_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (rag, _, history) = orchestrator(dir.path(), 1).await;

        let out = rag.run(Some("thread-1"), "alpha beta gamma", &[]).await;
        assert_eq!(out.questions, vec!["eta theta iota", "alpha beta gamma"]);
        assert_eq!(contents(&out), vec!["alpha beta gamma", "delta epsilon zeta", "eta theta iota"]);
        assert_eq!(out.context, "alpha beta gamma\ndelta epsilon zeta\neta theta iota");
        assert!(out.docs.iter().all(|r| r.chunk.metadata.relevance.is_none()));
        assert_eq!(out.docs[1].chunk.metadata.dbquery.as_deref(), Some("delta epsilon zeta"));

        let stages: Vec<_> = out.trace.iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            vec![
                RagStage::Idle,
                RagStage::Refining,
                RagStage::Diverging,
                RagStage::Merging,
                RagStage::ThresholdFilter,
                RagStage::RelevanceFilter,
                RagStage::ContextAssembled,
                RagStage::Done,
            ]
        );
        assert_eq!(out.trace[2].kept, 2);
        assert_eq!(out.trace[3].kept, 3);

        let cached = history.get("thread-1").await.unwrap().unwrap();
        assert_eq!(cached.docs, out.docs);
    }

    #[tokio::test]
    async fn relevance_judgement_drops_and_annotates() {
        let dir = tempfile::tempdir().unwrap();
        let (rag, configs, _) = orchestrator(dir.path(), 1).await;
        set_enabled(configs.as_ref(), AgentKind::RelevanceJudgement, true).await;

        let out = rag.run(None, "alpha beta gamma", &[]).await;
        assert_eq!(contents(&out), vec!["alpha beta gamma", "eta theta iota"]);
        assert!(out
            .docs
            .iter()
            .all(|r| r.chunk.metadata.relevance.as_deref() == Some("RELEVANT: on topic")));
    }

    #[tokio::test]
    async fn disabled_agents_fall_back_to_raw_search() {
        let dir = tempfile::tempdir().unwrap();
        let (rag, configs, _) = orchestrator(dir.path(), 10).await;
        set_enabled(configs.as_ref(), AgentKind::QueryRefinement, false).await;
        set_enabled(configs.as_ref(), AgentKind::DivergentThinking, false).await;

        let out = rag.run(None, "alpha beta gamma", &[]).await;
        assert!(out.questions.is_empty());
        // All three come back from the raw search; only the exact match is close enough.
        assert_eq!(out.trace[1].kept, 3);
        assert_eq!(contents(&out), vec!["alpha beta gamma"]);
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut docs = vec![
            RetrievedChunk::new(chunk("f", "at threshold"), 0.4),
            RetrievedChunk::new(chunk("f", "just over"), 0.4 + f32::EPSILON * 4.0),
            RetrievedChunk::new(chunk("f", "close"), 0.1),
        ];
        apply_threshold(&mut docs, 0.4);
        let kept: Vec<_> = docs.iter().map(|r| r.chunk.content.as_str()).collect();
        assert_eq!(kept, vec!["at threshold", "close"]);
    }

    #[test]
    fn final_prompt_branches() {
        assert_eq!(build_final_prompt("hi", "", Some("ctx")), "hi");

        let with_both = build_final_prompt("why?", "K", Some("C"));
        assert!(with_both.contains("Knowledge: K\nContext: C"));
        assert!(with_both.contains("Question: why?"));

        let knowledge_only = build_final_prompt("why?", "K", None);
        assert!(knowledge_only.starts_with("Reference material\n---\nK\n---"));
        assert_eq!(knowledge_only, build_final_prompt("why?", "K", Some("")));
    }
}
