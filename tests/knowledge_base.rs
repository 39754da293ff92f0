//! End-to-end tests of ingestion, retrieval and RAG orchestration with
//! offline embedding and generation.

mod common;

use common::{harness, harness_with, source, PromptRouter};
use knowledge_harness::agents::{AgentKind, ConfigStore};
use knowledge_harness::ingest::IngestStage;
use knowledge_harness::progress::ProgressSink;
use knowledge_harness::rag::RagStage;
use std::sync::Arc;
use tempfile::TempDir;

const ALPHA: &str = "alpha beta gamma";
const DELTA: &str = "delta epsilon zeta";

async fn enable(configs: &dyn ConfigStore, kind: AgentKind) {
    let mut config = configs.get(kind).await.unwrap();
    config.enabled = true;
    configs.put(kind, &config).await.unwrap();
}

fn sink(h: &common::Harness) -> Arc<dyn ProgressSink> {
    Arc::new(h.app.events.clone())
}

#[tokio::test]
async fn batch_with_unsupported_file_ingests_the_rest() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), PromptRouter::new());

    let report = h
        .app
        .pipeline(sink(&h))
        .ingest(vec![
            source("alpha.txt", ALPHA),
            source("notes.xyz", "opaque"),
            source("delta.md", DELTA),
        ])
        .await;

    assert_eq!(report.ingested.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "notes.xyz");
    assert_eq!(report.failed[0].stage, IngestStage::Parse);

    let files = h.app.kb.files.list().await.unwrap();
    let names: Vec<&str> = files.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["alpha.txt", "delta.md"]);
    assert!(files.files.iter().all(|f| f.enabled));
}

#[tokio::test]
async fn ingested_chunks_are_searchable_and_meet_min_length() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), PromptRouter::new());
    h.app
        .pipeline(sink(&h))
        .ingest(vec![source("alpha.txt", ALPHA), source("delta.txt", DELTA), source("tiny.txt", "hi")])
        .await;

    let results = h.app.search.search(ALPHA, 10).await;
    assert!(!results.is_empty());
    assert_eq!(results[0].chunk.content, ALPHA);
    assert!(results[0].distance.abs() < 1e-4);
    assert_eq!(results[0].chunk.metadata.dbquery.as_deref(), Some(ALPHA));

    let min = h.app.config.chunking.min_chunk_chars;
    assert!(results.iter().all(|r| r.chunk.content.chars().count() >= min));
    assert!(results.iter().all(|r| r.chunk.content != "hi"));
}

#[tokio::test]
async fn disabled_and_deleted_files_leave_retrieval() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), PromptRouter::new());
    let report = h
        .app
        .pipeline(sink(&h))
        .ingest(vec![source("alpha.txt", ALPHA), source("delta.txt", DELTA)])
        .await;
    let alpha_id = report.ingested[0].id.clone();

    assert!(h.app.kb.files.set_enabled(&alpha_id, false).await.unwrap());
    let results = h.app.search.search(ALPHA, 10).await;
    assert!(results.iter().all(|r| r.chunk.file_id != alpha_id));

    assert!(h.app.kb.files.set_enabled(&alpha_id, true).await.unwrap());
    assert_eq!(h.app.search.search(ALPHA, 10).await[0].chunk.file_id, alpha_id);

    let before = h.app.kb.index.stats().await.live_chunks;
    assert!(h.app.kb.delete_file(&alpha_id).await.unwrap());
    assert!(h.app.kb.index.stats().await.live_chunks < before);
    assert!(h
        .app
        .search
        .search(ALPHA, 10)
        .await
        .iter()
        .all(|r| r.chunk.file_id != alpha_id));
    assert!(!h.app.kb.delete_file(&alpha_id).await.unwrap());
}

#[tokio::test]
async fn index_survives_reopening_the_data_dir() {
    let tmp = TempDir::new().unwrap();
    let first = harness(tmp.path(), PromptRouter::new());
    first
        .app
        .pipeline(sink(&first))
        .ingest(vec![source("alpha.txt", ALPHA)])
        .await;
    let kv = first.kv.clone();
    drop(first);

    let second = harness_with(tmp.path(), kv, PromptRouter::new());
    let results = second.app.search.search(ALPHA, 5).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.content, ALPHA);

    second.app.kb.index.reload().await.unwrap();
    second.app.kb.index.reload().await.unwrap();
    assert_eq!(second.app.kb.index.stats().await.live_chunks, 1);
}

#[tokio::test]
async fn empty_knowledge_base_gives_empty_context() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), PromptRouter::new());

    assert!(h.app.search.search("anything at all", 5).await.is_empty());
    let outcome = h.app.rag.run(Some("t1"), "anything at all", &[]).await;
    assert!(outcome.docs.is_empty());
    assert_eq!(outcome.context, "");
    assert_eq!(outcome.trace.last().map(|s| s.stage), Some(RagStage::Done));
}

#[tokio::test]
async fn rag_merges_thresholds_and_judges_relevance() {
    let tmp = TempDir::new().unwrap();
    let router = PromptRouter {
        refine: Some("alpha beta gamma overview".to_string()),
        divergent: vec![DELTA.to_string(), DELTA.to_string(), String::new()],
        relevance: Box::new(|text| {
            if text.contains("delta") {
                "NO".to_string()
            } else {
                "RELEVANT it names alpha".to_string()
            }
        }),
        ..PromptRouter::new()
    };
    let h = harness(tmp.path(), router);
    enable(h.app.configs.as_ref(), AgentKind::RelevanceJudgement).await;
    h.app
        .pipeline(sink(&h))
        .ingest(vec![
            source("alpha.txt", ALPHA),
            source("mixed.txt", "alpha beta gamma delta"),
            source("delta.txt", DELTA),
        ])
        .await;

    let outcome = h.app.rag.run(Some("thread-1"), ALPHA, &[]).await;

    // The repeated divergent question is asked once.
    assert_eq!(outcome.questions, vec![DELTA.to_string()]);
    assert_eq!(outcome.docs.len(), 1);
    assert_eq!(outcome.docs[0].chunk.content, ALPHA);
    assert_eq!(
        outcome.docs[0].chunk.metadata.relevance.as_deref(),
        Some("RELEVANT it names alpha")
    );
    assert_eq!(outcome.context, ALPHA);

    let kept = |stage: RagStage| outcome.trace.iter().find(|s| s.stage == stage).unwrap().kept;
    assert_eq!(kept(RagStage::Merging), 3);
    assert_eq!(kept(RagStage::ThresholdFilter), 2);
    assert_eq!(kept(RagStage::RelevanceFilter), 1);

    let cached = h.app.history.get("thread-1").await.unwrap().unwrap();
    assert_eq!(cached.docs, outcome.docs);
}

#[tokio::test]
async fn content_filter_drops_rejected_chunks() {
    let tmp = TempDir::new().unwrap();
    let router = PromptRouter {
        filter: "N".to_string(),
        ..PromptRouter::new()
    };
    let h = harness(tmp.path(), router);
    enable(h.app.configs.as_ref(), AgentKind::ContentFilter).await;

    let report = h.app.pipeline(sink(&h)).ingest(vec![source("alpha.txt", ALPHA)]).await;
    assert!(report.is_success());
    assert_eq!(report.ingested[0].chunks, 0);
    assert_eq!(report.ingested[0].filtered_out, 1);
    assert!(h.app.search.search(ALPHA, 5).await.is_empty());
    assert!(h.generator.prompts().iter().any(|p| p.contains(ALPHA)));
}

#[tokio::test]
async fn progress_events_end_with_the_completion_banner() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), PromptRouter::new());
    let mut rx = h.app.events.subscribe();

    h.app
        .pipeline(sink(&h))
        .ingest(vec![source("alpha.txt", ALPHA), source("notes.xyz", "opaque")])
        .await;

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    let values: Vec<f64> = events.iter().map(|e| e.value).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
    let last = events.last().unwrap();
    assert_eq!(last.value, 100.0);
    assert!(last.title.contains("1 file(s) could not be processed"));
    assert_eq!(last.content, "notes.xyz");
}
