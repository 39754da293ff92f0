//! Ingestion pipeline orchestration.
//!
//! Coordinates the per-file flow: upload → parse → content filter →
//! embed + persist. Files are processed in upload order, and a failure
//! at any stage rolls back that file alone (blob and list entry are
//! removed) before the batch moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::agents::filter::FilterInput;
use crate::agents::{AgentRunner, ContentFilterAgent, Invocation};
use crate::chunk::ChunkOptions;
use crate::error::{RagError, RagResult};
use crate::files::{KnowledgeBase, UploadedFile};
use crate::loader;
use crate::models::{Chunk, KnowledgeFileRecord};
use crate::progress::{ProgressEvent, ProgressSink, ProgressTracker};

/// Include patterns used when none are configured.
pub const DEFAULT_INCLUDE_GLOBS: &[&str] = &["**/*.md", "**/*.markdown", "**/*.txt", "**/*.pdf", "**/*.docx"];

/// A document handed to the pipeline.
#[derive(Debug, Clone)]
pub struct IngestSource {
    /// File name; its extension selects the loader.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl IngestSource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> RagResult<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| RagError::Storage(format!("not a file: {}", path.display())))?;
        Ok(Self::new(name, std::fs::read(path)?))
    }
}

/// Stage a file failed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Upload,
    Parse,
    Filter,
    /// Embedding and persisting to the index.
    Embed,
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestStage::Upload => "upload",
            IngestStage::Parse => "parse",
            IngestStage::Filter => "filter",
            IngestStage::Embed => "embed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub name: String,
    pub stage: IngestStage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedFile {
    pub id: String,
    pub name: String,
    /// Chunks handed to the index after filtering.
    pub chunks: usize,
    /// Chunks the content filter rejected.
    pub filtered_out: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub ingested: Vec<IngestedFile>,
    pub failed: Vec<FileFailure>,
}

impl IngestReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct IngestionPipeline {
    kb: KnowledgeBase,
    runner: AgentRunner,
    filter: ContentFilterAgent,
    chunking: ChunkOptions,
    progress: Arc<dyn ProgressSink>,
}

impl IngestionPipeline {
    pub fn new(
        kb: KnowledgeBase,
        runner: AgentRunner,
        filter: ContentFilterAgent,
        chunking: ChunkOptions,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            kb,
            runner,
            filter,
            chunking,
            progress,
        }
    }

    /// Ingest a batch. Never fails as a whole; per-file failures are in
    /// the report.
    pub async fn ingest(&self, sources: Vec<IngestSource>) -> IngestReport {
        let mut report = IngestReport::default();
        let source_count = sources.len();
        let upload_tracker = ProgressTracker::new(source_count);

        let mut uploaded = Vec::with_capacity(sources.len());
        for (i, source) in sources.into_iter().enumerate() {
            match self.upload(&source).await {
                Ok(file) => uploaded.push(file),
                Err(e) => {
                    warn!(name = %source.name, error = %e, "upload failed");
                    report.failed.push(FileFailure {
                        name: source.name.clone(),
                        stage: IngestStage::Upload,
                        error: e.to_string(),
                    });
                }
            }
            self.progress.publish(
                ProgressEvent::new("📤 Uploading files", upload_tracker.upload(i + 1))
                    .subtitle(format!("file {}/{}", i + 1, source_count))
                    .content(source.name),
            );
        }

        let tracker = ProgressTracker::new(uploaded.len());
        let total = uploaded.len();
        for (i, file) in uploaded.into_iter().enumerate() {
            match self.process_file(&file, i, total, &tracker).await {
                Ok(done) => {
                    info!(file_id = %done.id, name = %done.name, chunks = done.chunks, "file ingested");
                    report.ingested.push(done);
                }
                Err((stage, e)) => {
                    warn!(file_id = %file.id, name = %file.filename, %stage, error = %e, "ingestion failed, rolling back file");
                    self.rollback(&file).await;
                    report.failed.push(FileFailure {
                        name: file.filename.clone(),
                        stage,
                        error: e.to_string(),
                    });
                }
            }
            self.progress.publish(
                ProgressEvent::new(format!("📚 {}", file.filename), tracker.file_done(i))
                    .subtitle(format!("file {}/{}", i + 1, total)),
            );
        }

        let banner = if report.is_success() {
            ProgressEvent::new("✅ All files processed", 100.0)
        } else {
            let names: Vec<&str> = report.failed.iter().map(|f| f.name.as_str()).collect();
            ProgressEvent::new(format!("❌ {} file(s) could not be processed", report.failed.len()), 100.0)
                .content(names.join("\n"))
        };
        self.progress.publish(banner.add_to_history(true));
        report
    }

    async fn upload(&self, source: &IngestSource) -> RagResult<UploadedFile> {
        let file = self.kb.registry.upload(&source.name, &source.bytes).await?;
        let record = KnowledgeFileRecord {
            id: file.id.clone(),
            name: file.filename.clone(),
            size: source.bytes.len() as u64,
            created_at: chrono::Utc::now().to_rfc3339(),
            enabled: true,
        };
        if let Err(e) = self.kb.files.add(record).await {
            self.rollback(&file).await;
            return Err(e);
        }
        Ok(file)
    }

    async fn process_file(
        &self,
        file: &UploadedFile,
        index: usize,
        total: usize,
        tracker: &ProgressTracker,
    ) -> Result<IngestedFile, (IngestStage, RagError)> {
        let bytes = self
            .kb
            .registry
            .get_content(&file.id)
            .await
            .map_err(|e| (IngestStage::Parse, e))?;
        let chunks = loader::parse_bytes(&bytes, &file.filename, &file.id, &self.chunking)
            .map_err(|e| (IngestStage::Parse, e))?;
        let parsed = chunks.len();

        let kept = self
            .filter_chunks(chunks, index, total, tracker)
            .await
            .map_err(|e| (IngestStage::Filter, e))?;
        let kept_len = kept.len();

        self.kb
            .index
            .upsert(kept)
            .await
            .map_err(|e| (IngestStage::Embed, e))?;

        Ok(IngestedFile {
            id: file.id.clone(),
            name: file.filename.clone(),
            chunks: kept_len,
            filtered_out: parsed - kept_len,
        })
    }

    async fn filter_chunks(
        &self,
        chunks: Vec<Chunk>,
        index: usize,
        total: usize,
        tracker: &ProgressTracker,
    ) -> RagResult<Vec<Chunk>> {
        let count = chunks.len();
        let mut kept = Vec::with_capacity(count);
        for (j, chunk) in chunks.into_iter().enumerate() {
            let input = FilterInput {
                chunk,
                file_index: index,
                total_files: total,
            };
            match self.runner.invoke(&self.filter, input).await? {
                Invocation::Disabled(input) => kept.push(input.chunk),
                Invocation::Ran(out) => {
                    if let Some(message) = out.message {
                        self.progress.publish(
                            ProgressEvent::new(message.title, tracker.file(index, j + 1, count))
                                .subtitle(message.subtitle)
                                .content(message.content)
                                .add_to_history(false),
                        );
                    }
                    kept.extend(out.result);
                }
            }
        }
        Ok(kept)
    }

    async fn rollback(&self, file: &UploadedFile) {
        if let Err(e) = self.kb.registry.delete(&file.id).await {
            warn!(file_id = %file.id, error = %e, "failed to delete upload during rollback");
        }
        if let Err(e) = self.kb.files.remove(&file.id).await {
            warn!(file_id = %file.id, error = %e, "failed to remove list entry during rollback");
        }
    }
}

// ============ Discovery ============

/// Expand `paths` into the files to ingest.
///
/// Files named directly are always kept. Directories are walked and
/// filtered by `include` (relative to the directory), skipping VCS and
/// build directories. Results keep argument order; each directory's
/// files are sorted.
pub fn discover_files(paths: &[PathBuf], include: &[String]) -> Result<Vec<PathBuf>> {
    let patterns: Vec<String> = if include.is_empty() {
        DEFAULT_INCLUDE_GLOBS.iter().map(|s| s.to_string()).collect()
    } else {
        include.to_vec()
    };
    let include_set = build_globset(&patterns)?;
    let exclude_set = build_globset(&[
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ])?;

    let mut out = Vec::new();
    for root in paths {
        if root.is_file() {
            out.push(root.clone());
            continue;
        }
        if !root.is_dir() {
            bail!("path does not exist: {}", root.display());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string();
            if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
                continue;
            }
            found.push(path.to_path_buf());
        }
        found.sort();
        out.extend(found);
    }
    Ok(out)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::{config_store, set_enabled, ScriptedGenerator};
    use crate::agents::AgentKind;
    use crate::files::{KnowledgeFiles, LocalFileRegistry};
    use crate::index::tests::WordHashEmbedder;
    use crate::index::{IndexParams, KnowledgeIndex};
    use crate::kv::MemoryKvStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Collect {
        fn publish(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        kb: KnowledgeBase,
        configs: Arc<crate::agents::KvConfigStore>,
        events: Arc<Collect>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let kb = KnowledgeBase::new(
            Arc::new(LocalFileRegistry::new(dir.path().join("files"))),
            KnowledgeFiles::new(Arc::new(MemoryKvStore::new())),
            Arc::new(KnowledgeIndex::new(
                dir.path().join("index"),
                IndexParams::default(),
                Arc::new(WordHashEmbedder::new()),
            )),
        );
        Fixture {
            _dir: dir,
            kb,
            configs: config_store(),
            events: Arc::new(Collect::default()),
        }
    }

    fn pipeline(f: &Fixture, generator: ScriptedGenerator) -> IngestionPipeline {
        IngestionPipeline::new(
            f.kb.clone(),
            AgentRunner::new(f.configs.clone()),
            ContentFilterAgent::new(Arc::new(generator)),
            ChunkOptions::new(80, 10),
            f.events.clone(),
        )
    }

    #[tokio::test]
    async fn bad_file_is_isolated_and_rolled_back() {
        let f = fixture();
        let report = pipeline(&f, ScriptedGenerator::always("Y"))
            .ingest(vec![
                IngestSource::new("one.md", b"Ownership moves values between bindings in rust.".to_vec()),
                IngestSource::new("two.xyz", b"whatever is in here".to_vec()),
                IngestSource::new("three.txt", b"Borrowing lends access without moving anything.".to_vec()),
            ])
            .await;

        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "two.xyz");
        assert_eq!(report.failed[0].stage, IngestStage::Parse);

        let names: Vec<_> = f.kb.files.list().await.unwrap().files.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["one.md", "three.txt"]);
        assert_eq!(f.kb.index.stats().await.live_chunks, 2);
        assert_eq!(std::fs::read_dir(f._dir.path().join("files")).unwrap().count(), 2);

        let events = f.events.0.lock().unwrap();
        assert!(events.windows(2).all(|w| w[0].value <= w[1].value));
        assert!(events.last().unwrap().title.starts_with('❌'));
    }

    #[tokio::test]
    async fn enabled_filter_drops_chunks_and_reports_progress() {
        let f = fixture();
        set_enabled(f.configs.as_ref(), AgentKind::ContentFilter, true).await;
        let generator = ScriptedGenerator::new(|prompt, _| {
            Some(if prompt.contains("Insulin") { "Y" } else { "N" }.to_string())
        });

        let text = "Insulin lowers blood glucose after meals.\n\nThe cafeteria menu changes every Tuesday.";
        let report = pipeline(&f, generator)
            .ingest(vec![IngestSource::new("notes.txt", text.as_bytes().to_vec())])
            .await;

        assert!(report.is_success());
        assert_eq!(report.ingested[0].chunks, 1);
        assert_eq!(report.ingested[0].filtered_out, 1);

        let events = f.events.0.lock().unwrap();
        let filter_events: Vec<_> = events.iter().filter(|e| e.title == "🦾 Filter Agent").collect();
        assert_eq!(filter_events.len(), 2);
        assert_eq!(filter_events[0].subtitle, "file 1/1");
        assert_eq!(filter_events[1].value, 100.0);
        assert_eq!(events.last().unwrap().title, "✅ All files processed");
    }

    #[tokio::test]
    async fn filter_failure_fails_only_that_file() {
        let f = fixture();
        set_enabled(f.configs.as_ref(), AgentKind::ContentFilter, true).await;
        let report = pipeline(&f, ScriptedGenerator::failing())
            .ingest(vec![IngestSource::new("a.md", b"Some content long enough to keep.".to_vec())])
            .await;

        assert_eq!(report.failed[0].stage, IngestStage::Filter);
        assert!(f.kb.files.list().await.unwrap().files.is_empty());
        assert_eq!(f.kb.index.stats().await.live_chunks, 0);
    }

    #[test]
    fn discovery_walks_directories_with_globs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("docs/deep")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("docs/b.md"), "b").unwrap();
        std::fs::write(root.join("docs/deep/a.txt"), "a").unwrap();
        std::fs::write(root.join("docs/skip.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join(".git/x.md"), "x").unwrap();
        std::fs::write(root.join("single.rs"), "explicit").unwrap();

        let found = discover_files(&[root.join("single.rs"), root.to_path_buf()], &[]).unwrap();
        let rel: Vec<String> = found
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, vec!["single.rs", "docs/b.md", "docs/deep/a.txt"]);

        assert!(discover_files(&[root.join("missing")], &[]).is_err());
    }
}
