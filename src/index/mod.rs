//! Persistent vector index over chunk embeddings.
//!
//! Two layers:
//!
//! - [`VectorStore`]: a pluggable in-memory storage engine holding
//!   `(chunk, vector)` records: [`HnswStore`](hnsw::HnswStore) for
//!   approximate search, [`FlatStore`](flat::FlatStore) for exact search.
//! - [`KnowledgeIndex`]: the process-wide handle. It owns the embedder,
//!   lazily opens the persisted engine, serializes writers, and persists
//!   after every successful batch.
//!
//! # Persistence
//!
//! An engine saves into a staging directory next to the index directory,
//! which is then swapped in with two renames. A crash mid-save leaves
//! either the previous snapshot or the new one on disk; an interrupted
//! swap is recovered on the next open.
//!
//! # Failure policy
//!
//! | Operation | Embedding failure | Missing / unreadable index |
//! |-----------|-------------------|----------------------------|
//! | `upsert`  | error             | move it aside, start fresh |
//! | `query`   | error             | empty result               |

pub mod docstore;
pub mod flat;
pub mod hnsw;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::embedding::{cosine_distance, embed_query, l2_distance, Embedder};
use crate::error::{RagError, RagResult};
use crate::models::{Chunk, RetrievedChunk};
use docstore::DocStore;
use flat::FlatStore;
use hnsw::HnswStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    L2,
}

impl Metric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_distance(a, b),
            Metric::L2 => l2_distance(a, b),
        }
    }
}

impl FromStr for Metric {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "l2" => Ok(Metric::L2),
            other => Err(RagError::InvalidConfig(format!("unknown index metric: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Hnsw,
    Flat,
}

impl FromStr for IndexKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hnsw" => Ok(IndexKind::Hnsw),
            "flat" => Ok(IndexKind::Flat),
            other => Err(RagError::InvalidConfig(format!("unknown index kind: {}", other))),
        }
    }
}

/// Engine selection and tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexParams {
    pub kind: IndexKind,
    pub metric: Metric,
    /// Max neighbors per node per HNSW layer (layer 0 allows `2 * m`).
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            kind: IndexKind::Hnsw,
            metric: Metric::Cosine,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

impl IndexParams {
    pub fn from_config(config: &IndexConfig) -> RagResult<Self> {
        Ok(Self {
            kind: config.kind.parse()?,
            metric: config.metric.parse()?,
            m: config.m,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
        })
    }
}

/// An embedded chunk on its way into an engine.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A storage engine. Node ids are dense and assigned in insertion order.
pub trait VectorStore: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Add records; fails on a vector dimension mismatch.
    fn insert(&mut self, records: Vec<IndexRecord>) -> RagResult<usize>;

    /// Up to `k` live chunks ascending by distance. A non-empty `filter`
    /// restricts results to chunks whose `file_id` it contains.
    fn search(&self, query: &[f32], k: usize, filter: Option<&HashSet<String>>) -> Vec<RetrievedChunk>;

    /// Whether a live chunk with this `(file_id, hash)` exists.
    fn contains(&self, file_id: &str, hash: &str) -> bool;

    /// Soft-delete every chunk of a file; returns how many were live.
    fn remove_file(&mut self, file_id: &str) -> usize;

    /// Live chunk count.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn docs(&self) -> &DocStore;

    fn dimension(&self) -> Option<usize>;

    /// Drop tombstoned records; returns how many were reclaimed.
    fn compact(&mut self) -> usize;

    /// Write the engine's files into `dir`.
    fn save(&self, dir: &Path) -> RagResult<()>;
}

pub(crate) fn check_dimension(dimension: &mut Option<usize>, got: usize) -> RagResult<()> {
    if got == 0 {
        return Err(RagError::IndexWrite("empty vector".to_string()));
    }
    match *dimension {
        Some(expected) if expected != got => Err(RagError::IndexWrite(format!(
            "dimension mismatch: expected {}, got {}",
            expected, got
        ))),
        Some(_) => Ok(()),
        None => {
            *dimension = Some(got);
            Ok(())
        }
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> RagResult<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| RagError::IndexLoadFailure(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RagError::IndexLoadFailure(format!("{}: {}", path.display(), e)))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> RagResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| RagError::IndexWrite(e.to_string()))?;
    std::fs::write(path, bytes)
        .map_err(|e| RagError::IndexWrite(format!("{}: {}", path.display(), e)))
}

/// Create an empty engine.
pub fn create_store(params: &IndexParams) -> Box<dyn VectorStore> {
    match params.kind {
        IndexKind::Hnsw => Box::new(HnswStore::new(params.clone())),
        IndexKind::Flat => Box::new(FlatStore::new(params.clone())),
    }
}

/// The engine whose files are in `dir`, if any.
pub fn persisted_kind(dir: &Path) -> Option<IndexKind> {
    if dir.join(hnsw::GRAPH_FILE).exists() {
        Some(IndexKind::Hnsw)
    } else if dir.join(flat::VECTORS_FILE).exists() {
        Some(IndexKind::Flat)
    } else {
        None
    }
}

/// Open the engine persisted in `dir`, or `None` when nothing is there.
///
/// The engine is chosen by the files on disk, not by `params.kind`, so a
/// changed configuration keeps serving the existing index until it is
/// rebuilt.
pub fn open_store(dir: &Path, params: &IndexParams) -> RagResult<Option<Box<dyn VectorStore>>> {
    recover_interrupted_save(dir)?;
    if !DocStore::exists(dir) {
        return Ok(None);
    }
    let kind = persisted_kind(dir).ok_or_else(|| {
        RagError::IndexLoadFailure(format!("{}: no engine file next to the docstore", dir.display()))
    })?;
    if kind != params.kind {
        warn!(
            persisted = ?kind,
            configured = ?params.kind,
            "index kind differs from the configuration, opening the persisted engine"
        );
    }
    let params = IndexParams {
        kind,
        ..params.clone()
    };
    let store: Box<dyn VectorStore> = match kind {
        IndexKind::Hnsw => Box::new(HnswStore::load(dir, params)?),
        IndexKind::Flat => Box::new(FlatStore::load(dir)?),
    };
    Ok(Some(store))
}

/// Move an unreadable index aside so a fresh one can take its place.
/// Returns where it went.
pub fn quarantine_store(dir: &Path) -> RagResult<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let target = sibling(dir, &format!("corrupt-{}", stamp));
    std::fs::rename(dir, &target)
        .map_err(|e| RagError::IndexWrite(format!("{}: {}", dir.display(), e)))?;
    Ok(target)
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    dir.with_file_name(format!("{}.{}", name, suffix))
}

/// Save `store` as the new snapshot in `dir`.
pub fn persist_store(store: &dyn VectorStore, dir: &Path) -> RagResult<()> {
    let write_err = |e: std::io::Error| RagError::IndexWrite(format!("{}: {}", dir.display(), e));
    let staging = sibling(dir, "staging");
    let previous = sibling(dir, "previous");

    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(write_err)?;
    }
    std::fs::create_dir_all(&staging).map_err(write_err)?;
    store.save(&staging).map_err(|e| match e {
        RagError::IndexWrite(_) => e,
        other => RagError::IndexWrite(other.to_string()),
    })?;

    if dir.exists() {
        if previous.exists() {
            std::fs::remove_dir_all(&previous).map_err(write_err)?;
        }
        std::fs::rename(dir, &previous).map_err(write_err)?;
    }
    std::fs::rename(&staging, dir).map_err(write_err)?;
    if previous.exists() {
        if let Err(e) = std::fs::remove_dir_all(&previous) {
            warn!(error = %e, "could not remove previous index snapshot");
        }
    }
    Ok(())
}

/// Finish a swap that was interrupted between its two renames.
fn recover_interrupted_save(dir: &Path) -> RagResult<()> {
    let previous = sibling(dir, "previous");
    if !dir.exists() && previous.exists() {
        warn!(dir = %dir.display(), "restoring index snapshot from interrupted save");
        std::fs::rename(&previous, dir)
            .map_err(|e| RagError::IndexLoadFailure(format!("{}: {}", dir.display(), e)))?;
    }
    Ok(())
}

/// Summary of the index for `kh index stats` and the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub persisted: bool,
    pub live_chunks: usize,
    pub deleted_chunks: usize,
    pub files: usize,
    pub dimension: Option<usize>,
}

/// The process-wide knowledge index.
///
/// Shared behind an `Arc`. Readers run concurrently; `upsert`,
/// `remove_file`, `compact` and `reload` are serialized by a writer mutex,
/// and the engine is only write-locked for the in-memory mutation and
/// the save that follows it.
pub struct KnowledgeIndex {
    dir: PathBuf,
    params: IndexParams,
    embedder: Arc<dyn Embedder>,
    store: RwLock<Option<Box<dyn VectorStore>>>,
    writer: Mutex<()>,
}

impl KnowledgeIndex {
    pub fn new(dir: impl Into<PathBuf>, params: IndexParams, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            dir: dir.into(),
            params,
            embedder,
            store: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Open the persisted engine if nothing is loaded yet. `Ok(false)`
    /// means there is no persisted index.
    async fn load(&self) -> RagResult<bool> {
        if self.store.read().await.is_some() {
            return Ok(true);
        }
        let mut guard = self.store.write().await;
        if guard.is_some() {
            return Ok(true);
        }
        match open_store(&self.dir, &self.params)? {
            Some(store) => {
                debug!(chunks = store.len(), kind = ?store.kind(), "loaded knowledge index");
                *guard = Some(store);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// [`load`](Self::load) for readers: an unreadable index reads as empty.
    async fn ensure_loaded(&self) -> bool {
        match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "knowledge index unavailable");
                false
            }
        }
    }

    /// Embed and insert `chunks`, then persist.
    ///
    /// Chunks whose `(file_id, hash)` is already indexed, or repeated
    /// within the batch, are skipped. Query-time metadata is stripped
    /// before storage. Returns the number of chunks inserted.
    pub async fn upsert(&self, chunks: Vec<Chunk>) -> RagResult<usize> {
        let _writer = self.writer.lock().await;
        if let Err(e) = self.load().await {
            // Never write over a snapshot that could not be read.
            let moved = quarantine_store(&self.dir)?;
            warn!(error = %e, moved_to = %moved.display(), "unreadable knowledge index moved aside, starting a fresh one");
        }

        let fresh: Vec<Chunk> = {
            let guard = self.store.read().await;
            let mut seen = HashSet::new();
            chunks
                .into_iter()
                .filter(|c| !c.content.trim().is_empty())
                .filter(|c| !guard.as_ref().is_some_and(|s| s.contains(&c.file_id, &c.hash)))
                .filter(|c| seen.insert((c.file_id.clone(), c.hash.clone())))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(self.embedder.model_name(), &texts).await?;
        if vectors.len() != fresh.len() {
            return Err(RagError::EmbeddingUnavailable(format!(
                "expected {} vectors, got {}",
                fresh.len(),
                vectors.len()
            )));
        }

        let records: Vec<IndexRecord> = fresh
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexRecord {
                chunk: chunk.persisted(),
                vector,
            })
            .collect();

        let mut guard = self.store.write().await;
        let store = guard.get_or_insert_with(|| create_store(&self.params));
        let result = store
            .insert(records)
            .and_then(|n| persist_store(&**store, &self.dir).map(|_| n));

        match result {
            Ok(n) => {
                info!(inserted = n, total = store.len(), "knowledge index updated");
                Ok(n)
            }
            Err(e) => {
                // Forget the unpersisted batch; the next access reopens the last snapshot.
                *guard = None;
                Err(e)
            }
        }
    }

    /// Nearest chunks to `text`, ascending by distance.
    ///
    /// `filter` restricts results to the listed file ids (empty or `None`
    /// means unrestricted). `embedding_model` overrides the configured
    /// model; a blank model yields no results.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&HashSet<String>>,
        embedding_model: Option<&str>,
    ) -> RagResult<Vec<RetrievedChunk>> {
        let model = embedding_model.unwrap_or_else(|| self.embedder.model_name()).to_string();
        if top_k == 0 || model.trim().is_empty() {
            return Ok(Vec::new());
        }
        if !self.ensure_loaded().await {
            return Ok(Vec::new());
        }
        {
            let guard = self.store.read().await;
            if guard.as_ref().map_or(true, |s| s.is_empty()) {
                return Ok(Vec::new());
            }
        }

        let vector = embed_query(self.embedder.as_ref(), &model, text).await?;

        let guard = self.store.read().await;
        let Some(store) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        if store.dimension() != Some(vector.len()) {
            warn!(
                model = %model,
                expected = ?store.dimension(),
                got = vector.len(),
                "query embedding dimension does not match the index"
            );
            return Ok(Vec::new());
        }
        Ok(store.search(&vector, top_k, filter))
    }

    /// Re-open the persisted state, discarding what is in memory.
    pub async fn reload(&self) -> RagResult<()> {
        let _writer = self.writer.lock().await;
        let mut guard = self.store.write().await;
        *guard = None;
        *guard = open_store(&self.dir, &self.params)?;
        Ok(())
    }

    /// Soft-delete every chunk of `file_id` and persist.
    pub async fn remove_file(&self, file_id: &str) -> RagResult<usize> {
        let _writer = self.writer.lock().await;
        if !self.load().await? {
            return Ok(0);
        }
        let mut guard = self.store.write().await;
        let Some(store) = guard.as_mut() else {
            return Ok(0);
        };
        let removed = store.remove_file(file_id);
        if removed > 0 {
            if let Err(e) = persist_store(&**store, &self.dir) {
                *guard = None;
                return Err(e);
            }
            info!(file_id, removed, "removed file chunks from knowledge index");
        }
        Ok(removed)
    }

    /// Rebuild the engine without tombstones and persist.
    pub async fn compact(&self) -> RagResult<usize> {
        let _writer = self.writer.lock().await;
        if !self.load().await? {
            return Ok(0);
        }
        let mut guard = self.store.write().await;
        let Some(store) = guard.as_mut() else {
            return Ok(0);
        };
        let reclaimed = store.compact();
        if reclaimed > 0 {
            if let Err(e) = persist_store(&**store, &self.dir) {
                *guard = None;
                return Err(e);
            }
            info!(reclaimed, "compacted knowledge index");
        }
        Ok(reclaimed)
    }

    pub async fn stats(&self) -> IndexStats {
        let persisted = self.ensure_loaded().await;
        let guard = self.store.read().await;
        match guard.as_ref() {
            Some(store) => IndexStats {
                kind: store.kind(),
                persisted,
                live_chunks: store.len(),
                deleted_chunks: store.docs().slots() - store.len(),
                files: store.docs().file_count(),
                dimension: store.dimension(),
            },
            None => IndexStats {
                kind: self.params.kind,
                persisted: false,
                live_chunks: 0,
                deleted_chunks: 0,
                files: 0,
                dimension: None,
            },
        }
    }
}
