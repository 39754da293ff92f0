//! Exact brute-force storage engine.
//!
//! Scans every live vector on each search. Useful for small knowledge
//! bases and as a reference when checking HNSW recall.

use std::collections::HashSet;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::docstore::DocStore;
use super::{check_dimension, read_json, write_json, IndexKind, IndexParams, IndexRecord, Metric, VectorStore};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, RagResult};
use crate::models::RetrievedChunk;

pub const VECTORS_FILE: &str = "flat.json";

pub struct FlatStore {
    metric: Metric,
    docs: DocStore,
    vectors: Vec<Vec<f32>>,
    dimension: Option<usize>,
}

#[derive(Serialize, Deserialize)]
struct VectorsFile {
    metric: Metric,
    dimension: Option<usize>,
    vectors: Vec<String>,
}

impl FlatStore {
    pub fn new(params: IndexParams) -> Self {
        Self {
            metric: params.metric,
            docs: DocStore::new(),
            vectors: Vec::new(),
            dimension: None,
        }
    }

    pub fn load(dir: &Path) -> RagResult<Self> {
        let file: VectorsFile = read_json(&dir.join(VECTORS_FILE))?;
        let docs = DocStore::load(dir)?;
        if file.vectors.len() != docs.slots() {
            return Err(RagError::IndexLoadFailure(format!(
                "{} vectors but docstore has {} records",
                file.vectors.len(),
                docs.slots()
            )));
        }

        let vectors = file
            .vectors
            .iter()
            .map(|encoded| {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map(|blob| blob_to_vec(&blob))
                    .map_err(|e| RagError::IndexLoadFailure(e.to_string()))
            })
            .collect::<RagResult<Vec<_>>>()?;

        Ok(Self {
            metric: file.metric,
            docs,
            vectors,
            dimension: file.dimension,
        })
    }
}

impl VectorStore for FlatStore {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn insert(&mut self, records: Vec<IndexRecord>) -> RagResult<usize> {
        let mut inserted = 0;
        for record in records {
            check_dimension(&mut self.dimension, record.vector.len())?;
            self.docs.push(record.chunk);
            self.vectors.push(record.vector);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn search(&self, query: &[f32], k: usize, filter: Option<&HashSet<String>>) -> Vec<RetrievedChunk> {
        if k == 0 || self.dimension != Some(query.len()) {
            return Vec::new();
        }

        let mut scored: Vec<(u32, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .filter(|(id, _)| self.docs.admits(*id, filter))
            .map(|(id, v)| (id, self.metric.distance(v, query)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(k)
            .filter_map(|(id, dist)| self.docs.get(id).map(|c| RetrievedChunk::new(c.clone(), dist)))
            .collect()
    }

    fn contains(&self, file_id: &str, hash: &str) -> bool {
        self.docs.contains(file_id, hash)
    }

    fn remove_file(&mut self, file_id: &str) -> usize {
        self.docs.remove_file(file_id)
    }

    fn len(&self) -> usize {
        self.docs.live_len()
    }

    fn docs(&self) -> &DocStore {
        &self.docs
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn compact(&mut self) -> usize {
        let reclaimed = self.docs.slots() - self.docs.live_len();
        if reclaimed == 0 {
            return 0;
        }

        let mut docs = DocStore::new();
        let mut vectors = Vec::with_capacity(self.docs.live_len());
        for (id, chunk) in self.docs.live() {
            docs.push(chunk.clone());
            vectors.push(self.vectors[id as usize].clone());
        }
        self.docs = docs;
        self.vectors = vectors;
        reclaimed
    }

    fn save(&self, dir: &Path) -> RagResult<()> {
        std::fs::create_dir_all(dir)?;
        let file = VectorsFile {
            metric: self.metric,
            dimension: self.dimension,
            vectors: self
                .vectors
                .iter()
                .map(|v| STANDARD.encode(vec_to_blob(v)))
                .collect(),
        };
        write_json(&dir.join(VECTORS_FILE), &file)?;
        self.docs.save(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};

    fn record(file: &str, content: &str, vector: Vec<f32>) -> IndexRecord {
        IndexRecord {
            chunk: Chunk {
                id: content.to_string(),
                file_id: file.to_string(),
                content: content.to_string(),
                hash: content.to_string(),
                metadata: ChunkMetadata::default(),
            },
            vector,
        }
    }

    fn params(metric: Metric) -> IndexParams {
        IndexParams {
            kind: IndexKind::Flat,
            metric,
            ..IndexParams::default()
        }
    }

    #[test]
    fn returns_ascending_distances_under_l2() {
        let mut store = FlatStore::new(params(Metric::L2));
        store
            .insert(vec![
                record("a", "far", vec![10.0, 0.0]),
                record("a", "near", vec![1.0, 0.0]),
                record("b", "mid", vec![3.0, 0.0]),
            ])
            .unwrap();

        let results = store.search(&[0.0, 0.0], 3, None);
        let ids: Vec<_> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!((results[0].distance - 1.0).abs() < 1e-6);

        let only_b: HashSet<String> = ["b".to_string()].into_iter().collect();
        let filtered = store.search(&[0.0, 0.0], 3, Some(&only_b));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chunk.id, "mid");
    }

    #[test]
    fn persist_compact_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::new(params(Metric::Cosine));
        store
            .insert(vec![
                record("a", "one", vec![1.0, 0.0]),
                record("b", "two", vec![0.0, 1.0]),
            ])
            .unwrap();
        store.remove_file("a");
        assert_eq!(store.compact(), 1);
        store.save(dir.path()).unwrap();

        let loaded = FlatStore::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        let results = loaded.search(&[0.0, 1.0], 5, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "two");
    }
}
