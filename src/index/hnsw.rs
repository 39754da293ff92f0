//! HNSW (Hierarchical Navigable Small World) storage engine.
//!
//! A multi-layer proximity graph for approximate nearest-neighbor search:
//! - Higher layers have fewer nodes (exponential decay)
//! - Search starts from the top layer and descends greedily
//! - Layer 0 is searched with a beam of width `ef`
//!
//! File filtering happens during the layer-0 beam search: nodes outside
//! the filter (and tombstoned nodes) are still traversed, so they keep the
//! graph navigable, but they are never admitted to the result set.
//!
//! Level assignment uses a seeded LCG, so building the same index from the
//! same inserts always yields the same graph. The RNG state is persisted
//! alongside the graph.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::docstore::DocStore;
use super::{check_dimension, read_json, write_json, IndexKind, IndexParams, IndexRecord, Metric, VectorStore};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, RagResult};
use crate::models::RetrievedChunk;

pub const GRAPH_FILE: &str = "hnsw.json";

const MAX_LEVEL: u8 = 16;
const RNG_SEED: u64 = 42;

/// Heap entry ordered by distance.
#[derive(Debug, Clone, Copy)]
struct Scored {
    dist: f32,
    id: u32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.partial_cmp(&other.dist).unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Clone)]
struct Node {
    vector: Vec<f32>,
    /// Neighbor ids per layer, `0..=level`.
    neighbors: Vec<Vec<u32>>,
}

pub struct HnswStore {
    params: IndexParams,
    m_max0: usize,
    level_mult: f32,
    docs: DocStore,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
    level_max: u8,
    dimension: Option<usize>,
    rng_state: u64,
}

impl HnswStore {
    pub fn new(params: IndexParams) -> Self {
        let m = params.m.max(2);
        Self {
            m_max0: m * 2,
            level_mult: 1.0 / (m as f32).ln(),
            params: IndexParams { m, ..params },
            docs: DocStore::new(),
            nodes: Vec::new(),
            entry_point: None,
            level_max: 0,
            dimension: None,
            rng_state: RNG_SEED,
        }
    }

    fn dist(&self, id: u32, query: &[f32]) -> f32 {
        match self.nodes.get(id as usize) {
            Some(node) => self.params.metric.distance(&node.vector, query),
            None => f32::INFINITY,
        }
    }

    /// Select a level for a new node from an exponential distribution.
    fn select_level(&mut self) -> u8 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let r = ((self.rng_state >> 33) as f32 / (u32::MAX >> 1) as f32).clamp(1e-7, 1.0);
        let level = (-r.ln() * self.level_mult).floor() as u8;
        level.min(MAX_LEVEL)
    }

    /// Greedy walk on one layer towards `query`.
    fn greedy(&self, mut current: u32, query: &[f32], layer: usize) -> u32 {
        let mut current_dist = self.dist(current, query);
        loop {
            let mut changed = false;
            if let Some(node) = self.nodes.get(current as usize) {
                if let Some(neighbors) = node.neighbors.get(layer) {
                    for &nid in neighbors {
                        let d = self.dist(nid, query);
                        if d < current_dist {
                            current = nid;
                            current_dist = d;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                return current;
            }
        }
    }

    /// Beam search on one layer. Every reachable node may be expanded, but
    /// only nodes for which `admit` holds enter the result set. Results are
    /// sorted ascending by distance.
    fn search_layer<F>(&self, entry: u32, query: &[f32], ef: usize, layer: usize, admit: F) -> Vec<Scored>
    where
        F: Fn(u32) -> bool,
    {
        let mut visited: HashSet<u32> = HashSet::new();
        // Min-heap: closest candidate first.
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        // Max-heap: worst kept result on top.
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        let entry_scored = Scored {
            dist: self.dist(entry, query),
            id: entry,
        };
        visited.insert(entry);
        candidates.push(Reverse(entry_scored));
        if admit(entry) {
            results.push(entry_scored);
        }

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = results.peek().map(|s| s.dist).unwrap_or(f32::INFINITY);
            if current.dist > worst && results.len() >= ef {
                break;
            }

            let Some(neighbors) = self
                .nodes
                .get(current.id as usize)
                .and_then(|n| n.neighbors.get(layer))
            else {
                continue;
            };

            for &nid in neighbors {
                if !visited.insert(nid) {
                    continue;
                }
                let scored = Scored {
                    dist: self.dist(nid, query),
                    id: nid,
                };
                let worst = results.peek().map(|s| s.dist).unwrap_or(f32::INFINITY);
                if scored.dist < worst || results.len() < ef {
                    candidates.push(Reverse(scored));
                    if admit(nid) {
                        results.push(scored);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        out
    }

    fn add_neighbor(&mut self, from: u32, to: u32, layer: usize) {
        if let Some(node) = self.nodes.get_mut(from as usize) {
            while node.neighbors.len() <= layer {
                node.neighbors.push(Vec::new());
            }
            if !node.neighbors[layer].contains(&to) {
                node.neighbors[layer].push(to);
            }
        }
    }

    /// Keep only the `max` closest neighbors of `id` on `layer`.
    fn prune_neighbors(&mut self, id: u32, layer: usize, max: usize) {
        let Some(node) = self.nodes.get(id as usize) else { return };
        let Some(neighbors) = node.neighbors.get(layer) else { return };
        if neighbors.len() <= max {
            return;
        }

        let mut scored: Vec<Scored> = neighbors
            .iter()
            .map(|&nid| Scored {
                dist: self.dist(nid, &node.vector),
                id: nid,
            })
            .collect();
        scored.sort();
        let kept: Vec<u32> = scored.into_iter().take(max).map(|s| s.id).collect();

        if let Some(node) = self.nodes.get_mut(id as usize) {
            node.neighbors[layer] = kept;
        }
    }

    fn insert_vector(&mut self, vector: Vec<f32>) -> u32 {
        let level = self.select_level();
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            vector,
            neighbors: vec![Vec::new(); level as usize + 1],
        });

        let Some(mut ep) = self.entry_point else {
            self.entry_point = Some(id);
            self.level_max = level;
            return id;
        };

        let query = self.nodes[id as usize].vector.clone();

        // Phase 1: greedy descent through layers above the node's level.
        let mut layer = self.level_max as usize;
        while layer > level as usize {
            ep = self.greedy(ep, &query, layer);
            layer -= 1;
        }

        // Phase 2: connect on every layer from min(level, level_max) down to 0.
        let top = (level as usize).min(self.level_max as usize);
        for lc in (0..=top).rev() {
            let found = self.search_layer(ep, &query, self.params.ef_construction, lc, |nid| nid != id);
            let m_limit = if lc == 0 { self.m_max0 } else { self.params.m };

            for s in found.iter().take(m_limit) {
                self.add_neighbor(s.id, id, lc);
                self.add_neighbor(id, s.id, lc);
            }
            for s in found.iter().take(m_limit) {
                self.prune_neighbors(s.id, lc, m_limit);
            }
            if let Some(first) = found.first() {
                ep = first.id;
            }
        }

        if level > self.level_max {
            self.entry_point = Some(id);
            self.level_max = level;
        }
        id
    }
}

impl VectorStore for HnswStore {
    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }

    fn insert(&mut self, records: Vec<IndexRecord>) -> RagResult<usize> {
        let mut inserted = 0;
        for record in records {
            check_dimension(&mut self.dimension, record.vector.len())?;
            let doc_id = self.docs.push(record.chunk);
            let node_id = self.insert_vector(record.vector);
            debug_assert_eq!(doc_id, node_id);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn search(&self, query: &[f32], k: usize, filter: Option<&HashSet<String>>) -> Vec<RetrievedChunk> {
        let Some(mut ep) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || self.dimension != Some(query.len()) {
            return Vec::new();
        }

        let mut layer = self.level_max as usize;
        while layer > 0 {
            ep = self.greedy(ep, query, layer);
            layer -= 1;
        }

        let ef = k.max(self.params.ef_search);
        self.search_layer(ep, query, ef, 0, |nid| self.docs.admits(nid, filter))
            .into_iter()
            .take(k)
            .filter_map(|s| {
                self.docs
                    .get(s.id)
                    .map(|chunk| RetrievedChunk::new(chunk.clone(), s.dist))
            })
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

        let mut rebuilt = HnswStore::new(self.params.clone());
        let live: Vec<IndexRecord> = self
            .docs
            .live()
            .map(|(id, chunk)| IndexRecord {
                chunk: chunk.clone(),
                vector: self.nodes[id as usize].vector.clone(),
            })
            .collect();
        // Dimensions were validated on the way in.
        if rebuilt.insert(live).is_ok() {
            *self = rebuilt;
            reclaimed
        } else {
            0
        }
    }

    fn save(&self, dir: &Path) -> RagResult<()> {
        std::fs::create_dir_all(dir)?;
        let file = GraphFile {
            metric: self.params.metric,
            m: self.params.m,
            ef_construction: self.params.ef_construction,
            dimension: self.dimension,
            entry_point: self.entry_point,
            level_max: self.level_max,
            rng_state: self.rng_state,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeFile {
                    vector: STANDARD.encode(vec_to_blob(&n.vector)),
                    neighbors: n.neighbors.clone(),
                })
                .collect(),
        };
        write_json(&dir.join(GRAPH_FILE), &file)?;
        self.docs.save(dir)
    }
}

impl HnswStore {
    /// Open a persisted graph. Search-time parameters come from `params`;
    /// build-time parameters and the metric come from the file.
    pub fn load(dir: &Path, params: IndexParams) -> RagResult<Self> {
        let file: GraphFile = read_json(&dir.join(GRAPH_FILE))?;
        let docs = DocStore::load(dir)?;

        if file.nodes.len() != docs.slots() {
            return Err(RagError::IndexLoadFailure(format!(
                "graph has {} nodes but docstore has {} records",
                file.nodes.len(),
                docs.slots()
            )));
        }

        let mut nodes = Vec::with_capacity(file.nodes.len());
        for (i, n) in file.nodes.into_iter().enumerate() {
            let blob = STANDARD
                .decode(n.vector.as_bytes())
                .map_err(|e| RagError::IndexLoadFailure(format!("node {}: {}", i, e)))?;
            let vector = blob_to_vec(&blob);
            if Some(vector.len()) != file.dimension {
                return Err(RagError::IndexLoadFailure(format!(
                    "node {} has dimension {}, expected {:?}",
                    i,
                    vector.len(),
                    file.dimension
                )));
            }
            if n.neighbors.iter().flatten().any(|&nid| nid as usize >= docs.slots()) {
                return Err(RagError::IndexLoadFailure(format!("node {} has a dangling edge", i)));
            }
            nodes.push(Node {
                vector,
                neighbors: n.neighbors,
            });
        }
        if file.entry_point.is_some_and(|ep| ep as usize >= nodes.len()) {
            return Err(RagError::IndexLoadFailure("entry point out of range".to_string()));
        }

        let mut store = HnswStore::new(IndexParams {
            metric: file.metric,
            m: file.m,
            ef_construction: file.ef_construction,
            ..params
        });
        store.docs = docs;
        store.nodes = nodes;
        store.entry_point = file.entry_point;
        store.level_max = file.level_max;
        store.dimension = file.dimension;
        store.rng_state = file.rng_state;
        Ok(store)
    }
}

#[derive(Serialize, Deserialize)]
struct GraphFile {
    metric: Metric,
    m: usize,
    ef_construction: usize,
    dimension: Option<usize>,
    entry_point: Option<u32>,
    level_max: u8,
    rng_state: u64,
    nodes: Vec<NodeFile>,
}

#[derive(Serialize, Deserialize)]
struct NodeFile {
    /// Base64 of little-endian `f32` bytes.
    vector: String,
    neighbors: Vec<Vec<u32>>,
}
