//! Chunk records shared by every storage engine.
//!
//! Node ids are positions in the record list, so an engine's vectors and
//! the docstore line up by index. Deletion is a tombstone flag; ids are
//! only reassigned by compaction.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{read_json, write_json};
use crate::error::RagResult;
use crate::models::Chunk;

pub const DOCSTORE_FILE: &str = "docstore.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocEntry {
    chunk: Chunk,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DocStore {
    entries: Vec<DocEntry>,
    /// Live `(file_id, hash)` pairs.
    #[serde(skip)]
    keys: HashSet<(String, String)>,
}

impl DocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return its node id.
    pub fn push(&mut self, chunk: Chunk) -> u32 {
        self.keys.insert((chunk.file_id.clone(), chunk.hash.clone()));
        self.entries.push(DocEntry {
            chunk,
            deleted: false,
        });
        (self.entries.len() - 1) as u32
    }

    pub fn get(&self, id: u32) -> Option<&Chunk> {
        self.entries
            .get(id as usize)
            .filter(|e| !e.deleted)
            .map(|e| &e.chunk)
    }

    /// Live and, when a non-empty filter is given, owned by a listed file.
    pub fn admits(&self, id: u32, filter: Option<&HashSet<String>>) -> bool {
        match self.get(id) {
            None => false,
            Some(chunk) => match filter {
                Some(files) if !files.is_empty() => files.contains(&chunk.file_id),
                _ => true,
            },
        }
    }

    pub fn contains(&self, file_id: &str, hash: &str) -> bool {
        self.keys.contains(&(file_id.to_string(), hash.to_string()))
    }

    /// Tombstone every chunk of `file_id`; returns how many were live.
    pub fn remove_file(&mut self, file_id: &str) -> usize {
        let mut removed = 0;
        for entry in self.entries.iter_mut() {
            if !entry.deleted && entry.chunk.file_id == file_id {
                entry.deleted = true;
                removed += 1;
            }
        }
        self.keys.retain(|(f, _)| f != file_id);
        removed
    }

    /// Total records, tombstones included.
    pub fn slots(&self) -> usize {
        self.entries.len()
    }

    pub fn live_len(&self) -> usize {
        self.entries.iter().filter(|e| !e.deleted).count()
    }

    pub fn file_count(&self) -> usize {
        self.keys.iter().map(|(f, _)| f.as_str()).collect::<HashSet<_>>().len()
    }

    /// Live `(old id, chunk)` pairs in id order.
    pub fn live(&self) -> impl Iterator<Item = (u32, &Chunk)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .map(|(i, e)| (i as u32, &e.chunk))
    }

    pub fn save(&self, dir: &Path) -> RagResult<()> {
        write_json(&dir.join(DOCSTORE_FILE), self)
    }

    pub fn load(dir: &Path) -> RagResult<Self> {
        let mut store: DocStore = read_json(&dir.join(DOCSTORE_FILE))?;
        store.keys = store
            .entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| (e.chunk.file_id.clone(), e.chunk.hash.clone()))
            .collect();
        Ok(store)
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(DOCSTORE_FILE).is_file()
    }
}
