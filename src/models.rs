//! Core data models used throughout the knowledge harness.
//!
//! These types represent the chunks, retrieval results, and knowledge file
//! records that flow through ingestion and retrieval.

use serde::{Deserialize, Serialize};

/// Line or page range a chunk was cut from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Location {
    /// 1-based inclusive line range within a text source.
    Lines { from: usize, to: usize },
    /// 1-based page number of a paginated source, plus lines within the page.
    Page {
        page: usize,
        from: usize,
        to: usize,
    },
}

/// Metadata carried by a chunk.
///
/// `dbquery` and `relevance` are only ever set on per-query copies; the
/// index never persists them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Original path or file name of the source document.
    pub source: String,
    pub loc: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbquery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<String>,
}

/// A unit of retrievable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub file_id: String,
    pub content: String,
    /// SHA-256 of `content`, used to merge re-ingested duplicates.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Returns a copy without the query-time metadata fields.
    pub fn persisted(&self) -> Chunk {
        let mut c = self.clone();
        c.metadata.dbquery = None;
        c.metadata.relevance = None;
        c
    }
}

/// A `(chunk, distance)` pair returned from retrieval. Lower distance is
/// more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub distance: f32,
}

impl RetrievedChunk {
    pub fn new(chunk: Chunk, distance: f32) -> Self {
        Self { chunk, distance }
    }
}

/// A document registered in the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeFileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// Whether the file's chunks participate in retrieval.
    pub enabled: bool,
}

/// The whole knowledge file list, read and written as one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFileList {
    pub files: Vec<KnowledgeFileRecord>,
}

/// One message of a chat thread, used as refinement context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: String,
    pub content: String,
}

impl ThreadMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}
