//! Knowledge search over the enabled files.
//!
//! [`KnowledgeSearch`] is what every retrieval agent uses to hit the
//! index. It never fails: a blank query, an empty file list, or any
//! embedding/index error all come back as an empty result, because a
//! failed lookup must not abort a chat turn.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::files::KnowledgeFiles;
use crate::index::KnowledgeIndex;
use crate::models::RetrievedChunk;

#[derive(Clone)]
pub struct KnowledgeSearch {
    index: Arc<KnowledgeIndex>,
    files: KnowledgeFiles,
    embedding_model: Option<String>,
}

impl KnowledgeSearch {
    pub fn new(index: Arc<KnowledgeIndex>, files: KnowledgeFiles) -> Self {
        Self {
            index,
            files,
            embedding_model: None,
        }
    }

    /// Query with `model` instead of the embedder's configured model.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn index(&self) -> &Arc<KnowledgeIndex> {
        &self.index
    }

    /// Up to `top_k` chunks of enabled files nearest to `query`, each
    /// tagged with the query that found it.
    pub async fn search(&self, query: &str, top_k: usize) -> Vec<RetrievedChunk> {
        if query.trim().is_empty() {
            return Vec::new();
        }

        let enabled = match self.files.enabled_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "could not read the knowledge file list");
                return Vec::new();
            }
        };
        if enabled.is_empty() {
            debug!("no enabled knowledge files");
            return Vec::new();
        }

        match self
            .index
            .query(query, top_k, Some(&enabled), self.embedding_model.as_deref())
            .await
        {
            Ok(results) => {
                debug!(query, top_k, results = results.len(), "knowledge search");
                tag_query(results, query)
            }
            Err(e) => {
                warn!(query, error = %e, "knowledge search failed");
                Vec::new()
            }
        }
    }
}

/// Stamp `metadata.dbquery` on each result.
pub fn tag_query(mut results: Vec<RetrievedChunk>, query: &str) -> Vec<RetrievedChunk> {
    for r in results.iter_mut() {
        r.chunk.metadata.dbquery = Some(query.to_string());
    }
    results
}

/// Append the results of `more` whose content is not already in `into`.
///
/// Returns how many were appended. Equality is on exact content.
pub fn merge_distinct(into: &mut Vec<RetrievedChunk>, more: Vec<RetrievedChunk>) -> usize {
    let mut seen: HashSet<String> = into.iter().map(|r| r.chunk.content.clone()).collect();
    let mut added = 0;
    for r in more {
        if seen.insert(r.chunk.content.clone()) {
            into.push(r);
            added += 1;
        }
    }
    added
}
