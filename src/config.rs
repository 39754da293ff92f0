//! TOML configuration parsing and validation.
//!
//! Every section has defaults so an empty file is a valid configuration;
//! [`load_config`] rejects values that would make the pipeline misbehave.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    128
}
fn default_min_chunk_chars() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_embedding_model(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "bge-m3:567m".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_retries(),
        }
    }
}

fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_generation_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_refine_top_k")]
    pub refine_top_k: usize,
    #[serde(default = "default_divergent_top_k")]
    pub divergent_top_k: usize,
    #[serde(default = "default_divergent_num")]
    pub divergent_num: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            refine_top_k: default_refine_top_k(),
            divergent_top_k: default_divergent_top_k(),
            divergent_num: default_divergent_num(),
            similarity_threshold: default_similarity_threshold(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_refine_top_k() -> usize {
    10
}
fn default_divergent_top_k() -> usize {
    2
}
fn default_divergent_num() -> usize {
    3
}
fn default_similarity_threshold() -> f32 {
    0.4
}
fn default_history_capacity() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"hnsw"` or `"flat"`.
    #[serde(default = "default_index_kind")]
    pub kind: String,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// `"cosine"` or `"l2"`.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_index_kind(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            metric: default_metric(),
        }
    }
}

fn default_index_kind() -> String {
    "hnsw".to_string()
}
fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}
fn default_metric() -> String {
    "cosine".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// All-defaults configuration rooted at `data_dir`.
    pub fn minimal(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data: DataConfig {
                dir: data_dir.into(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            index: IndexConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// SQLite file backing the keyed storage.
    pub fn db_path(&self) -> PathBuf {
        self.data.dir.join("knowledge.sqlite")
    }

    /// Directory holding the persisted vector index.
    pub fn index_dir(&self) -> PathBuf {
        self.data.dir.join("KnowledgeVectorDB")
    }

    /// Directory holding uploaded file blobs.
    pub fn files_dir(&self) -> PathBuf {
        self.data.dir.join("files")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    if config.embedding.model.trim().is_empty() {
        anyhow::bail!("embedding.model must not be empty");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.retrieval.refine_top_k == 0 || config.retrieval.divergent_top_k == 0 {
        anyhow::bail!("retrieval top-k values must be >= 1");
    }
    if !(config.retrieval.similarity_threshold >= 0.0) {
        anyhow::bail!("retrieval.similarity_threshold must be >= 0.0");
    }
    if config.retrieval.history_capacity == 0 {
        anyhow::bail!("retrieval.history_capacity must be >= 1");
    }

    match config.index.kind.as_str() {
        "hnsw" | "flat" => {}
        other => anyhow::bail!("Unknown index kind: '{}'. Must be hnsw or flat.", other),
    }
    match config.index.metric.as_str() {
        "cosine" | "l2" => {}
        other => anyhow::bail!("Unknown index metric: '{}'. Must be cosine or l2.", other),
    }
    if config.index.m < 2 {
        anyhow::bail!("index.m must be >= 2");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.chunk_overlap, 128);
        assert_eq!(config.retrieval.divergent_num, 3);
        assert!((config.retrieval.similarity_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.embedding.model, "bge-m3:567m");
        assert_eq!(config.index.kind, "hnsw");
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config: Config = toml::from_str("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_index_kind_rejected() {
        let config: Config = toml::from_str("[index]\nkind = \"ivf\"\n").unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("ivf"));
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = Config::minimal("/tmp/kh");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/kh/knowledge.sqlite"));
        assert_eq!(config.index_dir(), PathBuf::from("/tmp/kh/KnowledgeVectorDB"));
        assert_eq!(config.files_dir(), PathBuf::from("/tmp/kh/files"));
    }
}
