//! Offline collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use knowledge_harness::app::App;
use knowledge_harness::config::Config;
use knowledge_harness::embedding::Embedder;
use knowledge_harness::error::{RagError, RagResult};
use knowledge_harness::generation::{Generator, ModelConfig};
use knowledge_harness::ingest::IngestSource;
use knowledge_harness::kv::{KeyValueStore, MemoryKvStore};

/// Bag-of-words embedder: identical texts embed identically and texts
/// without shared words are (almost always) orthogonal.
pub struct HashingEmbedder;

impl HashingEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 128];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            let h = word.bytes().fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
            v[(h % 128) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Generator that answers by recognising which agent prompt it received.
pub struct PromptRouter {
    pub refine: Option<String>,
    pub divergent: Vec<String>,
    pub relevance: Box<dyn Fn(&str) -> String + Send + Sync>,
    pub filter: String,
    pub prompts: Mutex<Vec<String>>,
}

impl PromptRouter {
    pub fn new() -> Self {
        Self {
            refine: None,
            divergent: Vec::new(),
            relevance: Box::new(|_| "RELEVANT it answers the query".to_string()),
            filter: "Y".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn divergent_reply(&self) -> String {
        let asked = self
            .prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains("brand-new question"))
            .count();
        self.divergent
            .get(asked.saturating_sub(1))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for PromptRouter {
    async fn generate(&self, prompt: &str, _model: &ModelConfig) -> RagResult<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.contains("improved query") {
            return self
                .refine
                .clone()
                .ok_or_else(|| RagError::AgentInvocationFailure("refinement offline".to_string()));
        }
        if prompt.contains("brand-new question") {
            return Ok(self.divergent_reply());
        }
        if prompt.contains("helps answer") {
            let text = prompt.rsplit("Text:\n").next().unwrap_or_default();
            return Ok((self.relevance)(text));
        }
        Ok(self.filter.clone())
    }
}

pub struct Harness {
    pub app: App,
    pub kv: Arc<dyn KeyValueStore>,
    pub generator: Arc<PromptRouter>,
}

pub fn harness(data_dir: &Path, generator: PromptRouter) -> Harness {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    harness_with(data_dir, kv, generator)
}

pub fn harness_with(data_dir: &Path, kv: Arc<dyn KeyValueStore>, generator: PromptRouter) -> Harness {
    let generator = Arc::new(generator);
    let app = App::assemble(
        Config::minimal(data_dir),
        kv.clone(),
        Arc::new(HashingEmbedder),
        generator.clone(),
    )
    .unwrap();
    Harness { app, kv, generator }
}

pub fn source(name: &str, text: &str) -> IngestSource {
    IngestSource::new(name, text.as_bytes().to_vec())
}
