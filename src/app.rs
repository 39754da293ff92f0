//! Process-wide wiring.
//!
//! [`App`] owns the shared pieces (keyed storage, the knowledge index,
//! agent configs, the event bus) and hands out the pipelines built on
//! them. The CLI builds one per command; the server builds one at
//! startup and shares it across handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::agents::{
    AgentRunner, AnswerGenerationAgent, ConfigStore, ContentFilterAgent, DivergentThinkingAgent, KvConfigStore,
    QueryRefinementAgent, RelevanceJudgementAgent,
};
use crate::chunk::ChunkOptions;
use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::error::RagResult;
use crate::files::{KnowledgeBase, KnowledgeFiles, LocalFileRegistry};
use crate::generation::Generator;
use crate::index::{IndexParams, KnowledgeIndex};
use crate::ingest::IngestionPipeline;
use crate::kv::{KeyValueStore, SqliteKvStore};
use crate::migrate;
use crate::ollama::OllamaClient;
use crate::progress::{EventBus, ProgressSink};
use crate::rag::{RagHistory, RagOrchestrator, RagSettings};
use crate::search::KnowledgeSearch;

pub struct App {
    pub config: Config,
    pub kv: Arc<dyn KeyValueStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub runner: AgentRunner,
    pub kb: KnowledgeBase,
    pub search: KnowledgeSearch,
    pub generator: Arc<dyn Generator>,
    pub rag: Arc<RagOrchestrator>,
    pub history: RagHistory,
    pub events: EventBus,
}

impl App {
    /// Open the data directory with the configured model server.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config.db_path())
            .await
            .with_context(|| format!("Failed to open {}", config.db_path().display()))?;
        migrate::run_migrations(&pool).await?;

        let client = Arc::new(OllamaClient::new(&config.embedding, &config.generation)?);
        let app = Self::assemble(config, Arc::new(SqliteKvStore::new(pool)), client.clone(), client)?;
        Ok(app)
    }

    /// Wire the app from explicit collaborators.
    pub fn assemble(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> RagResult<Self> {
        let params = IndexParams::from_config(&config.index)?;
        let index = Arc::new(KnowledgeIndex::new(config.index_dir(), params, embedder));
        let files = KnowledgeFiles::new(kv.clone());
        let kb = KnowledgeBase::new(
            Arc::new(LocalFileRegistry::new(config.files_dir())),
            files.clone(),
            index.clone(),
        );
        let search = KnowledgeSearch::new(index, files);

        let configs: Arc<dyn ConfigStore> = Arc::new(KvConfigStore::new(kv.clone()));
        let runner = AgentRunner::new(configs.clone());
        let history = RagHistory::new(kv.clone(), config.retrieval.history_capacity);

        let rag = RagOrchestrator::new(
            runner.clone(),
            QueryRefinementAgent::new(generator.clone(), search.clone()),
            DivergentThinkingAgent::new(generator.clone(), search.clone()),
            RelevanceJudgementAgent::new(generator.clone()),
            RagSettings::from(&config.retrieval),
        )
        .with_history(history.clone());

        debug!(data_dir = %config.data.dir.display(), "app assembled");
        Ok(Self {
            config,
            kv,
            configs,
            runner,
            kb,
            search,
            generator,
            rag: Arc::new(rag),
            history,
            events: EventBus::default(),
        })
    }

    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            chunk_size: self.config.chunking.chunk_size,
            chunk_overlap: self.config.chunking.chunk_overlap,
            min_chunk_chars: self.config.chunking.min_chunk_chars,
        }
    }

    /// An ingestion pipeline reporting to `progress`.
    pub fn pipeline(&self, progress: Arc<dyn ProgressSink>) -> IngestionPipeline {
        IngestionPipeline::new(
            self.kb.clone(),
            self.runner.clone(),
            ContentFilterAgent::new(self.generator.clone()),
            self.chunk_options(),
            progress,
        )
    }

    pub fn answer_agent(&self) -> AnswerGenerationAgent {
        AnswerGenerationAgent::new(self.generator.clone())
    }
}
