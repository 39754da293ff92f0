//! # Knowledge Harness CLI (`kh`)
//!
//! The `kh` binary drives the knowledge core from the command line: it
//! ingests documents, searches them, runs the agentic RAG pipeline for a
//! question, edits agent configs, and starts the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh init` | Create the data directory and keyed storage |
//! | `kh ingest <paths..>` | Chunk, filter, embed and index documents |
//! | `kh files list` | List knowledge files |
//! | `kh files enable/disable/delete <id>` | Manage one knowledge file |
//! | `kh search "<query>"` | Similarity search over enabled files |
//! | `kh ask "<question>"` | Run the RAG pipeline, optionally answering |
//! | `kh agents list/show/set/reset` | Inspect and edit agent configs |
//! | `kh index stats/compact` | Index maintenance |
//! | `kh models` | List models on the generation server |
//! | `kh serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! kh init
//! kh ingest ./docs --include "**/*.md"
//! kh search "insulin dosage" --top-k 5
//! kh ask "How is insulin dosed?" --thread t1 --answer
//! kh agents set relevance-judgement --enabled true
//! kh agents set answer-generation --file answer.json
//! kh serve
//! ```
//!
//! Logs go to stderr and are filtered with `RUST_LOG`
//! (default `knowledge_harness=info`). Results go to stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use knowledge_harness::agents::answer::AnswerInput;
use knowledge_harness::agents::{AgentKind, ConfigStore, PromptTemplate};
use knowledge_harness::app::App;
use knowledge_harness::config::{self, Config};
use knowledge_harness::ingest::{discover_files, IngestSource};
use knowledge_harness::ollama::OllamaClient;
use knowledge_harness::progress::{ProgressMode, ProgressSink};
use knowledge_harness::rag::build_final_prompt;
use knowledge_harness::server;

/// Knowledge Harness CLI, a local-first knowledge base with agent-driven
/// retrieval-augmented generation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kh",
    about = "Knowledge Harness: a local-first knowledge base with agent-driven RAG",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist, built-in defaults are used with the
    /// data directory given by `--data-dir`.
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    /// Data directory used when no config file is present.
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and keyed storage.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Ingest documents into the knowledge base.
    ///
    /// Directories are walked recursively and filtered by the include
    /// globs; files named explicitly are always ingested. A file that
    /// fails is rolled back and reported without affecting the others.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Glob selecting files inside directories (repeatable).
        #[arg(long)]
        include: Vec<String>,

        /// Progress reporting on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Manage knowledge files.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// Similarity search over enabled knowledge files.
    Search {
        /// Search query text.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Run the RAG pipeline for a question.
    ///
    /// Prints the retrieved knowledge and the final prompt; with
    /// `--answer`, streams the answer generation agent's reply instead.
    Ask {
        /// The question.
        question: String,

        /// Chat thread whose RAG results are cached.
        #[arg(long)]
        thread: Option<String>,

        /// Generate an answer from the retrieved knowledge.
        #[arg(long)]
        answer: bool,
    },

    /// Inspect and edit agent configs.
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// List models available on the generation server.
    Models,

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum FilesAction {
    /// List knowledge files.
    List,
    /// Include a file in retrieval.
    Enable { id: String },
    /// Exclude a file from retrieval without deleting it.
    Disable { id: String },
    /// Delete a file and all of its chunks.
    Delete { id: String },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// Show whether each agent is enabled and which model it uses.
    List,
    /// Print one agent's config as JSON.
    Show { kind: String },
    /// Change one agent's config.
    ///
    /// `--file` replaces the whole config with a JSON document; the other
    /// flags edit single fields of the current config.
    Set {
        kind: String,
        /// JSON file holding a complete agent config.
        #[arg(long, conflicts_with_all = ["enabled", "model", "template"])]
        file: Option<PathBuf>,
        /// Enable or disable the agent.
        #[arg(long)]
        enabled: Option<bool>,
        /// Model name.
        #[arg(long)]
        model: Option<String>,
        /// File holding a new prompt template.
        #[arg(long)]
        template: Option<PathBuf>,
    },
    /// Restore an agent's default config.
    Reset { kind: String },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Print index statistics as JSON.
    Stats,
    /// Rebuild the index without deleted chunks.
    Compact,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("knowledge_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_or_default(&cli.config, &cli.data_dir)?;

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&cfg.data.dir)
                .with_context(|| format!("Failed to create {}", cfg.data.dir.display()))?;
            App::open(cfg.clone()).await?;
            println!("Knowledge base initialized at {}.", cfg.data.dir.display());
        }
        Commands::Ingest {
            paths,
            include,
            progress,
        } => {
            run_ingest(cfg, &paths, &include, progress.map(Into::into)).await?;
        }
        Commands::Files { action } => run_files(cfg, action).await?,
        Commands::Search { query, top_k } => {
            let app = App::open(cfg).await?;
            let top_k = top_k.unwrap_or(app.config.retrieval.refine_top_k);
            let results = app.search.search(&query, top_k).await;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                println!("{}. [{:.4}] {}", i + 1, r.distance, r.chunk.metadata.source);
                println!("   {}", preview(&r.chunk.content, 160));
            }
        }
        Commands::Ask {
            question,
            thread,
            answer,
        } => run_ask(cfg, &question, thread.as_deref(), answer).await?,
        Commands::Agents { action } => run_agents(cfg, action).await?,
        Commands::Index { action } => {
            let app = App::open(cfg).await?;
            match action {
                IndexAction::Stats => {
                    let stats = app.kb.index.stats().await;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                IndexAction::Compact => {
                    let live = app.kb.index.compact().await?;
                    println!("Index compacted: {} live chunks.", live);
                }
            }
        }
        Commands::Models => {
            let client = OllamaClient::new(&cfg.embedding, &cfg.generation)?;
            for name in client.list_models().await? {
                println!("{}", name);
            }
        }
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

fn load_or_default(path: &Path, data_dir: &Path) -> Result<Config> {
    if path.exists() {
        return config::load_config(path);
    }
    warn!(config = %path.display(), "config file not found, using defaults");
    Ok(Config::minimal(data_dir))
}

async fn run_ingest(cfg: Config, paths: &[PathBuf], include: &[String], progress: Option<ProgressMode>) -> Result<()> {
    let files = discover_files(paths, include)?;
    if files.is_empty() {
        bail!("no ingestible files found");
    }
    let sources = files
        .iter()
        .map(|p| IngestSource::from_path(p).with_context(|| format!("Failed to read {}", p.display())))
        .collect::<Result<Vec<_>>>()?;

    let app = App::open(cfg).await?;
    let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
    let sink: Arc<dyn ProgressSink> = Arc::from(mode.sink());
    let report = app.pipeline(sink).ingest(sources).await;

    for file in &report.ingested {
        println!(
            "{}  {}  {} chunks ({} filtered out)",
            file.id, file.name, file.chunks, file.filtered_out
        );
    }
    for failure in &report.failed {
        eprintln!("failed: {} at {}: {}", failure.name, failure.stage, failure.error);
    }
    if !report.is_success() {
        bail!("{} file(s) could not be ingested", report.failed.len());
    }
    Ok(())
}

async fn run_files(cfg: Config, action: FilesAction) -> Result<()> {
    let app = App::open(cfg).await?;
    match action {
        FilesAction::List => {
            let list = app.kb.files.list().await?;
            if list.files.is_empty() {
                println!("No knowledge files.");
            }
            for f in list.files {
                let state = if f.enabled { "enabled " } else { "disabled" };
                println!("{}  {}  {:>9} B  {}  {}", f.id, state, f.size, f.created_at, f.name);
            }
        }
        FilesAction::Enable { id } => set_enabled(&app, &id, true).await?,
        FilesAction::Disable { id } => set_enabled(&app, &id, false).await?,
        FilesAction::Delete { id } => {
            if !app.kb.delete_file(&id).await? {
                bail!("no file with id {}", id);
            }
            println!("Deleted {}.", id);
        }
    }
    Ok(())
}

async fn set_enabled(app: &App, id: &str, enabled: bool) -> Result<()> {
    if !app.kb.files.set_enabled(id, enabled).await? {
        bail!("no file with id {}", id);
    }
    println!("{} {}.", if enabled { "Enabled" } else { "Disabled" }, id);
    Ok(())
}

async fn run_ask(cfg: Config, question: &str, thread: Option<&str>, answer: bool) -> Result<()> {
    let app = App::open(cfg).await?;
    let outcome = app.rag.run(thread, question, &[]).await;

    for r in &outcome.docs {
        eprintln!(
            "[{:.4}] {}  {}",
            r.distance,
            r.chunk.metadata.source,
            preview(&r.chunk.content, 100)
        );
    }
    if !outcome.questions.is_empty() {
        eprintln!("divergent questions: {}", outcome.questions.join(" | "));
    }

    if !answer {
        println!("{}", build_final_prompt(question, &outcome.context, None));
        return Ok(());
    }

    let config = app.configs.get(AgentKind::AnswerGeneration).await?;
    if !config.enabled {
        bail!("the answer generation agent is disabled");
    }
    let input = AnswerInput {
        question: question.to_string(),
        knowledge: outcome.docs,
    };
    let mut printed = 0;
    let mut stdout = std::io::stdout();
    let mut on_progress = |partial: &str| {
        if let Some(delta) = partial.get(printed..) {
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
            printed = partial.len();
        }
    };
    app.answer_agent().stream(&config, &input, &mut on_progress).await?;
    println!();
    Ok(())
}

async fn run_agents(cfg: Config, action: AgentsAction) -> Result<()> {
    let app = App::open(cfg).await?;
    match action {
        AgentsAction::List => {
            for kind in AgentKind::ALL {
                let c = app.configs.get(kind).await?;
                let state = if c.enabled { "on " } else { "off" };
                println!("{:<22} {}  {:<28} {}", kind.slug(), state, c.title(), c.model_config.name);
            }
        }
        AgentsAction::Show { kind } => {
            let kind: AgentKind = kind.parse()?;
            let c = app.configs.get(kind).await?;
            println!("{}", serde_json::to_string_pretty(&c)?);
        }
        AgentsAction::Set {
            kind,
            file,
            enabled,
            model,
            template,
        } => {
            let kind: AgentKind = kind.parse()?;
            let mut c = match file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("{} is not an agent config", path.display()))?
                }
                None => app.configs.get(kind).await?,
            };
            if let Some(enabled) = enabled {
                c.enabled = enabled;
            }
            if let Some(model) = model {
                c.model_config.name = model;
            }
            if let Some(path) = template {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                c.prompt_template = PromptTemplate::new(text);
            }
            app.configs.put(kind, &c).await?;
            println!("Updated {}.", kind.slug());
        }
        AgentsAction::Reset { kind } => {
            let kind: AgentKind = kind.parse()?;
            app.configs.reset(kind).await?;
            println!("Reset {} to defaults.", kind.slug());
        }
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut)
}
