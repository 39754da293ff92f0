//! # Knowledge Harness
//!
//! A local-first knowledge base with agent-driven retrieval-augmented
//! generation.
//!
//! Documents are uploaded, parsed, chunked, screened by a content filter
//! agent, embedded, and kept in a persisted vector index. At question
//! time a small pipeline of LLM agents refines the query, asks divergent
//! follow-up questions, and judges each retrieved chunk for relevance
//! before the surviving chunks become the knowledge context of the chat
//! prompt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐
//! │  Files   │──▶│ Parse+Chunk      │──▶│ Vector index │
//! │ registry │   │ Filter agent     │   │ HNSW / flat  │
//! └──────────┘   │ Embed            │   └──────┬───────┘
//!                └──────────────────┘          │
//!                        ┌─────────────────────┤
//!                        ▼                     ▼
//!                 ┌────────────┐        ┌────────────┐
//!                 │ Refine     │──────▶ │ Relevance  │──▶ context
//!                 │ Divergent  │        │ threshold  │
//!                 └────────────┘        └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`extract`] | Text extraction from PDF and DOCX |
//! | [`loader`] | Per-format loading into chunks |
//! | [`chunk`] | Recursive text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Text generation abstraction |
//! | [`ollama`] | Ollama client for both |
//! | [`index`] | Persisted vector index |
//! | [`files`] | File registry and knowledge file list |
//! | [`search`] | Retrieval over enabled files |
//! | [`agents`] | Agent framework and the five agents |
//! | [`ingest`] | Ingestion pipeline |
//! | [`rag`] | RAG orchestration and per-thread history |
//! | [`progress`] | Progress events and sinks |
//! | [`kv`] | Keyed storage |
//! | [`app`] | Process-wide wiring |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agents;
pub mod app;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod files;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod kv;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod ollama;
pub mod progress;
pub mod rag;
pub mod search;
pub mod server;
