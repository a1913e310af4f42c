//! # convo-reflect
//!
//! **An incremental indexer and semantic search service for local chat
//! transcripts.**
//!
//! convo-reflect watches a tree of JSONL conversation transcripts (the shape
//! Claude Code and similar tools write to disk), reconstructs each
//! conversation's tool-call metadata, chunks and embeds the result, and
//! exposes time-decayed semantic search over it via a CLI and an HTTP
//! surface modeled on Anthropic's tool-protocol conventions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐
//! │ Watcher  │──▶│ Chunk +   │──▶│ Qdrant   │   │ Resolver  │
//! │ scan/Q   │   │ Embed     │   │ (vector) │◀──│ (project) │
//! └──────────┘   └───────────┘   └────┬─────┘   └─────┬────┘
//!                                      │               │
//!                      ┌───────────────┴───────┐       │
//!                      ▼                       ▼       ▼
//!                ┌──────────┐           ┌──────────────────┐
//!                │   CLI    │           │   HTTP (server)   │
//!                └──────────┘           └──────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **watcher** ([`watcher`]) scans `logs_dir` for transcript files,
//!    classifies each by [`freshness`] (hot/warm/cold), and pulls a batch
//!    through its queue each cycle.
//! 2. Each file is streamed by [`transcript`], its tool calls summarized by
//!    [`metadata`], and the reconstructed text split into overlapping
//!    windows by [`chunk`].
//! 3. Chunks are embedded by the active [`embedding`] backend (local
//!    MiniLM or remote Voyage) and upserted into [`vector_store`] under a
//!    collection keyed by [`project`] hash and backend suffix.
//! 4. Progress is persisted crash-safely by [`state`]; [`resource`] throttles
//!    the loop under memory/CPU pressure.
//! 5. [`search`] answers `reflect_on_past`/`search_by_file`/
//!    `search_by_concept`/`get_full_conversation` queries, using
//!    [`resolver`] to map a project string onto the right collections, with
//!    optional exponential time decay.
//! 6. [`reflection`] lets a caller save a free-form note as a searchable
//!    point; [`status`] reports indexing progress.
//! 7. Both are exposed by the **CLI** (`creflect`) and the **HTTP server**
//!    ([`server`]).
//!
//! ## Quick Start
//!
//! ```bash
//! creflect watch                          # run the incremental indexer
//! creflect sync                           # run one scan/index cycle and exit
//! creflect search "how did we fix the retry bug" --project my-app
//! creflect reflect "remember to revisit the decay formula" --tag todo
//! creflect status
//! creflect serve                          # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration, no config file |
//! | [`error`] | Typed error kinds per boundary, converging on [`error::AppError`] |
//! | [`models`] | Core data types: `Chunk`, `Point` |
//! | [`project`] | Project-name normalization and hashing |
//! | [`transcript`] | Streaming JSONL transcript parser |
//! | [`metadata`] | Tool-call metadata and concept extraction |
//! | [`chunk`] | Boundary-seeking sliding-window text chunker |
//! | [`embedding`] | Embedding provider trait, local and Voyage backends |
//! | [`vector_store`] | Qdrant collection lifecycle, upsert, search |
//! | [`state`] | Crash-safe JSON watcher state |
//! | [`freshness`] | Hot/warm/cold file classification and queueing |
//! | [`resource`] | Memory and CPU pressure monitoring |
//! | [`watcher`] | The incremental scan-classify-embed-upsert loop |
//! | [`resolver`] | Project-string to collection-name resolution |
//! | [`search`] | `reflect_on_past` and the other search operations |
//! | [`reflection`] | `store_reflection` |
//! | [`status`] | `get_status` |
//! | [`server`] | HTTP bindings for the tool-protocol surface (Axum) |
//!
//! ## Configuration
//!
//! convo-reflect is configured entirely from the environment; see [`config`]
//! for every variable and its default.

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod freshness;
pub mod metadata;
pub mod models;
pub mod project;
pub mod reflection;
pub mod resolver;
pub mod resource;
pub mod search;
pub mod server;
pub mod state;
pub mod status;
pub mod transcript;
pub mod vector_store;
pub mod watcher;
