//! # convo-reflect
//!
//! An incremental indexer and semantic search service for local chat
//! transcripts: watches a tree of JSONL conversation logs, chunks and
//! embeds them, and serves time-decayed semantic search over the result via
//! a CLI and an HTTP surface.
//!
//! ## Architecture
//!
//! ```text
//! Watcher (scan/classify/queue) → Chunk + Embed → Qdrant → Resolver → Search → CLI / HTTP
//! ```
//!
//! ## Modules
//!
//! - [`config`] — environment-driven configuration, no config file
//! - [`models`] — core data types: `Chunk`, `Point`
//! - [`project`] — project-name normalization and hashing
//! - [`transcript`] — streaming JSONL transcript parser
//! - [`metadata`] — tool-call metadata and concept extraction
//! - [`chunk`] — boundary-seeking sliding-window text chunker
//! - [`embedding`] — embedding provider trait, local and Voyage backends
//! - [`vector_store`] — Qdrant collection lifecycle, upsert, search
//! - [`state`] — crash-safe JSON watcher state
//! - [`freshness`] — hot/warm/cold file classification and queueing
//! - [`resource`] — memory and CPU pressure monitoring
//! - [`watcher`] — the incremental scan-classify-embed-upsert loop
//! - [`resolver`] — project-string to collection-name resolution
//! - [`search`] — `reflect_on_past` and the other search operations
//! - [`reflection`] — `store_reflection`
//! - [`status`] — `get_status`
//! - [`server`] — HTTP bindings for the tool-protocol surface (Axum)

mod chunk;
mod config;
mod embedding;
mod error;
mod freshness;
mod metadata;
mod models;
mod project;
mod reflection;
mod resolver;
mod resource;
mod search;
mod server;
mod state;
mod status;
mod transcript;
mod vector_store;
mod watcher;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Config;
use embedding::{local::LocalProvider, voyage::VoyageProvider, EmbeddingProvider};
use resolver::Resolver;
use search::{DecayMode, ResponseFormat, SearchEngine, SearchRequest};
use vector_store::VectorStore;

#[derive(Parser)]
#[command(
    name = "creflect",
    about = "convo-reflect — incremental conversation indexer and semantic search",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the incremental indexer until interrupted.
    Watch {
        /// Use the legacy paragraph chunker instead of the sliding-window
        /// chunker, for older-format transcripts it handles poorly.
        #[arg(long)]
        legacy_chunking: bool,
    },

    /// Run a single scan/classify/embed cycle and exit.
    Sync {
        /// Use the legacy paragraph chunker instead of the sliding-window
        /// chunker, for older-format transcripts it handles poorly.
        #[arg(long)]
        legacy_chunking: bool,
    },

    /// Semantic search over indexed conversations (`reflect_on_past`).
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long, default_value_t = 0.0)]
        min_score: f32,

        /// Decay mode: off, client, or server. Defaults to the configured decay settings.
        #[arg(long)]
        decay: Option<String>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value = "xml")]
        format: String,

        #[arg(long)]
        brief: bool,

        /// Include each hit's raw stored payload in the response.
        #[arg(long)]
        include_raw: bool,
    },

    /// Search conversations that touched a file.
    SearchByFile {
        path: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        project: Option<String>,
    },

    /// Search conversations tagged with a concept.
    SearchByConcept {
        concept: String,

        #[arg(long)]
        include_files: bool,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        project: Option<String>,
    },

    /// Reassemble and print one conversation's full text.
    Get {
        conversation_id: String,

        #[arg(long)]
        project: Option<String>,
    },

    /// Save a free-form note as a searchable reflection.
    Reflect {
        content: String,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Print indexing progress and watcher liveness as JSON.
    Status,

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("convo_reflect=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Watch { legacy_chunking } => {
            let store = Arc::new(VectorStore::with_timeout(&config.qdrant_url, config.max_concurrent_qdrant, config.qdrant_timeout)?);
            let provider: Arc<dyn EmbeddingProvider> = Arc::from(embedding::create_provider(&config));
            let watcher = watcher::Watcher::with_chunking(Arc::new(config), store, provider, legacy_chunking);

            let (tx, rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = tx.send(true);
            });
            watcher.run(rx).await?;
        }

        Commands::Sync { legacy_chunking } => {
            let store = Arc::new(VectorStore::with_timeout(&config.qdrant_url, config.max_concurrent_qdrant, config.qdrant_timeout)?);
            let provider: Arc<dyn EmbeddingProvider> = Arc::from(embedding::create_provider(&config));
            let config = Arc::new(config);
            let watcher = watcher::Watcher::with_chunking(config.clone(), store, provider, legacy_chunking);

            let state_store = state::StateStore::new(config.state_file.clone());
            let mut state = state_store.load(&config.logs_dir).unwrap_or_default();
            let current_project = project::project_from_cwd().unwrap_or_default();
            let mut classifier =
                freshness::Classifier::new(config.hot_window_minutes, config.warm_window_hours, config.max_warm_wait_minutes, current_project);
            let mut queue = freshness::Queue::new(config.max_queue_size);

            let processed = watcher.run_cycle(&mut state, &mut classifier, &mut queue).await;
            state_store.save(&state)?;
            println!("processed {processed} file(s)");
        }

        Commands::Search {
            query,
            limit,
            min_score,
            decay,
            project,
            format,
            brief,
            include_raw,
        } => {
            let engine = build_engines(&config)?;
            let decay = match decay.as_deref() {
                Some("off") => DecayMode::Off,
                Some("client") => DecayMode::Client,
                Some("server") => DecayMode::Server,
                Some(other) => anyhow::bail!("unknown decay mode: {other}"),
                None => default_decay_mode(&config),
            };
            let format = match format.as_str() {
                "xml" => ResponseFormat::Xml,
                "markdown" | "md" => ResponseFormat::Markdown,
                other => anyhow::bail!("unknown format: {other}"),
            };

            let req = SearchRequest {
                query,
                limit,
                min_score,
                decay,
                project,
                include_raw,
                format,
                brief,
            };
            let engine = engine.as_engine();
            println!("{}", engine.reflect_on_past(&req).await?);
        }

        Commands::SearchByFile { path, limit, project } => {
            let engine = build_engines(&config)?;
            println!("{}", engine.as_engine().search_by_file(&path, limit, project.as_deref()).await?);
        }

        Commands::SearchByConcept {
            concept,
            include_files,
            limit,
            project,
        } => {
            let engine = build_engines(&config)?;
            println!(
                "{}",
                engine
                    .as_engine()
                    .search_by_concept(&concept, include_files, limit, project.as_deref())
                    .await?
            );
        }

        Commands::Get { conversation_id, project } => {
            let engine = build_engines(&config)?;
            println!("{}", engine.as_engine().get_full_conversation(&conversation_id, project.as_deref()).await?);
        }

        Commands::Reflect { content, tags } => {
            let store = VectorStore::with_timeout(&config.qdrant_url, config.max_concurrent_qdrant, config.qdrant_timeout)?;
            let provider = embedding::create_provider(&config);
            let (collection, id) = reflection::store_reflection(&store, provider.as_ref(), &content, &tags).await?;
            println!("saved reflection {id} to {collection}");
        }

        Commands::Status => {
            let report = status::get_status(&config);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Serve => {
            server::run_server(config).await?;
        }
    }

    Ok(())
}

fn default_decay_mode(config: &Config) -> DecayMode {
    if !config.enable_memory_decay {
        DecayMode::Off
    } else if config.use_native_decay {
        DecayMode::Server
    } else {
        DecayMode::Client
    }
}

/// Owns the store, resolver, and both search-path embedding providers so a
/// `SearchEngine` borrowing from them can be built on demand; `SearchEngine`
/// itself only holds references and can't outlive this.
struct Engines {
    config: Config,
    store: VectorStore,
    resolver: Resolver,
    local_provider: Box<dyn EmbeddingProvider>,
    voyage_provider: Option<Box<dyn EmbeddingProvider>>,
}

impl Engines {
    fn as_engine(&self) -> SearchEngine<'_> {
        SearchEngine {
            config: &self.config,
            store: &self.store,
            resolver: &self.resolver,
            local_provider: self.local_provider.as_ref(),
            voyage_provider: self.voyage_provider.as_deref(),
        }
    }
}

fn build_engines(config: &Config) -> anyhow::Result<Engines> {
    let store = VectorStore::with_timeout(&config.qdrant_url, config.max_concurrent_qdrant, config.qdrant_timeout)?;
    let resolver = Resolver::new(Some(config.logs_dir.clone()));
    let local_provider: Box<dyn EmbeddingProvider> =
        Box::new(LocalProvider::new(&config.embedding_model, config.max_concurrent_embeddings)?);
    let voyage_provider: Option<Box<dyn EmbeddingProvider>> = config
        .voyage_api_key
        .clone()
        .map(|key| Box::new(VoyageProvider::new(key)) as Box<dyn EmbeddingProvider>);

    Ok(Engines {
        config: config.clone(),
        store,
        resolver,
        local_provider,
        voyage_provider,
    })
}
