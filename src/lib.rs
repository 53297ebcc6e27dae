//! Persistent memory for AI agents.
//!
//! Rhizome stores text memories in SQLite, splits long content into a chunk
//! tree, and retrieves it by keyword, tag, date, embedding similarity, or a
//! fusion of keyword and semantic scores. Memories can be linked by typed,
//! directed relationships and walked as a graph.
//!
//! Embedding, vector search, and chat completion are optional. Each is probed
//! for availability and every component degrades to its non-AI behaviour when
//! a capability is missing, slow, or failing.
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) with an FTS5 index kept in sync inside each write
//! - **Embeddings and chat**: an Ollama-compatible HTTP service
//! - **Vectors**: sqlite-vec in a side database, or a Qdrant collection
//! - **Search**: keyword (BM25), semantic, tags, date range, and weighted hybrid
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: connection handling, schema, migrations, health checks
//! - [`ai`]: capability traits, HTTP backends, availability tracking
//! - [`memory`]: chunking, sessions, the store, categories and domains,
//!   retrieval, and the graph

pub mod ai;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;

use std::sync::Arc;

pub use ai::{AiServices, AiStatus};
pub use config::RhizomeConfig;
pub use db::Database;
pub use error::{MemoryError, Result};
pub use memory::relations::RelationshipGraph;
pub use memory::search::RetrievalEngine;
pub use memory::store::MemoryStore;

use memory::chunker::Chunker;
use memory::session::SessionDetector;
use memory::types::TagMatch;

/// One engine instance: a database, its AI services, and the components
/// built over them. Cheap to share behind an `Arc`.
pub struct Rhizome {
    config: RhizomeConfig,
    db: Database,
    ai: Arc<AiServices>,
    store: MemoryStore,
    search: RetrievalEngine,
    graph: RelationshipGraph,
}

impl Rhizome {
    /// Open the configured database and build AI services from configuration.
    pub fn open(config: RhizomeConfig) -> Result<Self> {
        let path = config.resolved_db_path();
        let db = Database::open(&path, config.storage.reader_connections)?;
        let ai = Arc::new(AiServices::from_config(&config));
        tracing::info!(path = %path.display(), "rhizome opened");
        Ok(Self::with_parts(config, db, ai))
    }

    /// Assemble an engine from an existing database and AI services.
    pub fn with_parts(config: RhizomeConfig, db: Database, ai: Arc<AiServices>) -> Self {
        let tag_match: TagMatch = config.retrieval.tag_match.parse().unwrap_or_default();
        let session = Arc::new(SessionDetector::from_config(&config.session));
        let store = MemoryStore::new(
            db.clone(),
            Arc::clone(&ai),
            Chunker::new(&config.chunking),
            session,
        )
        .with_tag_match(tag_match);
        let search = RetrievalEngine::new(db.clone(), Arc::clone(&ai), &config.retrieval);
        let graph = RelationshipGraph::new(db.clone(), Arc::clone(&ai), &config.graph);

        Self {
            config,
            db,
            ai,
            store,
            search,
            graph,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn search(&self) -> &RetrievalEngine {
        &self.search
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn ai(&self) -> &Arc<AiServices> {
        &self.ai
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &RhizomeConfig {
        &self.config
    }

    /// Probe every AI capability and report enabled/available/model.
    pub async fn status(&self) -> AiStatus {
        self.ai.refresh_status().await
    }
}
