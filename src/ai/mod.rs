//! AI capability layer: embeddings, vector search, and chat completion.
//!
//! Each capability sits behind an async trait so backends can be swapped
//! (Ollama, Qdrant, sqlite-vec, or test doubles). [`AiServices`] bundles the
//! configured providers with a TTL-cached availability probe per capability
//! and an LRU cache of query embeddings. Components ask it whether a
//! capability is usable and fall back to non-AI behavior when it is not.

pub mod availability;
pub mod cache;
mod http;
pub mod ollama;
pub mod qdrant;
pub mod sqlite_vec;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::RhizomeConfig;
use availability::Availability;
pub use availability::CapabilityStatus;
pub use cache::CacheStats;
use cache::EmbeddingCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Embedding,
    VectorStore,
    Chat,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Embedding => "embedding",
            Self::VectorStore => "vector store",
            Self::Chat => "chat",
        })
    }
}

#[derive(Error, Debug, Clone)]
pub enum AiError {
    #[error("{0} is disabled")]
    Disabled(Capability),

    #[error("{capability} backend unreachable: {message}")]
    Unreachable {
        capability: Capability,
        message: String,
    },

    #[error("{capability} call timed out after {after:?}")]
    Timeout {
        capability: Capability,
        after: Duration,
    },

    #[error("model not installed: {model}")]
    ModelMissing { model: String },

    #[error("{capability} backend error: {message}")]
    Backend {
        capability: Capability,
        message: String,
    },
}

impl AiError {
    /// True when the backend as a whole is unusable, as opposed to one bad request.
    pub fn is_outage(&self) -> bool {
        !matches!(self, Self::Backend { .. })
    }

    pub(crate) fn backend(capability: Capability, message: impl fmt::Display) -> Self {
        Self::Backend {
            capability,
            message: message.to_string(),
        }
    }

    /// Classify a transport error from an HTTP backend.
    pub(crate) fn from_reqwest(capability: Capability, err: reqwest::Error, after: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout { capability, after }
        } else if err.is_connect() || err.is_request() {
            Self::Unreachable {
                capability,
                message: err.to_string(),
            }
        } else {
            Self::backend(capability, err)
        }
    }
}

pub type AiResult<T> = std::result::Result<T, AiError>;

// ── Provider traits ──────────────────────────────────────────────

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn generate(&self, text: &str) -> AiResult<Vec<f32>>;

    /// Succeeds with the model name when the backend can serve requests.
    async fn health(&self) -> AiResult<String>;
}

/// Metadata stored next to each vector so searches can be filtered server-side.
#[derive(Debug, Clone, Serialize)]
pub struct VectorPayload {
    pub session_id: String,
    pub domain: Option<String>,
    pub importance: u8,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub session_id: Option<String>,
    pub domain: Option<String>,
}

impl VectorFilter {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.domain.is_none()
    }

    pub fn matches(&self, payload: &VectorPayload) -> bool {
        self.session_id.as_ref().map_or(true, |s| *s == payload.session_id)
            && self
                .domain
                .as_ref()
                .map_or(true, |d| payload.domain.as_ref() == Some(d))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity in `[-1, 1]`, higher is closer.
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, id: &str, vector: &[f32], payload: &VectorPayload) -> AiResult<()>;

    /// Nearest neighbours at or above `min_score`, best first.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> AiResult<Vec<VectorMatch>>;

    async fn delete(&self, ids: &[String]) -> AiResult<()>;

    async fn health(&self) -> AiResult<String>;
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> AiResult<String>;

    async fn health(&self) -> AiResult<String>;
}

// ── Service bundle ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AiStatus {
    pub embedding: CapabilityStatus,
    pub vector_store: CapabilityStatus,
    pub chat: CapabilityStatus,
    pub embedding_cache: CacheStats,
}

pub struct AiServices {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    vectors: Option<Arc<dyn VectorStore>>,
    chat: Option<Arc<dyn ChatProvider>>,
    embedding_state: Availability,
    vector_state: Availability,
    chat_state: Availability,
    cache: EmbeddingCache,
    call_timeout: Duration,
}

pub struct AiServicesBuilder {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    vectors: Option<Arc<dyn VectorStore>>,
    chat: Option<Arc<dyn ChatProvider>>,
    cache_capacity: usize,
    call_timeout: Duration,
    probe_timeout: Duration,
    status_ttl: Duration,
}

impl Default for AiServicesBuilder {
    fn default() -> Self {
        Self {
            embedder: None,
            vectors: None,
            chat: None,
            cache_capacity: 1000,
            call_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            status_ttl: Duration::from_secs(30),
        }
    }
}

impl AiServicesBuilder {
    pub fn embedder(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(provider);
        self
    }

    pub fn vectors(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(store);
        self
    }

    pub fn chat(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.chat = Some(provider);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn build(self) -> AiServices {
        let state = |capability, enabled| {
            Availability::new(capability, enabled, self.status_ttl, self.probe_timeout)
        };
        AiServices {
            embedding_state: state(Capability::Embedding, self.embedder.is_some()),
            vector_state: state(Capability::VectorStore, self.vectors.is_some()),
            chat_state: state(Capability::Chat, self.chat.is_some()),
            embedder: self.embedder,
            vectors: self.vectors,
            chat: self.chat,
            cache: EmbeddingCache::new(self.cache_capacity),
            call_timeout: self.call_timeout,
        }
    }
}

impl AiServices {
    pub fn builder() -> AiServicesBuilder {
        AiServicesBuilder::default()
    }

    /// No providers at all: every component runs in its non-AI mode.
    pub fn disabled() -> Self {
        Self::builder().build()
    }

    /// Build the providers named by configuration. Never fails: a backend that
    /// cannot be constructed is logged and left disabled.
    pub fn from_config(config: &RhizomeConfig) -> Self {
        let ai = &config.ai;
        let mut builder = Self::builder()
            .cache_capacity(config.embedding.cache_capacity)
            .call_timeout(Duration::from_millis(ai.call_timeout_ms))
            .probe_timeout(Duration::from_millis(ai.probe_timeout_ms))
            .status_ttl(Duration::from_secs(ai.status_ttl_secs));

        if config.embedding.enabled {
            match ollama::OllamaClient::embeddings(&config.embedding.base_url, &config.embedding.model) {
                Ok(client) => builder = builder.embedder(Arc::new(client)),
                Err(e) => tracing::warn!(error = %e, "embedding provider disabled"),
            }
        }

        if config.vector.enabled {
            let store: Result<Arc<dyn VectorStore>, AiError> = match config.vector.backend.as_str() {
                "qdrant" => qdrant::QdrantStore::new(
                    &config.vector.url,
                    &config.vector.collection,
                    config.embedding.dimensions,
                )
                .map(|s| Arc::new(s) as Arc<dyn VectorStore>),
                _ => {
                    let path = config.resolved_db_path().with_extension("vec.db");
                    sqlite_vec::SqliteVecStore::open(&path, config.embedding.dimensions)
                        .map(|s| Arc::new(s) as Arc<dyn VectorStore>)
                }
            };
            match store {
                Ok(store) => builder = builder.vectors(store),
                Err(e) => tracing::warn!(
                    backend = %config.vector.backend,
                    error = %e,
                    "vector store disabled"
                ),
            }
        }

        if config.chat.enabled {
            match ollama::OllamaClient::chat(&config.chat.base_url, &config.chat.model) {
                Ok(client) => builder = builder.chat(Arc::new(client)),
                Err(e) => tracing::warn!(error = %e, "chat provider disabled"),
            }
        }

        builder.build()
    }

    // ── Availability ──

    pub async fn embeddings_available(&self) -> bool {
        match &self.embedder {
            Some(p) => self.embedding_state.check(|| p.health()).await,
            None => false,
        }
    }

    pub async fn vectors_available(&self) -> bool {
        match &self.vectors {
            Some(s) => self.vector_state.check(|| s.health()).await,
            None => false,
        }
    }

    /// Embeddings and vector search both usable.
    pub async fn semantic_available(&self) -> bool {
        let (embeddings, vectors) =
            tokio::join!(self.embeddings_available(), self.vectors_available());
        embeddings && vectors
    }

    pub async fn chat_available(&self) -> bool {
        match &self.chat {
            Some(p) => self.chat_state.check(|| p.health()).await,
            None => false,
        }
    }

    /// Cached view of every capability without probing.
    pub fn status(&self) -> AiStatus {
        AiStatus {
            embedding: self.embedding_state.snapshot(),
            vector_store: self.vector_state.snapshot(),
            chat: self.chat_state.snapshot(),
            embedding_cache: self.cache.stats(),
        }
    }

    /// Probe every enabled capability, then report.
    pub async fn refresh_status(&self) -> AiStatus {
        tokio::join!(
            self.embeddings_available(),
            self.vectors_available(),
            self.chat_available()
        );
        self.status()
    }

    // ── Calls ──

    /// Embed `text`, served from the cache when the same text was embedded before.
    pub async fn embed(&self, text: &str) -> AiResult<Arc<[f32]>> {
        let provider = self
            .embedder
            .as_ref()
            .ok_or(AiError::Disabled(Capability::Embedding))?;

        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }

        let vector: Arc<[f32]> = self
            .call(&self.embedding_state, provider.generate(text))
            .await?
            .into();
        if vector.is_empty() {
            return Err(AiError::backend(Capability::Embedding, "empty embedding"));
        }
        self.cache.insert(text, Arc::clone(&vector));
        Ok(vector)
    }

    pub async fn index(&self, id: &str, vector: &[f32], payload: &VectorPayload) -> AiResult<()> {
        let store = self.vector_store()?;
        self.call(&self.vector_state, store.upsert(id, vector, payload))
            .await
    }

    pub async fn search_vectors(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> AiResult<Vec<VectorMatch>> {
        let store = self.vector_store()?;
        self.call(&self.vector_state, store.search(vector, limit, min_score, filter))
            .await
    }

    pub async fn remove_vectors(&self, ids: &[String]) -> AiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let store = self.vector_store()?;
        self.call(&self.vector_state, store.delete(ids)).await
    }

    pub async fn complete(&self, prompt: &str) -> AiResult<String> {
        let provider = self.chat.as_ref().ok_or(AiError::Disabled(Capability::Chat))?;
        self.call(&self.chat_state, provider.complete(prompt)).await
    }

    fn vector_store(&self) -> AiResult<&Arc<dyn VectorStore>> {
        self.vectors
            .as_ref()
            .ok_or(AiError::Disabled(Capability::VectorStore))
    }

    /// Bound a provider call by the configured timeout and record outages so
    /// later availability checks fail fast.
    async fn call<T, Fut>(&self, state: &Availability, fut: Fut) -> AiResult<T>
    where
        Fut: Future<Output = AiResult<T>>,
    {
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(AiError::Timeout {
                capability: state.capability(),
                after: self.call_timeout,
            }),
        };
        if let Err(e) = &result {
            state.mark_failed(e);
        }
        result
    }

}

impl Default for AiServices {
    fn default() -> Self {
        Self::disabled()
    }
}
