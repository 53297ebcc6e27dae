#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rhizome::ai::{
    AiError, AiResult, AiServices, Capability, ChatProvider, EmbeddingProvider, VectorFilter,
    VectorMatch, VectorPayload, VectorStore,
};
use rhizome::memory::cosine_similarity;
use rhizome::{Database, Rhizome, RhizomeConfig};

pub const TEST_SESSION: &str = "test-session";
pub const TEST_DIMS: usize = 64;

/// Defaults with a pinned session, short AI timeouts, and no status caching
/// so switching a mock up or down takes effect on the next call.
pub fn test_config() -> RhizomeConfig {
    let mut config = RhizomeConfig::default();
    config.session.strategy = "manual".into();
    config.session.manual_id = Some(TEST_SESSION.into());
    config.embedding.dimensions = TEST_DIMS;
    config.ai.status_ttl_secs = 0;
    config.ai.call_timeout_ms = 2_000;
    config.retrieval.branch_timeout_ms = 500;
    config
}

/// Engine over a fresh in-memory database.
pub fn engine_with(config: RhizomeConfig, ai: AiServices) -> Rhizome {
    let db = Database::open_in_memory().unwrap();
    Rhizome::with_parts(config, db, Arc::new(ai))
}

/// Engine with no AI capabilities at all.
pub fn plain_engine() -> Rhizome {
    engine_with(test_config(), AiServices::disabled())
}

/// Mocks wired into one engine; keep the handles to flip them at runtime.
pub struct MockAi {
    pub embedder: Arc<HashEmbedder>,
    pub vectors: Arc<MemoryVectorStore>,
    pub chat: Option<Arc<ScriptedChat>>,
}

impl MockAi {
    pub fn new() -> Self {
        Self {
            embedder: Arc::new(HashEmbedder::new(TEST_DIMS)),
            vectors: Arc::new(MemoryVectorStore::default()),
            chat: None,
        }
    }

    pub fn with_chat(mut self, chat: ScriptedChat) -> Self {
        self.chat = Some(Arc::new(chat));
        self
    }

    pub fn services(&self) -> AiServices {
        let mut builder = AiServices::builder()
            .embedder(Arc::clone(&self.embedder) as Arc<dyn EmbeddingProvider>)
            .vectors(Arc::clone(&self.vectors) as Arc<dyn VectorStore>)
            .status_ttl(Duration::ZERO)
            .probe_timeout(Duration::from_millis(500))
            .call_timeout(Duration::from_secs(2));
        if let Some(chat) = &self.chat {
            builder = builder.chat(Arc::clone(chat) as Arc<dyn ChatProvider>);
        }
        builder.build()
    }

    pub fn engine(&self) -> Rhizome {
        engine_with(test_config(), self.services())
    }
}

// ── Embeddings ───────────────────────────────────────────────────

/// Deterministic bag-of-words embedder: each lowercase word is hashed into a
/// bucket, so texts sharing words point in similar directions.
pub struct HashEmbedder {
    dims: usize,
    down: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            down: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        embed_words(text, self.dims)
    }

    fn check(&self) -> AiResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AiError::Unreachable {
                capability: Capability::Embedding,
                message: "mock embedder is down".into(),
            });
        }
        Ok(())
    }
}

pub fn embed_words(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        // FNV-1a
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        v[(h % dims as u64) as usize] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn generate(&self, text: &str) -> AiResult<Vec<f32>> {
        self.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.vector(text))
    }

    async fn health(&self) -> AiResult<String> {
        self.check()?;
        Ok("hash-embedder".into())
    }
}

// ── Vectors ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryVectorStore {
    points: Mutex<HashMap<String, (Vec<f32>, VectorPayload)>>,
    down: AtomicBool,
}

impl MemoryVectorStore {
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.points.lock().contains_key(id)
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> AiResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AiError::Unreachable {
                capability: Capability::VectorStore,
                message: "mock vector store is down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, id: &str, vector: &[f32], payload: &VectorPayload) -> AiResult<()> {
        self.check()?;
        self.points
            .lock()
            .insert(id.to_string(), (vector.to_vec(), payload.clone()));
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> AiResult<Vec<VectorMatch>> {
        self.check()?;
        let mut matches: Vec<VectorMatch> = self
            .points
            .lock()
            .iter()
            .filter(|(_, (_, payload))| filter.matches(payload))
            .map(|(id, (v, _))| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(vector, v) as f32,
            })
            .filter(|m| m.score >= min_score)
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete(&self, ids: &[String]) -> AiResult<()> {
        self.check()?;
        let mut points = self.points.lock();
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn health(&self) -> AiResult<String> {
        self.check()?;
        Ok("memory".into())
    }
}

// ── Chat ─────────────────────────────────────────────────────────

type Script = Box<dyn Fn(&str) -> AiResult<String> + Send + Sync>;

/// Chat provider whose replies come from a closure over the prompt.
pub struct ScriptedChat {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedChat {
    pub fn new(script: impl Fn(&str) -> AiResult<String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Same reply for every prompt.
    pub fn always(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_| Ok(reply.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of completions that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn complete(&self, prompt: &str) -> AiResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(prompt)
    }

    async fn health(&self) -> AiResult<String> {
        Ok("scripted".into())
    }
}
