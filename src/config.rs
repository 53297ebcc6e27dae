use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RhizomeConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub vector: VectorConfig,
    pub chat: ChatConfig,
    pub ai: AiConfig,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Read-only connections opened next to the single writer.
    pub reader_connections: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// `git-directory`, `manual`, or `hash`.
    pub strategy: String,
    pub manual_id: Option<String>,
    pub hash_inputs: Vec<String>,
    pub prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size_threshold: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub cache_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorConfig {
    pub enabled: bool,
    /// `sqlite-vec` (stored next to the memory database) or `qdrant`.
    pub backend: String,
    pub url: String,
    pub collection: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    pub call_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub status_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub branch_timeout_ms: u64,
    /// `any` (intersection) or `all` (containment).
    pub tag_match: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub default_depth: usize,
    pub max_depth: usize,
    pub discovery_threshold: f64,
    pub discovery_workers: usize,
    pub discovery_candidates: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_rhizome_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            reader_connections: 4,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strategy: "git-directory".into(),
            manual_id: None,
            hash_inputs: Vec::new(),
            prefix: "daemon-".into(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            overlap: 100,
            min_chunk_size_threshold: 1500,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            dimensions: 768,
            cache_capacity: 1000,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: "sqlite-vec".into(),
            url: "http://localhost:6333".into(),
            collection: "rhizome-memories".into(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".into(),
            model: "qwen2.5:3b".into(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            probe_timeout_ms: 3_000,
            status_ttl_secs: 30,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            keyword_weight: 0.4,
            semantic_weight: 0.6,
            branch_timeout_ms: 5_000,
            tag_match: "any".into(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_depth: 2,
            max_depth: 5,
            discovery_threshold: 0.6,
            discovery_workers: 5,
            discovery_candidates: 50,
        }
    }
}

/// Returns `~/.rhizome/`, or `./.rhizome` when no home directory is known.
pub fn default_rhizome_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rhizome")
}

/// Returns the default config file path: `~/.rhizome/config.toml`
pub fn default_config_path() -> PathBuf {
    default_rhizome_dir().join("config.toml")
}

impl RhizomeConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, apply env var overrides, then validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            RhizomeConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// `RHIZOME_SESSION_ID` switches the session strategy to `manual`.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RHIZOME_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("RHIZOME_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("RHIZOME_SESSION_ID") {
            self.session.strategy = "manual".into();
            self.session.manual_id = Some(val);
        }
        if let Ok(val) = std::env::var("RHIZOME_OLLAMA_URL") {
            self.embedding.base_url = val.clone();
            self.chat.base_url = val;
        }
        if let Ok(val) = std::env::var("RHIZOME_QDRANT_URL") {
            self.vector.url = val;
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.max_chunk_size == 0 {
            bail!("chunking.max_chunk_size must be greater than zero");
        }
        if c.overlap >= c.max_chunk_size {
            bail!(
                "chunking.overlap ({}) must be smaller than max_chunk_size ({})",
                c.overlap,
                c.max_chunk_size
            );
        }

        match self.session.strategy.as_str() {
            "git-directory" | "manual" | "hash" => {}
            other => bail!("unknown session strategy: {other}"),
        }
        match self.vector.backend.as_str() {
            "sqlite-vec" | "qdrant" => {}
            other => bail!("unknown vector backend: {other}. Supported: sqlite-vec, qdrant"),
        }
        if self.embedding.dimensions == 0 {
            bail!("embedding.dimensions must be greater than zero");
        }

        let r = &self.retrieval;
        for (name, w) in [("keyword_weight", r.keyword_weight), ("semantic_weight", r.semantic_weight)] {
            if !(0.0..=1.0).contains(&w) {
                bail!("retrieval.{name} must be within [0, 1], got {w}");
            }
        }
        if r.keyword_weight + r.semantic_weight == 0.0 {
            bail!("retrieval weights cannot both be zero");
        }
        match r.tag_match.as_str() {
            "any" | "all" => {}
            other => bail!("unknown retrieval.tag_match: {other}. Supported: any, all"),
        }

        let g = &self.graph;
        if !(0.0..=1.0).contains(&g.discovery_threshold) {
            bail!("graph.discovery_threshold must be within [0, 1]");
        }
        if g.discovery_workers == 0 {
            bail!("graph.discovery_workers must be at least 1");
        }
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RhizomeConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.chunking.max_chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 100);
        assert_eq!(config.chunking.min_chunk_size_threshold, 1500);
        assert_eq!(config.session.strategy, "git-directory");
        assert_eq!(config.vector.backend, "sqlite-vec");
        assert!(config.storage.db_path.ends_with("memory.db"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[logging]
level = "debug"

[storage]
db_path = "/tmp/test.db"

[vector]
backend = "qdrant"
collection = "agents"

[retrieval]
default_limit = 25
tag_match = "all"
"#;
        let config: RhizomeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.vector.backend, "qdrant");
        assert_eq!(config.vector.collection, "agents");
        assert_eq!(config.retrieval.default_limit, 25);
        assert_eq!(config.retrieval.tag_match, "all");
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.keyword_weight, 0.4);
        assert_eq!(config.embedding.model, "nomic-embed-text");
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut config = RhizomeConfig::default();
        config.chunking.overlap = 1000;
        assert!(config.validate().is_err());

        let mut config = RhizomeConfig::default();
        config.session.strategy = "random".into();
        assert!(config.validate().is_err());

        let mut config = RhizomeConfig::default();
        config.retrieval.keyword_weight = 0.0;
        config.retrieval.semantic_weight = 0.0;
        assert!(config.validate().is_err());

        let mut config = RhizomeConfig::default();
        config.graph.discovery_workers = 0;
        assert!(config.validate().is_err());

        let mut config = RhizomeConfig::default();
        config.vector.backend = "pinecone".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RhizomeConfig::default();
        std::env::set_var("RHIZOME_DB", "/tmp/override.db");
        std::env::set_var("RHIZOME_LOG_LEVEL", "trace");
        std::env::set_var("RHIZOME_SESSION_ID", "pinned");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.session.strategy, "manual");
        assert_eq!(config.session.manual_id.as_deref(), Some("pinned"));

        // Clean up
        std::env::remove_var("RHIZOME_DB");
        std::env::remove_var("RHIZOME_LOG_LEVEL");
        std::env::remove_var("RHIZOME_SESSION_ID");
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RhizomeConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retrieval.default_limit, 10);
    }
}
