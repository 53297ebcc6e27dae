//! Session key derivation.
//!
//! A session groups memories written from the same project. The key is computed
//! once per [`SessionDetector`] and cached; later calls are free.

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::config::SessionConfig;

/// Caller-supplied session function for [`SessionStrategy::Hash`].
pub type SessionHasher = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

#[derive(Clone)]
pub enum SessionStrategy {
    /// Hash of the enclosing git repository root (or the working directory).
    GitDirectory,
    /// A fixed identifier. Blank or malformed values fall back to `GitDirectory`.
    Manual(String),
    /// A deterministic function over caller-provided inputs. An empty result
    /// falls back to `GitDirectory`.
    Hash {
        inputs: Vec<String>,
        hasher: SessionHasher,
    },
}

impl fmt::Debug for SessionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitDirectory => f.write_str("GitDirectory"),
            Self::Manual(id) => f.debug_tuple("Manual").field(id).finish(),
            Self::Hash { inputs, .. } => f.debug_struct("Hash").field("inputs", inputs).finish(),
        }
    }
}

impl SessionStrategy {
    /// Hash strategy using the built-in SHA-256 digest of the joined inputs.
    pub fn hashed(inputs: Vec<String>, prefix: &str) -> Self {
        let prefix = prefix.to_string();
        Self::Hash {
            inputs,
            hasher: Arc::new(move |inputs: &[String]| {
                if inputs.iter().all(|i| i.trim().is_empty()) {
                    return String::new();
                }
                format!("{prefix}{}", short_hash(&inputs.join("\n")))
            }),
        }
    }
}

#[derive(Debug)]
pub struct SessionDetector {
    strategy: SessionStrategy,
    prefix: String,
    working_dir: PathBuf,
    session_id: OnceLock<String>,
    agent_context: OnceLock<String>,
}

impl SessionDetector {
    pub fn new(strategy: SessionStrategy, prefix: impl Into<String>) -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            strategy,
            prefix: prefix.into(),
            working_dir,
            session_id: OnceLock::new(),
            agent_context: OnceLock::new(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        let strategy = match config.strategy.as_str() {
            "manual" => SessionStrategy::Manual(config.manual_id.clone().unwrap_or_default()),
            "hash" => SessionStrategy::hashed(config.hash_inputs.clone(), &config.prefix),
            _ => SessionStrategy::GitDirectory,
        };
        Self::new(strategy, config.prefix.clone())
    }

    /// Resolve from `dir` instead of the process working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// The session key. Computed on first call, cached afterwards.
    pub fn detect(&self) -> &str {
        self.session_id.get_or_init(|| {
            let id = self.compute();
            tracing::debug!(session_id = %id, strategy = ?self.strategy, "session detected");
            id
        })
    }

    /// `project:<repo dir name>` inside a git repository, else `cwd:<dir name>`.
    pub fn agent_context(&self) -> &str {
        self.agent_context.get_or_init(|| {
            let dir = self.absolute_working_dir();
            match find_git_root(&dir) {
                Some(root) => format!("project:{}", dir_name(&root)),
                None => format!("cwd:{}", dir_name(&dir)),
            }
        })
    }

    fn compute(&self) -> String {
        match &self.strategy {
            SessionStrategy::GitDirectory => self.from_git_directory(),
            SessionStrategy::Manual(id) => {
                if is_valid_manual_id(id) {
                    id.trim().to_string()
                } else {
                    tracing::warn!(manual_id = %id, "invalid manual session id, using git directory");
                    self.from_git_directory()
                }
            }
            SessionStrategy::Hash { inputs, hasher } => {
                let id = hasher(inputs.as_slice());
                if id.trim().is_empty() {
                    tracing::warn!("session hash produced an empty id, using git directory");
                    self.from_git_directory()
                } else {
                    id
                }
            }
        }
    }

    fn from_git_directory(&self) -> String {
        let dir = self.absolute_working_dir();
        let anchor = find_git_root(&dir).unwrap_or(dir);
        format!("{}{}", self.prefix, short_hash(&anchor.to_string_lossy()))
    }

    fn absolute_working_dir(&self) -> PathBuf {
        std::fs::canonicalize(&self.working_dir).unwrap_or_else(|_| self.working_dir.clone())
    }
}

/// Walk upward from `start` to the first directory holding a `.git` entry
/// (directory for normal clones, file for worktrees and submodules).
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// First 8 bytes of SHA-256, hex encoded (16 chars).
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Agent classification from the environment (`RHIZOME_AGENT_TYPE`), else `unknown`.
pub fn detect_agent_type() -> String {
    std::env::var("RHIZOME_AGENT_TYPE")
        .ok()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_valid_manual_id(id: &str) -> bool {
    let id = id.trim();
    !id.is_empty() && id.chars().count() <= 128 && !id.chars().any(char::is_control)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
