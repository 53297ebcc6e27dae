//! Error taxonomy for rhizome operations.
//!
//! Callers see four categories. [`MemoryError::Validation`] and
//! [`MemoryError::NotFound`] are returned unchanged. [`MemoryError::Unavailable`]
//! exists so AI failures can be described, but components absorb it and return
//! a degraded result instead. [`MemoryError::Storage`] is the only fatal case.

use thiserror::Error;

use crate::ai::AiError;

/// Result type alias for rhizome operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("AI capability unavailable: {0}")]
    Unavailable(#[from] AiError),

    #[error("storage failure during {operation}{suffix}: {source}", suffix = fmt_id(.id))]
    Storage {
        operation: &'static str,
        id: Option<String>,
        #[source]
        source: BoxError,
    },
}

fn fmt_id(id: &Option<String>) -> String {
    match id {
        Some(id) => format!(" (id={id})"),
        None => String::new(),
    }
}

impl MemoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn memory_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "memory",
            id: id.into(),
        }
    }

    pub fn relationship_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "relationship",
            id: id.into(),
        }
    }

    pub fn category_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "category",
            id: id.into(),
        }
    }

    pub fn domain_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "domain",
            id: name.into(),
        }
    }

    pub fn storage(
        operation: &'static str,
        id: Option<&str>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Storage {
            operation,
            id: id.map(str::to_string),
            source: source.into(),
        }
    }

    /// True for errors the caller should treat as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    /// Attach an operation name and entity id to a storage error that was
    /// raised without one. Other variants pass through untouched.
    pub fn during(self, operation: &'static str, id: Option<&str>) -> Self {
        match self {
            Self::Storage {
                operation: "sqlite",
                id: None,
                source,
            } => Self::Storage {
                operation,
                id: id.map(str::to_string),
                source,
            },
            other => other,
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage("sqlite", None, err)
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage("serialize", None, err)
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::storage("blocking task", None, err)
    }
}

/// Adds operation context to fallible storage calls.
pub trait StorageContext<T> {
    fn storage(self, operation: &'static str, id: Option<&str>) -> Result<T>;
}

impl<T> StorageContext<T> for Result<T> {
    fn storage(self, operation: &'static str, id: Option<&str>) -> Result<T> {
        self.map_err(|e| e.during(operation, id))
    }
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, operation: &'static str, id: Option<&str>) -> Result<T> {
        self.map_err(|e| MemoryError::storage(operation, id, e))
    }
}
