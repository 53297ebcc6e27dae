//! Core record and filter types.
//!
//! [`Memory`] mirrors a row of the `memories` table, [`Relationship`] a row of
//! `memory_relationships`. [`MemoryFilter`] is shared by listing and every search
//! strategy so the same filter means the same thing everywhere.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Position of a record in its chunk tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkLevel {
    /// The whole content. Owns every chunk below it.
    Root,
    /// One paragraph of the root.
    Paragraph,
    /// An overlap-carrying slice of an oversized paragraph.
    Atomic,
}

impl ChunkLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Root => 0,
            Self::Paragraph => 1,
            Self::Atomic => 2,
        }
    }

    pub fn from_i64(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Root),
            1 => Some(Self::Paragraph),
            2 => Some(Self::Atomic),
            _ => None,
        }
    }
}

/// A stored memory: either a root or one of its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub content: String,
    /// Always within `[1, 10]`.
    pub importance: u8,
    /// Lower-cased, trimmed, de-duplicated.
    pub tags: Vec<String>,
    pub session_id: String,
    pub domain: Option<String>,
    pub source: Option<String>,
    pub agent_type: String,
    pub agent_context: Option<String>,
    pub access_scope: String,
    /// Present only when an embedding was generated for this record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Set only on chunks. Level-1 chunks point at the root, level-2 chunks at their paragraph.
    pub parent_memory_id: Option<String>,
    pub chunk_level: ChunkLevel,
    pub chunk_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn is_root(&self) -> bool {
        self.chunk_level == ChunkLevel::Root
    }
}

/// Input for [`MemoryStore::store`](crate::memory::store::MemoryStore::store).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewMemory {
    pub content: String,
    /// Clamped at write time. `None` means the default of 5.
    pub importance: Option<i64>,
    pub tags: Vec<String>,
    pub domain: Option<String>,
    pub source: Option<String>,
    /// Detected from the process context when absent.
    pub session_id: Option<String>,
    pub agent_type: Option<String>,
    pub agent_context: Option<String>,
    pub access_scope: Option<String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn importance(mut self, importance: i64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Partial update. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub importance: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub domain: Option<String>,
    pub source: Option<String>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance.is_none()
            && self.tags.is_none()
            && self.domain.is_none()
            && self.source.is_none()
    }
}

/// How requested tags are matched against a memory's tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    /// At least one requested tag is present.
    #[default]
    Any,
    /// Every requested tag is present.
    All,
}

impl std::str::FromStr for TagMatch {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            _ => Err(MemoryError::validation(format!("unknown tag match mode: {s}"))),
        }
    }
}

/// Filter dimensions shared by listing and search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryFilter {
    pub session_id: Option<String>,
    pub domain: Option<String>,
    pub tags: Vec<String>,
    pub tag_match: Option<TagMatch>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
    pub min_importance: Option<u8>,
    pub max_importance: Option<u8>,
    /// Return chunks as independent results instead of only roots.
    pub include_chunks: bool,
}

impl MemoryFilter {
    pub(crate) fn tag_mode(&self, default: TagMatch) -> TagMatch {
        self.tag_match.unwrap_or(default)
    }

    /// SQL predicates over the `memories` row aliased as `alias`. Bind values are
    /// appended to `params` in the order the predicates appear.
    pub(crate) fn sql_predicates(
        &self,
        alias: &str,
        default_tag_match: TagMatch,
        params: &mut Vec<Value>,
    ) -> Vec<String> {
        let mut clauses = Vec::new();

        if !self.include_chunks {
            clauses.push(format!("{alias}.chunk_level = 0"));
        }
        if let Some(session) = &self.session_id {
            clauses.push(format!("{alias}.session_id = ?"));
            params.push(Value::Text(session.clone()));
        }
        if let Some(domain) = &self.domain {
            clauses.push(format!("{alias}.domain = ?"));
            params.push(Value::Text(domain.clone()));
        }
        if let Some(after) = &self.created_after {
            clauses.push(format!("{alias}.created_at >= ?"));
            params.push(Value::Text(super::format_timestamp(after)));
        }
        if let Some(before) = &self.created_before {
            clauses.push(format!("{alias}.created_at <= ?"));
            params.push(Value::Text(super::format_timestamp(before)));
        }
        if let Some(min) = self.min_importance {
            clauses.push(format!("{alias}.importance >= ?"));
            params.push(Value::Integer(min as i64));
        }
        if let Some(max) = self.max_importance {
            clauses.push(format!("{alias}.importance <= ?"));
            params.push(Value::Integer(max as i64));
        }

        let tags = super::store::normalize_tags(&self.tags);
        if !tags.is_empty() {
            match self.tag_mode(default_tag_match) {
                TagMatch::Any => {
                    let marks = vec!["?"; tags.len()].join(", ");
                    clauses.push(format!(
                        "EXISTS (SELECT 1 FROM json_each({alias}.tags) WHERE json_each.value IN ({marks}))"
                    ));
                    params.extend(tags.into_iter().map(Value::Text));
                }
                TagMatch::All => {
                    for tag in tags {
                        clauses.push(format!(
                            "EXISTS (SELECT 1 FROM json_each({alias}.tags) WHERE json_each.value = ?)"
                        ));
                        params.push(Value::Text(tag));
                    }
                }
            }
        }

        clauses
    }

    /// In-memory equivalent of [`Self::sql_predicates`], for records that come
    /// back from the vector store.
    pub(crate) fn matches(&self, memory: &Memory, default_tag_match: TagMatch) -> bool {
        if !self.include_chunks && !memory.is_root() {
            return false;
        }
        if self.session_id.as_ref().is_some_and(|s| s != &memory.session_id) {
            return false;
        }
        if self.domain.is_some() && self.domain != memory.domain {
            return false;
        }
        if self.created_after.is_some_and(|t| memory.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| memory.created_at > t) {
            return false;
        }
        if self.min_importance.is_some_and(|m| memory.importance < m) {
            return false;
        }
        if self.max_importance.is_some_and(|m| memory.importance > m) {
            return false;
        }

        let tags = super::store::normalize_tags(&self.tags);
        if tags.is_empty() {
            return true;
        }
        match self.tag_mode(default_tag_match) {
            TagMatch::Any => tags.iter().any(|t| memory.tags.contains(t)),
            TagMatch::All => tags.iter().all(|t| memory.tags.contains(t)),
        }
    }
}

/// Sort order for [`ListOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    #[default]
    Newest,
    Oldest,
    Importance,
    RecentlyUpdated,
}

impl ListOrder {
    pub(crate) fn sql(self, alias: &str) -> String {
        match self {
            Self::Newest => format!("{alias}.created_at DESC, {alias}.updated_at DESC"),
            Self::Oldest => format!("{alias}.created_at ASC, {alias}.updated_at DESC"),
            Self::Importance => format!("{alias}.importance DESC, {alias}.updated_at DESC"),
            Self::RecentlyUpdated => format!("{alias}.updated_at DESC"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub filter: MemoryFilter,
    /// Defaults to 50.
    pub limit: Option<usize>,
    pub offset: usize,
    pub order: ListOrder,
}

/// The closed set of edge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    References,
    Contradicts,
    Expands,
    Similar,
    Sequential,
    Causes,
    Enables,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 7] = [
        Self::References,
        Self::Contradicts,
        Self::Expands,
        Self::Similar,
        Self::Sequential,
        Self::Causes,
        Self::Enables,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::References => "references",
            Self::Contradicts => "contradicts",
            Self::Expands => "expands",
            Self::Similar => "similar",
            Self::Sequential => "sequential",
            Self::Causes => "causes",
            Self::Enables => "enables",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| MemoryError::validation(format!("unknown relationship type: {s}")))
    }
}

/// A directed, typed edge between two memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub strength: f64,
    pub context: Option<String>,
    /// Created by relationship discovery rather than a caller.
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
