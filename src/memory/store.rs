//! Write path and record lifecycle.
//!
//! [`MemoryStore`] is the entry point for Store/Get/Update/Delete/List. Every
//! mutation runs in one transaction on the writer connection: the `memories`
//! rows, their FTS5 entries, the persisted embedding, and the audit log commit
//! together or not at all. AI work (embedding, vector indexing) happens
//! outside the transaction and never fails the write.
//!
//! Categories and domains are filed through the same handle; their SQL lives
//! in [`catalog`].
//!
//! The free functions below operate on a plain `&Connection` and are shared
//! with the retrieval engine and the relationship graph.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ai::{AiServices, VectorPayload};
use crate::db::{migrations, Database};
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory::catalog::{
    self, AutoCategorizeOptions, AutoCategorizeResult, Categorization, Category, Domain,
    DomainStats, NewCategory,
};
use crate::memory::chunker::{Chunk, Chunker};
use crate::memory::session::{detect_agent_type, SessionDetector};
use crate::memory::types::{
    ChunkLevel, ListOptions, Memory, MemoryFilter, MemoryUpdate, NewMemory, TagMatch,
};
use crate::memory::{
    bytes_to_embedding, embedding_to_bytes, format_timestamp, next_timestamp, now, parse_timestamp,
};

pub const DEFAULT_IMPORTANCE: u8 = 5;
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const DEFAULT_ACCESS_SCOPE: &str = "session";

/// Upper bound on bound parameters per `IN (...)` lookup.
const FETCH_BATCH: usize = 500;

// ── Public types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StoreResult {
    pub memory: Memory,
    /// Chunk rows written under the root (0 for unsplit content).
    pub chunk_count: usize,
    pub embedded: bool,
    pub vector_indexed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub id: String,
    pub chunks_removed: usize,
    pub relationships_removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub memories: u64,
    pub roots: u64,
    pub chunks: u64,
    pub embedded: u64,
    pub relationships: u64,
    pub auto_relationships: u64,
    pub sessions: u64,
    pub domains: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub memories: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

// ── MemoryStore ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
    ai: Arc<AiServices>,
    chunker: Chunker,
    session: Arc<SessionDetector>,
    default_tag_match: TagMatch,
}

impl MemoryStore {
    pub fn new(
        db: Database,
        ai: Arc<AiServices>,
        chunker: Chunker,
        session: Arc<SessionDetector>,
    ) -> Self {
        Self {
            db,
            ai,
            chunker,
            session,
            default_tag_match: TagMatch::Any,
        }
    }

    pub fn with_tag_match(mut self, mode: TagMatch) -> Self {
        self.default_tag_match = mode;
        self
    }

    /// Validate, chunk, embed (best effort), and persist a new memory.
    pub async fn store(&self, input: NewMemory) -> Result<StoreResult> {
        let content = validate_content(&input.content)?;
        let created = now();

        let session_id = input
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.session.detect().to_string());

        let mut root = Memory {
            id: uuid::Uuid::now_v7().to_string(),
            content,
            importance: clamp_importance(input.importance),
            tags: normalize_tags(&input.tags),
            session_id,
            domain: non_blank(input.domain),
            source: non_blank(input.source),
            agent_type: non_blank(input.agent_type).unwrap_or_else(detect_agent_type),
            agent_context: non_blank(input.agent_context)
                .or_else(|| Some(self.session.agent_context().to_string())),
            access_scope: non_blank(input.access_scope)
                .unwrap_or_else(|| DEFAULT_ACCESS_SCOPE.to_string()),
            embedding: None,
            parent_memory_id: None,
            chunk_level: ChunkLevel::Root,
            chunk_index: 0,
            created_at: created,
            updated_at: created,
        };

        let chunks = self.chunker.chunk(&root.content);
        root.embedding = self.try_embed(&root.content, &root.id).await;
        let model = self.embedding_model(root.embedding.is_some());

        let record = root.clone();
        let chunk_count = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let written = insert_tree(&tx, &record, &chunks)?;
                write_audit_log(
                    &tx,
                    "create",
                    &record.id,
                    Some(&serde_json::json!({
                        "chunks": written,
                        "embedded": record.embedding.is_some(),
                    })),
                )?;
                if let Some(model) = model {
                    migrations::record_embedding_model(&tx, &model)?;
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .storage("store memory", Some(&root.id))?;

        let vector_indexed = self.index_vector(&root).await;
        tracing::debug!(
            memory_id = %root.id,
            session_id = %root.session_id,
            chunks = chunk_count,
            embedded = root.embedding.is_some(),
            vector_indexed,
            "memory stored"
        );

        Ok(StoreResult {
            embedded: root.embedding.is_some(),
            memory: root,
            chunk_count,
            vector_indexed,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Memory> {
        let key = id.to_string();
        self.db
            .read(move |conn| fetch_memory(conn, &key))
            .await
            .storage("get memory", Some(id))?
            .ok_or_else(|| MemoryError::memory_not_found(id))
    }

    /// Apply the provided fields to a root memory. A content change re-chunks
    /// the record and replaces its embedding.
    pub async fn update(&self, id: &str, update: MemoryUpdate) -> Result<Memory> {
        let new_content = update.content.as_deref().map(validate_content).transpose()?;

        let current = self.get(id).await?;
        if !current.is_root() {
            return Err(MemoryError::validation(format!(
                "memory {id} is a chunk; update its root instead"
            )));
        }
        if update.is_empty() {
            return Ok(current);
        }

        let content_changed = new_content
            .as_ref()
            .is_some_and(|c| *c != current.content);
        let (chunks, embedding) = match (&new_content, content_changed) {
            (Some(content), true) => (
                Some(self.chunker.chunk(content)),
                self.try_embed(content, id).await,
            ),
            _ => (None, None),
        };
        let model = self.embedding_model(embedding.is_some());

        let key = id.to_string();
        let updated = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let updated = apply_update(&tx, &key, &update, new_content, chunks, embedding)?;
                if let Some(model) = model {
                    migrations::record_embedding_model(&tx, &model)?;
                }
                tx.commit()?;
                Ok(updated)
            })
            .await
            .storage("update memory", Some(id))?;

        if updated.embedding.is_some() {
            self.index_vector(&updated).await;
        } else if content_changed {
            self.remove_vector(id).await;
        }
        tracing::debug!(memory_id = %id, content_changed, "memory updated");
        Ok(updated)
    }

    /// Remove a root memory with its chunks and every relationship touching them.
    pub async fn delete(&self, id: &str) -> Result<DeleteResult> {
        let key = id.to_string();
        let result = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let result = delete_tree(&tx, &key)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .storage("delete memory", Some(id))?;

        self.remove_vector(id).await;
        tracing::debug!(
            memory_id = %id,
            chunks = result.chunks_removed,
            relationships = result.relationships_removed,
            "memory deleted"
        );
        Ok(result)
    }

    pub async fn list(&self, options: ListOptions) -> Result<Vec<Memory>> {
        validate_filter(&options.filter)?;
        let limit = options.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit == 0 {
            return Err(MemoryError::validation("limit must be greater than zero"));
        }
        let tag_match = self.default_tag_match;
        self.db
            .read(move |conn| list_memories(conn, &options, limit, tag_match))
            .await
            .storage("list memories", None)
    }

    /// Chunks under a root, paragraphs first, each followed by its slices.
    pub async fn chunks(&self, id: &str) -> Result<Vec<Memory>> {
        let root = self.get(id).await?;
        let key = root.id.clone();
        self.db
            .read(move |conn| fetch_subtree(conn, &key))
            .await
            .storage("list chunks", Some(id))
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.db
            .read(|conn| store_stats(conn))
            .await
            .storage("stats", None)
    }

    /// Sessions with their root memory count, most recently active first.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        self.db
            .read(|conn| list_sessions(conn))
            .await
            .storage("list sessions", None)
    }

    // ── Categories ──

    pub async fn create_category(&self, input: NewCategory) -> Result<Category> {
        let input = catalog::validate_category(input)?;
        let category = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let category = catalog::insert_category(&tx, &input, false)?;
                tx.commit()?;
                Ok(category)
            })
            .await
            .storage("create category", None)?;
        tracing::debug!(category_id = %category.id, name = %category.name, "category created");
        Ok(category)
    }

    /// Every category, ordered by name.
    pub async fn categories(&self) -> Result<Vec<Category>> {
        self.db
            .read(|conn| catalog::list_categories(conn))
            .await
            .storage("list categories", None)
    }

    /// File a root memory under a category. Repeating the call for the same
    /// pair replaces its confidence and reasoning.
    pub async fn categorize(
        &self,
        memory_id: &str,
        category_id: &str,
        confidence: f64,
        reasoning: Option<String>,
    ) -> Result<Categorization> {
        let confidence = catalog::validate_confidence(confidence, "confidence")?;
        let reasoning = non_blank(reasoning);
        let (memory, category) = (memory_id.to_string(), category_id.to_string());
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let assigned =
                    catalog::assign_category(&tx, &memory, &category, confidence, reasoning.as_deref())?;
                tx.commit()?;
                Ok(assigned)
            })
            .await
            .storage("categorize memory", Some(memory_id))
    }

    /// Categories a memory is filed under, most confident first.
    pub async fn memory_categories(&self, memory_id: &str) -> Result<Vec<Categorization>> {
        let memory = self.get(memory_id).await?;
        self.db
            .read(move |conn| catalog::categorizations_for(conn, &memory.id))
            .await
            .storage("list memory categories", Some(memory_id))
    }

    /// Ask the chat model for a category and store it when the confidence
    /// clears the threshold. Chat failures return a degraded result.
    pub async fn auto_categorize(
        &self,
        memory_id: &str,
        options: AutoCategorizeOptions,
    ) -> Result<AutoCategorizeResult> {
        if let Some(min) = options.min_confidence {
            catalog::validate_confidence(min, "min_confidence")?;
        }
        let memory = self.get(memory_id).await?;
        if !memory.is_root() {
            return Err(MemoryError::validation(format!(
                "memory {memory_id} is a chunk; categorize its root instead"
            )));
        }
        if !self.ai.chat_available().await {
            tracing::warn!(capability = "chat", memory_id = %memory_id, "categorization skipped");
            return Ok(AutoCategorizeResult {
                degraded: Some("chat model unavailable; memory not categorized".into()),
                ..AutoCategorizeResult::default()
            });
        }

        let known = self.categories().await?;
        let prompt = catalog::category_prompt(&memory.content, &known);
        let reply = match self.ai.complete(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(memory_id = %memory_id, error = %e, "categorization request failed");
                return Ok(AutoCategorizeResult {
                    degraded: Some("chat request failed; memory not categorized".into()),
                    ..AutoCategorizeResult::default()
                });
            }
        };
        let Some((name, confidence, reasoning)) = catalog::parse_category_reply(&reply) else {
            tracing::debug!(memory_id = %memory_id, "chat model proposed no category");
            return Ok(AutoCategorizeResult::default());
        };

        let existing = known.iter().find(|c| c.name.eq_ignore_ascii_case(&name));
        let threshold = options
            .min_confidence
            .or(existing.map(|c| c.confidence_threshold))
            .unwrap_or(catalog::DEFAULT_CONFIDENCE_THRESHOLD);
        let mut result = AutoCategorizeResult {
            suggested: Some(name.clone()),
            confidence: Some(confidence),
            ..AutoCategorizeResult::default()
        };
        if confidence < threshold || (existing.is_none() && !options.auto_create) {
            return Ok(result);
        }

        let key = memory.id.clone();
        let (assigned, created) = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let (category, created) = match catalog::category_by_name(&tx, &name)? {
                    Some(c) => (c, false),
                    None => (catalog::insert_category(&tx, &NewCategory::new(name), true)?, true),
                };
                let assigned =
                    catalog::assign_category(&tx, &key, &category.id, confidence, reasoning.as_deref())?;
                tx.commit()?;
                Ok((assigned, created))
            })
            .await
            .storage("categorize memory", Some(memory_id))?;
        tracing::debug!(
            memory_id = %memory_id,
            category = %assigned.category.name,
            confidence,
            created,
            "memory categorized"
        );
        result.categorization = Some(assigned);
        result.created_category = created;
        Ok(result)
    }

    // ── Domains ──

    /// Register a domain, or replace the description of a registered one.
    pub async fn register_domain(&self, name: &str, description: Option<String>) -> Result<Domain> {
        let name = catalog::validate_domain_name(name)?;
        let description = non_blank(description);
        let key = name.clone();
        let domain = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                catalog::register_domain(&tx, &key, description.as_deref())?;
                let domain = catalog::list_domains(&tx, Some(key.as_str()))?.into_iter().next();
                tx.commit()?;
                Ok(domain)
            })
            .await
            .storage("register domain", Some(name.as_str()))?;
        domain.ok_or_else(|| MemoryError::domain_not_found(name))
    }

    /// Registered and in-use domains with their statistics, ordered by name.
    pub async fn domains(&self) -> Result<Vec<Domain>> {
        self.db
            .read(|conn| catalog::list_domains(conn, None))
            .await
            .storage("list domains", None)
    }

    /// Statistics for one domain. Unknown names are `NotFound`.
    pub async fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        let name = catalog::validate_domain_name(name)?;
        let key = name.clone();
        self.db
            .read(move |conn| catalog::list_domains(conn, Some(key.as_str())))
            .await
            .storage("domain stats", Some(name.as_str()))?
            .into_iter()
            .next()
            .map(|d| d.stats)
            .ok_or_else(|| MemoryError::domain_not_found(name))
    }

    // ── AI helpers (never fail the caller) ──

    async fn try_embed(&self, content: &str, memory_id: &str) -> Option<Vec<f32>> {
        if !self.ai.embeddings_available().await {
            tracing::debug!(memory_id = %memory_id, "embeddings unavailable, storing without embedding");
            return None;
        }
        match self.ai.embed(content).await {
            Ok(vector) => Some(vector.to_vec()),
            Err(e) => {
                tracing::warn!(memory_id = %memory_id, error = %e, "embedding failed, storing without embedding");
                None
            }
        }
    }

    fn embedding_model(&self, embedded: bool) -> Option<String> {
        if embedded {
            self.ai.status().embedding.model
        } else {
            None
        }
    }

    async fn index_vector(&self, memory: &Memory) -> bool {
        let Some(embedding) = &memory.embedding else {
            return false;
        };
        if !self.ai.vectors_available().await {
            tracing::debug!(memory_id = %memory.id, "vector store unavailable, skipping index");
            return false;
        }
        let payload = VectorPayload {
            session_id: memory.session_id.clone(),
            domain: memory.domain.clone(),
            importance: memory.importance,
            created_at: format_timestamp(&memory.created_at),
        };
        match self.ai.index(&memory.id, embedding, &payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(memory_id = %memory.id, error = %e, "vector indexing failed");
                false
            }
        }
    }

    async fn remove_vector(&self, id: &str) {
        if !self.ai.vectors_available().await {
            return;
        }
        if let Err(e) = self.ai.remove_vectors(&[id.to_string()]).await {
            tracing::warn!(memory_id = %id, error = %e, "vector removal failed");
        }
    }
}

// ── Normalization ────────────────────────────────────────────────

/// Lower-case, trim, drop empties, and de-duplicate (first occurrence wins).
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Unset or below 1 becomes the default; above 10 becomes 10.
pub fn clamp_importance(importance: Option<i64>) -> u8 {
    match importance {
        Some(i) if i > 10 => 10,
        Some(i) if i >= 1 => i as u8,
        _ => DEFAULT_IMPORTANCE,
    }
}

fn validate_content(content: &str) -> Result<String> {
    if content.trim().is_empty() {
        return Err(MemoryError::validation("content must not be empty"));
    }
    Ok(content.to_string())
}

pub(crate) fn validate_filter(filter: &MemoryFilter) -> Result<()> {
    if let (Some(after), Some(before)) = (filter.created_after, filter.created_before) {
        if after > before {
            return Err(MemoryError::validation(
                "created_after must not be later than created_before",
            ));
        }
    }
    if let (Some(min), Some(max)) = (filter.min_importance, filter.max_importance) {
        if min > max {
            return Err(MemoryError::validation(
                "min_importance must not exceed max_importance",
            ));
        }
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Row mapping ──────────────────────────────────────────────────

/// Column list matching [`row_to_memory`], for a `memories` row aliased `m`.
pub(crate) const MEMORY_COLUMNS: &str = "m.id, m.content, m.importance, m.tags, m.session_id, \
     m.domain, m.source, m.agent_type, m.agent_context, m.access_scope, m.embedding, \
     m.parent_memory_id, m.chunk_level, m.chunk_index, m.created_at, m.updated_at";

pub(crate) fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {raw}")))
}

pub(crate) fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    memory_at(row, 0)
}

/// Map [`MEMORY_COLUMNS`] starting at column `base`.
pub(crate) fn memory_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Memory> {
    let tags_json: String = row.get(base + 3)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| conversion_error(base + 3, format!("bad tags json: {e}")))?;
    let level: i64 = row.get(base + 12)?;
    let chunk_level = ChunkLevel::from_i64(level)
        .ok_or_else(|| conversion_error(base + 12, format!("bad chunk level: {level}")))?;
    let embedding: Option<Vec<u8>> = row.get(base + 10)?;
    let importance: i64 = row.get(base + 2)?;
    let chunk_index: i64 = row.get(base + 13)?;

    Ok(Memory {
        id: row.get(base)?,
        content: row.get(base + 1)?,
        importance: importance.clamp(1, 10) as u8,
        tags,
        session_id: row.get(base + 4)?,
        domain: row.get(base + 5)?,
        source: row.get(base + 6)?,
        agent_type: row.get(base + 7)?,
        agent_context: row.get(base + 8)?,
        access_scope: row.get(base + 9)?,
        embedding: embedding.map(|b| bytes_to_embedding(&b)),
        parent_memory_id: row.get(base + 11)?,
        chunk_level,
        chunk_index: chunk_index.max(0) as u32,
        created_at: timestamp_column(row, base + 14)?,
        updated_at: timestamp_column(row, base + 15)?,
    })
}

pub(crate) fn fetch_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_memory).optional()?)
}

/// Batch-fetch records by id. Missing ids are simply absent from the map.
pub(crate) fn fetch_memories(conn: &Connection, ids: &[String]) -> Result<HashMap<String, Memory>> {
    let mut out = HashMap::with_capacity(ids.len());
    for batch in ids.chunks(FETCH_BATCH) {
        let marks = vec!["?"; batch.len()].join(", ");
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id IN ({marks})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(batch.iter()), row_to_memory)?;
        for row in rows {
            let memory = row?;
            out.insert(memory.id.clone(), memory);
        }
    }
    Ok(out)
}

/// All chunks below `root_id`, in tree order.
fn fetch_subtree(conn: &Connection, root_id: &str) -> Result<Vec<Memory>> {
    let sql = format!(
        "WITH RECURSIVE tree(id, sort_key) AS (
             SELECT id, printf('%010d', chunk_index) FROM memories WHERE parent_memory_id = ?1
             UNION ALL
             SELECT c.id, tree.sort_key || '.' || printf('%010d', c.chunk_index)
             FROM memories c JOIN tree ON c.parent_memory_id = tree.id
         )
         SELECT {MEMORY_COLUMNS} FROM tree JOIN memories m ON m.id = tree.id
         ORDER BY tree.sort_key"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![root_id], row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn list_memories(
    conn: &Connection,
    options: &ListOptions,
    limit: usize,
    tag_match: TagMatch,
) -> Result<Vec<Memory>> {
    let mut params: Vec<Value> = Vec::new();
    let clauses = options.filter.sql_predicates("m", tag_match, &mut params);
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    params.push(Value::Integer(limit as i64));
    params.push(Value::Integer(options.offset as i64));

    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m {where_sql} ORDER BY {} LIMIT ? OFFSET ?",
        options.order.sql("m")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Write helpers ────────────────────────────────────────────────

/// Insert one row and its FTS entry. Returns the rowid.
fn insert_memory(tx: &Transaction, memory: &Memory) -> Result<i64> {
    let tags_json = serde_json::to_string(&memory.tags)?;
    tx.execute(
        "INSERT INTO memories (id, content, importance, tags, session_id, domain, source, \
         agent_type, agent_context, access_scope, embedding, parent_memory_id, chunk_level, \
         chunk_index, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            memory.id,
            memory.content,
            memory.importance as i64,
            tags_json,
            memory.session_id,
            memory.domain,
            memory.source,
            memory.agent_type,
            memory.agent_context,
            memory.access_scope,
            memory.embedding.as_deref().map(embedding_to_bytes),
            memory.parent_memory_id,
            memory.chunk_level.as_i64(),
            memory.chunk_index as i64,
            format_timestamp(&memory.created_at),
            format_timestamp(&memory.updated_at),
        ],
    )?;
    let rowid = tx.last_insert_rowid();
    insert_fts(tx, rowid, &memory.content, &tags_json)?;
    Ok(rowid)
}

/// Must use the same rowid as the corresponding `memories` row.
fn insert_fts(tx: &Transaction, rowid: i64, content: &str, tags_json: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO memories_fts (rowid, content, tags) VALUES (?1, ?2, ?3)",
        params![rowid, content, tags_json],
    )?;
    Ok(())
}

/// External-content FTS5 deletes need the values that were indexed.
fn delete_fts(tx: &Transaction, rowid: i64, content: &str, tags_json: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO memories_fts (memories_fts, rowid, content, tags) VALUES ('delete', ?1, ?2, ?3)",
        params![rowid, content, tags_json],
    )?;
    Ok(())
}

/// A chunk row inheriting its root's classification.
fn chunk_record(root: &Memory, chunk: &Chunk, parent_id: &str) -> Memory {
    Memory {
        id: uuid::Uuid::now_v7().to_string(),
        content: chunk.text.clone(),
        embedding: None,
        parent_memory_id: Some(parent_id.to_string()),
        chunk_level: chunk.level,
        chunk_index: chunk.index as u32,
        ..root.clone()
    }
}

/// Insert `root` and, when the content was split, every chunk below it.
/// Returns the number of chunk rows.
fn insert_tree(tx: &Transaction, root: &Memory, chunks: &[Chunk]) -> Result<usize> {
    insert_memory(tx, root)?;
    insert_chunks(tx, root, chunks)
}

fn insert_chunks(tx: &Transaction, root: &Memory, chunks: &[Chunk]) -> Result<usize> {
    let mut paragraph_ids: HashMap<usize, String> = HashMap::new();
    let mut written = 0;
    for chunk in chunks {
        let parent_id = match chunk.level {
            ChunkLevel::Root => continue,
            ChunkLevel::Paragraph => root.id.clone(),
            ChunkLevel::Atomic => chunk
                .parent
                .and_then(|p| paragraph_ids.get(&p).cloned())
                .ok_or_else(|| {
                    MemoryError::storage(
                        "insert chunk",
                        Some(&root.id),
                        format!("slice {} has no paragraph", chunk.index),
                    )
                })?,
        };
        let record = chunk_record(root, chunk, &parent_id);
        insert_memory(tx, &record)?;
        if chunk.level == ChunkLevel::Paragraph {
            paragraph_ids.insert(chunk.index, record.id);
        }
        written += 1;
    }
    Ok(written)
}

/// (rowid, id, content, tags) for every chunk below `root_id`.
fn subtree_rows(tx: &Transaction, root_id: &str) -> Result<Vec<(i64, String, String, String)>> {
    let mut stmt = tx.prepare(
        "WITH RECURSIVE tree(id) AS (
             SELECT id FROM memories WHERE parent_memory_id = ?1
             UNION ALL
             SELECT c.id FROM memories c JOIN tree ON c.parent_memory_id = tree.id
         )
         SELECT m.rowid, m.id, m.content, m.tags FROM memories m JOIN tree ON tree.id = m.id",
    )?;
    let rows = stmt
        .query_map(params![root_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn root_row(tx: &Transaction, id: &str) -> Result<(i64, Memory)> {
    let sql = format!("SELECT m.rowid, {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?1");
    let found = tx
        .query_row(&sql, params![id], |row| {
            let rowid: i64 = row.get(0)?;
            let memory = memory_at(row, 1)?;
            Ok((rowid, memory))
        })
        .optional()?;
    let (rowid, memory) = found.ok_or_else(|| MemoryError::memory_not_found(id))?;
    if !memory.is_root() {
        return Err(MemoryError::validation(format!(
            "memory {id} is a chunk; operate on its root instead"
        )));
    }
    Ok((rowid, memory))
}

fn apply_update(
    tx: &Transaction,
    id: &str,
    update: &MemoryUpdate,
    new_content: Option<String>,
    chunks: Option<Vec<Chunk>>,
    embedding: Option<Vec<f32>>,
) -> Result<Memory> {
    let (rowid, before) = root_row(tx, id)?;
    let before_tags = serde_json::to_string(&before.tags)?;

    let mut after = before.clone();
    let content_changed = new_content.as_ref().is_some_and(|c| *c != before.content);
    if let Some(content) = new_content {
        after.content = content;
    }
    if let Some(importance) = update.importance {
        after.importance = clamp_importance(Some(importance));
    }
    if let Some(tags) = &update.tags {
        after.tags = normalize_tags(tags);
    }
    if let Some(domain) = &update.domain {
        after.domain = non_blank(Some(domain.clone()));
    }
    if let Some(source) = &update.source {
        after.source = non_blank(Some(source.clone()));
    }
    if content_changed {
        after.embedding = embedding;
    }
    after.updated_at = next_timestamp(&before.updated_at);
    let after_tags = serde_json::to_string(&after.tags)?;

    tx.execute(
        "UPDATE memories SET content = ?1, importance = ?2, tags = ?3, domain = ?4, source = ?5, \
         embedding = ?6, updated_at = ?7 WHERE id = ?8",
        params![
            after.content,
            after.importance as i64,
            after_tags,
            after.domain,
            after.source,
            after.embedding.as_deref().map(embedding_to_bytes),
            format_timestamp(&after.updated_at),
            id,
        ],
    )?;
    delete_fts(tx, rowid, &before.content, &before_tags)?;
    insert_fts(tx, rowid, &after.content, &after_tags)?;

    let existing = subtree_rows(tx, id)?;
    let chunk_changes = if content_changed {
        // Rebuild the chunk tree from the new content.
        for (rowid, _, content, tags) in &existing {
            delete_fts(tx, *rowid, content, tags)?;
        }
        tx.execute("DELETE FROM memories WHERE parent_memory_id = ?1", params![id])?;
        match chunks {
            Some(chunks) => insert_chunks(tx, &after, &chunks)?,
            None => 0,
        }
    } else {
        for (rowid, chunk_id, content, tags) in &existing {
            delete_fts(tx, *rowid, content, tags)?;
            tx.execute(
                "UPDATE memories SET importance = ?1, tags = ?2, domain = ?3, source = ?4, \
                 updated_at = ?5 WHERE id = ?6",
                params![
                    after.importance as i64,
                    after_tags,
                    after.domain,
                    after.source,
                    format_timestamp(&after.updated_at),
                    chunk_id,
                ],
            )?;
            insert_fts(tx, *rowid, content, &after_tags)?;
        }
        existing.len()
    };

    let mut fields = Vec::new();
    if content_changed {
        fields.push("content");
    }
    if update.importance.is_some() {
        fields.push("importance");
    }
    if update.tags.is_some() {
        fields.push("tags");
    }
    if update.domain.is_some() {
        fields.push("domain");
    }
    if update.source.is_some() {
        fields.push("source");
    }
    write_audit_log(
        tx,
        "update",
        id,
        Some(&serde_json::json!({ "fields": fields, "chunks": chunk_changes })),
    )?;
    Ok(after)
}

fn delete_tree(tx: &Transaction, id: &str) -> Result<DeleteResult> {
    let (rowid, root) = root_row(tx, id)?;
    let chunks = subtree_rows(tx, id)?;

    let mut ids: Vec<String> = chunks.iter().map(|(_, id, _, _)| id.clone()).collect();
    ids.push(root.id.clone());
    let relationships_removed = count_relationships(tx, &ids)?;

    for (chunk_rowid, _, content, tags) in &chunks {
        delete_fts(tx, *chunk_rowid, content, tags)?;
    }
    delete_fts(tx, rowid, &root.content, &serde_json::to_string(&root.tags)?)?;

    // Chunks and relationships go with the root via ON DELETE CASCADE.
    tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    write_audit_log(
        tx,
        "delete",
        id,
        Some(&serde_json::json!({
            "chunks": chunks.len(),
            "relationships": relationships_removed,
        })),
    )?;

    Ok(DeleteResult {
        id: id.to_string(),
        chunks_removed: chunks.len(),
        relationships_removed,
    })
}

fn count_relationships(conn: &Connection, ids: &[String]) -> Result<usize> {
    let mut total = 0usize;
    for batch in ids.chunks(FETCH_BATCH / 2) {
        let marks = vec!["?"; batch.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM memory_relationships \
             WHERE source_memory_id IN ({marks}) OR target_memory_id IN ({marks})"
        );
        let params = batch.iter().chain(batch.iter());
        let n: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        total += n as usize;
    }
    Ok(total)
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = format_timestamp(&Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}

// ── Reporting ────────────────────────────────────────────────────

fn store_stats(conn: &Connection) -> Result<StoreStats> {
    let stats = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(chunk_level = 0), 0),
                COALESCE(SUM(chunk_level > 0), 0),
                COALESCE(SUM(embedding IS NOT NULL), 0),
                COUNT(DISTINCT session_id),
                COUNT(DISTINCT domain),
                MIN(created_at),
                MAX(created_at)
         FROM memories",
        [],
        |row| {
            let oldest: Option<String> = row.get(6)?;
            let newest: Option<String> = row.get(7)?;
            Ok(StoreStats {
                memories: row.get::<_, i64>(0)? as u64,
                roots: row.get::<_, i64>(1)? as u64,
                chunks: row.get::<_, i64>(2)? as u64,
                embedded: row.get::<_, i64>(3)? as u64,
                sessions: row.get::<_, i64>(4)? as u64,
                domains: row.get::<_, i64>(5)? as u64,
                oldest: oldest.as_deref().and_then(parse_timestamp),
                newest: newest.as_deref().and_then(parse_timestamp),
                ..StoreStats::default()
            })
        },
    )?;
    let (relationships, auto_relationships) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(auto_generated), 0) FROM memory_relationships",
        [],
        |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
    )?;
    Ok(StoreStats {
        relationships,
        auto_relationships,
        ..stats
    })
}

fn list_sessions(conn: &Connection) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, COUNT(*), MAX(updated_at) FROM memories
         WHERE chunk_level = 0
         GROUP BY session_id
         ORDER BY MAX(updated_at) DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let last: Option<String> = row.get(2)?;
            Ok(SessionSummary {
                session_id: row.get(0)?,
                memories: row.get::<_, i64>(1)? as u64,
                last_activity: last.as_deref().and_then(parse_timestamp),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
