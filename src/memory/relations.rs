//! Typed, directed edges between memories.
//!
//! Edges are unique per `(source, target, type)`; creating one that already
//! exists updates its strength and context in place. Traversal is a
//! level-by-level breadth-first walk that loads each frontier in one query.
//! Discovery pre-filters candidate pairs by embedding similarity and only
//! then asks the chat model to classify them, a bounded number at a time.

use futures::stream::{self, StreamExt};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ai::AiServices;
use crate::config::GraphConfig;
use crate::db::Database;
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory::store::{
    conversion_error, fetch_memories, memory_at, row_to_memory, timestamp_column,
    write_audit_log, MEMORY_COLUMNS,
};
use crate::memory::types::{Memory, Relationship, RelationshipType};
use crate::memory::{cosine_similarity, format_timestamp, now};

pub const DEFAULT_STRENGTH: f64 = 0.5;
pub const DEFAULT_RELATED_LIMIT: usize = 10;

const RELATIONSHIP_COLUMNS: &str = "r.id, r.source_memory_id, r.target_memory_id, \
     r.relationship_type, r.strength, r.context, r.auto_generated, r.created_at, r.updated_at";

/// Ids bound per `IN (...)` list when loading a traversal frontier.
const FRONTIER_BATCH: usize = 250;

// ── Public types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRelationship {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub context: Option<String>,
}

fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

impl NewRelationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type,
            strength: DEFAULT_STRENGTH,
            context: None,
        }
    }

    pub fn strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResult {
    pub relationship: Relationship,
    /// The edge already existed and was updated.
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedMemory {
    pub memory: Memory,
    pub relationship: Relationship,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub memory: Memory,
    /// Hops from the traversal root along the shortest path.
    pub distance: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Relationship>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DiscoverOptions {
    pub limit: usize,
    /// Write accepted suggestions as auto-generated edges.
    pub persist: bool,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            persist: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipSuggestion {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub reasoning: Option<String>,
    /// Cosine similarity of the pair's embeddings.
    pub similarity: f64,
    /// Set once the suggestion has been written as an edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverResult {
    pub suggestions: Vec<RelationshipSuggestion>,
    /// Pairs that passed the similarity threshold.
    pub pairs_considered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    pub cancelled: bool,
}

// ── Graph ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RelationshipGraph {
    db: Database,
    ai: Arc<AiServices>,
    config: GraphConfig,
}

impl RelationshipGraph {
    pub fn new(db: Database, ai: Arc<AiServices>, config: &GraphConfig) -> Self {
        Self {
            db,
            ai,
            config: config.clone(),
        }
    }

    /// Create an edge, or update strength and context when the same
    /// `(source, target, type)` edge exists.
    pub async fn create(&self, input: NewRelationship) -> Result<CreateResult> {
        let input = validate_new(input)?;
        let source = input.source_id.clone();
        let result = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let result = upsert_relationship(&tx, &input, false)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .storage("create relationship", Some(&source))?;

        tracing::debug!(
            relationship_id = %result.relationship.id,
            source = %result.relationship.source_id,
            target = %result.relationship.target_id,
            kind = %result.relationship.relationship_type,
            existed = result.existed,
            "relationship saved"
        );
        Ok(result)
    }

    pub async fn remove(&self, id: &str) -> Result<Relationship> {
        let key = id.to_string();
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let Some(existing) = fetch_relationship(&tx, &key)? else {
                    return Err(MemoryError::relationship_not_found(&key));
                };
                tx.execute(
                    "DELETE FROM memory_relationships WHERE id = ?1",
                    params![key],
                )?;
                write_audit_log(
                    &tx,
                    "unrelate",
                    &existing.source_id,
                    Some(&serde_json::json!({
                        "relationship_id": existing.id,
                        "target_id": existing.target_id,
                        "type": existing.relationship_type.as_str(),
                    })),
                )?;
                tx.commit()?;
                Ok(existing)
            })
            .await
            .storage("remove relationship", Some(id))
    }

    /// Every edge touching `memory_id`, in either direction, strongest first.
    pub async fn for_memory(&self, memory_id: &str) -> Result<Vec<Relationship>> {
        let key = memory_id.to_string();
        self.db
            .read(move |conn| {
                require_memory(conn, &key)?;
                let sql = format!(
                    "SELECT {RELATIONSHIP_COLUMNS} FROM memory_relationships r
                     WHERE r.source_memory_id = ?1 OR r.target_memory_id = ?1
                     ORDER BY r.strength DESC, r.created_at ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key], row_to_relationship)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .storage("list relationships", Some(memory_id))
    }

    /// Memories one hop from `memory_id`, optionally restricted by edge type
    /// and minimum strength.
    pub async fn related(
        &self,
        memory_id: &str,
        relationship_type: Option<RelationshipType>,
        min_strength: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<RelatedMemory>> {
        let limit = limit.unwrap_or(DEFAULT_RELATED_LIMIT);
        if limit == 0 {
            return Err(MemoryError::validation("limit must be greater than zero"));
        }
        if let Some(s) = min_strength {
            validate_strength(s)?;
        }

        let key = memory_id.to_string();
        self.db
            .read(move |conn| {
                require_memory(conn, &key)?;
                let mut params: Vec<Value> = vec![Value::Text(key.clone())];
                let mut sql = format!(
                    "SELECT {RELATIONSHIP_COLUMNS}, {MEMORY_COLUMNS}
                     FROM memory_relationships r
                     JOIN memories m ON m.id = CASE
                         WHEN r.source_memory_id = ?1 THEN r.target_memory_id
                         ELSE r.source_memory_id END
                     WHERE (r.source_memory_id = ?1 OR r.target_memory_id = ?1)"
                );
                if let Some(t) = relationship_type {
                    params.push(Value::Text(t.as_str().to_string()));
                    sql.push_str(&format!(" AND r.relationship_type = ?{}", params.len()));
                }
                if let Some(s) = min_strength {
                    params.push(Value::Real(s));
                    sql.push_str(&format!(" AND r.strength >= ?{}", params.len()));
                }
                params.push(Value::Integer(limit as i64));
                sql.push_str(&format!(
                    " ORDER BY r.strength DESC, m.importance DESC LIMIT ?{}",
                    params.len()
                ));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(params), |row| {
                        Ok(RelatedMemory {
                            relationship: row_to_relationship(row)?,
                            memory: memory_after_relationship(row)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .storage("related memories", Some(memory_id))
    }

    /// Breadth-first walk from `root_id`, treating edges as undirected.
    /// `depth` defaults to the configured depth and is capped at the
    /// configured maximum. Depth 0 returns the root alone.
    pub async fn traverse(&self, root_id: &str, depth: Option<usize>) -> Result<Subgraph> {
        let depth = depth
            .unwrap_or(self.config.default_depth)
            .min(self.config.max_depth);
        let key = root_id.to_string();
        let graph = self
            .db
            .read(move |conn| walk(conn, &key, depth))
            .await
            .storage("traverse graph", Some(root_id))?;
        tracing::debug!(
            memory_id = %root_id,
            depth,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "graph traversed"
        );
        Ok(graph)
    }

    /// Suggest edges among recent memories. Pairs below the similarity
    /// threshold or already connected never reach the chat model. At most
    /// `discovery_workers` classifications run at once; a failed one is
    /// skipped. Cancelling `cancel` drops in-flight calls and returns what
    /// was gathered so far.
    pub async fn discover(
        &self,
        options: DiscoverOptions,
        cancel: &CancellationToken,
    ) -> Result<DiscoverResult> {
        if options.limit == 0 {
            return Err(MemoryError::validation("limit must be greater than zero"));
        }
        if !self.ai.chat_available().await {
            tracing::warn!(capability = "chat", "relationship discovery skipped");
            return Ok(DiscoverResult {
                degraded: Some("chat model unavailable; no suggestions made".into()),
                ..DiscoverResult::default()
            });
        }

        let candidates = self.candidates().await?;
        let embedded = self.embed_candidates(candidates).await;
        if embedded.len() < 2 {
            let degraded = (!self.ai.embeddings_available().await)
                .then(|| "embeddings unavailable; too few comparable memories".to_string());
            return Ok(DiscoverResult {
                degraded,
                ..DiscoverResult::default()
            });
        }

        let ids: Vec<String> = embedded.iter().map(|(m, _)| m.id.clone()).collect();
        let connected = self
            .db
            .read(move |conn| connected_pairs(conn, &ids))
            .await
            .storage("discover relationships", None)?;

        let pairs = similar_pairs(&embedded, self.config.discovery_threshold, &connected);
        let pairs_considered = pairs.len();
        tracing::debug!(
            candidates = embedded.len(),
            pairs = pairs_considered,
            "discovery pairs selected"
        );

        let mut suggestions = Vec::new();
        let mut cancelled = false;
        let mut classified = stream::iter(pairs)
            .map(|(source, target, similarity)| self.classify(source, target, similarity))
            .buffer_unordered(self.config.discovery_workers.max(1));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = classified.next() => match next {
                    None => break,
                    Some(Ok(Some(suggestion))) => {
                        suggestions.push(suggestion);
                        if suggestions.len() >= options.limit {
                            break;
                        }
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => tracing::warn!(error = %e, "pair classification failed, skipping"),
                },
            }
        }
        drop(classified);

        suggestions.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if options.persist && !suggestions.is_empty() {
            suggestions = self.persist(suggestions).await?;
        }
        if cancelled {
            tracing::info!(found = suggestions.len(), "relationship discovery cancelled");
        }

        Ok(DiscoverResult {
            suggestions,
            pairs_considered,
            degraded: None,
            cancelled,
        })
    }

    // ── Discovery helpers ──

    async fn candidates(&self) -> Result<Vec<Memory>> {
        let limit = self.config.discovery_candidates.max(2);
        self.db
            .read(move |conn| {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories m
                     WHERE m.chunk_level = 0
                     ORDER BY m.created_at DESC
                     LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![limit as i64], row_to_memory)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .storage("discovery candidates", None)
    }

    /// Stored embeddings first; the rest are embedded now when possible.
    async fn embed_candidates(&self, candidates: Vec<Memory>) -> Vec<(Memory, Vec<f32>)> {
        let mut out = Vec::with_capacity(candidates.len());
        let mut embeddings_up = true;
        for mut memory in candidates {
            if let Some(vector) = memory.embedding.take() {
                out.push((memory, vector));
                continue;
            }
            if !embeddings_up {
                continue;
            }
            match self.ai.embed(&memory.content).await {
                Ok(vector) => out.push((memory, vector.to_vec())),
                Err(e) => {
                    tracing::warn!(memory_id = %memory.id, error = %e, "candidate embedding failed");
                    embeddings_up = !e.is_outage();
                }
            }
        }
        out
    }

    async fn classify(
        &self,
        source: Memory,
        target: Memory,
        similarity: f64,
    ) -> crate::ai::AiResult<Option<RelationshipSuggestion>> {
        let prompt = classification_prompt(&source.content, &target.content);
        let reply = self.ai.complete(&prompt).await?;
        let Some((relationship_type, confidence, reasoning)) = parse_classification(&reply) else {
            return Ok(None);
        };
        Ok(Some(RelationshipSuggestion {
            source_id: source.id,
            target_id: target.id,
            relationship_type,
            confidence,
            reasoning,
            similarity,
            relationship_id: None,
        }))
    }

    async fn persist(
        &self,
        suggestions: Vec<RelationshipSuggestion>,
    ) -> Result<Vec<RelationshipSuggestion>> {
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let mut saved = Vec::with_capacity(suggestions.len());
                for mut s in suggestions {
                    let input = NewRelationship {
                        source_id: s.source_id.clone(),
                        target_id: s.target_id.clone(),
                        relationship_type: s.relationship_type,
                        strength: s.confidence,
                        context: s.reasoning.clone(),
                    };
                    let result = upsert_relationship(&tx, &input, true)?;
                    s.relationship_id = Some(result.relationship.id);
                    saved.push(s);
                }
                tx.commit()?;
                Ok(saved)
            })
            .await
            .storage("persist suggestions", None)
    }
}

// ── Validation ───────────────────────────────────────────────────

fn validate_strength(strength: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&strength) {
        return Err(MemoryError::validation(format!(
            "strength must be between 0 and 1, got {strength}"
        )));
    }
    Ok(())
}

fn validate_new(mut input: NewRelationship) -> Result<NewRelationship> {
    input.source_id = input.source_id.trim().to_string();
    input.target_id = input.target_id.trim().to_string();
    if input.source_id.is_empty() || input.target_id.is_empty() {
        return Err(MemoryError::validation("source and target ids are required"));
    }
    if input.source_id == input.target_id {
        return Err(MemoryError::validation(
            "a memory cannot be related to itself",
        ));
    }
    validate_strength(input.strength)?;
    input.context = input
        .context
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    Ok(input)
}

fn require_memory(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM memories WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(MemoryError::memory_not_found(id))
    }
}

// ── Row mapping ──────────────────────────────────────────────────

fn relationship_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Relationship> {
    let kind: String = row.get(base + 3)?;
    let relationship_type = kind
        .parse()
        .map_err(|_| conversion_error(base + 3, format!("bad relationship type: {kind}")))?;
    Ok(Relationship {
        id: row.get(base)?,
        source_id: row.get(base + 1)?,
        target_id: row.get(base + 2)?,
        relationship_type,
        strength: row.get(base + 4)?,
        context: row.get(base + 5)?,
        auto_generated: row.get::<_, i64>(base + 6)? != 0,
        created_at: timestamp_column(row, base + 7)?,
        updated_at: timestamp_column(row, base + 8)?,
    })
}

fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    relationship_at(row, 0)
}

/// The memory columns that follow [`RELATIONSHIP_COLUMNS`] in a joined row.
fn memory_after_relationship(row: &Row<'_>) -> rusqlite::Result<Memory> {
    memory_at(row, 9)
}

fn fetch_relationship(conn: &Connection, id: &str) -> Result<Option<Relationship>> {
    let sql = format!("SELECT {RELATIONSHIP_COLUMNS} FROM memory_relationships r WHERE r.id = ?1");
    Ok(conn
        .query_row(&sql, params![id], row_to_relationship)
        .optional()?)
}

// ── Writes ───────────────────────────────────────────────────────

fn upsert_relationship(
    conn: &Connection,
    input: &NewRelationship,
    auto_generated: bool,
) -> Result<CreateResult> {
    require_memory(conn, &input.source_id)?;
    require_memory(conn, &input.target_id)?;

    let ts = format_timestamp(&now());
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM memory_relationships
             WHERE source_memory_id = ?1 AND target_memory_id = ?2 AND relationship_type = ?3",
            params![input.source_id, input.target_id, input.relationship_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let id = match &existing {
        Some(id) => {
            conn.execute(
                "UPDATE memory_relationships
                 SET strength = ?1, context = COALESCE(?2, context), updated_at = ?3
                 WHERE id = ?4",
                params![input.strength, input.context, ts, id],
            )?;
            id.clone()
        }
        None => {
            let id = uuid::Uuid::now_v7().to_string();
            conn.execute(
                "INSERT INTO memory_relationships
                     (id, source_memory_id, target_memory_id, relationship_type,
                      strength, context, auto_generated, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    input.source_id,
                    input.target_id,
                    input.relationship_type.as_str(),
                    input.strength,
                    input.context,
                    auto_generated as i64,
                    ts
                ],
            )?;
            id
        }
    };

    write_audit_log(
        conn,
        "relate",
        &input.source_id,
        Some(&serde_json::json!({
            "relationship_id": id,
            "target_id": input.target_id,
            "type": input.relationship_type.as_str(),
            "strength": input.strength,
            "auto_generated": auto_generated,
            "updated": existing.is_some(),
        })),
    )?;

    let relationship = fetch_relationship(conn, &id)?
        .ok_or_else(|| MemoryError::relationship_not_found(&id))?;
    Ok(CreateResult {
        relationship,
        existed: existing.is_some(),
    })
}

// ── Traversal ────────────────────────────────────────────────────

fn walk(conn: &Connection, root_id: &str, depth: usize) -> Result<Subgraph> {
    require_memory(conn, root_id)?;

    let mut distance: HashMap<String, usize> = HashMap::from([(root_id.to_string(), 0)]);
    let mut order: Vec<String> = vec![root_id.to_string()];
    let mut edges: Vec<Relationship> = Vec::new();
    let mut seen_edges: HashSet<String> = HashSet::new();
    let mut frontier: Vec<String> = vec![root_id.to_string()];

    for level in 0..depth {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for rel in edges_touching(conn, &frontier)? {
            for end in [&rel.source_id, &rel.target_id] {
                if !distance.contains_key(end) {
                    distance.insert(end.clone(), level + 1);
                    order.push(end.clone());
                    next.push(end.clone());
                }
            }
            if seen_edges.insert(rel.id.clone()) {
                edges.push(rel);
            }
        }
        frontier = next;
    }

    let mut records = fetch_memories(conn, &order)?;
    let nodes = order
        .into_iter()
        .filter_map(|id| {
            let d = distance.get(&id).copied()?;
            records.remove(&id).map(|memory| GraphNode {
                memory,
                distance: d,
            })
        })
        .collect();
    Ok(Subgraph { nodes, edges })
}

fn edges_touching(conn: &Connection, ids: &[String]) -> Result<Vec<Relationship>> {
    let mut out = Vec::new();
    for batch in ids.chunks(FRONTIER_BATCH) {
        let marks = vec!["?"; batch.len()].join(", ");
        let sql = format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM memory_relationships r
             WHERE r.source_memory_id IN ({marks}) OR r.target_memory_id IN ({marks})
             ORDER BY r.strength DESC, r.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(batch.iter().chain(batch.iter())),
            row_to_relationship,
        )?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

// ── Discovery ────────────────────────────────────────────────────

/// Unordered id pairs that already share an edge of any type.
fn connected_pairs(conn: &Connection, ids: &[String]) -> Result<HashSet<(String, String)>> {
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut pairs = HashSet::new();
    for rel in edges_touching(conn, ids)? {
        if wanted.contains(rel.source_id.as_str()) && wanted.contains(rel.target_id.as_str()) {
            pairs.insert(pair_key(&rel.source_id, &rel.target_id));
        }
    }
    Ok(pairs)
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Candidate pairs at or above `threshold`, most similar first. Candidates
/// arrive newest first, so the newer memory becomes the source.
fn similar_pairs(
    embedded: &[(Memory, Vec<f32>)],
    threshold: f64,
    connected: &HashSet<(String, String)>,
) -> Vec<(Memory, Memory, f64)> {
    let mut pairs = Vec::new();
    for (i, (a, va)) in embedded.iter().enumerate() {
        for (b, vb) in &embedded[i + 1..] {
            if connected.contains(&pair_key(&a.id, &b.id)) {
                continue;
            }
            let similarity = cosine_similarity(va, vb);
            if similarity >= threshold {
                pairs.push((a.clone(), b.clone(), similarity));
            }
        }
    }
    pairs.sort_by(|x, y| y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal));
    pairs
}

fn classification_prompt(source: &str, target: &str) -> String {
    let types = RelationshipType::ALL
        .iter()
        .map(RelationshipType::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Decide whether the first note relates to the second.\n\n\
         First note:\n{source}\n\n\
         Second note:\n{target}\n\n\
         Allowed relationship types: {types}\n\n\
         Answer with exactly these lines:\n\
         TYPE: <one allowed type, or none>\n\
         CONFIDENCE: <number from 0.0 to 1.0>\n\
         REASONING: <one short sentence>\n"
    )
}

/// Read `TYPE:`, `CONFIDENCE:` and `REASONING:` lines (any case). `none`, a
/// missing type, or a type outside the fixed set yields no suggestion.
/// Confidence defaults to 0.5 and is clamped to `[0, 1]`.
fn parse_classification(reply: &str) -> Option<(RelationshipType, f64, Option<String>)> {
    let mut kind = None;
    let mut confidence = DEFAULT_STRENGTH;
    let mut reasoning = None;

    for line in reply.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "TYPE" => kind = Some(value.trim_matches(|c| c == '[' || c == ']').to_lowercase()),
            "CONFIDENCE" => {
                if let Ok(c) = value.parse::<f64>() {
                    if c.is_finite() {
                        confidence = c.clamp(0.0, 1.0);
                    }
                }
            }
            "REASONING" if !value.is_empty() => reasoning = Some(value.to_string()),
            _ => {}
        }
    }

    let kind = kind?;
    if kind.is_empty() || kind == "none" {
        return None;
    }
    match kind.parse::<RelationshipType>() {
        Ok(t) => Some((t, confidence, reasoning)),
        Err(_) => {
            tracing::debug!(reply_type = %kind, "chat model proposed an unknown relationship type");
            None
        }
    }
}
