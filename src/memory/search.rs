//! Query routing and result fusion.
//!
//! [`RetrievalEngine::search`] validates the options, picks a strategy, and
//! returns ranked hits. Keyword, tag, date, and list strategies are plain SQL
//! over the memory database. Semantic search goes through the vector store and
//! falls back to keyword search whenever embeddings or vectors are unavailable.
//! Hybrid search runs both branches concurrently under one deadline and fuses
//! their min-max normalized scores with configured weights.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::ai::{AiServices, VectorFilter};
use crate::config::RetrievalConfig;
use crate::db::Database;
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory::store::{fetch_memories, row_to_memory, validate_filter, MEMORY_COLUMNS};
use crate::memory::types::{ListOrder, Memory, MemoryFilter, TagMatch};

/// Vector hits fetched per requested result, leaving room for filters the
/// vector store cannot apply (tags, dates, importance).
const SEMANTIC_OVERFETCH: usize = 3;

// ── Public types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Keyword,
    Semantic,
    Tags,
    DateRange,
    Hybrid,
}

impl std::str::FromStr for SearchType {
    type Err = MemoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keyword" => Ok(Self::Keyword),
            "semantic" => Ok(Self::Semantic),
            "tags" => Ok(Self::Tags),
            "date_range" | "date-range" | "daterange" => Ok(Self::DateRange),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(MemoryError::validation(format!("unknown search type: {other}"))),
        }
    }
}

/// Which strategy produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Keyword,
    Semantic,
    /// Found by both hybrid branches.
    Hybrid,
    Tags,
    Date,
    List,
}

/// The strategy that actually ran, after any fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Keyword,
    Semantic,
    Tags,
    DateRange,
    Hybrid,
    List,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub query: Option<String>,
    /// `None` runs keyword search when a query is given, else lists.
    pub search_type: Option<SearchType>,
    pub filter: MemoryFilter,
    pub limit: Option<usize>,
    /// Hits scoring below this are dropped. Within `[0, 1]`.
    pub min_relevance: f64,
}

impl SearchOptions {
    pub fn keyword(query: impl Into<String>) -> Self {
        Self::with_type(query, SearchType::Keyword)
    }

    pub fn semantic(query: impl Into<String>) -> Self {
        Self::with_type(query, SearchType::Semantic)
    }

    pub fn hybrid(query: impl Into<String>) -> Self {
        Self::with_type(query, SearchType::Hybrid)
    }

    fn with_type(query: impl Into<String>, search_type: SearchType) -> Self {
        Self {
            query: Some(query.into()),
            search_type: Some(search_type),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn query_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub memory: Memory,
    /// Within `[0, 1]`, higher is better.
    pub relevance: f64,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub strategy: Strategy,
    /// Set when an AI capability was unavailable and a reduced strategy ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl SearchResponse {
    fn new(results: Vec<SearchHit>, strategy: Strategy) -> Self {
        Self {
            results,
            strategy,
            degraded: None,
        }
    }

    fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.degraded = Some(reason.into());
        self
    }
}

// ── Engine ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RetrievalEngine {
    db: Database,
    ai: Arc<AiServices>,
    default_limit: usize,
    keyword_weight: f64,
    semantic_weight: f64,
    branch_timeout: Duration,
    tag_match: TagMatch,
}

impl RetrievalEngine {
    pub fn new(db: Database, ai: Arc<AiServices>, config: &RetrievalConfig) -> Self {
        Self {
            db,
            ai,
            default_limit: config.default_limit.max(1),
            keyword_weight: config.keyword_weight,
            semantic_weight: config.semantic_weight,
            branch_timeout: Duration::from_millis(config.branch_timeout_ms),
            tag_match: config.tag_match.parse().unwrap_or_default(),
        }
    }

    pub async fn search(&self, options: SearchOptions) -> Result<SearchResponse> {
        let limit = self.validate(&options)?;
        let started = Instant::now();
        let response = self.route(&options, limit).await?;
        tracing::debug!(
            strategy = ?response.strategy,
            results = response.results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(response)
    }

    async fn route(&self, options: &SearchOptions, limit: usize) -> Result<SearchResponse> {
        let query = options.query_text().map(str::to_string);

        match (options.search_type, query) {
            (Some(SearchType::Keyword), Some(q)) | (None, Some(q)) => {
                let hits = self
                    .keyword_hits(&q, &options.filter, limit, options.min_relevance)
                    .await?;
                Ok(SearchResponse::new(hits, Strategy::Keyword))
            }
            (Some(SearchType::Semantic), Some(q)) => self.semantic(&q, options, limit).await,
            (Some(SearchType::Hybrid), Some(q)) => self.hybrid(&q, options, limit).await,
            (Some(SearchType::Tags), _) => {
                let hits = self.tag_hits(&options.filter, limit, options.min_relevance).await?;
                Ok(SearchResponse::new(hits, Strategy::Tags))
            }
            (Some(SearchType::DateRange), _) => {
                let hits = self.listed(&options.filter, limit, MatchType::Date).await?;
                Ok(SearchResponse::new(hits, Strategy::DateRange))
            }
            // Query-less keyword/semantic/hybrid is rejected by `validate`.
            (_, None) => {
                let hits = self.listed(&options.filter, limit, MatchType::List).await?;
                Ok(SearchResponse::new(hits, Strategy::List))
            }
        }
    }

    fn validate(&self, options: &SearchOptions) -> Result<usize> {
        let limit = options.limit.unwrap_or(self.default_limit);
        if limit == 0 {
            return Err(MemoryError::validation("limit must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&options.min_relevance) {
            return Err(MemoryError::validation(
                "min_relevance must be between 0 and 1",
            ));
        }
        validate_filter(&options.filter)?;

        let filter = &options.filter;
        match options.search_type {
            Some(t @ (SearchType::Keyword | SearchType::Semantic | SearchType::Hybrid))
                if options.query_text().is_none() =>
            {
                Err(MemoryError::validation(format!(
                    "query is required for {} search",
                    serde_json::to_value(t)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default()
                )))
            }
            Some(SearchType::Tags) if filter.tags.iter().all(|t| t.trim().is_empty()) => {
                Err(MemoryError::validation("tags are required for tag search"))
            }
            Some(SearchType::DateRange)
                if filter.created_after.is_none() && filter.created_before.is_none() =>
            {
                Err(MemoryError::validation(
                    "created_after or created_before is required for date range search",
                ))
            }
            _ => Ok(limit),
        }
    }

    // ── Strategies ──

    async fn keyword_hits(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
        min_relevance: f64,
    ) -> Result<Vec<SearchHit>> {
        let query = query.to_string();
        let filter = filter.clone();
        let tag_match = self.tag_match;
        let ranked = self
            .db
            .read(move |conn| keyword_search(conn, &query, &filter, tag_match, limit))
            .await
            .storage("keyword search", None)?;
        Ok(ranked
            .into_iter()
            .filter(|(_, relevance)| *relevance >= min_relevance)
            .map(|(memory, relevance)| SearchHit {
                memory,
                relevance,
                match_type: MatchType::Keyword,
            })
            .collect())
    }

    /// `Ok(None)` when the AI side failed; the failure is logged here.
    async fn semantic_hits(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
        min_relevance: f64,
    ) -> Result<Option<Vec<SearchHit>>> {
        let vector = match self.ai.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed");
                return Ok(None);
            }
        };

        let vector_filter = VectorFilter {
            session_id: filter.session_id.clone(),
            domain: filter.domain.clone(),
        };
        let matches = match self
            .ai
            .search_vectors(
                &vector,
                limit * SEMANTIC_OVERFETCH,
                min_relevance as f32,
                &vector_filter,
            )
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "vector search failed");
                return Ok(None);
            }
        };

        let ids: Vec<String> = matches.iter().map(|m| m.id.clone()).collect();
        let mut records = self
            .db
            .read(move |conn| fetch_memories(conn, &ids))
            .await
            .storage("semantic search", None)?;

        let mut hits: Vec<SearchHit> = matches
            .into_iter()
            .filter_map(|m| {
                let memory = records.remove(&m.id)?;
                Some(SearchHit {
                    memory,
                    relevance: (m.score as f64).clamp(0.0, 1.0),
                    match_type: MatchType::Semantic,
                })
            })
            .filter(|h| h.relevance >= min_relevance && filter.matches(&h.memory, self.tag_match))
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(Some(hits))
    }

    async fn semantic(&self, query: &str, options: &SearchOptions, limit: usize) -> Result<SearchResponse> {
        if self.ai.semantic_available().await {
            if let Some(hits) = self
                .semantic_hits(query, &options.filter, limit, options.min_relevance)
                .await?
            {
                return Ok(SearchResponse::new(hits, Strategy::Semantic));
            }
        } else {
            tracing::warn!("semantic search unavailable, using keyword search");
        }

        let hits = self
            .keyword_hits(query, &options.filter, limit, options.min_relevance)
            .await?;
        Ok(SearchResponse::new(hits, Strategy::Keyword)
            .degraded("semantic search unavailable; keyword results returned"))
    }

    async fn hybrid(&self, query: &str, options: &SearchOptions, limit: usize) -> Result<SearchResponse> {
        let filter = &options.filter;
        if !self.ai.semantic_available().await {
            tracing::warn!("semantic branch unavailable, hybrid search runs keyword only");
            let hits = self
                .keyword_hits(query, filter, limit, options.min_relevance)
                .await?;
            return Ok(SearchResponse::new(hits, Strategy::Keyword)
                .degraded("semantic search unavailable; keyword results returned"));
        }

        let branch_limit = limit * 2;
        let deadline = Instant::now() + self.branch_timeout;
        let (keyword, semantic) = tokio::join!(
            tokio::time::timeout_at(deadline, self.keyword_hits(query, filter, branch_limit, 0.0)),
            tokio::time::timeout_at(deadline, self.semantic_hits(query, filter, branch_limit, 0.0)),
        );

        let timeout_ms = self.branch_timeout.as_millis() as u64;
        let mut keyword_error = None;
        let (keyword, keyword_outcome) = match keyword {
            Ok(Ok(hits)) => (Some(hits), BranchOutcome::Completed),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "keyword branch failed");
                keyword_error = Some(e);
                (None, BranchOutcome::Failed)
            }
            Err(_) => {
                tracing::warn!(timeout_ms, "keyword branch timed out");
                (None, BranchOutcome::TimedOut)
            }
        };
        let (semantic, semantic_outcome) = match semantic {
            Ok(Ok(Some(hits))) => (Some(hits), BranchOutcome::Completed),
            Ok(Ok(None)) => (None, BranchOutcome::Failed),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "semantic branch failed");
                (None, BranchOutcome::Failed)
            }
            Err(_) => {
                tracing::warn!(timeout_ms, "semantic branch timed out");
                (None, BranchOutcome::TimedOut)
            }
        };
        let note = branch_note(keyword_outcome, semantic_outcome);

        Ok(match (keyword, semantic) {
            (Some(k), Some(s)) => {
                let hits = fuse(k, s, self.keyword_weight, self.semantic_weight);
                SearchResponse::new(finish(hits, limit, options.min_relevance), Strategy::Hybrid)
            }
            (Some(k), None) => SearchResponse::new(finish(k, limit, options.min_relevance), Strategy::Keyword)
                .degraded(format!("{note}; keyword results returned")),
            (None, Some(s)) => SearchResponse::new(finish(s, limit, options.min_relevance), Strategy::Semantic)
                .degraded(format!("{note}; semantic results returned")),
            (None, None) => {
                if let Some(e) = keyword_error {
                    return Err(e);
                }
                SearchResponse::new(Vec::new(), Strategy::Hybrid).degraded(note)
            }
        })
    }

    async fn tag_hits(&self, filter: &MemoryFilter, limit: usize, min_relevance: f64) -> Result<Vec<SearchHit>> {
        let filter = filter.clone();
        let tag_match = self.tag_match;
        let ranked = self
            .db
            .read(move |conn| tag_search(conn, &filter, tag_match, limit))
            .await
            .storage("tag search", None)?;
        Ok(ranked
            .into_iter()
            .filter(|(_, relevance)| *relevance >= min_relevance)
            .map(|(memory, relevance)| SearchHit {
                memory,
                relevance,
                match_type: MatchType::Tags,
            })
            .collect())
    }

    async fn listed(&self, filter: &MemoryFilter, limit: usize, match_type: MatchType) -> Result<Vec<SearchHit>> {
        let filter = filter.clone();
        let tag_match = self.tag_match;
        let memories = self
            .db
            .read(move |conn| filtered_list(conn, &filter, tag_match, limit))
            .await
            .storage("list search", None)?;
        Ok(memories
            .into_iter()
            .map(|memory| SearchHit {
                memory,
                relevance: 1.0,
                match_type,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Describes the hybrid branches that did not complete.
fn branch_note(keyword: BranchOutcome, semantic: BranchOutcome) -> String {
    [("keyword", keyword), ("semantic", semantic)]
        .into_iter()
        .filter_map(|(branch, outcome)| match outcome {
            BranchOutcome::Completed => None,
            BranchOutcome::Failed => Some(format!("{branch} branch failed")),
            BranchOutcome::TimedOut => Some(format!("{branch} branch timed out")),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Scoring ──────────────────────────────────────────────────────

/// Descending relevance; ties go to the more recently updated memory.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
}

fn finish(mut hits: Vec<SearchHit>, limit: usize, min_relevance: f64) -> Vec<SearchHit> {
    hits.retain(|h| h.relevance >= min_relevance);
    sort_hits(&mut hits);
    hits.truncate(limit);
    hits
}

/// Min-max scale to `[0, 1]`. A branch whose scores are all equal maps to 1.0.
fn normalize(hits: &[SearchHit]) -> HashMap<String, f64> {
    let (min, max) = hits.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), h| {
        (lo.min(h.relevance), hi.max(h.relevance))
    });
    let span = max - min;
    hits.iter()
        .map(|h| {
            let n = if span > f64::EPSILON {
                (h.relevance - min) / span
            } else {
                1.0
            };
            (h.memory.id.clone(), n)
        })
        .collect()
}

/// Weighted combination of independently normalized branch scores. A memory
/// found by one branch contributes zero for the other.
fn fuse(
    keyword: Vec<SearchHit>,
    semantic: Vec<SearchHit>,
    keyword_weight: f64,
    semantic_weight: f64,
) -> Vec<SearchHit> {
    let total = keyword_weight + semantic_weight;
    let (wk, ws) = if total > 0.0 {
        (keyword_weight / total, semantic_weight / total)
    } else {
        (0.5, 0.5)
    };
    let nk = normalize(&keyword);
    let ns = normalize(&semantic);

    let mut merged: HashMap<String, SearchHit> = HashMap::new();
    for hit in keyword.into_iter().chain(semantic) {
        let id = hit.memory.id.clone();
        let k = nk.get(&id).copied();
        let s = ns.get(&id).copied();
        let relevance = wk * k.unwrap_or(0.0) + ws * s.unwrap_or(0.0);
        let match_type = match (k, s) {
            (Some(_), Some(_)) => MatchType::Hybrid,
            (Some(_), None) => MatchType::Keyword,
            _ => MatchType::Semantic,
        };
        merged.entry(id).or_insert(SearchHit {
            memory: hit.memory,
            relevance,
            match_type,
        });
    }
    merged.into_values().collect()
}

/// Scale BM25 ranks (lower is better) against the best rank in the same
/// result set, so the strongest hit scores 1.0. FTS5 clamps the IDF of
/// common terms to 1e-6, so raw ranks are not comparable across queries.
fn relative_bm25(ranks: &[f64]) -> Vec<f64> {
    let best = ranks.iter().map(|r| -r).fold(0.0_f64, f64::max);
    ranks
        .iter()
        .map(|r| {
            if best > 0.0 {
                (-r / best).clamp(0.0, 1.0)
            } else {
                1.0
            }
        })
        .collect()
}

// ── SQL strategies ───────────────────────────────────────────────

/// Split on anything that is not a letter or digit, quote each token, and
/// OR them together. Returns `None` when no tokens remain.
fn fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    (!tokens.is_empty()).then(|| tokens.join(" OR "))
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// FTS5 search. Chunk hits fold into their root (best chunk rank wins)
/// unless the filter asks for chunks.
fn keyword_search(
    conn: &Connection,
    query: &str,
    filter: &MemoryFilter,
    tag_match: TagMatch,
    limit: usize,
) -> Result<Vec<(Memory, f64)>> {
    let Some(fts) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let hit_id = if filter.include_chunks {
        "c.id"
    } else {
        "COALESCE(p.parent_memory_id, c.parent_memory_id, c.id)"
    };
    let mut params: Vec<Value> = vec![Value::Text(fts)];
    let clauses = filter.sql_predicates("m", tag_match, &mut params);
    params.push(Value::Integer(limit as i64));

    // bm25() is only valid directly over the FTS cursor, so the scored
    // rows are materialized before any join or grouping.
    let sql = format!(
        "WITH scored AS MATERIALIZED (
             SELECT rowid AS fts_rowid, bm25(memories_fts) AS rank
             FROM memories_fts
             WHERE memories_fts MATCH ?
         ),
         hits AS (
             SELECT {hit_id} AS hit_id, s.rank AS rank
             FROM scored s
             JOIN memories c ON c.rowid = s.fts_rowid
             LEFT JOIN memories p ON p.id = c.parent_memory_id
         )
         SELECT {MEMORY_COLUMNS}, MIN(h.rank) AS best
         FROM hits h JOIN memories m ON m.id = h.hit_id
         {}
         GROUP BY m.id
         ORDER BY best ASC, m.updated_at DESC
         LIMIT ?",
        where_clause(&clauses)
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let memory = row_to_memory(row)?;
            let rank: f64 = row.get(16)?;
            Ok((memory, rank))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let ranks: Vec<f64> = rows.iter().map(|(_, rank)| *rank).collect();
    Ok(rows
        .into_iter()
        .zip(relative_bm25(&ranks))
        .map(|((memory, _), relevance)| (memory, relevance))
        .collect())
}

/// Relevance is the fraction of requested tags present.
fn tag_search(
    conn: &Connection,
    filter: &MemoryFilter,
    tag_match: TagMatch,
    limit: usize,
) -> Result<Vec<(Memory, f64)>> {
    let requested = super::store::normalize_tags(&filter.tags);
    if requested.is_empty() {
        return Ok(Vec::new());
    }

    let marks = vec!["?"; requested.len()].join(", ");
    let mut params: Vec<Value> = requested.iter().cloned().map(Value::Text).collect();
    let clauses = filter.sql_predicates("m", tag_match, &mut params);
    params.push(Value::Integer(limit as i64));

    let sql = format!(
        "SELECT {MEMORY_COLUMNS},
                (SELECT COUNT(*) FROM json_each(m.tags) WHERE json_each.value IN ({marks})) AS matched
         FROM memories m
         {}
         ORDER BY matched DESC, m.updated_at DESC
         LIMIT ?",
        where_clause(&clauses)
    );

    let wanted = requested.len() as f64;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let memory = row_to_memory(row)?;
            let matched: i64 = row.get(16)?;
            Ok((memory, (matched as f64 / wanted).min(1.0)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Filter-only listing, newest first.
fn filtered_list(
    conn: &Connection,
    filter: &MemoryFilter,
    tag_match: TagMatch,
    limit: usize,
) -> Result<Vec<Memory>> {
    let mut params: Vec<Value> = Vec::new();
    let clauses = filter.sql_predicates("m", tag_match, &mut params);
    params.push(Value::Integer(limit as i64));
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m {} ORDER BY {} LIMIT ?",
        where_clause(&clauses),
        ListOrder::Newest.sql("m")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
