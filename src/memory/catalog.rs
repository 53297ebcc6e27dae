//! Categories and the domain registry.
//!
//! Categories form a named hierarchy that root memories are filed under,
//! each assignment carrying a confidence and optional reasoning. Domains are
//! the free-form `memories.domain` values; registering one attaches a
//! description, and listings cover registered and in-use domains alike.
//!
//! Everything here works on a plain `&Connection`; [`MemoryStore`] wraps the
//! functions in transactions.
//!
//! [`MemoryStore`]: crate::memory::store::MemoryStore

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{MemoryError, Result};
use crate::memory::store::{fetch_memory, timestamp_column};
use crate::memory::{format_timestamp, now, parse_timestamp};

/// Minimum confidence for an automatic assignment when a category sets none.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Confidence assumed when a chat reply omits or garbles it.
const DEFAULT_REPLY_CONFIDENCE: f64 = 0.5;

const CATEGORY_COLUMNS: &str = "c.id, c.name, c.description, c.parent_category_id, \
     c.confidence_threshold, c.auto_generated, c.created_at";

// ── Types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    pub parent_id: Option<String>,
    /// Minimum confidence for an automatic assignment to this category.
    pub confidence_threshold: f64,
    /// Created by automatic categorization rather than by a caller.
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCategory {
    pub name: String,
    pub description: String,
    pub parent_id: Option<String>,
    pub confidence_threshold: Option<f64>,
}

impl NewCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Categorization {
    pub memory_id: String,
    pub category: Category,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoCategorizeOptions {
    /// Create the suggested category when no existing one matches.
    pub auto_create: bool,
    /// Overrides the matched category's own threshold.
    pub min_confidence: Option<f64>,
}

impl Default for AutoCategorizeOptions {
    fn default() -> Self {
        Self {
            auto_create: true,
            min_confidence: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoCategorizeResult {
    /// Set when the suggestion cleared the threshold and was stored.
    pub categorization: Option<Categorization>,
    pub created_category: bool,
    /// Category name the chat model proposed, stored or not.
    pub suggested: Option<String>,
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainStats {
    /// Root memories only; chunks inherit their root's domain.
    pub memories: u64,
    pub sessions: u64,
    pub average_importance: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Domain {
    pub name: String,
    pub description: Option<String>,
    /// False for domains that only appear on memories.
    pub registered: bool,
    pub stats: DomainStats,
}

// ── Validation ───────────────────────────────────────────────────

pub(crate) fn validate_confidence(value: f64, field: &str) -> Result<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(MemoryError::validation(format!(
            "{field} must be between 0.0 and 1.0"
        )))
    }
}

pub(crate) fn validate_category(mut input: NewCategory) -> Result<NewCategory> {
    input.name = input.name.trim().to_string();
    if input.name.is_empty() {
        return Err(MemoryError::validation("category name is empty"));
    }
    input.description = input.description.trim().to_string();
    input.parent_id = input
        .parent_id
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    if let Some(t) = input.confidence_threshold {
        validate_confidence(t, "confidence_threshold")?;
    }
    Ok(input)
}

pub(crate) fn validate_domain_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(MemoryError::validation("domain name is empty"));
    }
    Ok(name.to_string())
}

// ── Categories ───────────────────────────────────────────────────

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        parent_id: row.get(3)?,
        confidence_threshold: row.get(4)?,
        auto_generated: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

pub(crate) fn fetch_category(conn: &Connection, id: &str) -> Result<Option<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories c WHERE c.id = ?1");
    Ok(conn
        .query_row(&sql, params![id], row_to_category)
        .optional()?)
}

/// Case-insensitive lookup.
pub(crate) fn category_by_name(conn: &Connection, name: &str) -> Result<Option<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories c WHERE c.name = ?1");
    Ok(conn
        .query_row(&sql, params![name], row_to_category)
        .optional()?)
}

pub(crate) fn list_categories(conn: &Connection) -> Result<Vec<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories c ORDER BY c.name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_to_category)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Insert a validated category. Names are unique regardless of case.
pub(crate) fn insert_category(
    conn: &Connection,
    input: &NewCategory,
    auto_generated: bool,
) -> Result<Category> {
    if category_by_name(conn, &input.name)?.is_some() {
        return Err(MemoryError::validation(format!(
            "category {:?} already exists",
            input.name
        )));
    }
    if let Some(parent) = &input.parent_id {
        if fetch_category(conn, parent)?.is_none() {
            return Err(MemoryError::category_not_found(parent.as_str()));
        }
    }

    let category = Category {
        id: uuid::Uuid::now_v7().to_string(),
        name: input.name.clone(),
        description: input.description.clone(),
        parent_id: input.parent_id.clone(),
        confidence_threshold: input
            .confidence_threshold
            .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
        auto_generated,
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO categories
             (id, name, description, parent_category_id, confidence_threshold,
              auto_generated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            category.id,
            category.name,
            category.description,
            category.parent_id,
            category.confidence_threshold,
            category.auto_generated,
            format_timestamp(&category.created_at),
        ],
    )?;
    Ok(category)
}

/// File a root memory under a category, replacing any earlier assignment
/// to the same category.
pub(crate) fn assign_category(
    conn: &Connection,
    memory_id: &str,
    category_id: &str,
    confidence: f64,
    reasoning: Option<&str>,
) -> Result<Categorization> {
    let memory = fetch_memory(conn, memory_id)?
        .ok_or_else(|| MemoryError::memory_not_found(memory_id))?;
    if !memory.is_root() {
        return Err(MemoryError::validation(format!(
            "memory {memory_id} is a chunk; categorize its root instead"
        )));
    }
    let category = fetch_category(conn, category_id)?
        .ok_or_else(|| MemoryError::category_not_found(category_id))?;

    let created_at = now();
    conn.execute(
        "INSERT INTO memory_categories (memory_id, category_id, confidence, reasoning, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(memory_id, category_id) DO UPDATE SET
             confidence = excluded.confidence,
             reasoning = excluded.reasoning,
             created_at = excluded.created_at",
        params![
            memory_id,
            category_id,
            confidence,
            reasoning,
            format_timestamp(&created_at)
        ],
    )?;
    Ok(Categorization {
        memory_id: memory_id.to_string(),
        category,
        confidence,
        reasoning: reasoning.map(str::to_string),
        created_at,
    })
}

/// Assignments for one memory, most confident first.
pub(crate) fn categorizations_for(conn: &Connection, memory_id: &str) -> Result<Vec<Categorization>> {
    let sql = format!(
        "SELECT {CATEGORY_COLUMNS}, mc.confidence, mc.reasoning, mc.created_at
         FROM memory_categories mc
         JOIN categories c ON c.id = mc.category_id
         WHERE mc.memory_id = ?1
         ORDER BY mc.confidence DESC, c.name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![memory_id], |row| {
            Ok(Categorization {
                memory_id: memory_id.to_string(),
                category: row_to_category(row)?,
                confidence: row.get(7)?,
                reasoning: row.get(8)?,
                created_at: timestamp_column(row, 9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Chat categorization ──────────────────────────────────────────

pub(crate) fn category_prompt(content: &str, categories: &[Category]) -> String {
    let known = if categories.is_empty() {
        "(none yet)".to_string()
    } else {
        categories
            .iter()
            .map(|c| {
                if c.description.is_empty() {
                    format!("- {}", c.name)
                } else {
                    format!("- {}: {}", c.name, c.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Pick the single best category for the note below.\n\n\
         Note:\n{content}\n\n\
         Existing categories:\n{known}\n\n\
         Prefer an existing category. Propose a short new name only when none fits.\n\
         Answer with exactly these lines:\n\
         CATEGORY: <category name, or none>\n\
         CONFIDENCE: <number from 0.0 to 1.0>\n\
         REASONING: <one short sentence>\n"
    )
}

/// Read `CATEGORY:`, `CONFIDENCE:` and `REASONING:` lines (any case). A
/// missing category or `none` yields nothing. Confidence defaults to 0.5 and
/// is clamped to `[0, 1]`.
pub(crate) fn parse_category_reply(reply: &str) -> Option<(String, f64, Option<String>)> {
    let mut name = None;
    let mut confidence = DEFAULT_REPLY_CONFIDENCE;
    let mut reasoning = None;

    for line in reply.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "CATEGORY" => {
                name = Some(
                    value
                        .trim_matches(|c: char| c == '[' || c == ']' || c == '"' || c == '\'')
                        .trim()
                        .to_string(),
                )
            }
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

    let name = name?;
    if name.is_empty() || name.eq_ignore_ascii_case("none") {
        return None;
    }
    Some((name, confidence, reasoning))
}

// ── Domains ──────────────────────────────────────────────────────

/// Register a domain, or replace the description of one already registered.
pub(crate) fn register_domain(conn: &Connection, name: &str, description: Option<&str>) -> Result<()> {
    let ts = format_timestamp(&now());
    conn.execute(
        "INSERT INTO domains (name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(name) DO UPDATE SET
             description = excluded.description,
             updated_at = excluded.updated_at",
        params![name, description, ts],
    )?;
    Ok(())
}

/// Registered and in-use domains with statistics over their root memories,
/// ordered by name. `only` restricts the result to one name.
pub(crate) fn list_domains(conn: &Connection, only: Option<&str>) -> Result<Vec<Domain>> {
    let mut stmt = conn.prepare(
        "WITH names AS (
             SELECT name FROM domains
             UNION
             SELECT domain FROM memories WHERE domain IS NOT NULL AND chunk_level = 0
         )
         SELECT n.name, d.description, d.name IS NOT NULL,
                COUNT(m.id), COUNT(DISTINCT m.session_id),
                COALESCE(AVG(m.importance), 0.0), MAX(m.updated_at)
         FROM names n
         LEFT JOIN domains d ON d.name = n.name
         LEFT JOIN memories m ON m.domain = n.name AND m.chunk_level = 0
         WHERE ?1 IS NULL OR n.name = ?1
         GROUP BY n.name
         ORDER BY n.name",
    )?;
    let rows = stmt
        .query_map(params![only], |row| {
            let last: Option<String> = row.get(6)?;
            Ok(Domain {
                name: row.get(0)?,
                description: row.get(1)?,
                registered: row.get(2)?,
                stats: DomainStats {
                    memories: row.get::<_, i64>(3)? as u64,
                    sessions: row.get::<_, i64>(4)? as u64,
                    average_importance: row.get(5)?,
                    last_activity: last.as_deref().and_then(parse_timestamp),
                },
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
