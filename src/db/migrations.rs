//! Versioned schema upgrades.
//!
//! `schema_meta.schema_version` records the last applied step. Steps are
//! listed in [`STEPS`] in order and never edited once released.

use rusqlite::{params, Connection, OptionalExtension};

/// Version a fresh database reaches after [`apply_pending`].
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// `(version reached, DDL)` in ascending order.
const STEPS: &[(u32, &str)] = &[
    (
        2,
        "CREATE INDEX IF NOT EXISTS idx_memories_level_created ON memories(chunk_level, created_at);
         CREATE INDEX IF NOT EXISTS idx_relationships_pair
             ON memory_relationships(source_memory_id, target_memory_id);",
    ),
    (
        3,
        "CREATE TABLE IF NOT EXISTS categories (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL UNIQUE COLLATE NOCASE,
             description TEXT NOT NULL DEFAULT '',
             parent_category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
             confidence_threshold REAL NOT NULL DEFAULT 0.7
                 CHECK(confidence_threshold >= 0.0 AND confidence_threshold <= 1.0),
             auto_generated INTEGER NOT NULL DEFAULT 0,
             created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS memory_categories (
             memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
             category_id TEXT NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
             confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
             reasoning TEXT,
             created_at TEXT NOT NULL,
             PRIMARY KEY (memory_id, category_id)
         );
         CREATE INDEX IF NOT EXISTS idx_memory_categories_category
             ON memory_categories(category_id);
         CREATE TABLE IF NOT EXISTS domains (
             name TEXT PRIMARY KEY,
             description TEXT,
             created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL
         );",
    ),
];

fn meta_value(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn set_meta_value(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Applied schema version; 0 when unset or unreadable.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    Ok(meta_value(conn, "schema_version")?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Model that produced the stored embeddings, once any were written.
pub fn embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    meta_value(conn, "embedding_model")
}

pub fn record_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    set_meta_value(conn, "embedding_model", model)
}

/// Apply every step above the recorded version, one transaction per step.
pub fn apply_pending(conn: &mut Connection) -> rusqlite::Result<()> {
    let from = schema_version(conn)?;
    let pending: Vec<_> = STEPS.iter().filter(|(v, _)| *v > from).collect();
    if pending.is_empty() {
        tracing::debug!(schema_version = from, "schema up to date");
        return Ok(());
    }

    for (version, ddl) in pending {
        tracing::info!(schema_version = *version, "applying schema step");
        let tx = conn.transaction()?;
        tx.execute_batch(ddl)?;
        set_meta_value(&tx, "schema_version", &version.to_string())?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_schema() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    fn has_object(conn: &Connection, kind: &str, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            [kind, name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn base_schema_is_version_one() {
        assert_eq!(schema_version(&base_schema()).unwrap(), 1);
    }

    #[test]
    fn pending_steps_reach_current_version() {
        let mut conn = base_schema();
        apply_pending(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(has_object(&conn, "index", "idx_memories_level_created"));
        assert!(has_object(&conn, "index", "idx_relationships_pair"));
        for table in ["categories", "memory_categories", "domains"] {
            assert!(has_object(&conn, "table", table), "{table}");
        }

        apply_pending(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn steps_are_ordered_and_end_at_current() {
        assert!(STEPS.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(STEPS.last().map(|s| s.0), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn embedding_model_round_trips() {
        let conn = base_schema();
        assert!(embedding_model(&conn).unwrap().is_none());
        record_embedding_model(&conn, "nomic-embed-text").unwrap();
        record_embedding_model(&conn, "mxbai-embed-large").unwrap();
        assert_eq!(
            embedding_model(&conn).unwrap().as_deref(),
            Some("mxbai-embed-large")
        );
    }
}
