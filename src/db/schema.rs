//! SQL DDL for the rhizome store.
//!
//! Defines `memories` (roots and their chunks), `memories_fts` (FTS5 over
//! content and tags, synced by hand inside each write transaction),
//! `memory_relationships`, `memory_log`, and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` so initialization is idempotent.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Memories: roots (chunk_level 0) and their chunks
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    importance INTEGER NOT NULL DEFAULT 5 CHECK(importance >= 1 AND importance <= 10),
    tags TEXT NOT NULL DEFAULT '[]',
    session_id TEXT NOT NULL,
    domain TEXT,
    source TEXT,
    agent_type TEXT NOT NULL DEFAULT 'unknown',
    agent_context TEXT,
    access_scope TEXT NOT NULL DEFAULT 'session',
    embedding BLOB,
    parent_memory_id TEXT REFERENCES memories(id) ON DELETE CASCADE,
    chunk_level INTEGER NOT NULL DEFAULT 0 CHECK(chunk_level IN (0, 1, 2)),
    chunk_index INTEGER NOT NULL DEFAULT 0 CHECK(chunk_index >= 0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK((chunk_level = 0) = (parent_memory_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);
CREATE INDEX IF NOT EXISTS idx_memories_domain ON memories(domain);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_parent ON memories(parent_memory_id);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);

-- Full-text search (BM25). Columns mirror memories.content / memories.tags.
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    tags,
    content='memories',
    content_rowid='rowid'
);

-- Typed, directed edges between memories
CREATE TABLE IF NOT EXISTS memory_relationships (
    id TEXT PRIMARY KEY,
    source_memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL CHECK(relationship_type IN
        ('references','contradicts','expands','similar','sequential','causes','enables')),
    strength REAL NOT NULL CHECK(strength >= 0.0 AND strength <= 1.0),
    context TEXT,
    auto_generated INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK(source_memory_id != target_memory_id),
    UNIQUE(source_memory_id, target_memory_id, relationship_type)
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON memory_relationships(source_memory_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON memory_relationships(target_memory_id);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','delete','relate','unrelate')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "memories",
            "memories_fts",
            "memory_relationships",
            "memory_log",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn root_rows_cannot_carry_a_parent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO memories (id, content, session_id, created_at, updated_at) \
             VALUES ('root', 'text', 's', 't', 't')",
            [],
        )
        .unwrap();

        let bad = conn.execute(
            "INSERT INTO memories (id, content, session_id, parent_memory_id, chunk_level, created_at, updated_at) \
             VALUES ('bad', 'text', 's', 'root', 0, 't', 't')",
            [],
        );
        assert!(bad.is_err(), "level-0 row with a parent must be rejected");
    }

    #[test]
    fn self_loop_edges_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO memories (id, content, session_id, created_at, updated_at) \
             VALUES ('a', 'text', 's', 't', 't')",
            [],
        )
        .unwrap();

        let loop_edge = conn.execute(
            "INSERT INTO memory_relationships \
             (id, source_memory_id, target_memory_id, relationship_type, strength, created_at, updated_at) \
             VALUES ('r', 'a', 'a', 'similar', 0.5, 't', 't')",
            [],
        );
        assert!(loop_edge.is_err());
    }
}
