//! Embedded vector store on a sqlite-vec `vec0` table.
//!
//! Lives in its own database file next to the memory database so the vector
//! index can be dropped and rebuilt without touching memories. Vectors are
//! L2-normalized on insert, which makes the table's euclidean distance a
//! monotonic function of cosine similarity: `cos = 1 - d² / 2`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::{AiError, AiResult, Capability, VectorFilter, VectorMatch, VectorPayload, VectorStore};
use crate::memory::embedding_to_bytes;

/// Extra neighbours fetched per requested result when a payload filter applies.
const FILTER_OVERSAMPLE: usize = 4;

pub struct SqliteVecStore {
    conn: Arc<Mutex<Connection>>,
    dimensions: usize,
}

fn backend_err(e: impl std::fmt::Display) -> AiError {
    AiError::backend(Capability::VectorStore, e)
}

impl SqliteVecStore {
    pub fn open(path: &Path, dimensions: usize) -> AiResult<Self> {
        crate::db::load_sqlite_vec();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(backend_err)?;
        }
        let conn = Connection::open(path).map_err(backend_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(backend_err)?;
        Self::init(conn, dimensions)
    }

    pub fn open_in_memory(dimensions: usize) -> AiResult<Self> {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        Self::init(conn, dimensions)
    }

    fn init(conn: Connection, dimensions: usize) -> AiResult<Self> {
        if dimensions == 0 {
            return Err(backend_err("dimensions must be greater than zero"));
        }
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_memories USING vec0(
                id TEXT PRIMARY KEY,
                embedding FLOAT[{dimensions}]
            );
            CREATE TABLE IF NOT EXISTS vec_payloads (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                domain TEXT,
                importance INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vec_payloads_session ON vec_payloads(session_id);"
        ))
        .map_err(backend_err)?;

        let existing = table_dimensions(&conn).map_err(backend_err)?;
        if let Some(existing) = existing.filter(|d| *d != dimensions) {
            return Err(backend_err(format!(
                "vector index was built for {existing} dimensions, configured for {dimensions}"
            )));
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dimensions,
        })
    }

    fn prepare(&self, vector: &[f32]) -> AiResult<Vec<u8>> {
        if vector.len() != self.dimensions {
            return Err(backend_err(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(backend_err("cannot index a zero or non-finite vector"));
        }
        let normalized: Vec<f32> = vector.iter().map(|x| x / norm).collect();
        Ok(embedding_to_bytes(&normalized))
    }

    async fn blocking<T, F>(&self, op: F) -> AiResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await
        .map_err(backend_err)?
        .map_err(backend_err)
    }
}

/// Dimensions of the first stored vector, if any.
fn table_dimensions(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    conn.query_row(
        "SELECT vec_length(embedding) FROM vec_memories LIMIT 1",
        [],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|d| d.map(|d| d as usize))
}

fn distance_to_score(distance: f64) -> f32 {
    (1.0 - distance * distance / 2.0) as f32
}

#[async_trait]
impl VectorStore for SqliteVecStore {
    async fn upsert(&self, id: &str, vector: &[f32], payload: &VectorPayload) -> AiResult<()> {
        let bytes = self.prepare(vector)?;
        let id = id.to_string();
        let payload = payload.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            // vec0 has no upsert; replace by hand.
            tx.execute("DELETE FROM vec_memories WHERE id = ?1", params![id])?;
            tx.execute(
                "INSERT INTO vec_memories (id, embedding) VALUES (?1, ?2)",
                params![id, bytes],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO vec_payloads (id, session_id, domain, importance, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    payload.session_id,
                    payload.domain,
                    payload.importance as i64,
                    payload.created_at
                ],
            )?;
            tx.commit()
        })
        .await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> AiResult<Vec<VectorMatch>> {
        let bytes = self.prepare(vector)?;
        let limit = limit.max(1);
        let k = if filter.is_empty() {
            limit
        } else {
            limit * FILTER_OVERSAMPLE
        };
        let filter = filter.clone();

        let rows = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT knn.id, knn.distance
                     FROM (SELECT id, distance FROM vec_memories
                           WHERE embedding MATCH ?1 AND k = ?2) knn
                     JOIN vec_payloads p ON p.id = knn.id
                     WHERE (?3 IS NULL OR p.session_id = ?3)
                       AND (?4 IS NULL OR p.domain = ?4)
                     ORDER BY knn.distance
                     LIMIT ?5",
                )?;
                let rows = stmt
                    .query_map(
                        params![bytes, k as i64, filter.session_id, filter.domain, limit as i64],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, distance)| VectorMatch {
                id,
                score: distance_to_score(distance),
            })
            .filter(|m| m.score >= min_score)
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> AiResult<()> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute("DELETE FROM vec_memories WHERE id = ?1", params![id])?;
                tx.execute("DELETE FROM vec_payloads WHERE id = ?1", params![id])?;
            }
            tx.commit()
        })
        .await
    }

    async fn health(&self) -> AiResult<String> {
        let version = self
            .blocking(|conn| conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0)))
            .await?;
        Ok(format!("sqlite-vec {version}"))
    }
}
