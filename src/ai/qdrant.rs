//! Qdrant REST backend.
//!
//! The collection is created on first write if it does not exist (cosine
//! distance, `dimensions`-wide vectors). Point ids are the memory UUIDs.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};

use super::http::JsonClient;
use super::{AiError, AiResult, Capability, VectorFilter, VectorMatch, VectorPayload, VectorStore};

pub struct QdrantStore {
    http: JsonClient,
    collection: String,
    dimensions: usize,
    collection_ready: AtomicBool,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct RootInfo {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
}

impl QdrantStore {
    pub fn new(url: &str, collection: &str, dimensions: usize) -> AiResult<Self> {
        let collection = collection.trim();
        if collection.is_empty() || collection.contains('/') {
            return Err(AiError::backend(
                Capability::VectorStore,
                format!("invalid collection name: {collection:?}"),
            ));
        }
        Ok(Self {
            http: JsonClient::new(url, Capability::VectorStore)?,
            collection: collection.to_string(),
            dimensions,
            collection_ready: AtomicBool::new(false),
        })
    }

    fn path(&self, suffix: &str) -> String {
        format!("/collections/{}{}", self.collection, suffix)
    }

    /// Create the collection unless it already exists. Concurrent first writers
    /// may both attempt creation; Qdrant treats the second PUT as a conflict we ignore.
    async fn ensure_collection(&self) -> AiResult<()> {
        if self.collection_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let path = self.path("");
        match self.http.get::<Value>(&path).await? {
            Ok(_) => {}
            Err(failure) if failure.status == StatusCode::NOT_FOUND => {
                let body = json!({
                    "vectors": { "size": self.dimensions, "distance": "Cosine" },
                    "hnsw_config": { "m": 16, "ef_construct": 100 },
                });
                match self.http.send::<_, Value>(Method::PUT, &path, Some(&body)).await? {
                    Ok(_) => {
                        tracing::info!(collection = %self.collection, dims = self.dimensions, "qdrant collection created")
                    }
                    Err(failure) if failure.status == StatusCode::CONFLICT => {}
                    Err(failure) => return Err(self.http.status_error(&path, failure)),
                }
            }
            Err(failure) => return Err(self.http.status_error(&path, failure)),
        }

        self.collection_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn check_dimensions(&self, vector: &[f32]) -> AiResult<()> {
        if vector.len() != self.dimensions {
            return Err(AiError::backend(
                Capability::VectorStore,
                format!(
                    "vector dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    vector.len()
                ),
            ));
        }
        Ok(())
    }
}

fn filter_body(filter: &VectorFilter) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(session) = &filter.session_id {
        must.push(json!({ "key": "session_id", "match": { "value": session } }));
    }
    if let Some(domain) = &filter.domain {
        must.push(json!({ "key": "domain", "match": { "value": domain } }));
    }
    (!must.is_empty()).then(|| json!({ "must": must }))
}

fn point_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, id: &str, vector: &[f32], payload: &VectorPayload) -> AiResult<()> {
        self.check_dimensions(vector)?;
        self.ensure_collection().await?;
        let body = json!({
            "points": [{ "id": id, "vector": vector, "payload": payload }]
        });
        let path = self.path("/points?wait=true");
        let _: Value = self.http.send_ok(Method::PUT, &path, Some(&body)).await?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> AiResult<Vec<VectorMatch>> {
        self.check_dimensions(vector)?;
        self.ensure_collection().await?;

        let mut body = json!({
            "vector": vector,
            "limit": limit.max(1),
            "with_payload": false,
        });
        if min_score > 0.0 {
            body["score_threshold"] = json!(min_score);
        }
        if let Some(filter) = filter_body(filter) {
            body["filter"] = filter;
        }

        let path = self.path("/points/search");
        let response: Envelope<Vec<ScoredPoint>> =
            self.http.send_ok(Method::POST, &path, Some(&body)).await?;
        Ok(response
            .result
            .into_iter()
            .map(|p| VectorMatch {
                id: point_id(&p.id),
                score: p.score,
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> AiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ensure_collection().await?;
        let body = json!({ "points": ids });
        let path = self.path("/points/delete?wait=true");
        let _: Value = self.http.send_ok(Method::POST, &path, Some(&body)).await?;
        Ok(())
    }

    async fn health(&self) -> AiResult<String> {
        let info: RootInfo = match self.http.get("/").await? {
            Ok(info) => info,
            Err(failure) => return Err(self.http.status_error("/", failure)),
        };
        Ok(format!(
            "qdrant {}",
            info.version.unwrap_or_else(|| "unknown".into())
        ))
    }
}
