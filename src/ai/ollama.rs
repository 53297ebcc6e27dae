//! Ollama client for embeddings (`/api/embeddings`) and completions (`/api/generate`).

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::http::JsonClient;
use super::{AiError, AiResult, Capability, ChatProvider, EmbeddingProvider};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: JsonClient,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

impl OllamaClient {
    /// Client serving `model` through the embeddings endpoint.
    pub fn embeddings(base_url: &str, model: &str) -> AiResult<Self> {
        Self::new(base_url, model, Capability::Embedding)
    }

    /// Client serving `model` through the generate endpoint.
    pub fn chat(base_url: &str, model: &str) -> AiResult<Self> {
        Self::new(base_url, model, Capability::Chat)
    }

    fn new(base_url: &str, model: &str, capability: Capability) -> AiResult<Self> {
        let model = model.trim();
        if model.is_empty() {
            return Err(AiError::backend(capability, "model name is empty"));
        }
        Ok(Self {
            http: JsonClient::new(base_url, capability)?,
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The server answers and lists the configured model.
    async fn check_model(&self) -> AiResult<String> {
        let tags: TagsResponse = match self.http.get("/api/tags").await? {
            Ok(tags) => tags,
            Err(failure) => return Err(self.http.status_error("/api/tags", failure)),
        };
        if tags.models.iter().any(|m| model_matches(&m.name, &self.model)) {
            Ok(self.model.clone())
        } else {
            Err(AiError::ModelMissing {
                model: self.model.clone(),
            })
        }
    }
}

/// `nomic-embed-text` matches an installed `nomic-embed-text:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted
        || (!wanted.contains(':')
            && installed
                .split_once(':')
                .is_some_and(|(name, _)| name == wanted))
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    async fn generate(&self, text: &str) -> AiResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let response: EmbeddingResponse = self
            .http
            .send_ok(Method::POST, "/api/embeddings", Some(&request))
            .await?;
        tracing::trace!(model = %self.model, dims = response.embedding.len(), "embedding generated");
        Ok(response.embedding)
    }

    async fn health(&self) -> AiResult<String> {
        self.check_model().await
    }
}

#[async_trait]
impl ChatProvider for OllamaClient {
    async fn complete(&self, prompt: &str) -> AiResult<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response: GenerateResponse = self
            .http
            .send_ok(Method::POST, "/api/generate", Some(&request))
            .await?;
        Ok(response.response)
    }

    async fn health(&self) -> AiResult<String> {
        self.check_model().await
    }
}
