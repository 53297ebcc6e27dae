//! Minimal JSON-over-HTTP helper shared by the Ollama and Qdrant clients.

use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::{AiError, AiResult, Capability};

/// Hard ceiling per request. [`super::AiServices`] applies the configured,
/// usually shorter, per-call budget on top.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) struct JsonClient {
    client: Client,
    base_url: String,
    capability: Capability,
}

/// A non-2xx response, kept so callers can special-case statuses like 404.
pub(crate) struct HttpFailure {
    pub status: StatusCode,
    pub body: String,
}

impl JsonClient {
    pub(crate) fn new(base_url: &str, capability: Capability) -> AiResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AiError::backend(
                capability,
                format!("invalid base url: {base_url:?}"),
            ));
        }
        let client = Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AiError::backend(capability, e))?;
        Ok(Self {
            client,
            base_url,
            capability,
        })
    }

    /// Send `body` (if any) and decode the response. Non-2xx statuses come back
    /// as `Ok(Err(failure))` so callers can inspect them.
    pub(crate) async fn send<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> AiResult<Result<T, HttpFailure>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            let bytes = serde_json::to_vec(body).map_err(|e| AiError::backend(self.capability, e))?;
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .body(bytes);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AiError::from_reqwest(self.capability, e, CLIENT_TIMEOUT))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AiError::from_reqwest(self.capability, e, CLIENT_TIMEOUT))?;

        if !status.is_success() {
            return Ok(Err(HttpFailure {
                status,
                body: String::from_utf8_lossy(&bytes).chars().take(500).collect(),
            }));
        }

        let decoded = serde_json::from_slice(&bytes).map_err(|e| {
            AiError::backend(self.capability, format!("malformed response from {url}: {e}"))
        })?;
        Ok(Ok(decoded))
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> AiResult<Result<T, HttpFailure>> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    /// Like [`Self::send`] but any non-2xx status is an error.
    pub(crate) async fn send_ok<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> AiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        match self.send(method, path, body).await? {
            Ok(value) => Ok(value),
            Err(failure) => Err(self.status_error(path, failure)),
        }
    }

    pub(crate) fn status_error(&self, path: &str, failure: HttpFailure) -> AiError {
        let message = format!("{path} returned {}: {}", failure.status, failure.body);
        if failure.status.is_server_error() {
            AiError::Unreachable {
                capability: self.capability,
                message,
            }
        } else {
            AiError::backend(self.capability, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = JsonClient::new(" http://localhost:11434/ ", Capability::Embedding).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn non_http_urls_are_rejected() {
        assert!(JsonClient::new("localhost:6333", Capability::VectorStore).is_err());
    }
}
