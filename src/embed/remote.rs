//! Remote embedding provider speaking the OpenAI-compatible
//! `/embeddings` wire format.
//!
//! Requests are timeout-bounded; failures and wrong-dimension responses
//! are retried a configurable number of times with linear backoff, and
//! whatever still fails surfaces to the chain so it can fall back to the
//! local model.

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::embed::{EmbedError, EmbeddingVector, TextEmbedder};

/// Provider tag for vectors produced over the wire.
pub const PROVIDER: &str = "remote";

pub struct RemoteTextEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    max_retries: usize,
}

impl RemoteTextEmbedder {
    /// Build a remote embedding client.
    ///
    /// `dimensions` is declared, not probed: the remote model must match
    /// the local fallback's dimension for the chain to be usable, and
    /// every response is checked against it.
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: &str,
        dimensions: usize,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self, EmbedError> {
        if model.trim().is_empty() {
            return Err(EmbedError::InvalidModel("empty remote model name".to_string()));
        }

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| EmbedError::InitFailed("invalid api key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| EmbedError::InitFailed(format!("cannot build http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", endpoint.trim_end_matches('/')),
            model: model.to_string(),
            dimensions,
            max_retries,
        })
    }

    fn request_once(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| self.provider_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.provider_error(format!("http status {status}")));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| self.provider_error(format!("malformed response: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(self.provider_error(format!(
                "got {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        parsed.data.sort_by_key(|entry| entry.index);

        parsed
            .data
            .into_iter()
            .map(|entry| {
                if entry.embedding.len() != self.dimensions {
                    return Err(EmbedError::DimensionMismatch {
                        provider: PROVIDER.to_string(),
                        expected: self.dimensions,
                        got: entry.embedding.len(),
                    });
                }
                Ok(EmbeddingVector {
                    values: entry.embedding,
                    provider: PROVIDER.to_string(),
                    space: self.model.clone(),
                })
            })
            .collect()
    }

    fn provider_error(&self, message: String) -> EmbedError {
        EmbedError::Provider {
            provider: PROVIDER.to_string(),
            message,
        }
    }
}

impl TextEmbedder for RemoteTextEmbedder {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn space(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
        if texts.is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let mut attempt = 0usize;
        loop {
            match self.request_once(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(err @ (EmbedError::Provider { .. } | EmbedError::DimensionMismatch { .. }))
                    if attempt < self.max_retries =>
                {
                    attempt += 1;
                    log::warn!("remote embedding attempt {attempt} failed: {err}, retrying");
                    std::thread::sleep(Duration::from_millis(200 * attempt as u64));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_model_rejected() {
        let result = RemoteTextEmbedder::new(
            "http://localhost:9999",
            "",
            "key",
            384,
            Duration::from_secs(1),
            0,
        );
        assert!(matches!(result, Err(EmbedError::InvalidModel(_))));
    }

    #[test]
    fn test_endpoint_normalization() {
        let embedder = RemoteTextEmbedder::new(
            "http://localhost:9999/v1/",
            "text-embedding-3-small",
            "key",
            1536,
            Duration::from_secs(1),
            0,
        )
        .unwrap();
        assert_eq!(embedder.endpoint, "http://localhost:9999/v1/embeddings");
        assert_eq!(embedder.space(), "text-embedding-3-small");
    }

    #[test]
    fn test_unreachable_endpoint_is_provider_error() {
        let embedder = RemoteTextEmbedder::new(
            "http://127.0.0.1:1",
            "text-embedding-3-small",
            "key",
            1536,
            Duration::from_millis(100),
            0,
        )
        .unwrap();
        let result = embedder.embed_text(&["x".to_string()]);
        assert!(matches!(result, Err(EmbedError::Provider { .. })));
    }
}
