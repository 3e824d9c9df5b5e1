//! Embedding Service adapter.
//!
//! The embedding model is an external collaborator consumed through a
//! synchronous `embed(text) -> f32[D]` contract, unlike the LLM Client's
//! async `generate`. Built on `reqwest::blocking::Client` rather than the
//! async client the other adapters share so it can be handed to the
//! capture/recall pipelines as a plain `Fn(&str) -> Option<Vec<f32>>`
//! closure, called directly from their async methods the same way the
//! rest of this workspace's `EmbedFn` callers do.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8790/embed";
const DEFAULT_DIMENSION: usize = 384;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("embedding service returned dimension {got}, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// A thin HTTP client over the installation's embedding model. `dimension`
/// is fixed per installation (stable across the life of an installation,
/// e.g. 384 for the multilingual MiniLM family) and every returned vector is
/// validated against it so a misconfigured sidecar fails loudly rather
/// than silently corrupting cosine similarity math downstream.
#[derive(Clone)]
pub struct EmbeddingClient {
    endpoint: String,
    dimension: usize,
    http: reqwest::blocking::Client,
}

impl EmbeddingClient {
    pub fn new(endpoint: impl Into<String>, dimension: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            dimension,
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Builds a client from `RUNE_EMBEDDING_ENDPOINT` / `RUNE_EMBEDDING_DIMENSION`
    /// environment variables, falling back to a local sidecar default.
    pub fn from_env() -> Self {
        let endpoint = std::env::var("RUNE_EMBEDDING_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let dimension = std::env::var("RUNE_EMBEDDING_DIMENSION")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DIMENSION);
        Self::new(endpoint, dimension)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// `embed(text) -> f32[D]`. Blocking by contract.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&EmbedRequest { text })
            .send()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Unavailable(format!(
                "embedding service returned status {}",
                response.status()
            )));
        }

        let body: EmbedResponse = response
            .json()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        if body.embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                got: body.embedding.len(),
                expected: self.dimension,
            });
        }
        Ok(body.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_defaults_when_unset() {
        // SAFETY: single-threaded test process; no concurrent env readers.
        unsafe {
            std::env::remove_var("RUNE_EMBEDDING_ENDPOINT");
            std::env::remove_var("RUNE_EMBEDDING_DIMENSION");
        }
        let client = EmbeddingClient::from_env();
        assert_eq!(client.dimension(), DEFAULT_DIMENSION);
        assert_eq!(client.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn unreachable_endpoint_surfaces_unavailable() {
        let client = EmbeddingClient::new("http://127.0.0.1:1", 384);
        let err = client.embed("hello").unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }
}
