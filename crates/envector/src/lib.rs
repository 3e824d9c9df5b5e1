//! enVector Adapter.
//!
//! Owns a tenant-scoped session against the remote encrypted vector store.
//! Every operation is ciphertext-in, ciphertext-out except `insert`, which
//! accepts plaintext metadata and encrypts it (via the store's own opaque
//! `encrypt` RPC, using the tenant's public encryption key) before it ever
//! leaves this adapter. No component other than this one may speak the
//! enVector protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum EnvectorError {
    #[error("enVector store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Opaque ciphertext returned by the store's `search_returning_ciphertext`
/// RPC. Only the Vault Adapter can turn this into scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreCiphertext(pub String);

/// Opaque ciphertext returned by `fetch_metadata_ciphertext`. Only the
/// Vault Adapter can turn this into plaintext records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCiphertext(pub String);

pub struct EnvectorAdapter {
    endpoint: String,
    api_key: String,
    index: String,
    http: reqwest::Client,
    index_ensured: AtomicBool,
}

impl EnvectorAdapter {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            index: index.into(),
            http: reqwest::Client::new(),
            index_ensured: AtomicBool::new(false),
        }
    }

    /// Idempotent: ensures the configured index exists. Safe to call
    /// repeatedly or concurrently; only the first successful call within a
    /// process actually issues the RPC.
    pub async fn ensure_index(&self) -> Result<(), EnvectorError> {
        if self.index_ensured.load(Ordering::Acquire) {
            return Ok(());
        }
        let url = format!("{}/v1/indexes/{}", self.endpoint, self.index);
        self.with_retry(|| {
            let http = self.http.clone();
            let url = url.clone();
            let api_key = self.api_key.clone();
            async move {
                http.put(&url)
                    .bearer_auth(&api_key)
                    .json(&json!({ "name": &url }))
                    .send()
                    .await
            }
        })
        .await?;
        self.index_ensured.store(true, Ordering::Release);
        Ok(())
    }

    /// Encrypt `vector` and `metadata_plain` via the store's tenant key and
    /// insert the record. Returns the store-assigned record handle.
    /// enVector RPC failures (including retry exhaustion) surface as
    /// `store_unavailable` to the caller.
    pub async fn insert(&self, vector: &[f32], metadata_plain: &Value) -> Result<String, EnvectorError> {
        self.ensure_index().await?;

        let embedding_cipher = self.encrypt(&json!({ "vector": vector })).await?;
        let metadata_cipher = self.encrypt(metadata_plain).await?;

        let url = format!("{}/v1/indexes/{}/insert", self.endpoint, self.index);
        let response = self
            .with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let api_key = self.api_key.clone();
                let body = json!({
                    "embedding_ciphertext": embedding_cipher,
                    "metadata_ciphertext": metadata_cipher,
                });
                async move { http.post(&url).bearer_auth(&api_key).json(&body).send().await }
            })
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EnvectorError::StoreUnavailable(e.to_string()))?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| EnvectorError::StoreUnavailable("insert response missing id".to_string()))
    }

    /// `search(index, query_vector, k) -> score_ciphertext`. The query
    /// vector itself travels in plaintext — only stored
    /// embeddings and metadata are ciphertext; the similarity scoring
    /// happens homomorphically inside the remote store.
    pub async fn search(&self, query_vector: &[f32], k: usize) -> Result<ScoreCiphertext, EnvectorError> {
        let url = format!("{}/v1/indexes/{}/search", self.endpoint, self.index);
        let response = self
            .with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let api_key = self.api_key.clone();
                let body = json!({ "query_vector": query_vector, "k": k });
                async move { http.post(&url).bearer_auth(&api_key).json(&body).send().await }
            })
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EnvectorError::StoreUnavailable(e.to_string()))?;
        body.get("score_ciphertext")
            .and_then(|v| v.as_str())
            .map(|s| ScoreCiphertext(s.to_string()))
            .ok_or_else(|| EnvectorError::StoreUnavailable("search response missing score_ciphertext".to_string()))
    }

    /// `fetch_metadata(index, indices) -> metadata_ciphertext[]`.
    pub async fn fetch_metadata(&self, indices: &[u64]) -> Result<Vec<MetadataCiphertext>, EnvectorError> {
        let url = format!("{}/v1/indexes/{}/metadata", self.endpoint, self.index);
        let response = self
            .with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let api_key = self.api_key.clone();
                let body = json!({ "indices": indices });
                async move { http.post(&url).bearer_auth(&api_key).json(&body).send().await }
            })
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EnvectorError::StoreUnavailable(e.to_string()))?;
        let ciphers = body
            .get("metadata_ciphertext")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EnvectorError::StoreUnavailable("metadata response missing metadata_ciphertext".to_string()))?;
        Ok(ciphers
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| MetadataCiphertext(s.to_string()))
            .collect())
    }

    async fn encrypt(&self, plaintext: &Value) -> Result<String, EnvectorError> {
        let url = format!("{}/v1/encrypt", self.endpoint);
        let response = self
            .with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let api_key = self.api_key.clone();
                let body = json!({ "plaintext": plaintext });
                async move { http.post(&url).bearer_auth(&api_key).json(&body).send().await }
            })
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EnvectorError::StoreUnavailable(e.to_string()))?;
        body.get("ciphertext")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| EnvectorError::StoreUnavailable("encrypt response missing ciphertext".to_string()))
    }

    /// Session-level rate limiting is retried with exponential backoff up
    /// to [`MAX_RETRIES`] times before surfacing as `store_unavailable`
    /// to enVector.
    async fn with_retry<F, Fut>(&self, mut op: F) -> Result<reqwest::Response, EnvectorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(response) if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= MAX_RETRIES {
                        return Err(EnvectorError::StoreUnavailable(
                            "rate limited after exhausting retries".to_string(),
                        ));
                    }
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(attempt, ?backoff, "enVector rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    return Err(EnvectorError::StoreUnavailable(format!(
                        "enVector returned status {}",
                        response.status()
                    )))
                }
                Err(err) => {
                    if attempt >= MAX_RETRIES {
                        return Err(EnvectorError::StoreUnavailable(err.to_string()));
                    }
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(attempt, error = %err, ?backoff, "enVector transport error, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ciphertext_newtypes_round_trip_through_serde() {
        let score = ScoreCiphertext("abc123".to_string());
        let json = serde_json::to_string(&score).unwrap();
        let back: ScoreCiphertext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0, "abc123");
    }

    #[tokio::test]
    async fn ensure_index_is_idempotent_flagwise() {
        // Without a live server this just exercises the AtomicBool gate:
        // a fresh adapter reports the index as not-yet-ensured.
        let adapter = EnvectorAdapter::new("http://127.0.0.1:0", "key", "rune");
        assert!(!adapter.index_ensured.load(Ordering::Acquire));
    }
}
