//! Vault Adapter.
//!
//! The Vault is the only process trusted with the tenant's private
//! decryption key and the only source of truth for access policy. This
//! adapter is a thin gRPC client: it never sees plaintext embeddings and
//! never makes a policy decision itself, it only relays the ciphertext
//! produced by the enVector Adapter and returns whatever the Vault
//! decided.

use std::time::Duration;

use thiserror::Error;
use tonic::transport::Channel;
use tonic::Request;

use rune_envector::{MetadataCiphertext, ScoreCiphertext};

pub mod proto {
    tonic::include_proto!("rune.vault.v1");
}

use proto::vault_client::VaultClient;
use proto::{DecryptMetadataRequest, DecryptScoresRequest, StatusRequest};

const CALL_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault unavailable: {0}")]
    VaultUnavailable(String),
    #[error("vault denied the request: {0}")]
    PolicyDenied(String),
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub index: u64,
    pub similarity: f32,
}

pub struct VaultStatus {
    pub reachable: bool,
    pub security_mode: String,
}

pub struct VaultAdapter {
    client: VaultClient<Channel>,
    tenant: String,
    bearer_token: String,
}

impl VaultAdapter {
    /// Connects lazily: building a [`VaultAdapter`] does no I/O at all, the
    /// TCP handshake happens on first RPC call. This keeps `build_pipelines`
    /// free of outbound I/O and lets `capture` (which never touches Vault)
    /// keep working while Vault is down; `recall` surfaces the dead
    /// connection as `vault_unavailable` through [`Self::classify`] on its
    /// first call instead.
    pub fn connect(endpoint: impl Into<String>, tenant: impl Into<String>, bearer_token: impl Into<String>) -> Result<Self, VaultError> {
        let channel = Channel::from_shared(endpoint.into())
            .map_err(|e| VaultError::VaultUnavailable(e.to_string()))?
            .connect_lazy();
        Ok(Self {
            client: VaultClient::new(channel),
            tenant: tenant.into(),
            bearer_token: bearer_token.into(),
        })
    }

    fn authed_request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(CALL_DEADLINE);
        if let Ok(value) = format!("Bearer {}", self.bearer_token).parse() {
            request.metadata_mut().insert("authorization", value);
        }
        request
    }

    /// Decrypts a `ScoreCiphertext` from the enVector Adapter into ranked
    /// `(record_id, score)` pairs, applying the tenant's access policy.
    /// Policy refusals surface as [`VaultError::PolicyDenied`], kept
    /// distinct from transport/availability failures so callers can
    /// decide whether a retry is sensible.
    pub async fn decrypt_scores(&mut self, score_ciphertext: &ScoreCiphertext, k: u32) -> Result<Vec<ScoredRecord>, VaultError> {
        let request = self.authed_request(DecryptScoresRequest {
            tenant: self.tenant.clone(),
            score_ciphertext: score_ciphertext.0.clone().into_bytes(),
            k,
        });
        let response = self.client.decrypt_scores(request).await.map_err(Self::classify)?;
        Ok(response
            .into_inner()
            .results
            .into_iter()
            .map(|r| ScoredRecord { index: r.index, similarity: r.similarity })
            .collect())
    }

    /// Decrypts a batch of `MetadataCiphertext` into plaintext JSON
    /// strings, one per input ciphertext, in the same order.
    pub async fn decrypt_metadata(&mut self, metadata_ciphertext: &[MetadataCiphertext]) -> Result<Vec<String>, VaultError> {
        let request = self.authed_request(DecryptMetadataRequest {
            tenant: self.tenant.clone(),
            metadata_ciphertext: metadata_ciphertext.iter().map(|c| c.0.clone().into_bytes()).collect(),
        });
        let response = self.client.decrypt_metadata(request).await.map_err(Self::classify)?;
        Ok(response.into_inner().metadata_json)
    }

    /// Reports whether the Vault is reachable and unsealed, surfaced by
    /// the `vault_status` MCP tool.
    pub async fn status(&mut self) -> Result<VaultStatus, VaultError> {
        let request = self.authed_request(StatusRequest {});
        let response = self.client.status(request).await.map_err(Self::classify)?;
        let inner = response.into_inner();
        Ok(VaultStatus { reachable: inner.reachable, security_mode: inner.security_mode })
    }

    fn classify(status: tonic::Status) -> VaultError {
        match status.code() {
            tonic::Code::PermissionDenied => VaultError::PolicyDenied(status.message().to_string()),
            _ => VaultError::VaultUnavailable(status.message().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_classifies_as_policy_denied() {
        let status = tonic::Status::permission_denied("no access to this tenant");
        match VaultAdapter::classify(status) {
            VaultError::PolicyDenied(msg) => assert!(msg.contains("no access")),
            other => panic!("expected PolicyDenied, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_classifies_as_vault_unavailable() {
        let status = tonic::Status::unavailable("connection refused");
        match VaultAdapter::classify(status) {
            VaultError::VaultUnavailable(msg) => assert!(msg.contains("connection refused")),
            other => panic!("expected VaultUnavailable, got {other:?}"),
        }
    }
}
