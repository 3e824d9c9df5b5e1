//! Builds and rebuilds the capture/recall pipelines from an [`AppConfig`].
//!
//! Each LLM-backed stage owns its own [`LlmClient`], constructed fresh here
//! rather than shared, so a reload can pick up a changed provider/model for
//! one stage without disturbing another. The enVector and Vault adapters are
//! the opposite: a single session each, shared across capture and recall.

use std::sync::Arc;

use anyhow::{Context, Result};
use rune_config::AppConfig;
use rune_embedding::EmbeddingClient;
use rune_envector::EnvectorAdapter;
use rune_llm::LlmClient;
use rune_retriever::RecallPipeline;
use rune_scribe::{CapturePipeline, EmbedFn};
use rune_vault::VaultAdapter;
use tokio::sync::Mutex as AsyncMutex;

/// Everything a tool call needs, rebuilt atomically on config reload and
/// swapped in behind a single `RwLock<Arc<Pipelines>>` so in-flight calls
/// always see a fully-initialized snapshot.
pub struct Pipelines {
    pub capture: CapturePipeline,
    pub recall: RecallPipeline,
    pub vault: Arc<AsyncMutex<VaultAdapter>>,
}

fn build_llm(config: &AppConfig, kind: Option<rune_config::LlmProviderKind>) -> Option<LlmClient> {
    use rune_config::LlmProviderKind::*;
    match kind? {
        Anthropic => Some(LlmClient::anthropic(&config.llm.anthropic_api_key, &config.llm.anthropic_model)),
        Openai => Some(LlmClient::openai(&config.llm.openai_api_key, &config.llm.openai_model)),
        Google => Some(LlmClient::google(&config.llm.google_api_key, &config.llm.google_model)),
    }
}

fn build_tier2_llm(config: &AppConfig) -> Option<LlmClient> {
    if !config.scribe.tier2_enabled {
        return None;
    }
    build_llm(config, config.llm.resolve_tier2())
}

fn build_embed_fn() -> EmbedFn {
    let client = EmbeddingClient::from_env();
    Arc::new(move |text: &str| client.embed(text).ok())
}

/// Builds a fresh [`Pipelines`] snapshot from `config`. Called once at
/// startup and again on every `reload_pipelines` call.
pub async fn build_pipelines(config: &AppConfig) -> Result<Pipelines> {
    let envector = Arc::new(EnvectorAdapter::new(
        config.envector.endpoint.clone(),
        config.envector.api_key.clone(),
        config.envector.index.clone(),
    ));

    let vault = Arc::new(AsyncMutex::new(
        VaultAdapter::connect(config.vault.endpoint.clone(), config.envector.index.clone(), config.vault.token.clone())
            .context("connecting to Vault")?,
    ));

    let capture = CapturePipeline::new(
        config.scribe.clone(),
        build_embed_fn(),
        build_tier2_llm(config),
        build_llm(config, config.llm.resolve_primary()),
        envector.clone(),
    );

    let recall = RecallPipeline::new(
        config.retriever.clone(),
        build_embed_fn(),
        envector,
        vault.clone(),
        build_llm(config, config.llm.resolve_primary()),
        build_llm(config, config.llm.resolve_primary()),
    );

    Ok(Pipelines { capture, recall, vault })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rune_config::AppConfig;

    #[test]
    fn build_llm_returns_none_without_a_resolvable_provider() {
        let config = AppConfig::default();
        assert!(build_llm(&config, config.llm.resolve_primary()).is_none());
    }

    #[test]
    fn build_llm_resolves_the_configured_provider() {
        let mut config = AppConfig::default();
        config.llm.anthropic_api_key = "key".to_string();
        let client = build_llm(&config, config.llm.resolve_primary());
        assert!(client.is_some_and(|c| c.is_available()));
    }

    #[test]
    fn build_tier2_llm_is_none_when_tier2_disabled() {
        let mut config = AppConfig::default();
        config.llm.anthropic_api_key = "key".to_string();
        config.llm.tier2_provider = "anthropic".to_string();
        config.scribe.tier2_enabled = false;
        assert!(build_tier2_llm(&config).is_none());
    }

    #[test]
    fn build_tier2_llm_resolves_when_enabled_and_configured() {
        let mut config = AppConfig::default();
        config.llm.anthropic_api_key = "key".to_string();
        config.llm.tier2_provider = "anthropic".to_string();
        assert!(build_tier2_llm(&config).is_some());
    }
}
