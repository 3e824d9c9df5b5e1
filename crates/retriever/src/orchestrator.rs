//! Recall Orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use rune_config::RetrieverConfig;
use rune_envector::EnvectorAdapter;
use rune_llm::LlmClient;
use rune_scribe::{DecisionRecord, EmbedFn};
use rune_vault::VaultAdapter;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::query::{process_query, QueryPlan};
use crate::synth::synthesize;

const MIN_TOPK: usize = 1;
const MAX_TOPK: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub id: String,
    pub title: String,
    pub certainty: rune_scribe::Certainty,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallOutcome {
    pub ok: bool,
    pub found: usize,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f32,
    pub warnings: Vec<String>,
    pub related_queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecallOutcome {
    fn error(kind: &str) -> Self {
        Self {
            ok: false,
            found: 0,
            answer: String::new(),
            sources: Vec::new(),
            confidence: 0.0,
            warnings: Vec::new(),
            related_queries: Vec::new(),
            error: Some(kind.to_string()),
        }
    }
}

/// Transient merge candidate: exists only for
/// the duration of one `recall` call.
#[derive(Debug, Clone)]
struct RecallCandidate {
    index: u64,
    similarity: f32,
}

/// Multi-query expansion, encrypted top-k search, Vault-mediated decrypt,
/// metadata fetch, and LLM synthesis. Owned as a plain struct,
/// no trait objects. The enVector Adapter is shared immutably;
/// the Vault Adapter requires `&mut self` per call, so it is leased through
/// a mutex — a single-connection approximation of the "connections leased
/// per-call" pool.
pub struct RecallPipeline {
    config: RetrieverConfig,
    embed: EmbedFn,
    envector: Arc<EnvectorAdapter>,
    vault: Arc<AsyncMutex<VaultAdapter>>,
    query_llm: Option<LlmClient>,
    synth_llm: Option<LlmClient>,
}

impl RecallPipeline {
    pub fn new(
        config: RetrieverConfig,
        embed: EmbedFn,
        envector: Arc<EnvectorAdapter>,
        vault: Arc<AsyncMutex<VaultAdapter>>,
        query_llm: Option<LlmClient>,
        synth_llm: Option<LlmClient>,
    ) -> Self {
        Self { config, embed, envector, vault, query_llm, synth_llm }
    }

    /// Runs the full `recall` contract end to end.
    pub async fn recall(&self, query: &str, topk: Option<usize>) -> RecallOutcome {
        let topk = match self.resolve_topk(topk) {
            Some(k) => k,
            None => return RecallOutcome::error("bad_argument"),
        };

        let plan = process_query(query, self.query_llm.as_ref()).await;

        let branch_results = join_all(plan.queries.iter().map(|q| self.search_one(q, topk))).await;

        let mut merged: HashMap<u64, f32> = HashMap::new();
        for branch in branch_results {
            match branch {
                Ok(candidates) => {
                    for c in candidates {
                        merged
                            .entry(c.index)
                            .and_modify(|sim| *sim = sim.max(c.similarity))
                            .or_insert(c.similarity);
                    }
                }
                Err(kind) => return RecallOutcome::error(kind),
            }
        }

        let mut survivors: Vec<RecallCandidate> = merged
            .into_iter()
            .map(|(index, similarity)| RecallCandidate { index, similarity })
            .collect();
        // Strictly descending similarity; ties broken by ascending index for
        // determinism.
        survivors.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });
        survivors.truncate(topk);

        if survivors.is_empty() {
            return RecallOutcome {
                ok: true,
                found: 0,
                answer: "No relevant records were found.".to_string(),
                sources: Vec::new(),
                confidence: 0.0,
                warnings: Vec::new(),
                related_queries: related_queries(&plan, query),
                error: None,
            };
        }

        let indices: Vec<u64> = survivors.iter().map(|c| c.index).collect();
        let records = match self.fetch_records(&indices).await {
            Ok(records) => records,
            Err(kind) => return RecallOutcome::error(kind),
        };

        let confidence = mean(survivors.iter().map(|c| c.similarity));
        let mut warnings = Vec::new();
        if confidence < self.config.confidence_threshold {
            warnings.push("low_confidence".to_string());
        }

        let answer = synthesize(self.synth_llm.as_ref(), query, &plan.intent, &records).await;

        let sources = records
            .iter()
            .map(|r| SourceRef { id: r.id.clone(), title: r.title.clone(), certainty: r.certainty })
            .collect();

        RecallOutcome {
            ok: true,
            found: records.len(),
            answer,
            sources,
            confidence,
            warnings,
            related_queries: related_queries(&plan, query),
            error: None,
        }
    }

    fn resolve_topk(&self, requested: Option<usize>) -> Option<usize> {
        resolve_topk(&self.config, requested)
    }

    async fn search_one(&self, query_text: &str, topk: usize) -> Result<Vec<RecallCandidate>, &'static str> {
        let Some(embedding) = (self.embed)(query_text) else {
            return Err("internal");
        };

        let cipher = self
            .envector
            .search(&embedding, topk)
            .await
            .map_err(|_| "store_unavailable")?;

        let mut vault = self.vault.lock().await;
        let scored = vault
            .decrypt_scores(&cipher, topk as u32)
            .await
            .map_err(classify_vault_error)?;

        Ok(scored
            .into_iter()
            .map(|s| RecallCandidate { index: s.index, similarity: s.similarity })
            .collect())
    }

    async fn fetch_records(&self, indices: &[u64]) -> Result<Vec<DecisionRecord>, &'static str> {
        let cipher = self
            .envector
            .fetch_metadata(indices)
            .await
            .map_err(|_| "store_unavailable")?;

        let mut vault = self.vault.lock().await;
        let plaintexts = vault.decrypt_metadata(&cipher).await.map_err(classify_vault_error)?;

        Ok(plaintexts
            .iter()
            .filter_map(|json| serde_json::from_str::<DecisionRecord>(json).ok())
            .collect())
    }
}

fn classify_vault_error(err: rune_vault::VaultError) -> &'static str {
    match err {
        rune_vault::VaultError::PolicyDenied(_) => "policy_denied",
        rune_vault::VaultError::VaultUnavailable(_) => "vault_unavailable",
    }
}

fn resolve_topk(config: &RetrieverConfig, requested: Option<usize>) -> Option<usize> {
    match requested {
        Some(k) if (MIN_TOPK..=MAX_TOPK).contains(&k) => Some(k),
        Some(_) => None,
        None => Some(config.topk.clamp(MIN_TOPK, MAX_TOPK)),
    }
}

fn related_queries(plan: &QueryPlan, original: &str) -> Vec<String> {
    plan.queries.iter().filter(|q| q.as_str() != original).cloned().collect()
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(std::iter::empty()), 0.0);
    }

    #[test]
    fn mean_averages_values() {
        assert!((mean(vec![0.4, 0.6].into_iter()) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn resolve_topk_rejects_out_of_range() {
        let config = RetrieverConfig::default();
        assert_eq!(resolve_topk(&config, Some(0)), None);
        assert_eq!(resolve_topk(&config, Some(11)), None);
        assert_eq!(resolve_topk(&config, Some(5)), Some(5));
    }

    #[test]
    fn resolve_topk_defaults_from_config() {
        let config = RetrieverConfig::default();
        assert_eq!(resolve_topk(&config, None), Some(5));
    }

    #[test]
    fn related_queries_excludes_the_original() {
        let plan = QueryPlan { intent: "generic".into(), entities: vec![], queries: vec!["a".into(), "b".into()] };
        assert_eq!(related_queries(&plan, "a"), vec!["b".to_string()]);
    }
}
