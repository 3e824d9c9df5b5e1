//! Capture pipeline orchestration.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rune_config::ScribeConfig;
use rune_envector::EnvectorAdapter;
use rune_llm::{parse_llm_json_as, GenerateOptions, LlmClient};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::schema::{Certainty, DecisionKind, DecisionRecord};
use crate::tier1::{matches_capture_trigger, ExemplarCache};

/// Synchronous embedding backend, injected so tests and callers can supply
/// a fake without this crate depending on a concrete embedding model
/// (the embedding service itself lives outside this pipeline).
pub type EmbedFn = Arc<dyn Fn(&str) -> Option<Vec<f32>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub ok: bool,
    pub captured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureOutcome {
    fn dropped(reason: &str) -> Self {
        Self { ok: true, captured: false, record_id: None, reason: Some(reason.to_string()), error: None }
    }

    fn stored(record_id: String) -> Self {
        Self { ok: true, captured: true, record_id: Some(record_id), reason: None, error: None }
    }

    fn failed(error: &str) -> Self {
        Self { ok: true, captured: false, record_id: None, reason: None, error: Some(error.to_string()) }
    }
}

#[derive(Debug, Deserialize)]
struct Tier2Decision {
    capture: bool,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

/// Three-stage capture cascade: local similarity filter, LLM policy
/// classifier, LLM structured extractor, followed by encrypted insertion
/// into the remote store. Owned as a plain struct, no trait objects or
/// dynamic dispatch over ad-hoc pipeline types.
pub struct CapturePipeline {
    config: ScribeConfig,
    embed: EmbedFn,
    tier1: Mutex<ExemplarCache>,
    tier2_llm: Option<LlmClient>,
    tier3_llm: Option<LlmClient>,
    envector: Arc<EnvectorAdapter>,
}

impl CapturePipeline {
    pub fn new(
        config: ScribeConfig,
        embed: EmbedFn,
        tier2_llm: Option<LlmClient>,
        tier3_llm: Option<LlmClient>,
        envector: Arc<EnvectorAdapter>,
    ) -> Self {
        let tier1 = Mutex::new(ExemplarCache::new(config.tier1_cache_size));
        Self { config, embed, tier1, tier2_llm, tier3_llm, envector }
    }

    /// Runs the full `capture` contract end to end.
    pub async fn capture(&self, text: &str) -> CaptureOutcome {
        if text.trim().is_empty() {
            return CaptureOutcome::dropped("empty");
        }

        let Some(embedding) = (self.embed)(text) else {
            return CaptureOutcome::failed("embedding_unavailable");
        };

        let (skip_tier2, tier1_accept) = match self.run_tier1(text, &embedding) {
            Tier1Verdict::Duplicate => {
                self.update_tier1(embedding, false);
                return CaptureOutcome::dropped("duplicate");
            }
            Tier1Verdict::Noise => {
                self.update_tier1(embedding, false);
                return CaptureOutcome::dropped("below_threshold");
            }
            Tier1Verdict::AutoCapture => (true, true),
            Tier1Verdict::Pass => (false, true),
        };

        if !skip_tier2 && self.config.tier2_enabled {
            if let Some(reason) = self.run_tier2(text).await {
                self.update_tier1(embedding, false);
                return CaptureOutcome::dropped(&reason);
            }
        }

        let record = self.run_tier3(text).await;

        let metadata = json!({
            "id": record.id,
            "timestamp": record.timestamp,
            "kind": record.kind,
            "title": record.title,
            "body": record.body,
            "participants": record.participants,
            "sources": record.sources,
            "certainty": record.certainty,
            "tags": record.tags,
        });

        match self.envector.insert(&embedding, &metadata).await {
            Ok(_) => {
                self.update_tier1(embedding, tier1_accept);
                CaptureOutcome::stored(record.id)
            }
            Err(err) => {
                tracing::warn!(error = %err, "enVector insert failed during capture");
                CaptureOutcome::failed("store_unavailable")
            }
        }
    }

    fn run_tier1(&self, text: &str, embedding: &[f32]) -> Tier1Verdict {
        let cache = self.tier1.lock().unwrap();
        let Some(max_sim) = cache.max_similarity(embedding) else {
            // Nothing cached yet: nothing to be a duplicate of, and no
            // exemplar to measure noise against, so this is a pass.
            return Tier1Verdict::Pass;
        };

        if max_sim >= self.config.duplicate_threshold {
            return Tier1Verdict::Duplicate;
        }
        if max_sim >= self.config.auto_capture_threshold {
            return Tier1Verdict::AutoCapture;
        }
        if max_sim < self.config.similarity_threshold && !matches_capture_trigger(text) {
            return Tier1Verdict::Noise;
        }
        Tier1Verdict::Pass
    }

    fn update_tier1(&self, embedding: Vec<f32>, accepted: bool) {
        self.tier1.lock().unwrap().push(embedding, accepted);
    }

    /// Tier-2 policy filter. Returns `Some(reason)` if the candidate should
    /// be dropped, `None` if it should pass. Fails open: any LLM
    /// unavailability or unparsable response defaults to `capture:true`
    /// so a transient glitch never silently drops a
    /// decision.
    async fn run_tier2(&self, text: &str) -> Option<String> {
        let Some(llm) = &self.tier2_llm else { return None };
        if !llm.is_available() {
            return None;
        }

        let prompt = format!(
            "Decide whether this utterance is worth remembering as an organizational decision, \
             rationale, policy, lesson, or insight. Respond with JSON {{\"capture\": bool, \"reason\": string}}.\n\n\
             Utterance: {text}"
        );
        let raw = match llm.generate(&prompt, GenerateOptions::default()).await {
            Ok(raw) => raw,
            Err(_) => return None,
        };

        match parse_llm_json_as::<Tier2Decision>(&raw) {
            Some(decision) if !decision.capture => Some(decision.reason),
            Some(_) => None,
            None => None,
        }
    }

    /// Tier-3 structured extractor. Always runs once the pipeline reaches
    /// it. Degrades to a minimal record on any failure, never drops.
    async fn run_tier3(&self, text: &str) -> DecisionRecord {
        if let Some(llm) = &self.tier3_llm {
            if llm.is_available() {
                let prompt = format!(
                    "Extract a structured organizational decision record from this utterance as JSON with \
                     fields kind (decision|rationale|policy|lesson|insight), title (<=140 chars), body, \
                     participants (array of strings), sources (array of strings), \
                     certainty (supported|partially_supported|unknown), tags (array of strings).\n\n\
                     Utterance: {text}"
                );
                if let Ok(raw) = llm.generate(&prompt, GenerateOptions::default()).await {
                    if let Some(record) = parse_extracted_record(&raw, text) {
                        return record;
                    }
                }
            }
        }
        minimal_record(text)
    }
}

enum Tier1Verdict {
    Duplicate,
    Noise,
    AutoCapture,
    Pass,
}

#[derive(Debug, Deserialize)]
struct ExtractedFields {
    kind: Option<String>,
    title: Option<String>,
    body: Option<String>,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default)]
    sources: Vec<String>,
    certainty: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn parse_extracted_record(raw: &str, fallback_text: &str) -> Option<DecisionRecord> {
    let fields = parse_llm_json_as::<ExtractedFields>(raw)?;
    let kind = parse_kind(fields.kind.as_deref()).unwrap_or(DecisionKind::Insight);
    let certainty = parse_certainty(fields.certainty.as_deref()).unwrap_or(Certainty::Unknown);
    let now = Utc::now();
    Some(
        DecisionRecord {
            id: DecisionRecord::new_id(kind, now),
            timestamp: now,
            kind,
            title: fields.title.unwrap_or_else(|| first_chars(fallback_text, 120)),
            body: fields.body.unwrap_or_else(|| fallback_text.to_string()),
            participants: fields.participants,
            sources: fields.sources,
            certainty,
            tags: fields.tags,
        }
        .clamp(),
    )
}

/// Minimal degraded record: `kind=insight`,
/// `title=first 120 chars`, `body=text`, `certainty=unknown`.
fn minimal_record(text: &str) -> DecisionRecord {
    let now = Utc::now();
    DecisionRecord {
        id: DecisionRecord::new_id(DecisionKind::Insight, now),
        timestamp: now,
        kind: DecisionKind::Insight,
        title: first_chars(text, 120),
        body: text.to_string(),
        participants: Vec::new(),
        sources: Vec::new(),
        certainty: Certainty::Unknown,
        tags: Vec::new(),
    }
    .clamp()
}

fn first_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

fn parse_kind(raw: Option<&str>) -> Option<DecisionKind> {
    match raw? {
        "decision" => Some(DecisionKind::Decision),
        "rationale" => Some(DecisionKind::Rationale),
        "policy" => Some(DecisionKind::Policy),
        "lesson" => Some(DecisionKind::Lesson),
        "insight" => Some(DecisionKind::Insight),
        _ => None,
    }
}

fn parse_certainty(raw: Option<&str>) -> Option<Certainty> {
    match raw? {
        "supported" => Some(Certainty::Supported),
        "partially_supported" => Some(Certainty::PartiallySupported),
        "unknown" => Some(Certainty::Unknown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_embed(v: Vec<f32>) -> EmbedFn {
        Arc::new(move |_text: &str| Some(v.clone()))
    }

    #[tokio::test]
    async fn empty_text_is_dropped_as_empty() {
        let pipeline = CapturePipeline::new(
            ScribeConfig::default(),
            fixed_embed(vec![1.0, 0.0]),
            None,
            None,
            Arc::new(EnvectorAdapter::new("http://127.0.0.1:0", "key", "rune")),
        );
        let outcome = pipeline.capture("   ").await;
        assert!(outcome.ok);
        assert!(!outcome.captured);
        assert_eq!(outcome.reason.as_deref(), Some("empty"));
    }

    #[tokio::test]
    async fn first_ever_candidate_is_a_tier1_pass() {
        let pipeline = CapturePipeline::new(
            ScribeConfig::default(),
            fixed_embed(vec![1.0, 0.0]),
            None,
            None,
            Arc::new(EnvectorAdapter::new("http://127.0.0.1:0", "key", "rune")),
        );
        let verdict = pipeline.run_tier1("we decided to ship", &[1.0, 0.0]);
        assert!(matches!(verdict, Tier1Verdict::Pass));
    }

    #[test]
    fn minimal_record_degrades_correctly() {
        let record = minimal_record("a very important utterance about the roadmap");
        assert_eq!(record.kind, DecisionKind::Insight);
        assert_eq!(record.certainty, Certainty::Unknown);
        assert!(record.title.starts_with("a very important"));
    }

    #[test]
    fn duplicate_threshold_wins_over_auto_capture_threshold() {
        let mut config = ScribeConfig::default();
        config.duplicate_threshold = 0.9;
        config.auto_capture_threshold = 0.8;
        let pipeline = CapturePipeline::new(
            config,
            fixed_embed(vec![1.0, 0.0]),
            None,
            None,
            Arc::new(EnvectorAdapter::new("http://127.0.0.1:0", "key", "rune")),
        );
        pipeline.update_tier1(vec![1.0, 0.0], true);
        let verdict = pipeline.run_tier1("anything", &[1.0, 0.0]);
        assert!(matches!(verdict, Tier1Verdict::Duplicate));
    }
}
