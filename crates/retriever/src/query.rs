//! Query Processor.

use rune_llm::{parse_llm_json_as, GenerateOptions, LlmClient};
use serde::{Deserialize, Serialize};

const MAX_EXPANDED_QUERIES: usize = 4;

/// `QueryPlan = {intent, entities, queries[1..M]}`. Produced by
/// a single LLM call when a provider is available, or deterministically
/// from the raw query text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub intent: String,
    #[serde(default)]
    pub entities: Vec<String>,
    pub queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    queries: Vec<String>,
}

impl QueryPlan {
    /// Deterministic fallback used when no LLM is configured or available
    /// `queries = [original]`, `intent = "generic"`,
    /// `entities = []`.
    pub fn fallback(original: &str) -> Self {
        Self {
            intent: "generic".to_string(),
            entities: Vec::new(),
            queries: vec![original.to_string()],
        }
    }
}

/// Expands `query` into a [`QueryPlan`] with up to `M <= 4` query strings
/// via a single LLM call. Falls back deterministically on a missing/unavailable
/// LLM or on an unparsable response — the Query Processor must never fail
/// the `recall` call outright.
pub async fn process_query(query: &str, llm: Option<&LlmClient>) -> QueryPlan {
    let Some(llm) = llm else {
        return QueryPlan::fallback(query);
    };
    if !llm.is_available() {
        return QueryPlan::fallback(query);
    }

    let prompt = format!(
        "Expand this question into a search plan as JSON {{\"intent\": string, \
         \"entities\": [string], \"queries\": [string]}} with at most {MAX_EXPANDED_QUERIES} \
         alternate phrasings of the question (include the original).\n\nQuestion: {query}"
    );

    let raw = match llm.generate(&prompt, GenerateOptions::default()).await {
        Ok(raw) => raw,
        Err(_) => return QueryPlan::fallback(query),
    };

    match parse_llm_json_as::<RawPlan>(&raw) {
        Some(plan) if !plan.queries.is_empty() => QueryPlan {
            intent: plan.intent.unwrap_or_else(|| "generic".to_string()),
            entities: plan.entities,
            queries: plan.queries.into_iter().take(MAX_EXPANDED_QUERIES).collect(),
        },
        _ => QueryPlan::fallback(query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_llm_falls_back_deterministically() {
        let plan = process_query("why postgres?", None).await;
        assert_eq!(plan, QueryPlan::fallback("why postgres?"));
    }

    #[tokio::test]
    async fn unavailable_llm_falls_back_deterministically() {
        let llm = LlmClient::anthropic("", "claude-3-5-sonnet-latest");
        let plan = process_query("why postgres?", Some(&llm)).await;
        assert_eq!(plan, QueryPlan::fallback("why postgres?"));
    }

    #[test]
    fn fallback_has_single_query_and_generic_intent() {
        let plan = QueryPlan::fallback("hello");
        assert_eq!(plan.intent, "generic");
        assert!(plan.entities.is_empty());
        assert_eq!(plan.queries, vec!["hello".to_string()]);
    }
}
