//! Synthesizer.

use rune_llm::{GenerateOptions, LlmClient};
use rune_scribe::{Certainty, DecisionRecord};

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are Rune's recall synthesizer. You answer questions about an \
organization's past decisions using only the supplied records. Cite every claim by its record id in \
parentheses, e.g. (dec_20260101_decision_ab12cd34). Never introduce a fact that is not present in the \
records. Respect each record's certainty: state a `supported` record's content plainly, qualify a \
`partially_supported` record (e.g. \"it appears that...\"), and explicitly caveat an `unknown` record \
(e.g. \"it is unclear whether...\"). Never upgrade a record's certainty.";

/// Produces a cited natural-language answer from the decrypted top-k
/// records. Falls back to a deterministic
/// concatenation of titles, prefixed `"Found: "`, on any LLM failure —
/// the synthesizer must never turn a successful recall into an error.
pub async fn synthesize(
    llm: Option<&LlmClient>,
    query: &str,
    intent: &str,
    records: &[DecisionRecord],
) -> String {
    if records.is_empty() {
        return "No relevant records were found.".to_string();
    }

    if let Some(llm) = llm {
        if llm.is_available() {
            let prompt = build_prompt(query, intent, records);
            if let Ok(answer) = llm
                .generate(&prompt, GenerateOptions::with_system(SYNTHESIS_SYSTEM_PROMPT))
                .await
            {
                if !answer.trim().is_empty() {
                    return answer;
                }
            }
        }
    }

    fallback_answer(records)
}

fn build_prompt(query: &str, intent: &str, records: &[DecisionRecord]) -> String {
    let mut prompt = format!("Question: {query}\nIntent: {intent}\n\nRecords:\n");
    for record in records {
        prompt.push_str(&format!(
            "- id={} kind={:?} certainty={:?} title=\"{}\" body=\"{}\"\n",
            record.id, record.kind, record.certainty, record.title, record.body
        ));
    }
    prompt.push_str(
        "\nAnswer the question using only these records. Cite each claim's record id in parentheses.",
    );
    prompt
}

/// Deterministic fallback: `"Found: "` followed by the titles of the
/// surviving records, each qualified by its certainty caveat so a
/// `partially_supported` or `unknown` record is never stated as plainly
/// as a `supported` one even without the LLM.
fn fallback_answer(records: &[DecisionRecord]) -> String {
    let entries: Vec<String> = records
        .iter()
        .map(|r| format!("{}{}", certainty_caveat(r.certainty), r.title))
        .collect();
    format!("Found: {}", entries.join("; "))
}

/// Certainty-aware caveat phrase prefixed to a record's title in the
/// deterministic fallback.
fn certainty_caveat(certainty: Certainty) -> &'static str {
    match certainty {
        Certainty::Supported => "",
        Certainty::PartiallySupported => "it appears that ",
        Certainty::Unknown => "it is unclear whether ",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, title: &str, certainty: Certainty) -> DecisionRecord {
        DecisionRecord {
            id: id.to_string(),
            timestamp: Utc::now(),
            kind: rune_scribe::DecisionKind::Decision,
            title: title.to_string(),
            body: "body text".to_string(),
            participants: vec![],
            sources: vec![],
            certainty,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn no_llm_falls_back_to_found_prefix() {
        let records = vec![record("dec_1", "Adopt PostgreSQL", Certainty::Supported)];
        let answer = synthesize(None, "why postgres?", "generic", &records).await;
        assert_eq!(answer, "Found: Adopt PostgreSQL");
    }

    #[tokio::test]
    async fn empty_records_reports_no_results() {
        let answer = synthesize(None, "anything", "generic", &[]).await;
        assert_eq!(answer, "No relevant records were found.");
    }

    #[tokio::test]
    async fn unavailable_llm_falls_back() {
        let llm = LlmClient::anthropic("", "claude-3-5-sonnet-latest");
        let records = vec![
            record("dec_1", "Adopt PostgreSQL", Certainty::Supported),
            record("dec_2", "Deprecate Mongo", Certainty::Unknown),
        ];
        let answer = synthesize(Some(&llm), "why?", "generic", &records).await;
        assert_eq!(answer, "Found: Adopt PostgreSQL; it is unclear whether Deprecate Mongo");
    }

    #[test]
    fn certainty_caveat_matches_each_level() {
        assert_eq!(certainty_caveat(Certainty::Supported), "");
        assert!(certainty_caveat(Certainty::PartiallySupported).contains("appears"));
        assert!(certainty_caveat(Certainty::Unknown).contains("unclear"));
    }

    #[tokio::test]
    async fn fallback_caveats_partially_supported_records() {
        let records = vec![record("dec_1", "Sunset the monolith", Certainty::PartiallySupported)];
        let answer = synthesize(None, "are we sunsetting it?", "generic", &records).await;
        assert_eq!(answer, "Found: it appears that Sunset the monolith");
    }
}
