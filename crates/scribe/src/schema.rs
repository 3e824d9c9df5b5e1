//! Decision Record schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Decision,
    Rationale,
    Policy,
    Lesson,
    Insight,
}

impl DecisionKind {
    fn slug(&self) -> &'static str {
        match self {
            DecisionKind::Decision => "decision",
            DecisionKind::Rationale => "rationale",
            DecisionKind::Policy => "policy",
            DecisionKind::Lesson => "lesson",
            DecisionKind::Insight => "insight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    Supported,
    PartiallySupported,
    Unknown,
}

/// The canonical captured entity. Once inserted, `(id, embedding,
/// metadata_cipher)` is immutable — deletions are allowed, updates are not.
/// `certainty` is fixed at capture time and must survive recall unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DecisionKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub certainty: Certainty,
    #[serde(default)]
    pub tags: Vec<String>,
}

const MAX_TITLE_CHARS: usize = 140;
const MAX_BODY_BYTES: usize = 4096;

impl DecisionRecord {
    /// Generates a fresh id in the
    /// `dec_{YYYYMMDD}_{kind_slug}_{8 lowercase hex chars}` format.
    pub fn new_id(kind: DecisionKind, now: DateTime<Utc>) -> String {
        let date = now.format("%Y%m%d");
        let rand = Uuid::new_v4().simple().to_string()[..8].to_string();
        format!("dec_{date}_{}_{rand}", kind.slug())
    }

    /// Truncates `title`/`body` to their length caps so a record is
    /// always safe to insert regardless of extractor output length.
    pub fn clamp(mut self) -> Self {
        self.title = truncate_chars(&self.title, MAX_TITLE_CHARS);
        self.body = truncate_bytes(&self.body, MAX_BODY_BYTES);
        self
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_matches_expected_shape() {
        let now = Utc::now();
        let id = DecisionRecord::new_id(DecisionKind::Insight, now);
        assert!(id.starts_with(&format!("dec_{}_insight_", now.format("%Y%m%d"))));
        assert_eq!(id.len(), "dec_YYYYMMDD_insight_".len() + 8);
    }

    #[test]
    fn clamp_truncates_long_title_and_body() {
        let record = DecisionRecord {
            id: "dec_20260101_insight_aaaaaaaa".to_string(),
            timestamp: Utc::now(),
            kind: DecisionKind::Insight,
            title: "x".repeat(500),
            body: "y".repeat(10_000),
            participants: vec![],
            sources: vec![],
            certainty: Certainty::Unknown,
            tags: vec![],
        }
        .clamp();
        assert_eq!(record.title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(record.body.len(), MAX_BODY_BYTES);
    }
}
