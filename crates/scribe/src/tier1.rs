//! Tier-1 Similarity Filter and its Exemplar Cache.

use std::collections::VecDeque;

/// Bounded ordered sequence of the most recently captured `(embedding,
/// accepted)` pairs. Eviction is least-recently-inserted (pop-front on
/// overflow). Process-local and rebuilt empty on `reload_pipelines` — Rune
/// keeps no local record store, so there is nothing to replay from disk
/// (a deliberate design decision, not an incidental default).
pub struct ExemplarCache {
    capacity: usize,
    entries: VecDeque<(Vec<f32>, bool)>,
}

impl ExemplarCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, embedding: Vec<f32>, accepted: bool) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((embedding, accepted));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the maximum cosine similarity between `v` and any cached
    /// exemplar, or `None` if the cache is empty.
    pub fn max_similarity(&self, v: &[f32]) -> Option<f32> {
        self.entries
            .iter()
            .map(|(e, _)| cosine_similarity(v, e))
            .fold(None, |acc, sim| Some(acc.map_or(sim, |m: f32| m.max(sim))))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

/// Localized table of decision-indicating phrases: a
/// noise-suppressed candidate is still captured if it matches one of
/// these, regardless of how far it sits from any known exemplar.
const CAPTURE_TRIGGER_PHRASES: &[&str] = &[
    // English
    "we decided",
    "let's go with",
    "the decision is",
    "we agreed",
    "final answer",
    // Spanish
    "hemos decidido",
    "decidimos",
    // French
    "nous avons décidé",
    "la décision est",
    // German
    "wir haben uns entschieden",
    "die entscheidung ist",
    // Portuguese
    "decidimos que",
];

pub fn matches_capture_trigger(text: &str) -> bool {
    let lower = text.to_lowercase();
    CAPTURE_TRIGGER_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn cache_evicts_oldest_on_overflow() {
        let mut cache = ExemplarCache::new(2);
        cache.push(vec![1.0, 0.0], true);
        cache.push(vec![0.0, 1.0], true);
        cache.push(vec![1.0, 1.0], true);
        assert_eq!(cache.len(), 2);
        // The first entry ([1,0]) should have been evicted; similarity to
        // a pure [1,0] probe should now come only from the [1,1] entry.
        let sim = cache.max_similarity(&[1.0, 0.0]).unwrap();
        assert!(sim < 1.0);
    }

    #[test]
    fn empty_cache_has_no_max_similarity() {
        let cache = ExemplarCache::new(4);
        assert!(cache.max_similarity(&[1.0, 0.0]).is_none());
    }

    #[test]
    fn capture_trigger_matches_known_phrase_case_insensitively() {
        assert!(matches_capture_trigger("So WE DECIDED to ship Tuesday."));
        assert!(matches_capture_trigger("Nous avons décidé de reporter."));
        assert!(!matches_capture_trigger("just chatting about the weather"));
    }
}
