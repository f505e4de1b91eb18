//! Relationship detection by keyword overlap.

use std::collections::HashSet;

use recall_state::MemoryRecord;
use serde::{Deserialize, Serialize};

/// Thresholds for linking a new record to existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    /// Minimum Jaccard similarity for a link.
    pub similarity_threshold: f64,
    /// Maximum links any record holds, back-links included.
    pub max_links: usize,
    /// How many recently used records are considered as candidates.
    pub candidate_pool: usize,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.3,
            max_links: 5,
            candidate_pool: 200,
        }
    }
}

/// Jaccard similarity of two keyword lists. Zero when either is empty.
pub fn keyword_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

/// Ids of the candidates `record` should link to, strongest first.
pub fn detect_relationships<'a, I>(
    record: &MemoryRecord,
    candidates: I,
    config: &RelationshipConfig,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a MemoryRecord>,
{
    let mut links = rank_relationships(record, candidates, config);
    links.truncate(config.max_links);
    links
}

/// Every candidate above the similarity threshold, strongest first.
pub fn rank_relationships<'a, I>(
    record: &MemoryRecord,
    candidates: I,
    config: &RelationshipConfig,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a MemoryRecord>,
{
    let mut scored: Vec<(f64, &str)> = candidates
        .into_iter()
        .filter(|c| c.id != record.id)
        .map(|c| (keyword_similarity(&record.keywords, &c.keywords), c.id.as_str()))
        .filter(|(similarity, _)| *similarity >= config.similarity_threshold)
        .collect();

    scored.sort_by(|(sa, ia), (sb, ib)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ia.cmp(ib))
    });
    scored.dedup_by(|a, b| a.1 == b.1);

    scored.into_iter().map(|(_, id)| id.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_state::MemoryType;
    use std::collections::BTreeSet;

    fn record(keywords: &[&str]) -> MemoryRecord {
        MemoryRecord::new(
            keywords.join(" "),
            BTreeSet::new(),
            MemoryType::Context,
            keywords.iter().map(|k| k.to_string()).collect(),
            0.3,
        )
    }

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_similarity() {
        assert_eq!(keyword_similarity(&kw(&["a1x", "b2x"]), &kw(&["a1x", "b2x"])), 1.0);
        assert_eq!(keyword_similarity(&kw(&["a1x"]), &kw(&["b2x"])), 0.0);
        assert_eq!(keyword_similarity(&kw(&[]), &kw(&["b2x"])), 0.0);
        let half = keyword_similarity(&kw(&["cache", "sync"]), &kw(&["cache", "evict"]));
        assert!((half - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_links_above_threshold_strongest_first() {
        let new = record(&["cache", "sync", "retry"]);
        let strong = record(&["cache", "sync", "retry", "backoff"]);
        let weak = record(&["cache", "sync", "evict", "lru", "tick"]);
        let unrelated = record(&["goal", "latency"]);

        let links = detect_relationships(
            &new,
            [&unrelated, &weak, &strong, &new],
            &RelationshipConfig::default(),
        );
        assert_eq!(links, vec![strong.id.clone(), weak.id.clone()]);
    }

    #[test]
    fn test_link_cap() {
        let new = record(&["cache", "sync"]);
        let pool: Vec<_> = (0..10).map(|_| record(&["cache", "sync"])).collect();
        let config = RelationshipConfig {
            max_links: 3,
            ..RelationshipConfig::default()
        };
        assert_eq!(detect_relationships(&new, &pool, &config).len(), 3);
    }
}
