//! Classification engine: raw text to a typed, scored, keyword-tagged record.
//!
//! Everything here is pure and deterministic. Type inference looks for a
//! leading trigger phrase (`Goal:`, `Bug -`, ...) and falls back to in-body
//! cues, then to `CONTEXT`. Importance is a per-type base score plus
//! bonuses for critical keywords and long content, clamped to `[0, 1]`.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use recall_state::MemoryType;
use serde::{Deserialize, Serialize};

pub const MAX_KEYWORDS: usize = 20;
pub const MIN_KEYWORD_LEN: usize = 3;
pub const LENGTH_BONUS_THRESHOLD: usize = 200;
pub const LENGTH_BONUS: f64 = 0.1;
pub const CRITICAL_KEYWORD_BONUS: f64 = 0.1;
pub const MAX_CRITICAL_BONUS: f64 = 0.3;
pub const MIN_IMPORTANCE: f64 = 0.0;
pub const MAX_IMPORTANCE: f64 = 1.0;

/// Leading trigger phrases, checked in order.
const LEADING_TRIGGERS: &[(MemoryType, &[&str])] = &[
    (MemoryType::Goal, &["goal", "objective", "target", "aim"]),
    (MemoryType::Decision, &["decision", "decided", "choice", "chose"]),
    (MemoryType::Error, &["error", "bug", "failure", "exception", "issue"]),
    (
        MemoryType::Knowledge,
        &["learned", "learning", "pattern", "insight", "lesson", "tip"],
    ),
    (
        MemoryType::Progress,
        &["progress", "status", "update", "milestone", "done", "completed"],
    ),
    (MemoryType::Task, &["task", "todo", "action", "next step", "next steps"]),
    (MemoryType::Context, &["context", "background", "note", "info"]),
];

/// In-body cues consulted when no leading trigger matches.
const BODY_CUES: &[(MemoryType, &[&str])] = &[
    (
        MemoryType::Error,
        &["failed", "failure", "exception", "crashed", "panic", "traceback", "stack trace"],
    ),
    (MemoryType::Decision, &["decided", "we chose", "going with", "opted for"]),
    (MemoryType::Knowledge, &["learned that", "turns out", "lesson learned", "rule of thumb"]),
    (MemoryType::Progress, &["completed", "finished", "shipped", "merged", "deployed"]),
    (MemoryType::Goal, &["our goal", "the goal", "objective is", "aim to"]),
    (MemoryType::Task, &["need to", "needs to", "should implement", "must implement"]),
];

const CRITICAL_KEYWORDS: &[&str] = &[
    "security",
    "vulnerability",
    "architecture",
    "performance",
    "critical",
    "breaking",
    "production",
    "outage",
    "regression",
    "deadline",
    "blocker",
    "urgent",
    "compliance",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "old", "see",
    "two", "way", "who", "did", "get", "got", "let", "say", "she", "too", "use", "that", "this",
    "with", "from", "they", "them", "then", "than", "there", "their", "these", "those", "what",
    "when", "where", "which", "while", "will", "would", "should", "could", "been", "being",
    "into", "onto", "over", "under", "about", "after", "before", "again", "also", "just", "only",
    "very", "more", "most", "some", "such", "each", "other", "your", "yours", "were", "does",
    "doing", "done", "here", "because", "until", "upon", "within", "without", "both", "same",
    "own", "why", "off", "per", "via",
];

/// Output of [`classify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub memory_type: MemoryType,
    pub keywords: Vec<String>,
    pub importance_score: f64,
}

fn build_patterns(table: &[(MemoryType, &[&str])], leading: bool) -> Vec<(MemoryType, Regex)> {
    table
        .iter()
        .filter_map(|(memory_type, phrases)| {
            let alternatives = phrases
                .iter()
                .map(|p| regex::escape(p).replace(' ', r"\s+"))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = if leading {
                format!(r"(?i)^\s*(?:{alternatives})\s*[:\-]")
            } else {
                format!(r"(?i)\b(?:{alternatives})\b")
            };
            Regex::new(&pattern).ok().map(|re| (*memory_type, re))
        })
        .collect()
}

fn leading_patterns() -> &'static [(MemoryType, Regex)] {
    static PATTERNS: OnceLock<Vec<(MemoryType, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| build_patterns(LEADING_TRIGGERS, true))
}

fn body_patterns() -> &'static [(MemoryType, Regex)] {
    static PATTERNS: OnceLock<Vec<(MemoryType, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| build_patterns(BODY_CUES, false))
}

/// Classify `content` into type, keywords and importance.
pub fn classify(content: &str) -> Classification {
    if content.trim().is_empty() {
        return Classification {
            memory_type: MemoryType::Context,
            keywords: Vec::new(),
            importance_score: MIN_IMPORTANCE,
        };
    }

    let memory_type = infer_type(content);
    let keywords = extract_keywords(content);
    let importance_score = score_importance(memory_type, content, &keywords);

    Classification {
        memory_type,
        keywords,
        importance_score,
    }
}

/// Leading trigger first, then in-body cues, then `CONTEXT`.
pub fn infer_type(content: &str) -> MemoryType {
    leading_patterns()
        .iter()
        .chain(body_patterns().iter())
        .find(|(_, re)| re.is_match(content))
        .map(|(memory_type, _)| *memory_type)
        .unwrap_or(MemoryType::Context)
}

/// Lowercased alphanumeric tokens of at least [`MIN_KEYWORD_LEN`] chars,
/// stopwords removed, deduplicated in first-seen order, capped at
/// [`MAX_KEYWORDS`].
pub fn extract_keywords(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .filter(|token| seen.insert(token.clone()))
        .take(MAX_KEYWORDS)
        .collect()
}

pub fn base_score(memory_type: MemoryType) -> f64 {
    match memory_type {
        MemoryType::Goal => 0.8,
        MemoryType::Decision => 0.75,
        MemoryType::Error => 0.7,
        MemoryType::Knowledge => 0.65,
        MemoryType::Progress => 0.5,
        MemoryType::Task => 0.45,
        MemoryType::Context => 0.3,
    }
}

pub fn score_importance(memory_type: MemoryType, content: &str, keywords: &[String]) -> f64 {
    let critical_hits = keywords
        .iter()
        .filter(|k| CRITICAL_KEYWORDS.contains(&k.as_str()))
        .count();
    let critical_bonus = (critical_hits as f64 * CRITICAL_KEYWORD_BONUS).min(MAX_CRITICAL_BONUS);
    let length_bonus = if content.chars().count() > LENGTH_BONUS_THRESHOLD {
        LENGTH_BONUS
    } else {
        0.0
    };

    (base_score(memory_type) + critical_bonus + length_bonus).clamp(MIN_IMPORTANCE, MAX_IMPORTANCE)
}

// ---------------------------------------------------------------------------
// Decay
// ---------------------------------------------------------------------------

/// How kept-but-old records have their importance recomputed during
/// consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecayPolicy {
    /// Leave scores as they are.
    #[default]
    None,
    /// Subtract `per_day` for each day of age, never below `floor`.
    Linear { per_day: f64, floor: f64 },
    /// Halve every `days` days, never below `floor`.
    HalfLife { days: f64, floor: f64 },
}

impl DecayPolicy {
    pub fn is_none(&self) -> bool {
        matches!(self, DecayPolicy::None)
    }

    /// Decay `score` by `age_days`. A score already below the floor is kept.
    pub fn apply(&self, score: f64, age_days: f64) -> f64 {
        let age_days = age_days.max(0.0);
        let decayed = match *self {
            DecayPolicy::None => return score,
            DecayPolicy::Linear { per_day, floor } => {
                (score - per_day.max(0.0) * age_days).max(floor.min(score))
            }
            DecayPolicy::HalfLife { days, floor } => {
                if days <= 0.0 {
                    return score;
                }
                (score * 0.5f64.powf(age_days / days)).max(floor.min(score))
            }
        };
        decayed.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE)
    }
}

/// Importance of `content` after `age` under `policy`.
///
/// Recomputed from the classified score each time so repeated
/// consolidation passes never compound.
pub fn decayed_importance(content: &str, age: chrono::Duration, policy: &DecayPolicy) -> f64 {
    let base = classify(content).importance_score;
    let age_days = age.num_seconds() as f64 / 86_400.0;
    policy.apply(base, age_days)
}
