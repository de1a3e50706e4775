use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::OnceCell;
use regex::Regex;

/// Deduplicated set of normalized (lowercased, trimmed) hallucination
/// strings (spec §4.3). Loaded once from one or more files/directories.
#[derive(Debug, Default)]
pub struct HallucinationFilter {
    phrases: HashSet<String>,
}

impl HallucinationFilter {
    pub fn empty() -> Self {
        Self {
            phrases: HashSet::new(),
        }
    }

    /// Load from a mix of file paths and directories (spec §9: "multiple
    /// files and both single-file and directory variants are expected").
    pub fn load(paths: &[impl AsRef<Path>]) -> std::io::Result<Self> {
        let mut phrases = HashSet::new();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                for entry in std::fs::read_dir(path)? {
                    let entry = entry?;
                    if entry.path().is_file() {
                        load_file_into(&entry.path(), &mut phrases)?;
                    }
                }
            } else if path.is_file() {
                load_file_into(path, &mut phrases)?;
            }
        }
        Ok(Self { phrases })
    }

    pub fn is_hallucination(&self, text: &str) -> bool {
        self.phrases.contains(&normalize(text))
    }

    /// Build directly from a set of phrases (normalized on insert), for
    /// callers that already have the list in memory rather than on disk.
    pub fn from_phrases(phrases: impl IntoIterator<Item = String>) -> Self {
        Self {
            phrases: phrases.into_iter().map(|p| normalize(&p)).collect(),
        }
    }
}

fn load_file_into(path: &Path, out: &mut HashSet<String>) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        let norm = normalize(line);
        if !norm.is_empty() {
            out.insert(norm);
        }
    }
    Ok(())
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

// ---- segment filter pipeline (spec §4.2) ----------------------------------

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "you", "that", "this", "with", "was", "have",
    "not", "but", "they", "his", "her", "from", "had", "what", "when",
];

fn non_informative_patterns() -> &'static [Regex] {
    static PATTERNS: OnceCell<Vec<Regex>> = OnceCell::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)^\[.*blank.*audio.*\]$").unwrap(),
            Regex::new(r"(?i)^\(.*blank.*audio.*\)$").unwrap(),
            Regex::new(r"^\[[^\]]*\]$").unwrap(),
            Regex::new(r"^\([^\)]*\)$").unwrap(),
            Regex::new(r"^<\s*3\s*$").unwrap(),
            Regex::new(r"^[<>]+$").unwrap(),
            Regex::new(r"^\s*$").unwrap(),
        ]
    })
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub min_character_length: usize,
    pub min_real_words: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_character_length: 3,
            min_real_words: 1,
        }
    }
}

fn real_word_count(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| {
            let w = w.trim_matches(|c: char| !c.is_alphanumeric() && c != '<' && c != '[');
            w.len() >= 3
                && !w.starts_with('<')
                && !w.starts_with('[')
                && !STOPWORDS.contains(&w.to_lowercase().as_str())
        })
        .count()
}

/// Trim/length/pattern/real-word filter applied at flush time, ahead of
/// time/text dedup (spec §4.2's filter pipeline).
pub fn passes_filter(text: &str, config: &FilterConfig) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < config.min_character_length {
        return false;
    }
    if non_informative_patterns().iter().any(|re| re.is_match(trimmed)) {
        return false;
    }
    if real_word_count(trimmed) < config.min_real_words {
        return false;
    }
    true
}

/// One durable-flush candidate, carrying only the fields the dedup pass
/// needs (spec §4.2's time/text dedup against a per-meeting recent cache).
#[derive(Debug, Clone, PartialEq)]
pub struct DedupCandidate {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

impl DedupCandidate {
    fn is_subrange_of(&self, other: &DedupCandidate) -> bool {
        self.start_time >= other.start_time && self.end_time <= other.end_time
    }

    fn overlaps(&self, other: &DedupCandidate) -> bool {
        self.start_time.max(other.start_time) < self.end_time.min(other.end_time)
    }
}

/// Per-meeting recent-segment cache for time/text deduplication. Cleared by
/// the caller when a meeting leaves `active_meetings` (spec §4.2).
#[derive(Debug, Default)]
pub struct DedupCache {
    recent: Vec<DedupCandidate>,
}

#[derive(Debug, PartialEq)]
pub enum DedupOutcome {
    Keep,
    Drop,
}

impl DedupCache {
    /// Evaluate `candidate` against the cache, applying spec §4.2's rules in
    /// order, and update the cache to reflect the decision.
    pub fn evaluate(&mut self, candidate: DedupCandidate) -> DedupOutcome {
        for i in 0..self.recent.len() {
            let existing = self.recent[i].clone();
            if existing.text == candidate.text {
                if candidate.is_subrange_of(&existing) {
                    return DedupOutcome::Drop;
                }
                if existing.is_subrange_of(&candidate) {
                    self.recent[i] = candidate;
                    return DedupOutcome::Keep;
                }
            } else if existing.overlaps(&candidate) {
                let cand_len = candidate.end_time - candidate.start_time;
                let exist_len = existing.end_time - existing.start_time;
                if cand_len <= exist_len && candidate.is_subrange_of(&existing) {
                    return DedupOutcome::Drop;
                }
                if exist_len < cand_len && existing.is_subrange_of(&candidate) {
                    self.recent[i] = candidate;
                    return DedupOutcome::Keep;
                }
            }
        }
        self.recent.push(candidate);
        DedupOutcome::Keep
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_below_min_length() {
        let cfg = FilterConfig::default();
        assert!(!passes_filter("hi", &cfg));
    }

    #[test]
    fn rejects_bracket_only() {
        let cfg = FilterConfig::default();
        assert!(!passes_filter("[inaudible]", &cfg));
        assert!(!passes_filter("(background noise)", &cfg));
    }

    #[test]
    fn rejects_low_real_word_count() {
        let cfg = FilterConfig {
            min_character_length: 3,
            min_real_words: 2,
        };
        assert!(!passes_filter("the and", &cfg));
    }

    #[test]
    fn accepts_real_sentence() {
        let cfg = FilterConfig::default();
        assert!(passes_filter("let's begin the meeting now", &cfg));
    }

    #[test]
    fn hallucination_filter_matches_case_insensitively() {
        let mut phrases = HashSet::new();
        phrases.insert(normalize("Thanks for watching"));
        let filter = HallucinationFilter { phrases };
        assert!(filter.is_hallucination("  THANKS FOR WATCHING  "));
        assert!(!filter.is_hallucination("let's begin"));
    }

    #[test]
    fn dedup_drops_exact_text_subrange() {
        let mut cache = DedupCache::default();
        let first = DedupCandidate {
            start_time: 0.0,
            end_time: 5.0,
            text: "hello world".into(),
        };
        assert_eq!(cache.evaluate(first.clone()), DedupOutcome::Keep);
        let sub = DedupCandidate {
            start_time: 1.0,
            end_time: 3.0,
            text: "hello world".into(),
        };
        assert_eq!(cache.evaluate(sub), DedupOutcome::Drop);
    }

    #[test]
    fn dedup_keeps_wider_range_and_replaces_cached_subrange() {
        let mut cache = DedupCache::default();
        let narrow = DedupCandidate {
            start_time: 1.0,
            end_time: 2.0,
            text: "same text".into(),
        };
        cache.evaluate(narrow);
        let wider = DedupCandidate {
            start_time: 0.0,
            end_time: 3.0,
            text: "same text".into(),
        };
        assert_eq!(cache.evaluate(wider), DedupOutcome::Keep);
    }

    #[test]
    fn dedup_drops_shorter_overlapping_subinterval_with_different_text() {
        let mut cache = DedupCache::default();
        let longer = DedupCandidate {
            start_time: 0.0,
            end_time: 10.0,
            text: "the quick brown fox jumps".into(),
        };
        cache.evaluate(longer);
        let shorter = DedupCandidate {
            start_time: 2.0,
            end_time: 4.0,
            text: "quick brown".into(),
        };
        assert_eq!(cache.evaluate(shorter), DedupOutcome::Drop);
    }
}
