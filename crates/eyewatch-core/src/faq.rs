//! Local FAQ corpus with approximate question matching.
//!
//! Scores follow the usual fuzzy-search convention: `0.0` is a perfect
//! match, `1.0` is no match at all. A query hits an entry when its score is
//! at or below the corpus threshold.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default acceptance threshold. Lower is stricter.
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Characters of match-start offset that cost one full score point.
const LOCATION_DISTANCE: f64 = 100.0;

/// Only this many leading pattern characters take part in matching, which
/// bounds the cost of a search regardless of query length.
pub const MAX_PATTERN_CHARS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    questions: Vec<FaqEntry>,
}

/// A scored corpus hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaqMatch<'a> {
    pub entry: &'a FaqEntry,
    pub score: f64,
    /// Position of the entry in the corpus.
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct FaqCorpus {
    entries: Vec<FaqEntry>,
    threshold: f64,
}

impl Default for FaqCorpus {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FaqCorpus {
    pub fn new(entries: Vec<FaqEntry>) -> Self {
        Self {
            entries,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Parse `{"questions": [{"question": ..., "answer": ...}, ...]}`.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let file: CorpusFile = serde_json::from_str(raw)?;
        Ok(Self::new(file.questions))
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FaqEntry] {
        &self.entries
    }

    /// All entries within the threshold, best first. Equal scores keep
    /// corpus order.
    pub fn search(&self, query: &str) -> Vec<FaqMatch<'_>> {
        let mut hits: Vec<FaqMatch<'_>> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let score = fuzzy_score(query, &entry.question)?;
                (score <= self.threshold).then_some(FaqMatch {
                    entry,
                    score,
                    index,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.index.cmp(&b.index)));
        hits
    }

    pub fn best_match(&self, query: &str) -> Option<FaqMatch<'_>> {
        self.search(query).into_iter().next()
    }
}

/// Score how well `pattern` occurs approximately inside `text`.
///
/// Approximate substring edit distance (insertions, deletions and
/// substitutions all cost 1) divided by the pattern length, plus a penalty
/// of `start / LOCATION_DISTANCE` for where in `text` the best alignment
/// begins. Case-insensitive. Patterns are cut to [`MAX_PATTERN_CHARS`].
/// Returns `None` for a blank pattern.
pub fn fuzzy_score(pattern: &str, text: &str) -> Option<f64> {
    let pattern: Vec<char> = pattern
        .trim()
        .chars()
        .take(MAX_PATTERN_CHARS)
        .flat_map(char::to_lowercase)
        .collect();
    if pattern.is_empty() {
        return None;
    }
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let m = pattern.len();

    // Column over pattern prefixes: (errors, alignment start in text).
    let mut prev: Vec<(usize, usize)> = (0..=m).map(|i| (i, 0)).collect();
    let mut cur = prev.clone();
    let mut best = score_of(prev[m], m);

    for (j, &tc) in text.iter().enumerate() {
        cur[0] = (0, j + 1);
        for i in 1..=m {
            let cost = usize::from(pattern[i - 1] != tc);
            let diag = (prev[i - 1].0 + cost, prev[i - 1].1);
            let skip_pattern = (cur[i - 1].0 + 1, cur[i - 1].1);
            let skip_text = (prev[i].0 + 1, prev[i].1);
            // Ties favour the diagonal, then the later start.
            let mut cell = diag;
            for candidate in [skip_pattern, skip_text] {
                if candidate.0 < cell.0 || (candidate.0 == cell.0 && candidate.1 > cell.1) {
                    cell = candidate;
                }
            }
            cur[i] = cell;
        }
        best = best.min(score_of(cur[m], m));
        std::mem::swap(&mut prev, &mut cur);
    }

    Some(best.min(1.0))
}

fn score_of((errors, start): (usize, usize), pattern_len: usize) -> f64 {
    errors as f64 / pattern_len as f64 + start as f64 / LOCATION_DISTANCE
}
