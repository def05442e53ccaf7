//! Context match engine: Jaccard similarity of word verse distributions.
//!
//! A source and a target word that occur in the same verses are likely
//! translations of each other even when the aligner never linked them.

use crate::index::normalize_word;
use crate::models::{CondensedCorpus, MatchDictionary, MatchEntry, WordIndex};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Jaccard similarity and intersection size of two verse-id sets.
///
/// Two empty sets have similarity 0, not 1.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> (f64, u32) {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let intersection = small.iter().filter(|v| large.contains(*v)).count();
    let union = a.len() + b.len() - intersection;

    if union == 0 {
        (0.0, 0)
    } else {
        (intersection as f64 / union as f64, intersection as u32)
    }
}

/// One persisted memo entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoRecord {
    pub source: String,
    pub target: String,
    pub jaccard_similarity: f64,
    pub count: u32,
}

/// Pairwise memo of computed `(jaccard, count)` values for one text pair,
/// keyed by normalized `(source, target)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<MemoRecord>", into = "Vec<MemoRecord>")]
pub struct MatchMemo {
    entries: HashMap<(String, String), (f64, u32)>,
}

impl MatchMemo {
    pub fn get(&self, source: &str, target: &str) -> Option<(f64, u32)> {
        self.entries
            .get(&(source.to_string(), target.to_string()))
            .copied()
    }

    pub fn insert(&mut self, source: &str, target: &str, value: (f64, u32)) {
        self.entries
            .insert((source.to_string(), target.to_string()), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<MemoRecord>> for MatchMemo {
    fn from(records: Vec<MemoRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|r| ((r.source, r.target), (r.jaccard_similarity, r.count)))
            .collect();
        MatchMemo { entries }
    }
}

impl From<MatchMemo> for Vec<MemoRecord> {
    fn from(memo: MatchMemo) -> Self {
        let mut records: Vec<MemoRecord> = memo
            .entries
            .into_iter()
            .map(|((source, target), (jaccard_similarity, count))| MemoRecord {
                source,
                target,
                jaccard_similarity,
                count,
            })
            .collect();
        // Stable file contents
        records.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        records
    }
}

/// Unique normalized words of a line, in first-occurrence order.
fn unique_normalized(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split_whitespace()
        .map(normalize_word)
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Build the match dictionary for a condensed corpus.
///
/// Each (source, target) pair co-occurring in a verse is compared once per
/// run; its similarity comes from `memo` when present and is computed from
/// the restricted word indexes otherwise. An entry is kept when
/// `jaccard > similarity_threshold` and `count > count_threshold`.
pub fn build_match_dictionary(
    corpus: &CondensedCorpus,
    source_index: &WordIndex,
    target_index: &WordIndex,
    memo: &mut MatchMemo,
    similarity_threshold: f64,
    count_threshold: u32,
    show_progress: bool,
) -> MatchDictionary {
    let progress = if show_progress {
        let pb = ProgressBar::new(corpus.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} verses ({per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let empty = BTreeSet::new();
    let mut dictionary = MatchDictionary::default();
    let mut already_matched: HashMap<String, HashSet<String>> = HashMap::new();
    let mut computed = 0usize;
    let mut from_memo = 0usize;

    for record in &corpus.records {
        let targets = unique_normalized(&record.target_text);

        for source in unique_normalized(&record.source_text) {
            let matched = already_matched.entry(source.clone()).or_default();

            for target in &targets {
                if !matched.insert(target.clone()) {
                    continue;
                }

                let (similarity, count) = match memo.get(&source, target) {
                    Some(value) => {
                        from_memo += 1;
                        value
                    }
                    None => {
                        let a = source_index.verses(&source).unwrap_or(&empty);
                        let b = target_index.verses(target).unwrap_or(&empty);
                        let value = jaccard(a, b);
                        memo.insert(&source, target, value);
                        computed += 1;
                        value
                    }
                };

                if similarity > similarity_threshold && count > count_threshold {
                    dictionary.push(MatchEntry {
                        source_word: source.clone(),
                        target_word: target.clone(),
                        jaccard_similarity: similarity,
                        count,
                    });
                }
            }
        }

        if let Some(ref pb) = progress {
            pb.inc(1);
        }
    }

    if let Some(pb) = progress {
        pb.finish_with_message("done");
    }

    debug!(
        verses = corpus.len(),
        computed,
        from_memo,
        entries = dictionary.len(),
        "built match dictionary"
    );

    dictionary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condense::condense;
    use crate::models::DEFAULT_RANGE_MARKER;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn fixture(source: &[&str], target: &[&str]) -> (CondensedCorpus, WordIndex, WordIndex) {
        let refs: Vec<String> = (1..=source.len()).map(|i| format!("V{}", i)).collect();
        let corpus = condense(source, target, &refs, DEFAULT_RANGE_MARKER).unwrap();
        let ids = corpus.verse_ids();
        let s = WordIndex::from_lines(&refs, source, DEFAULT_RANGE_MARKER).restrict(&ids);
        let t = WordIndex::from_lines(&refs, target, DEFAULT_RANGE_MARKER).restrict(&ids);
        (corpus, s, t)
    }

    #[test]
    fn test_jaccard_basic() {
        let (sim, count) = jaccard(&set(&["V1", "V2", "V3"]), &set(&["V2", "V3", "V4"]));
        assert!((sim - 0.5).abs() < 1e-12);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_jaccard_symmetric() {
        let a = set(&["V1", "V2"]);
        let b = set(&["V2", "V5", "V7"]);
        assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
    }

    #[test]
    fn test_jaccard_self_and_empty() {
        let a = set(&["V1", "V9"]);
        assert_eq!(jaccard(&a, &a), (1.0, 2));
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), (0.0, 0));
        assert_eq!(jaccard(&a, &BTreeSet::new()), (0.0, 0));
    }

    #[test]
    fn test_identical_texts_match_themselves() {
        let lines = ["God created light", "God saw light", "darkness was"];
        let (corpus, s, t) = fixture(&lines, &lines);
        let mut memo = MatchMemo::default();
        let dict = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 0, false);

        for word in ["god", "created", "light", "saw", "darkness", "was"] {
            let entry = dict
                .get(word)
                .iter()
                .find(|e| e.target_word == word)
                .unwrap();
            assert_eq!(entry.jaccard_similarity, 1.0);
        }
    }

    #[test]
    fn test_thresholds_are_strict() {
        // "a" and "x" share one verse out of two
        let (corpus, s, t) = fixture(&["a", "a b"], &["x y", "y"]);

        let mut memo = MatchMemo::default();
        let dict = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 0, false);
        assert!(dict.get("a").iter().any(|e| e.target_word == "x"));

        let mut memo = MatchMemo::default();
        let dict = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.5, 0, false);
        assert!(!dict.get("a").iter().any(|e| e.target_word == "x"));

        let mut memo = MatchMemo::default();
        let dict = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 1, false);
        assert!(!dict.get("a").iter().any(|e| e.target_word == "x"));
    }

    #[test]
    fn test_pairs_compared_once_per_run() {
        let (corpus, s, t) = fixture(&["a a", "a"], &["x x", "x"]);
        let mut memo = MatchMemo::default();
        let dict = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 0, false);

        assert_eq!(dict.get("a").len(), 1);
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn test_memo_reuse_is_idempotent() {
        let (corpus, s, t) = fixture(&["a b", "a c", "b c"], &["x y", "x z", "y"]);

        let mut memo = MatchMemo::default();
        let cold = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 0, false);
        let size = memo.len();

        let warm = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 0, false);
        assert_eq!(cold, warm);
        assert_eq!(memo.len(), size);
    }

    #[test]
    fn test_memo_values_take_precedence() {
        let (corpus, s, t) = fixture(&["a"], &["x"]);
        let mut memo = MatchMemo::default();
        memo.insert("a", "x", (0.25, 7));

        let dict = build_match_dictionary(&corpus, &s, &t, &mut memo, 0.0, 0, false);
        assert_eq!(dict.get("a")[0].count, 7);
    }

    #[test]
    fn test_memo_serializes_as_records() {
        let mut memo = MatchMemo::default();
        memo.insert("b", "y", (0.5, 1));
        memo.insert("a", "x", (1.0, 2));

        let json = serde_json::to_string(&memo).unwrap();
        assert!(json.starts_with(r#"[{"source":"a","target":"x""#));

        let back: MatchMemo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, memo);
    }
}
