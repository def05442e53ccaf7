//! Score fusion and reduction.
//!
//! Every (verse, source word, target word) combination of the condensed
//! corpus is joined against the signal tables and weighted into a single
//! `total_score`. The fused table is then reduced to the best target per
//! source word, and to one mean per verse.

use crate::index::normalize_word;
use crate::models::{
    AlignmentPair, AlignmentSummary, CondensedCorpus, EmbeddingCoverage, EmbeddingScore, FusedRow, MatchDictionary,
    TranslationScore, VerseSummary,
};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FusionError {
    #[error("ambiguous join: {table} has more than one row for {key}")]
    JoinAmbiguity { table: &'static str, key: String },
    #[error("embedding coverage cutoff {0} is not in the verse list")]
    UnknownCutoff(String),
}

/// The signal tables joined by [`fuse`].
#[derive(Debug, Clone, Copy)]
pub struct SignalTables<'a> {
    pub alignments: &'a [AlignmentPair],
    pub alignment_summaries: &'a [AlignmentSummary],
    pub translations: &'a [TranslationScore],
    pub matches: &'a MatchDictionary,
    pub embeddings: &'a [EmbeddingScore],
}

/// Which verses use the five-signal average.
enum Coverage<'a> {
    All,
    Nothing,
    Before {
        positions: HashMap<&'a str, usize>,
        cutoff: usize,
    },
}

impl<'a> Coverage<'a> {
    fn resolve(coverage: &EmbeddingCoverage, verse_refs: &'a [String]) -> Result<Self, FusionError> {
        match coverage {
            EmbeddingCoverage::All => Ok(Coverage::All),
            EmbeddingCoverage::Nothing => Ok(Coverage::Nothing),
            EmbeddingCoverage::Before { cutoff } => {
                let positions: HashMap<&str, usize> = verse_refs
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.as_str(), i))
                    .collect();
                let cutoff = *positions
                    .get(cutoff.as_str())
                    .ok_or_else(|| FusionError::UnknownCutoff(cutoff.clone()))?;
                Ok(Coverage::Before { positions, cutoff })
            }
        }
    }

    fn covers(&self, verse_id: &str) -> bool {
        match self {
            Coverage::All => true,
            Coverage::Nothing => false,
            Coverage::Before { positions, cutoff } => positions
                .get(verse_id)
                .map(|&pos| pos < *cutoff)
                .unwrap_or(false),
        }
    }
}

/// Index a table by key, rejecting duplicate keys.
fn unique_index<K, V, I>(table: &'static str, rows: I) -> Result<HashMap<K, V>, FusionError>
where
    K: Eq + Hash + Debug,
    I: IntoIterator<Item = (K, V)>,
{
    let mut map = HashMap::new();
    for (key, value) in rows {
        if map.contains_key(&key) {
            return Err(FusionError::JoinAmbiguity {
                table,
                key: format!("{:?}", key),
            });
        }
        map.insert(key, value);
    }
    Ok(map)
}

#[inline]
fn or_zero(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x
    }
}

/// Unique surface words with their normalized forms, first occurrence first.
fn unique_words(text: &str) -> Vec<(&str, String)> {
    let mut seen = HashSet::new();
    text.split_whitespace()
        .filter(|w| seen.insert(*w))
        .map(|w| (w, normalize_word(w)))
        .collect()
}

/// Join the signal tables onto the corpus cross product.
///
/// Missing signals default to 0, translation scores below
/// `translation_floor` are clamped to 0, and NaN never survives into a
/// total.
pub fn fuse(
    corpus: &CondensedCorpus,
    tables: SignalTables<'_>,
    coverage: &EmbeddingCoverage,
    translation_floor: f64,
) -> Result<Vec<FusedRow>, FusionError> {
    let coverage = Coverage::resolve(coverage, &corpus.verse_refs)?;

    let alignments = unique_index(
        "alignments",
        tables.alignments.iter().map(|a| {
            (
                (a.verse_id.as_str(), a.source_word.as_str(), a.target_word.as_str()),
                a.alignment_score,
            )
        }),
    )?;
    let counts = unique_index(
        "alignment_summaries",
        tables
            .alignment_summaries
            .iter()
            .map(|a| ((a.source_word.as_str(), a.target_word.as_str()), a.alignment_count)),
    )?;
    let translations = unique_index(
        "translations",
        tables
            .translations
            .iter()
            .map(|t| ((t.source_word.as_str(), t.target_word.as_str()), t)),
    )?;
    let matches = unique_index(
        "matches",
        tables
            .matches
            .rows()
            .map(|m| ((m.source_word.as_str(), m.target_word.as_str()), m.jaccard_similarity)),
    )?;
    let embeddings = unique_index(
        "embeddings",
        tables
            .embeddings
            .iter()
            .map(|e| ((e.source_word.as_str(), e.target_word.as_str()), e.embedding_score)),
    )?;

    let mut rows = Vec::new();
    for record in &corpus.records {
        let verse = record.verse_id.as_str();
        let covered = coverage.covers(verse);
        let targets = unique_words(&record.target_text);

        for (s, s_norm) in unique_words(&record.source_text) {
            for (t, t_norm) in &targets {
                let key = (s, *t);

                let alignment_score = or_zero(alignments.get(&(verse, s, *t)).copied().unwrap_or(0.0));

                let (translation_score, co_occurrence) = match translations.get(&key) {
                    Some(tr) => (tr.translation_score, tr.co_occurrence_count),
                    None => (0.0, 0),
                };
                let translation_score = if translation_score < translation_floor {
                    0.0
                } else {
                    or_zero(translation_score)
                };

                let alignment_count = counts.get(&key).copied().unwrap_or(0);
                let avg_aligned = if co_occurrence > 0 {
                    alignment_count as f64 / co_occurrence as f64
                } else {
                    0.0
                };

                let match_score = or_zero(
                    matches
                        .get(&(s_norm.as_str(), t_norm.as_str()))
                        .copied()
                        .unwrap_or(0.0),
                );
                let embedding_score = or_zero(embeddings.get(&key).copied().unwrap_or(0.0));

                let total_score = if covered {
                    (avg_aligned + translation_score + alignment_score + match_score + embedding_score) / 5.0
                } else {
                    avg_aligned + translation_score + alignment_score + match_score / 4.0
                };

                rows.push(FusedRow {
                    verse_id: record.verse_id.clone(),
                    source_word: s.to_string(),
                    target_word: t.to_string(),
                    total_score: or_zero(total_score),
                    alignment_score,
                    translation_score,
                    avg_aligned,
                    match_score,
                    embedding_score: if covered { embedding_score } else { 0.0 },
                });
            }
        }
    }

    debug!(rows = rows.len(), verses = corpus.len(), "fused signal tables");
    Ok(rows)
}

/// Keep the highest-scoring row per (verse, source word).
///
/// Groups appear in order of their first row. On equal scores the earliest
/// row wins. NaN totals rank as 0.
pub fn top_source_rows(rows: &[FusedRow]) -> Vec<FusedRow> {
    let mut best: Vec<&FusedRow> = Vec::new();
    let mut groups: HashMap<(&str, &str), usize> = HashMap::new();

    for row in rows {
        let key = (row.verse_id.as_str(), row.source_word.as_str());
        match groups.get(&key) {
            Some(&idx) => {
                if or_zero(row.total_score) > or_zero(best[idx].total_score) {
                    best[idx] = row;
                }
            }
            None => {
                groups.insert(key, best.len());
                best.push(row);
            }
        }
    }

    best.into_iter()
        .map(|row| FusedRow {
            total_score: or_zero(row.total_score),
            ..row.clone()
        })
        .collect()
}

/// Unweighted mean `total_score` per verse, in order of first appearance.
pub fn verse_summaries(top_rows: &[FusedRow]) -> Vec<VerseSummary> {
    let mut sums: Vec<(&str, f64, usize)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for row in top_rows {
        let verse = row.verse_id.as_str();
        let idx = *index.entry(verse).or_insert_with(|| {
            sums.push((verse, 0.0, 0));
            sums.len() - 1
        });
        sums[idx].1 += or_zero(row.total_score);
        sums[idx].2 += 1;
    }

    sums.into_iter()
        .map(|(verse_id, total, n)| VerseSummary {
            verse_id: verse_id.to_string(),
            average_total_score: total / n as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condense::condense;
    use crate::models::{MatchEntry, DEFAULT_RANGE_MARKER};

    fn corpus(source: &[&str], target: &[&str]) -> CondensedCorpus {
        let refs: Vec<String> = (1..=source.len()).map(|i| format!("V{}", i)).collect();
        condense(source, target, &refs, DEFAULT_RANGE_MARKER).unwrap()
    }

    fn empty_tables(matches: &MatchDictionary) -> SignalTables<'_> {
        SignalTables {
            alignments: &[],
            alignment_summaries: &[],
            translations: &[],
            matches,
            embeddings: &[],
        }
    }

    fn row(verse: &str, source: &str, target: &str, total: f64) -> FusedRow {
        FusedRow {
            verse_id: verse.into(),
            source_word: source.into(),
            target_word: target.into(),
            total_score: total,
            alignment_score: 0.0,
            translation_score: 0.0,
            avg_aligned: 0.0,
            match_score: 0.0,
            embedding_score: 0.0,
        }
    }

    #[test]
    fn test_cross_product_of_unique_words() {
        let c = corpus(&["a b a"], &["x y"]);
        let matches = MatchDictionary::default();
        let rows = fuse(&c, empty_tables(&matches), &EmbeddingCoverage::All, 1e-5).unwrap();

        let pairs: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.source_word.as_str(), r.target_word.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "x"), ("a", "y"), ("b", "x"), ("b", "y")]);
    }

    #[test]
    fn test_missing_signals_default_to_zero() {
        let c = corpus(&["God"], &["Mungu"]);
        let matches = MatchDictionary::default();
        let rows = fuse(&c, empty_tables(&matches), &EmbeddingCoverage::All, 1e-5).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].translation_score, 0.0);
        assert_eq!(rows[0].alignment_score, 0.0);
        assert_eq!(rows[0].total_score, 0.0);
    }

    #[test]
    fn test_all_signals_joined() {
        let c = corpus(&["God said"], &["Mungu alisema"]);
        let alignments = vec![AlignmentPair {
            verse_id: "V1".into(),
            source_word: "God".into(),
            target_word: "Mungu".into(),
            alignment_score: 0.9,
            pair_count: 1,
        }];
        let summaries = vec![AlignmentSummary {
            source_word: "God".into(),
            target_word: "Mungu".into(),
            alignment_count: 1,
            alignment_score: 0.9,
        }];
        let translations = vec![TranslationScore {
            source_word: "God".into(),
            target_word: "Mungu".into(),
            translation_score: 0.6,
            co_occurrence_count: 2,
        }];
        let mut matches = MatchDictionary::default();
        matches.push(MatchEntry {
            source_word: "god".into(),
            target_word: "mungu".into(),
            jaccard_similarity: 0.5,
            count: 1,
        });
        let embeddings = vec![EmbeddingScore {
            source_word: "God".into(),
            target_word: "Mungu".into(),
            embedding_score: 0.5,
        }];
        let tables = SignalTables {
            alignments: &alignments,
            alignment_summaries: &summaries,
            translations: &translations,
            matches: &matches,
            embeddings: &embeddings,
        };

        let rows = fuse(&c, tables, &EmbeddingCoverage::All, 1e-5).unwrap();
        let god = &rows[0];
        assert_eq!(god.avg_aligned, 0.5);
        assert_eq!(god.match_score, 0.5);
        assert!((god.total_score - (0.5 + 0.6 + 0.9 + 0.5 + 0.5) / 5.0).abs() < 1e-12);

        let rows = fuse(&c, tables, &EmbeddingCoverage::Nothing, 1e-5).unwrap();
        assert!((rows[0].total_score - (0.5 + 0.6 + 0.9 + 0.5 / 4.0)).abs() < 1e-12);
        assert_eq!(rows[0].embedding_score, 0.0);
    }

    #[test]
    fn test_translation_floor_clamps() {
        let c = corpus(&["a"], &["x"]);
        let translations = vec![TranslationScore {
            source_word: "a".into(),
            target_word: "x".into(),
            translation_score: 1e-7,
            co_occurrence_count: 1,
        }];
        let matches = MatchDictionary::default();
        let tables = SignalTables {
            translations: &translations,
            ..empty_tables(&matches)
        };

        let rows = fuse(&c, tables, &EmbeddingCoverage::All, 1e-5).unwrap();
        assert_eq!(rows[0].translation_score, 0.0);
    }

    #[test]
    fn test_duplicate_key_is_ambiguous() {
        let c = corpus(&["a"], &["x"]);
        let score = TranslationScore {
            source_word: "a".into(),
            target_word: "x".into(),
            translation_score: 0.5,
            co_occurrence_count: 1,
        };
        let translations = vec![score.clone(), score];
        let matches = MatchDictionary::default();
        let tables = SignalTables {
            translations: &translations,
            ..empty_tables(&matches)
        };

        let err = fuse(&c, tables, &EmbeddingCoverage::All, 1e-5).unwrap_err();
        assert!(matches!(err, FusionError::JoinAmbiguity { table: "translations", .. }));
    }

    #[test]
    fn test_coverage_cutoff_by_position() {
        let c = corpus(&["a", "a", "a"], &["x", "x", "x"]);
        let mut matches = MatchDictionary::default();
        matches.push(MatchEntry {
            source_word: "a".into(),
            target_word: "x".into(),
            jaccard_similarity: 1.0,
            count: 3,
        });

        let coverage = EmbeddingCoverage::Before { cutoff: "V2".into() };
        let rows = fuse(&c, empty_tables(&matches), &coverage, 1e-5).unwrap();
        let totals: Vec<f64> = rows.iter().map(|r| r.total_score).collect();
        // V1 covered: 1/5; V2 and V3 uncovered: 1/4
        assert_eq!(totals, vec![0.2, 0.25, 0.25]);
    }

    #[test]
    fn test_unknown_cutoff() {
        let c = corpus(&["a"], &["x"]);
        let matches = MatchDictionary::default();
        let coverage = EmbeddingCoverage::Before { cutoff: "REV 22:21".into() };
        let err = fuse(&c, empty_tables(&matches), &coverage, 1e-5).unwrap_err();
        assert_eq!(err, FusionError::UnknownCutoff("REV 22:21".into()));
    }

    #[test]
    fn test_top_source_keeps_max() {
        let rows = vec![
            row("V1", "a", "x", 0.2),
            row("V1", "a", "y", 0.7),
            row("V1", "b", "x", 0.1),
            row("V1", "a", "z", 0.5),
            row("V2", "a", "x", 0.4),
        ];
        let top = top_source_rows(&rows);

        assert_eq!(top.len(), 3);
        for kept in &top {
            for other in rows
                .iter()
                .filter(|r| r.verse_id == kept.verse_id && r.source_word == kept.source_word)
            {
                assert!(kept.total_score >= other.total_score);
            }
        }
        assert_eq!(top[0].target_word, "y");
    }

    #[test]
    fn test_top_source_ties_keep_first() {
        let rows = vec![row("V1", "a", "x", 0.5), row("V1", "a", "y", 0.5)];
        let top = top_source_rows(&rows);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].target_word, "x");
    }

    #[test]
    fn test_top_source_nan_ranks_as_zero() {
        let rows = vec![row("V1", "a", "x", f64::NAN), row("V1", "a", "y", 0.1)];
        let top = top_source_rows(&rows);
        assert_eq!(top[0].target_word, "y");

        let rows = vec![row("V1", "a", "x", f64::NAN)];
        assert_eq!(top_source_rows(&rows)[0].total_score, 0.0);
    }

    #[test]
    fn test_verse_summaries_mean_in_order() {
        let top = vec![
            row("V2", "a", "x", 0.4),
            row("V1", "a", "x", 0.2),
            row("V2", "b", "y", 0.6),
        ];
        let summaries = verse_summaries(&top);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].verse_id, "V2");
        assert!((summaries[0].average_total_score - 0.5).abs() < 1e-12);
        assert_eq!(summaries[1].average_total_score, 0.2);
    }
}
