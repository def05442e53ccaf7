//! Corpus condensation: pairing two verse-indexed texts into a dense table.
//!
//! Blank verses are dropped and range-marker verses are folded into the verse
//! before them, so every surviving row has real text on both sides.

use crate::models::{CondensedCorpus, VerseRecord};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CondenseError {
    #[error(
        "length mismatch: source has {source_lines} lines, target has {target_lines}, \
         verse list has {verse_refs}"
    )]
    LengthMismatch {
        source_lines: usize,
        target_lines: usize,
        verse_refs: usize,
    },
    #[error("duplicate verse id in verse list: {0}")]
    DuplicateVerseId(String),
}

/// Condense two parallel line sequences against the canonical verse list.
///
/// Shapes are validated before any row is touched.
pub fn condense<S: AsRef<str>>(
    source: &[S],
    target: &[S],
    verse_refs: &[String],
    marker: &str,
) -> Result<CondensedCorpus, CondenseError> {
    if source.len() != target.len() || source.len() != verse_refs.len() {
        return Err(CondenseError::LengthMismatch {
            source_lines: source.len(),
            target_lines: target.len(),
            verse_refs: verse_refs.len(),
        });
    }

    let mut seen = HashSet::with_capacity(verse_refs.len());
    for verse_id in verse_refs {
        if !seen.insert(verse_id.as_str()) {
            return Err(CondenseError::DuplicateVerseId(verse_id.clone()));
        }
    }

    // Pair lines with ids, dropping positions blank on either side
    let rows: Vec<PendingRow> = verse_refs
        .iter()
        .zip(source.iter().zip(target.iter()))
        .filter_map(|(verse_id, (src, trg))| {
            let src = src.as_ref().trim();
            let trg = trg.as_ref().trim();
            if src.is_empty() || trg.is_empty() {
                return None;
            }
            Some(PendingRow {
                verse_id: verse_id.clone(),
                source: Side::new(src, marker),
                target: Side::new(trg, marker),
                merged_from: Vec::new(),
            })
        })
        .collect();

    let paired = rows.len();

    // Reverse scan: a range row is absorbed by the row before it. A range row
    // has already absorbed its own successors, so chains collapse onto the
    // first real verse.
    let mut reversed: Vec<PendingRow> = Vec::with_capacity(rows.len());
    for mut current in rows.into_iter().rev() {
        if reversed.last().map(PendingRow::is_range).unwrap_or(false) {
            if let Some(next) = reversed.pop() {
                current.absorb(next);
            }
        }
        reversed.push(current);
    }
    reversed.reverse();

    // Range rows with nothing before them survive the scan; drop them
    let records: Vec<VerseRecord> = reversed
        .into_iter()
        .filter(|r| !r.is_range())
        .map(PendingRow::into_record)
        .collect();

    let merged_ids: BTreeSet<String> = records
        .iter()
        .flat_map(|r| r.merged_from.iter().cloned())
        .collect();

    debug!(
        input = verse_refs.len(),
        paired,
        condensed = records.len(),
        merged = merged_ids.len(),
        "condensed corpus"
    );

    Ok(CondensedCorpus {
        records,
        merged_ids,
        verse_refs: verse_refs.to_vec(),
    })
}

/// One side of a row during the scan. A marker side keeps its marker status
/// while collecting text absorbed from later range rows.
struct Side {
    is_marker: bool,
    text: String,
}

impl Side {
    fn new(line: &str, marker: &str) -> Self {
        if line == marker {
            Side {
                is_marker: true,
                text: String::new(),
            }
        } else {
            Side {
                is_marker: false,
                text: line.to_string(),
            }
        }
    }

    fn append(&mut self, other: Side) {
        if other.text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(&other.text);
    }
}

struct PendingRow {
    verse_id: String,
    source: Side,
    target: Side,
    merged_from: Vec<String>,
}

impl PendingRow {
    fn is_range(&self) -> bool {
        self.source.is_marker || self.target.is_marker
    }

    fn absorb(&mut self, next: PendingRow) {
        self.source.append(next.source);
        self.target.append(next.target);
        self.merged_from.push(next.verse_id);
        self.merged_from.extend(next.merged_from);
    }

    fn into_record(self) -> VerseRecord {
        VerseRecord {
            verse_id: self.verse_id,
            source_text: self.source.text,
            target_text: self.target.text,
            merged_from: self.merged_from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_RANGE_MARKER;

    fn refs(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_length_mismatch_detected_first() {
        let err = condense(&["a", "b"], &["c"], &refs(&["V1", "V2"]), DEFAULT_RANGE_MARKER)
            .unwrap_err();
        assert_eq!(
            err,
            CondenseError::LengthMismatch {
                source_lines: 2,
                target_lines: 1,
                verse_refs: 2
            }
        );
    }

    #[test]
    fn test_verse_list_length_checked() {
        let err = condense(&["a"], &["c"], &refs(&["V1", "V2"]), DEFAULT_RANGE_MARKER);
        assert!(matches!(err, Err(CondenseError::LengthMismatch { .. })));
    }

    #[test]
    fn test_duplicate_verse_id() {
        let err = condense(&["a", "b"], &["c", "d"], &refs(&["V1", "V1"]), DEFAULT_RANGE_MARKER);
        assert_eq!(err, Err(CondenseError::DuplicateVerseId("V1".to_string())));
    }

    #[test]
    fn test_blank_rows_dropped() {
        let corpus = condense(
            &["a b", "", "e", "  "],
            &["c d", "x", "   ", "y"],
            &refs(&["V1", "V2", "V3", "V4"]),
            DEFAULT_RANGE_MARKER,
        )
        .unwrap();

        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.records[0].verse_id, "V1");
        assert!(corpus.merged_ids.is_empty());
    }

    #[test]
    fn test_range_merged_into_previous() {
        let corpus = condense(
            &["God created", "<range>"],
            &["Mungu aliumba", "dunia na mbingu"],
            &refs(&["GEN 1:1", "GEN 1:2"]),
            DEFAULT_RANGE_MARKER,
        )
        .unwrap();

        assert_eq!(corpus.len(), 1);
        let row = &corpus.records[0];
        assert_eq!(row.verse_id, "GEN 1:1");
        assert_eq!(row.source_text, "God created");
        assert_eq!(row.target_text, "Mungu aliumba dunia na mbingu");
        assert_eq!(row.merged_from, vec!["GEN 1:2".to_string()]);
        assert!(corpus.merged_ids.contains("GEN 1:2"));
    }

    #[test]
    fn test_range_on_both_sides() {
        let corpus = condense(
            &["a b", "<range>", "e"],
            &["c d", "<range>", "f"],
            &refs(&["V1", "V2", "V3"]),
            DEFAULT_RANGE_MARKER,
        )
        .unwrap();

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.records[0].source_text, "a b");
        assert_eq!(corpus.records[0].target_text, "c d");
        assert_eq!(corpus.records[0].merged_from, vec!["V2".to_string()]);
        assert_eq!(corpus.records[1].verse_id, "V3");
    }

    #[test]
    fn test_range_chain_collapses() {
        let corpus = condense(
            &["a", "<range>", "<range>", "d"],
            &["w", "x", "y", "z"],
            &refs(&["V1", "V2", "V3", "V4"]),
            DEFAULT_RANGE_MARKER,
        )
        .unwrap();

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.records[0].target_text, "w x y");
        assert_eq!(
            corpus.records[0].merged_from,
            vec!["V2".to_string(), "V3".to_string()]
        );
        assert_eq!(corpus.merged_ids.len(), 2);
    }

    #[test]
    fn test_leading_marker_dropped() {
        let corpus = condense(
            &["<range>", "b"],
            &["<range>", "d"],
            &refs(&["V1", "V2"]),
            DEFAULT_RANGE_MARKER,
        )
        .unwrap();

        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.records[0].verse_id, "V2");
    }

    #[test]
    fn test_condensed_never_longer_and_never_blank() {
        let source = ["a", "", "<range>", "b c", " ", "d"];
        let target = ["e", "f", "g", "<range>", "h", ""];
        let ids = refs(&["V1", "V2", "V3", "V4", "V5", "V6"]);
        let corpus = condense(&source, &target, &ids, DEFAULT_RANGE_MARKER).unwrap();

        assert!(corpus.len() <= source.len());
        for row in &corpus.records {
            assert!(!row.source_text.trim().is_empty());
            assert!(!row.target_text.trim().is_empty());
        }
    }

    #[test]
    fn test_all_blank_gives_empty_corpus() {
        let corpus = condense(&["", " "], &["x", ""], &refs(&["V1", "V2"]), DEFAULT_RANGE_MARKER)
            .unwrap();
        assert!(corpus.is_empty());
    }
}
