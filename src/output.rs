//! Output formatting for assessment results (CSV tables, JSON, console).

use crate::models::{
    AlignmentPair, AlignmentSummary, AssessmentResult, CondensedCorpus, EmbeddingScore, FusedRow, MatchDictionary,
    TranslationScore, VerseSummary,
};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

const CORPUS_HEADER: &[&str] = &["verse_id", "source_text", "target_text", "merged_from"];
const ALIGNMENT_HEADER: &[&str] = &["verse_id", "source_word", "target_word", "alignment_score", "pair_count"];
const ALIGNMENT_SUMMARY_HEADER: &[&str] = &["source_word", "target_word", "alignment_count", "alignment_score"];
const TRANSLATION_HEADER: &[&str] = &["source_word", "target_word", "translation_score", "co_occurrence_count"];
const MATCH_HEADER: &[&str] = &["source_word", "target_word", "jaccard_similarity", "count"];
const EMBEDDING_HEADER: &[&str] = &["source_word", "target_word", "embedding_score"];
const FUSED_HEADER: &[&str] = &[
    "verse_id",
    "source_word",
    "target_word",
    "total_score",
    "alignment_score",
    "translation_score",
    "avg_aligned",
    "match_score",
    "embedding_score",
];
const VERSE_HEADER: &[&str] = &["verse_id", "average_total_score"];

/// Header row first, so empty tables still carry their columns.
fn write_table<W, T, I>(writer: W, header: &[&str], rows: I) -> Result<(), OutputError>
where
    W: Write,
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    wtr.write_record(header)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct CorpusRow<'a> {
    verse_id: &'a str,
    source_text: &'a str,
    target_text: &'a str,
    merged_from: String,
}

/// Write the condensed corpus; merged ids are joined with `;`.
pub fn write_corpus_csv<W: Write>(corpus: &CondensedCorpus, writer: W) -> Result<(), OutputError> {
    let rows = corpus.records.iter().map(|r| CorpusRow {
        verse_id: &r.verse_id,
        source_text: &r.source_text,
        target_text: &r.target_text,
        merged_from: r.merged_from.join(";"),
    });
    write_table(writer, CORPUS_HEADER, rows)
}

pub fn write_alignments_csv<W: Write>(rows: &[AlignmentPair], writer: W) -> Result<(), OutputError> {
    write_table(writer, ALIGNMENT_HEADER, rows)
}

pub fn write_alignment_summaries_csv<W: Write>(rows: &[AlignmentSummary], writer: W) -> Result<(), OutputError> {
    write_table(writer, ALIGNMENT_SUMMARY_HEADER, rows)
}

pub fn write_translations_csv<W: Write>(rows: &[TranslationScore], writer: W) -> Result<(), OutputError> {
    write_table(writer, TRANSLATION_HEADER, rows)
}

/// Write the match dictionary flattened to one row per entry.
pub fn write_matches_csv<W: Write>(matches: &MatchDictionary, writer: W) -> Result<(), OutputError> {
    write_table(writer, MATCH_HEADER, matches.rows())
}

pub fn write_embeddings_csv<W: Write>(rows: &[EmbeddingScore], writer: W) -> Result<(), OutputError> {
    write_table(writer, EMBEDDING_HEADER, rows)
}

pub fn write_fused_csv<W: Write>(rows: &[FusedRow], writer: W) -> Result<(), OutputError> {
    write_table(writer, FUSED_HEADER, rows)
}

pub fn write_verses_csv<W: Write>(rows: &[VerseSummary], writer: W) -> Result<(), OutputError> {
    write_table(writer, VERSE_HEADER, rows)
}

/// Write the whole assessment result as JSON.
pub fn write_result_json<W: Write>(result: &AssessmentResult, writer: &mut W) -> Result<(), OutputError> {
    let json = serde_json::to_string_pretty(result)?;
    writer.write_all(json.as_bytes())?;
    Ok(())
}

/// Write the whole assessment result as JSON to a file.
pub fn write_result_json_file(result: &AssessmentResult, path: &Path) -> Result<(), OutputError> {
    let mut file = BufWriter::new(File::create(path)?);
    write_result_json(result, &mut file)?;
    file.flush()?;
    Ok(())
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<File>, OutputError> {
    Ok(BufWriter::new(File::create(dir.join(name))?))
}

/// Write every table of `result` into `dir` as CSV, plus `result.json`.
pub fn write_result_dir(result: &AssessmentResult, dir: &Path) -> Result<(), OutputError> {
    std::fs::create_dir_all(dir)?;

    write_corpus_csv(&result.corpus, create(dir, "corpus.csv")?)?;
    write_alignments_csv(&result.alignments, create(dir, "alignments.csv")?)?;
    write_alignment_summaries_csv(&result.alignment_summaries, create(dir, "alignment_summaries.csv")?)?;
    write_translations_csv(&result.translations, create(dir, "translations.csv")?)?;
    write_matches_csv(&result.matches, create(dir, "matches.csv")?)?;
    write_embeddings_csv(&result.embeddings, create(dir, "embeddings.csv")?)?;
    write_fused_csv(&result.fused, create(dir, "fused.csv")?)?;
    write_fused_csv(&result.top_rows, create(dir, "top_source.csv")?)?;
    write_verses_csv(&result.verses, create(dir, "verses.csv")?)?;
    write_result_json_file(result, &dir.join("result.json"))?;

    info!(pair = result.pair.as_str(), dir = %dir.display(), "wrote result tables");
    Ok(())
}

/// Write a summary report to stdout.
pub fn print_summary(result: &AssessmentResult) {
    println!("\n=== Assessment Summary ===");
    println!("Version: {}", result.version);
    println!("Pair: {}", result.pair);
    println!();
    println!("Parameters:");
    println!("  Similarity threshold: {}", result.parameters.similarity_threshold);
    println!("  Count threshold: {}", result.parameters.count_threshold);
    println!("  EM iterations: {}", result.parameters.training.iterations);
    println!("  Embedding coverage: {:?}", result.parameters.embedding_coverage);
    println!();
    println!("Results:");
    println!("  Verses: {}", result.summary.verse_count);
    println!("  Merged range verses: {}", result.summary.merged_count);
    println!("  Alignment links: {}", result.alignments.len());
    println!("  Match entries: {}", result.matches.len());
    println!("  Fused rows: {}", result.summary.fused_row_count);
    println!("  Mean verse score: {:.3}", result.summary.mean_verse_score);
    println!(
        "  Verses below {:.2}: {}",
        result.parameters.low_score_threshold, result.summary.low_verses
    );
}

/// Format a verse summary as a single line.
pub fn format_verse(verse: &VerseSummary) -> String {
    format!("{:<16} {:.3}", verse.verse_id, verse.average_total_score)
}

/// Print the lowest-scoring verses first.
pub fn print_lowest_verses(verses: &[VerseSummary], limit: Option<usize>) {
    let mut sorted: Vec<&VerseSummary> = verses.iter().collect();
    sorted.sort_by(|a, b| a.average_total_score.total_cmp(&b.average_total_score));

    let to_print = match limit {
        Some(n) => &sorted[..n.min(sorted.len())],
        None => &sorted[..],
    };

    for verse in to_print {
        println!("{}", format_verse(verse));
    }

    if let Some(n) = limit {
        if sorted.len() > n {
            println!("... and {} more verses", sorted.len() - n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchEntry, VerseRecord};

    fn create_test_row() -> FusedRow {
        FusedRow {
            verse_id: "GEN 1:1".into(),
            source_word: "God".into(),
            target_word: "Mungu".into(),
            total_score: 0.75,
            alignment_score: 0.9,
            translation_score: 0.6,
            avg_aligned: 1.0,
            match_score: 0.5,
            embedding_score: 0.0,
        }
    }

    #[test]
    fn test_write_fused_csv() {
        let mut output = Vec::new();
        write_fused_csv(&[create_test_row()], &mut output).unwrap();

        let csv = String::from_utf8(output).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "verse_id,source_word,target_word,total_score,alignment_score,translation_score,avg_aligned,match_score,embedding_score"
        );
        assert!(lines.next().unwrap().starts_with("GEN 1:1,God,Mungu,0.75,0.9"));
    }

    #[test]
    fn test_write_csv_empty_keeps_header() {
        let mut output = Vec::new();
        write_verses_csv(&[], &mut output).unwrap();

        let csv = String::from_utf8(output).unwrap();
        assert_eq!(csv.lines().count(), 1);
        assert!(csv.starts_with("verse_id,average_total_score"));
    }

    #[test]
    fn test_write_corpus_joins_merged_ids() {
        let corpus = CondensedCorpus {
            records: vec![VerseRecord {
                verse_id: "GEN 1:1".into(),
                source_text: "God created".into(),
                target_text: "Mungu aliumba, dunia".into(),
                merged_from: vec!["GEN 1:2".into(), "GEN 1:3".into()],
            }],
            ..Default::default()
        };
        let mut output = Vec::new();
        write_corpus_csv(&corpus, &mut output).unwrap();

        let csv = String::from_utf8(output).unwrap();
        assert!(csv.contains(r#"GEN 1:1,God created,"Mungu aliumba, dunia",GEN 1:2;GEN 1:3"#));
    }

    #[test]
    fn test_write_matches_flattened() {
        let mut matches = MatchDictionary::default();
        for target in ["mungu", "bwana"] {
            matches.push(MatchEntry {
                source_word: "god".into(),
                target_word: target.into(),
                jaccard_similarity: 0.5,
                count: 2,
            });
        }
        let mut output = Vec::new();
        write_matches_csv(&matches, &mut output).unwrap();

        let csv = String::from_utf8(output).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.contains("god,bwana,0.5,2"));
    }

    #[test]
    fn test_format_verse() {
        let verse = VerseSummary {
            verse_id: "GEN 1:1".into(),
            average_total_score: 0.12345,
        };
        assert!(format_verse(&verse).ends_with("0.123"));
    }
}
