//! SQLite storage for verse texts and assessment results, plus plain-text
//! line input.

use crate::models::{FusedRow, VerseSummary};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Revision not found: {0}")]
    RevisionNotFound(i64),
    #[error("{lines} lines given for {verses} verses")]
    LengthMismatch { verses: usize, lines: usize },
}

/// Fetch the text of a revision as one line per canonical verse.
pub trait VerseSource {
    /// Verses the revision does not contain come back as empty lines.
    fn fetch_revision(&self, revision_id: i64, verse_refs: &[String]) -> Result<Vec<String>, DbError>;
}

/// Persist the fused and verse-level tables of one assessment.
pub trait ResultSink {
    fn record(&mut self, assessment_id: i64, fused: &[FusedRow], verses: &[VerseSummary]) -> Result<(), DbError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS revisions (
    revision_id INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    verse_id    TEXT NOT NULL,
    text        TEXT NOT NULL,
    PRIMARY KEY (revision_id, verse_id)
);
CREATE TABLE IF NOT EXISTS fused_rows (
    assessment_id     INTEGER NOT NULL,
    verse_id          TEXT NOT NULL,
    source_word       TEXT NOT NULL,
    target_word       TEXT NOT NULL,
    total_score       REAL NOT NULL,
    alignment_score   REAL NOT NULL,
    translation_score REAL NOT NULL,
    avg_aligned       REAL NOT NULL,
    match_score       REAL NOT NULL,
    embedding_score   REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fused_rows_assessment ON fused_rows (assessment_id);
CREATE TABLE IF NOT EXISTS verse_summaries (
    assessment_id       INTEGER NOT NULL,
    verse_id            TEXT NOT NULL,
    average_total_score REAL NOT NULL,
    PRIMARY KEY (assessment_id, verse_id)
);
";

/// SQLite-backed [`VerseSource`] and [`ResultSink`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn })
    }

    /// Store a revision's text, one line per canonical verse. Blank lines
    /// are not stored. Re-importing a revision replaces matching verses.
    pub fn import_revision(&mut self, revision_id: i64, verse_refs: &[String], lines: &[String]) -> Result<usize, DbError> {
        if verse_refs.len() != lines.len() {
            return Err(DbError::LengthMismatch {
                verses: verse_refs.len(),
                lines: lines.len(),
            });
        }

        let tx = self.conn.transaction()?;
        let mut stored = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO revisions (revision_id, position, verse_id, text) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, (verse_id, text)) in verse_refs.iter().zip(lines).enumerate() {
                if text.trim().is_empty() {
                    continue;
                }
                stmt.execute(params![revision_id, position as i64, verse_id, text])?;
                stored += 1;
            }
        }
        tx.commit()?;

        info!(revision_id, stored, "imported revision");
        Ok(stored)
    }

    /// Verse summaries recorded for an assessment, in recording order.
    pub fn load_verse_summaries(&self, assessment_id: i64) -> Result<Vec<VerseSummary>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT verse_id, average_total_score FROM verse_summaries WHERE assessment_id = ? ORDER BY rowid",
        )?;
        let rows = stmt.query_map([assessment_id], |row| {
            Ok(VerseSummary {
                verse_id: row.get(0)?,
                average_total_score: row.get(1)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    pub fn fused_row_count(&self, assessment_id: i64) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM fused_rows WHERE assessment_id = ?",
            [assessment_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl VerseSource for SqliteStore {
    fn fetch_revision(&self, revision_id: i64, verse_refs: &[String]) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT verse_id, text FROM revisions WHERE revision_id = ?")?;
        let mut rows = stmt.query([revision_id])?;

        let mut texts: HashMap<String, String> = HashMap::new();
        while let Some(row) = rows.next()? {
            texts.insert(row.get(0)?, row.get(1)?);
        }

        if texts.is_empty() {
            return Err(DbError::RevisionNotFound(revision_id));
        }

        let lines: Vec<String> = verse_refs
            .iter()
            .map(|v| texts.remove(v).unwrap_or_default())
            .collect();
        debug!(revision_id, verses = lines.len(), "fetched revision");
        Ok(lines)
    }
}

impl ResultSink for SqliteStore {
    /// Replaces anything previously recorded under `assessment_id`.
    fn record(&mut self, assessment_id: i64, fused: &[FusedRow], verses: &[VerseSummary]) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM fused_rows WHERE assessment_id = ?", [assessment_id])?;
        tx.execute("DELETE FROM verse_summaries WHERE assessment_id = ?", [assessment_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO fused_rows (assessment_id, verse_id, source_word, target_word, total_score,
                    alignment_score, translation_score, avg_aligned, match_score, embedding_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for row in fused {
                stmt.execute(params![
                    assessment_id,
                    row.verse_id,
                    row.source_word,
                    row.target_word,
                    row.total_score,
                    row.alignment_score,
                    row.translation_score,
                    row.avg_aligned,
                    row.match_score,
                    row.embedding_score,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO verse_summaries (assessment_id, verse_id, average_total_score) VALUES (?1, ?2, ?3)",
            )?;
            for verse in verses {
                stmt.execute(params![assessment_id, verse.verse_id, verse.average_total_score])?;
            }
        }
        tx.commit()?;

        info!(assessment_id, fused = fused.len(), verses = verses.len(), "recorded assessment");
        Ok(())
    }
}

/// Read a line-oriented text file, one entry per line, line endings removed.
pub fn read_lines(path: &Path) -> Result<Vec<String>, DbError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().map(str::to_string).collect())
}
