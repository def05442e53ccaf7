//! Data structures for the verse alignment assessment pipeline.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Line content marking a verse whose text was merged into the previous verse.
pub const DEFAULT_RANGE_MARKER: &str = "<range>";

/// One condensed verse: aligned source and target text under a single verse-id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRecord {
    pub verse_id: String,
    pub source_text: String,
    pub target_text: String,
    /// Ids of range verses folded into this one (empty for ordinary verses)
    pub merged_from: Vec<String>,
}

impl VerseRecord {
    /// Whitespace tokens of the source text, in order.
    pub fn source_words(&self) -> Vec<&str> {
        self.source_text.split_whitespace().collect()
    }

    /// Whitespace tokens of the target text, in order.
    pub fn target_words(&self) -> Vec<&str> {
        self.target_text.split_whitespace().collect()
    }
}

/// Output of the condenser: dense verse table plus merge bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondensedCorpus {
    pub records: Vec<VerseRecord>,
    /// Every verse-id that was folded into a preceding verse
    pub merged_ids: BTreeSet<String>,
    /// Canonical verse list the corpus was condensed against
    pub verse_refs: Vec<String>,
}

impl CondensedCorpus {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Verse-ids present in the condensed table.
    pub fn verse_ids(&self) -> HashSet<String> {
        self.records.iter().map(|r| r.verse_id.clone()).collect()
    }

    /// Map from each merged range id to the verse-id that absorbed it.
    pub fn merge_map(&self) -> HashMap<String, String> {
        self.records
            .iter()
            .flat_map(|r| {
                r.merged_from
                    .iter()
                    .map(move |m| (m.clone(), r.verse_id.clone()))
            })
            .collect()
    }

    /// Canonical position of every verse-id in `verse_refs`.
    pub fn positions(&self) -> HashMap<&str, usize> {
        self.verse_refs
            .iter()
            .enumerate()
            .map(|(i, v)| (v.as_str(), i))
            .collect()
    }
}

/// Mapping `normalized word -> verse-ids containing it`, for a single text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordIndex {
    pub entries: BTreeMap<String, BTreeSet<String>>,
}

/// A word link emitted by the statistical aligner for one verse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentPair {
    pub verse_id: String,
    pub source_word: String,
    pub target_word: String,
    pub alignment_score: f64,
    pub pair_count: u32,
}

/// Alignment pairs grouped over the whole corpus by (source, target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSummary {
    pub source_word: String,
    pub target_word: String,
    /// Number of verses in which the pair was aligned
    pub alignment_count: u32,
    pub alignment_score: f64,
}

/// Corpus-level lexical translation probability for a word pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationScore {
    pub source_word: String,
    pub target_word: String,
    pub translation_score: f64,
    pub co_occurrence_count: u32,
}

/// Verse-distribution similarity between a source and a target word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEntry {
    pub source_word: String,
    pub target_word: String,
    pub jaccard_similarity: f64,
    pub count: u32,
}

/// Sparse `source word -> retained matches`, keyed by normalized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDictionary {
    pub entries: BTreeMap<String, Vec<MatchEntry>>,
}

impl MatchDictionary {
    pub fn push(&mut self, entry: MatchEntry) {
        self.entries
            .entry(entry.source_word.clone())
            .or_default()
            .push(entry);
    }

    pub fn get(&self, source_word: &str) -> &[MatchEntry] {
        self.entries
            .get(source_word)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All entries flattened, source words in sorted order.
    pub fn rows(&self) -> impl Iterator<Item = &MatchEntry> {
        self.entries.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }
}

/// Log-dampened similarity of two words' learned embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingScore {
    pub source_word: String,
    pub target_word: String,
    pub embedding_score: f64,
}

/// One (verse, source, target) combination with its fused score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedRow {
    pub verse_id: String,
    pub source_word: String,
    pub target_word: String,
    pub total_score: f64,

    // Signal columns the total was computed from
    pub alignment_score: f64,
    pub translation_score: f64,
    pub avg_aligned: f64,
    pub match_score: f64,
    pub embedding_score: f64,
}

/// Verse-level reduction of the top-source rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerseSummary {
    pub verse_id: String,
    pub average_total_score: f64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Which verses the embedding model covers, deciding the weighting regime.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingCoverage {
    /// Every verse uses the five-signal average
    #[default]
    All,
    /// No verse has embedding coverage
    Nothing,
    /// Verses strictly before `cutoff` in canonical order are covered
    Before { cutoff: String },
}

/// Statistical aligner training settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// EM iterations per direction
    pub iterations: usize,
    /// Prior probability of aligning a word to NULL
    pub null_probability: f64,
    /// Strength of the diagonal alignment prior
    pub diagonal_tension: f64,
    /// Abort training (and drop the partial model) after this many seconds
    pub timeout_secs: Option<u64>,
}

impl TrainingConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            null_probability: 0.08,
            diagonal_tension: 4.0,
            timeout_secs: None,
        }
    }
}

/// Assessment parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessmentParams {
    pub range_marker: String,
    // Match dictionary thresholds (strict greater-than)
    pub similarity_threshold: f64,
    pub count_threshold: u32,
    pub training: TrainingConfig,
    pub embedding_coverage: EmbeddingCoverage,
    /// Translation scores below this are clamped to zero
    pub translation_floor: f64,
    /// Verses averaging below this are counted as low in the summary
    pub low_score_threshold: f64,
}

impl Default for AssessmentParams {
    fn default() -> Self {
        Self {
            range_marker: DEFAULT_RANGE_MARKER.to_string(),
            similarity_threshold: 0.0,
            count_threshold: 0,
            training: TrainingConfig::default(),
            embedding_coverage: EmbeddingCoverage::All,
            translation_floor: 1e-5,
            low_score_threshold: 0.2,
        }
    }
}

impl AssessmentParams {
    /// Stricter preset for high-volume batch runs, bounding dictionary size.
    pub fn batch() -> Self {
        Self {
            similarity_threshold: 0.05,
            ..Self::default()
        }
    }

    /// Load parameters from a JSON document; absent fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentSummary {
    pub verse_count: usize,
    pub merged_count: usize,
    pub fused_row_count: usize,
    pub mean_verse_score: f64,
    /// Verses averaging below `low_score_threshold`
    pub low_verses: usize,
}

/// Every table produced by one text-pair assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub version: String,
    pub pair: String,
    pub parameters: AssessmentParams,
    pub summary: AssessmentSummary,
    pub corpus: CondensedCorpus,
    pub alignments: Vec<AlignmentPair>,
    pub alignment_summaries: Vec<AlignmentSummary>,
    pub translations: Vec<TranslationScore>,
    pub matches: MatchDictionary,
    pub embeddings: Vec<EmbeddingScore>,
    pub fused: Vec<FusedRow>,
    pub top_rows: Vec<FusedRow>,
    pub verses: Vec<VerseSummary>,
}
