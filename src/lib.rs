//! Verse Align: translation quality assessment by fused lexical signals.
//!
//! Two verse-aligned texts are condensed into a dense verse table, then
//! scored word pair by word pair with four independent signals: statistical
//! alignment, lexical translation probability, verse-distribution Jaccard
//! similarity, and embedding affinity. The signals are fused into one score
//! per (verse, source word, target word) and reduced to a score per verse.
//!
//! # Example
//!
//! ```no_run
//! use verse_align::prelude::*;
//! use std::path::Path;
//!
//! let verse_refs = read_lines(Path::new("vref.txt")).unwrap();
//! let job = PairJob {
//!     label: "en/sw".to_string(),
//!     source: read_lines(Path::new("en.txt")).unwrap(),
//!     target: read_lines(Path::new("sw.txt")).unwrap(),
//!     verse_refs,
//! };
//!
//! let cache = Cache::new(JsonFileStore::new(".verse-align-cache").unwrap());
//! let params = AssessmentParams::default();
//! let result = assess_pair(&job, &params, &cache, &AssessOptions::default()).unwrap();
//!
//! for verse in &result.verses {
//!     println!("{} {:.3}", verse.verse_id, verse.average_total_score);
//! }
//! ```
//!
//! # Stages
//!
//! ```no_run
//! use verse_align::prelude::*;
//!
//! let refs: Vec<String> = vec!["GEN 1:1".into(), "GEN 1:2".into()];
//! let corpus = condense(&["God created", "<range>"], &["Mungu aliumba", "dunia"], &refs, "<range>").unwrap();
//!
//! let model = train(&corpus, &TrainingConfig::default()).unwrap();
//! let alignments = align(&model, &corpus);
//! let summaries = aggregate_alignments(&alignments);
//! let translations = translation_scores(&model, &corpus);
//! println!("{} links, {} linked pairs, {} co-occurring pairs", alignments.len(), summaries.len(), translations.len());
//! ```

pub mod align;
pub mod assess;
pub mod cache;
pub mod condense;
pub mod db;
pub mod embed;
pub mod fusion;
pub mod index;
pub mod matching;
pub mod models;
pub mod output;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::align::{
        aggregate_alignments, align, grow_diag_final_and, train, translation_score, translation_scores,
        SymmetrizedModel, TrainingError,
    };
    pub use crate::assess::{assess_batch, assess_pair, AssessOptions, PairJob, PipelineError, Stage, StageError};
    pub use crate::cache::{Cache, CacheError, CacheKey, CacheStore, JsonFileStore, MemoryStore};
    pub use crate::condense::{condense, CondenseError};
    pub use crate::db::{read_lines, DbError, ResultSink, SqliteStore, VerseSource};
    pub use crate::embed::{score_corpus, EmbeddingError, Embeddings, EncoderWeights};
    pub use crate::fusion::{fuse, top_source_rows, verse_summaries, FusionError, SignalTables};
    pub use crate::index::normalize_word;
    pub use crate::matching::{build_match_dictionary, jaccard, MatchMemo};
    pub use crate::models::{
        AlignmentPair, AlignmentSummary, AssessmentParams, AssessmentResult, AssessmentSummary, CondensedCorpus,
        ConfigError, EmbeddingCoverage, EmbeddingScore, FusedRow, MatchDictionary, MatchEntry, TrainingConfig,
        TranslationScore, VerseRecord, VerseSummary, WordIndex, DEFAULT_RANGE_MARKER,
    };
    pub use crate::output::{
        format_verse, print_lowest_verses, print_summary, write_result_dir, write_result_json,
        write_result_json_file, OutputError,
    };
}

// Re-export commonly used types at the crate root
pub use models::{AssessmentParams, AssessmentResult, CondensedCorpus, FusedRow, VerseSummary};
