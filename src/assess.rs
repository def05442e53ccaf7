//! Assessment orchestration for one or many text pairs.
//!
//! Condensation runs first and fails fast. The word indexes are then loaded
//! (or built), after which alignment, matching and embedding scoring run as
//! independent parallel stages. Fusion joins their outputs once all three
//! are done.

use crate::align::{aggregate_alignments, align, train, translation_scores, TrainingError};
use crate::cache::{Cache, CacheKey, CacheStore};
use crate::condense::{condense, CondenseError};
use crate::embed::{score_corpus, EmbeddingError, Embeddings, EncoderWeights};
use crate::fusion::{fuse, top_source_rows, verse_summaries, FusionError, SignalTables};
use crate::index;
use crate::matching::{build_match_dictionary, MatchMemo};
use crate::models::*;
use rayon::prelude::*;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pipeline stage that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Condense,
    Align,
    Embed,
    Fuse,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Condense => "condense",
            Stage::Align => "align",
            Stage::Embed => "embed",
            Stage::Fuse => "fuse",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Condense(#[from] CondenseError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
}

/// A stage failure, naming the stage and the text pair it happened on.
#[derive(Error, Debug)]
#[error("{stage} stage failed for {pair}: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    pub pair: String,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    fn new(stage: Stage, pair: &str, source: impl Into<StageError>) -> Self {
        PipelineError {
            stage,
            pair: pair.to_string(),
            source: source.into(),
        }
    }
}

/// One source/target text pair to assess.
#[derive(Debug, Clone)]
pub struct PairJob {
    /// Label used in logs and errors, e.g. `"en-web/sw-onen"`
    pub label: String,
    pub source: Vec<String>,
    pub target: Vec<String>,
    /// Canonical verse list both texts are aligned to
    pub verse_refs: Vec<String>,
}

/// Per-run switches that are not assessment parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssessOptions<'a> {
    /// Rebuild cached word indexes and match memos
    pub refresh_cache: bool,
    pub show_progress: bool,
    /// Pretrained encoder weights; without them no embedding scores exist
    pub weights: Option<&'a EncoderWeights>,
}

type AlignOutput = (Vec<AlignmentPair>, Vec<AlignmentSummary>, Vec<TranslationScore>);

/// Assess one text pair end to end.
pub fn assess_pair<S: CacheStore>(
    job: &PairJob,
    params: &AssessmentParams,
    cache: &Cache<S>,
    options: &AssessOptions<'_>,
) -> Result<AssessmentResult, PipelineError> {
    let pair = job.label.as_str();
    let marker = params.range_marker.as_str();

    let corpus = condense(&job.source, &job.target, &job.verse_refs, marker)
        .map_err(|e| PipelineError::new(Stage::Condense, pair, e))?;

    // Word indexes, narrowed to the condensed verse space
    let source_key = CacheKey::for_index("source-index", marker, &job.verse_refs, &job.source);
    let target_key = CacheKey::for_index("target-index", marker, &job.verse_refs, &job.target);
    let (source_index, target_index) = rayon::join(
        || index::get_or_build(cache, &source_key, options.refresh_cache, &job.verse_refs, &job.source, marker),
        || index::get_or_build(cache, &target_key, options.refresh_cache, &job.verse_refs, &job.target, marker),
    );

    let merge_map = corpus.merge_map();
    let verse_ids = corpus.verse_ids();
    let source_index = source_index.fold_merged(&merge_map).restrict(&verse_ids);
    let target_index = target_index.fold_merged(&merge_map).restrict(&verse_ids);
    debug!(
        pair,
        source_words = source_index.len(),
        target_words = target_index.len(),
        "restricted word indexes"
    );

    let memo_key = CacheKey::for_pair("match-memo", marker, &job.verse_refs, &job.source, &job.target);

    let (aligned, (matches, embeddings)) = rayon::join(
        || -> Result<AlignOutput, PipelineError> {
            let model = train(&corpus, &params.training).map_err(|e| PipelineError::new(Stage::Align, pair, e))?;
            let alignments = align(&model, &corpus);
            let summaries = aggregate_alignments(&alignments);
            let translations = translation_scores(&model, &corpus);
            Ok((alignments, summaries, translations))
        },
        || {
            rayon::join(
                || {
                    cache.update(&memo_key, options.refresh_cache, |memo: &mut MatchMemo| {
                        build_match_dictionary(
                            &corpus,
                            &source_index,
                            &target_index,
                            memo,
                            params.similarity_threshold,
                            params.count_threshold,
                            options.show_progress,
                        )
                    })
                },
                || -> Result<Vec<EmbeddingScore>, PipelineError> {
                    let Some(weights) = options.weights else {
                        if params.embedding_coverage != EmbeddingCoverage::Nothing {
                            warn!(pair, "no encoder weights given; embedding scores default to 0");
                        }
                        return Ok(Vec::new());
                    };
                    let embeddings = Embeddings::encode(weights, &corpus.verse_refs, &source_index, &target_index)
                        .map_err(|e| PipelineError::new(Stage::Embed, pair, e))?;
                    Ok(score_corpus(&embeddings, &corpus))
                },
            )
        },
    );

    let (alignments, alignment_summaries, translations) = aligned?;
    let embeddings = embeddings?;

    let tables = SignalTables {
        alignments: &alignments,
        alignment_summaries: &alignment_summaries,
        translations: &translations,
        matches: &matches,
        embeddings: &embeddings,
    };
    let fused = fuse(&corpus, tables, &params.embedding_coverage, params.translation_floor)
        .map_err(|e| PipelineError::new(Stage::Fuse, pair, e))?;

    let top_rows = top_source_rows(&fused);
    let verses = verse_summaries(&top_rows);

    let summary = AssessmentSummary {
        verse_count: corpus.len(),
        merged_count: corpus.merged_ids.len(),
        fused_row_count: fused.len(),
        mean_verse_score: if verses.is_empty() {
            0.0
        } else {
            verses.iter().map(|v| v.average_total_score).sum::<f64>() / verses.len() as f64
        },
        low_verses: verses
            .iter()
            .filter(|v| v.average_total_score < params.low_score_threshold)
            .count(),
    };

    info!(
        pair,
        verses = summary.verse_count,
        merged = summary.merged_count,
        alignments = alignments.len(),
        matches = matches.len(),
        embeddings = embeddings.len(),
        fused = summary.fused_row_count,
        mean_verse_score = summary.mean_verse_score,
        "assessment complete"
    );

    Ok(AssessmentResult {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pair: job.label.clone(),
        parameters: params.clone(),
        summary,
        corpus,
        alignments,
        alignment_summaries,
        translations,
        matches,
        embeddings,
        fused,
        top_rows,
        verses,
    })
}

/// Assess independent text pairs in parallel. Results follow job order;
/// one failing pair does not stop the others.
pub fn assess_batch<S: CacheStore>(
    jobs: &[PairJob],
    params: &AssessmentParams,
    cache: &Cache<S>,
    options: &AssessOptions<'_>,
) -> Vec<Result<AssessmentResult, PipelineError>> {
    info!(jobs = jobs.len(), "starting batch assessment");

    let results: Vec<Result<AssessmentResult, PipelineError>> = jobs
        .par_iter()
        .map(|job| assess_pair(job, params, cache, options))
        .collect();

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!(failed, total = jobs.len(), "batch finished with failures");
    }
    results
}
