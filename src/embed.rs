//! Embedding scorer.
//!
//! A word's verse-occurrence vector (one dimension per canonical verse) is
//! projected through pretrained encoder weights and L2-normalized. Two words
//! score by a log-dampened transform of the Euclidean distance between their
//! embeddings.

use crate::index::normalize_word;
use crate::models::{CondensedCorpus, EmbeddingScore, WordIndex};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("word not in embedding vocabulary: {0}")]
    UnknownWord(String),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dense `rows x cols` projection matrix, row-major. One row per canonical
/// verse position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderWeights {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl EncoderWeights {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, EmbeddingError> {
        let weights = EncoderWeights { rows, cols, data };
        weights.validate()?;
        Ok(weights)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, EmbeddingError> {
        let text = std::fs::read_to_string(path)?;
        let weights: EncoderWeights = serde_json::from_str(&text)?;
        weights.validate()?;
        Ok(weights)
    }

    fn validate(&self) -> Result<(), EmbeddingError> {
        if self.data.len() != self.rows * self.cols {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.rows * self.cols,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    #[inline]
    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Euclidean distance of two equal-length vectors.
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// `ln(1 + max(1 - d, -0.99))` of the distance between two normalized
/// embeddings. Ranges from `ln 0.01` to `ln 2`.
#[inline]
pub fn distance_score(a: &[f32], b: &[f32]) -> f64 {
    let d = euclidean_distance(a, b) as f64;
    (1.0 - d).max(-0.99).ln_1p()
}

/// Normalized embeddings for the vocabularies of both texts, keyed by
/// normalized word.
#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    source: HashMap<String, Vec<f32>>,
    target: HashMap<String, Vec<f32>>,
}

impl Embeddings {
    /// Encode every word of both indexes. The weights must have one row per
    /// canonical verse.
    pub fn encode(
        weights: &EncoderWeights,
        verse_refs: &[String],
        source_index: &WordIndex,
        target_index: &WordIndex,
    ) -> Result<Self, EmbeddingError> {
        if weights.rows != verse_refs.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: verse_refs.len(),
                actual: weights.rows,
            });
        }

        let positions: HashMap<&str, usize> = verse_refs
            .iter()
            .enumerate()
            .map(|(i, v)| (v.as_str(), i))
            .collect();

        let (source, target) = rayon::join(
            || encode_index(weights, &positions, source_index),
            || encode_index(weights, &positions, target_index),
        );

        debug!(
            source_words = source.len(),
            target_words = target.len(),
            dim = weights.cols,
            "encoded embeddings"
        );

        Ok(Embeddings { source, target })
    }

    pub fn has_source(&self, word: &str) -> bool {
        self.source.contains_key(word)
    }

    pub fn has_target(&self, word: &str) -> bool {
        self.target.contains_key(word)
    }

    /// Score two normalized words.
    pub fn score(&self, source_word: &str, target_word: &str) -> Result<f64, EmbeddingError> {
        let a = self
            .source
            .get(source_word)
            .ok_or_else(|| EmbeddingError::UnknownWord(source_word.to_string()))?;
        let b = self
            .target
            .get(target_word)
            .ok_or_else(|| EmbeddingError::UnknownWord(target_word.to_string()))?;
        Ok(distance_score(a, b))
    }
}

fn encode_index(
    weights: &EncoderWeights,
    positions: &HashMap<&str, usize>,
    index: &WordIndex,
) -> HashMap<String, Vec<f32>> {
    index
        .entries
        .par_iter()
        .map(|(word, verses)| {
            let mut vector = vec![0.0f32; weights.cols];
            for pos in verses.iter().filter_map(|v| positions.get(v.as_str())) {
                for (acc, w) in vector.iter_mut().zip(weights.row(*pos)) {
                    *acc += w;
                }
            }
            l2_normalize(&mut vector);
            (word.clone(), vector)
        })
        .collect()
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Score every distinct surface (source, target) pair co-occurring in a
/// verse, skipping pairs outside the embedding vocabulary.
pub fn score_corpus(embeddings: &Embeddings, corpus: &CondensedCorpus) -> Vec<EmbeddingScore> {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut pairs: Vec<(&str, &str, String, String)> = Vec::new();
    let mut skipped = 0usize;

    for record in &corpus.records {
        let targets: Vec<(&str, String)> = record
            .target_words()
            .into_iter()
            .map(|t| (t, normalize_word(t)))
            .collect();

        for s in record.source_words() {
            let s_norm = normalize_word(s);
            for (t, t_norm) in &targets {
                if !seen.insert((s, *t)) {
                    continue;
                }
                if embeddings.has_source(&s_norm) && embeddings.has_target(t_norm) {
                    pairs.push((s, *t, s_norm.clone(), t_norm.clone()));
                } else {
                    skipped += 1;
                }
            }
        }
    }

    let scores: Vec<EmbeddingScore> = pairs
        .par_iter()
        .filter_map(|(s, t, s_norm, t_norm)| {
            let embedding_score = embeddings.score(s_norm, t_norm).ok()?;
            Some(EmbeddingScore {
                source_word: s.to_string(),
                target_word: t.to_string(),
                embedding_score,
            })
        })
        .collect();

    debug!(scored = scores.len(), skipped, "scored embeddings");
    scores
}
