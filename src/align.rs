//! Statistical word aligner.
//!
//! A lexical translation model with a diagonal alignment prior is trained by
//! EM in both directions (source generating target, and target generating
//! source). Per-verse links come from the Viterbi alignment of each direction,
//! symmetrized with grow-diagonal-final-and.
//!
//! Training is the hot path: every iteration visits every word pair of every
//! verse in both directions.

use crate::models::{AlignmentPair, AlignmentSummary, CondensedCorpus, TrainingConfig, TranslationScore, VerseRecord};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("cannot train on an empty corpus")]
    EmptyCorpus,
    #[error("training exceeded {limit:?} after {completed} of {requested} iterations")]
    Timeout {
        limit: Duration,
        completed: usize,
        requested: usize,
    },
}

/// Vocabulary id reserved for the empty (NULL) word.
pub const NULL_ID: u32 = 0;

const UNKNOWN_ID: u32 = u32::MAX;

/// Surface word <-> dense id, with id 0 reserved for NULL.
#[derive(Debug, Clone)]
pub struct Vocab {
    ids: HashMap<String, u32>,
    words: Vec<String>,
}

impl Default for Vocab {
    fn default() -> Self {
        Vocab {
            ids: HashMap::new(),
            words: vec![String::new()],
        }
    }
}

impl Vocab {
    fn intern(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.ids.insert(word.to_string(), id);
        self.words.push(word.to_string());
        id
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.ids.get(word).copied()
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    /// Number of real words (NULL excluded).
    pub fn len(&self) -> usize {
        self.words.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode(&self, words: &[&str]) -> Vec<u32> {
        words
            .iter()
            .map(|w| self.id(w).unwrap_or(UNKNOWN_ID))
            .collect()
    }
}

/// `t(out | gen)`: probability that generating word `gen` emits `out`.
#[derive(Debug, Clone, Default)]
pub struct LexicalTable {
    probs: HashMap<(u32, u32), f64>,
    /// Flat value used before the first M-step
    uniform: Option<f64>,
}

impl LexicalTable {
    fn uniform(out_vocab_size: usize) -> Self {
        LexicalTable {
            probs: HashMap::new(),
            uniform: Some(1.0 / out_vocab_size.max(1) as f64),
        }
    }

    #[inline]
    pub fn prob(&self, gen: u32, out: u32) -> f64 {
        if out == UNKNOWN_ID || gen == UNKNOWN_ID {
            return 0.0;
        }
        match self.uniform {
            Some(u) => u,
            None => self.probs.get(&(gen, out)).copied().unwrap_or(0.0),
        }
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }
}

/// One directional model: lexical table plus the shared prior settings.
#[derive(Debug, Clone)]
struct Direction {
    table: LexicalTable,
    null_probability: f64,
    diagonal_tension: f64,
}

impl Direction {
    /// Unnormalized link weights for output position `j` of `n`.
    ///
    /// `weights[0]` is the NULL link, `weights[1 + i]` links generating
    /// position `i`. Returns the sum of all weights.
    #[inline]
    fn link_weights(&self, gen: &[u32], out_word: u32, j: usize, n: usize, weights: &mut Vec<f64>) -> f64 {
        let m = gen.len();
        weights.clear();
        weights.push(self.null_probability * self.table.prob(NULL_ID, out_word));

        let out_pos = j as f64 / n as f64;
        let mut z = 0.0;
        for i in 0..m {
            let prior = (-self.diagonal_tension * (i as f64 / m as f64 - out_pos).abs()).exp();
            z += prior;
            weights.push(prior);
        }

        let mut sum = weights[0];
        let scale = (1.0 - self.null_probability) / z;
        for (i, &g) in gen.iter().enumerate() {
            let w = weights[1 + i] * scale * self.table.prob(g, out_word);
            weights[1 + i] = w;
            sum += w;
        }
        sum
    }

    /// Row-major `n x (m + 1)` posterior matrix; column 0 is NULL.
    fn posteriors(&self, gen: &[u32], out: &[u32]) -> Vec<f64> {
        let n = out.len();
        let width = gen.len() + 1;
        let mut matrix = vec![0.0; n * width];
        let mut weights = Vec::with_capacity(width);

        for (j, &o) in out.iter().enumerate() {
            let sum = self.link_weights(gen, o, j, n, &mut weights);
            if sum > 0.0 {
                let row = &mut matrix[j * width..(j + 1) * width];
                for (cell, w) in row.iter_mut().zip(&weights) {
                    *cell = w / sum;
                }
            }
        }
        matrix
    }
}

/// Viterbi links `(gen_pos, out_pos)` read off a posterior matrix.
/// Ties go to the lowest column, and NULL wins over real positions.
fn viterbi(posteriors: &[f64], width: usize) -> Vec<(usize, usize)> {
    posteriors
        .chunks(width)
        .enumerate()
        .filter_map(|(j, row)| {
            let mut best = 0;
            for (col, &p) in row.iter().enumerate().skip(1) {
                if p > row[best] {
                    best = col;
                }
            }
            (best > 0 && row[best] > 0.0).then(|| (best - 1, j))
        })
        .collect()
}

fn train_direction(
    corpus: &[(Vec<u32>, Vec<u32>)],
    out_vocab_size: usize,
    config: &TrainingConfig,
    deadline: Option<Instant>,
    label: &str,
) -> Result<Direction, TrainingError> {
    let mut direction = Direction {
        table: LexicalTable::uniform(out_vocab_size),
        null_probability: config.null_probability,
        diagonal_tension: config.diagonal_tension,
    };

    for iteration in 0..config.iterations {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(TrainingError::Timeout {
                    limit: config.timeout().unwrap_or_default(),
                    completed: iteration,
                    requested: config.iterations,
                });
            }
        }

        // E-step. Accumulated in corpus order so the sums are reproducible.
        let mut counts: HashMap<(u32, u32), f64> = HashMap::new();
        let mut totals: HashMap<u32, f64> = HashMap::new();
        let mut weights = Vec::new();
        let mut log_likelihood = 0.0;

        for (gen, out) in corpus {
            let n = out.len();
            for (j, &o) in out.iter().enumerate() {
                let sum = direction.link_weights(gen, o, j, n, &mut weights);
                if sum <= 0.0 {
                    continue;
                }
                log_likelihood += sum.ln();

                let null_post = weights[0] / sum;
                *counts.entry((NULL_ID, o)).or_insert(0.0) += null_post;
                *totals.entry(NULL_ID).or_insert(0.0) += null_post;

                for (i, &g) in gen.iter().enumerate() {
                    let post = weights[1 + i] / sum;
                    *counts.entry((g, o)).or_insert(0.0) += post;
                    *totals.entry(g).or_insert(0.0) += post;
                }
            }
        }

        // M-step
        let probs = counts
            .into_iter()
            .map(|((g, o), c)| {
                let total = totals.get(&g).copied().unwrap_or(0.0);
                let p = if total > 0.0 { c / total } else { 0.0 };
                ((g, o), p)
            })
            .collect();
        direction.table = LexicalTable { probs, uniform: None };

        debug!(direction = label, iteration = iteration + 1, log_likelihood, "EM iteration");
    }

    Ok(direction)
}

/// Two directional models over a shared pair of vocabularies.
#[derive(Debug, Clone)]
pub struct SymmetrizedModel {
    pub source_vocab: Vocab,
    pub target_vocab: Vocab,
    /// Source generates target: `t(target | source)`
    forward: Direction,
    /// Target generates source: `t(source | target)`
    reverse: Direction,
}

impl SymmetrizedModel {
    pub fn forward_table(&self) -> &LexicalTable {
        &self.forward.table
    }

    pub fn reverse_table(&self) -> &LexicalTable {
        &self.reverse.table
    }
}

/// Train both directional models on the condensed corpus.
///
/// The two directions are independent and train in parallel. When a timeout
/// is configured and expires, the partial model is dropped.
pub fn train(corpus: &CondensedCorpus, config: &TrainingConfig) -> Result<SymmetrizedModel, TrainingError> {
    if corpus.is_empty() {
        return Err(TrainingError::EmptyCorpus);
    }

    let start = Instant::now();
    let deadline = config.timeout().map(|t| start + t);

    let mut source_vocab = Vocab::default();
    let mut target_vocab = Vocab::default();
    let encoded: Vec<(Vec<u32>, Vec<u32>)> = corpus
        .records
        .iter()
        .map(|r| {
            let src = r.source_words().into_iter().map(|w| source_vocab.intern(w)).collect();
            let trg = r.target_words().into_iter().map(|w| target_vocab.intern(w)).collect();
            (src, trg)
        })
        .collect();

    if source_vocab.is_empty() || target_vocab.is_empty() {
        return Err(TrainingError::EmptyCorpus);
    }

    let reversed: Vec<(Vec<u32>, Vec<u32>)> = encoded
        .iter()
        .map(|(s, t)| (t.clone(), s.clone()))
        .collect();

    let (forward, reverse) = rayon::join(
        || train_direction(&encoded, target_vocab.len(), config, deadline, "forward"),
        || train_direction(&reversed, source_vocab.len(), config, deadline, "reverse"),
    );

    let model = SymmetrizedModel {
        forward: forward?,
        reverse: reverse?,
        source_vocab,
        target_vocab,
    };

    info!(
        verses = corpus.len(),
        source_vocab = model.source_vocab.len(),
        target_vocab = model.target_vocab.len(),
        iterations = config.iterations,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "trained alignment model"
    );

    Ok(model)
}

/// Grow-diagonal-final-and over two directional link sets.
///
/// Both link sets are `(source_pos, target_pos)`. Starts from the
/// intersection, grows into neighbouring union links that cover an
/// unaligned word, then adds directional links whose words are both still
/// unaligned. Result is sorted.
pub fn grow_diag_final_and(
    forward: &[(usize, usize)],
    reverse: &[(usize, usize)],
    source_len: usize,
    target_len: usize,
) -> Vec<(usize, usize)> {
    const NEIGHBOURS: [(isize, isize); 8] = [(-1, 0), (0, -1), (1, 0), (0, 1), (-1, -1), (-1, 1), (1, -1), (1, 1)];

    let fwd: BTreeSet<(usize, usize)> = forward.iter().copied().collect();
    let rev: BTreeSet<(usize, usize)> = reverse.iter().copied().collect();
    let union: BTreeSet<(usize, usize)> = fwd.union(&rev).copied().collect();
    let mut alignment: BTreeSet<(usize, usize)> = fwd.intersection(&rev).copied().collect();

    let mut source_aligned = vec![false; source_len];
    let mut target_aligned = vec![false; target_len];
    for &(i, j) in &alignment {
        source_aligned[i] = true;
        target_aligned[j] = true;
    }

    loop {
        let mut added = false;
        let current: Vec<(usize, usize)> = alignment.iter().copied().collect();
        for (i, j) in current {
            for (di, dj) in NEIGHBOURS {
                let (Some(ni), Some(nj)) = (i.checked_add_signed(di), j.checked_add_signed(dj)) else {
                    continue;
                };
                if ni >= source_len || nj >= target_len {
                    continue;
                }
                let link = (ni, nj);
                if (!source_aligned[ni] || !target_aligned[nj])
                    && union.contains(&link)
                    && alignment.insert(link)
                {
                    source_aligned[ni] = true;
                    target_aligned[nj] = true;
                    added = true;
                }
            }
        }
        if !added {
            break;
        }
    }

    for directional in [&fwd, &rev] {
        for &(i, j) in directional {
            if !source_aligned[i] && !target_aligned[j] {
                alignment.insert((i, j));
                source_aligned[i] = true;
                target_aligned[j] = true;
            }
        }
    }

    alignment.into_iter().collect()
}

/// Symmetrized links of one verse with their confidence.
fn align_verse(model: &SymmetrizedModel, record: &VerseRecord) -> Vec<AlignmentPair> {
    let source_words = record.source_words();
    let target_words = record.target_words();
    let src = model.source_vocab.encode(&source_words);
    let trg = model.target_vocab.encode(&target_words);

    // forward: rows are target positions, columns NULL + source positions
    let fwd_post = model.forward.posteriors(&src, &trg);
    let rev_post = model.reverse.posteriors(&trg, &src);
    let fwd_width = src.len() + 1;
    let rev_width = trg.len() + 1;

    let fwd_links = viterbi(&fwd_post, fwd_width);
    let rev_links: Vec<(usize, usize)> = viterbi(&rev_post, rev_width)
        .into_iter()
        .map(|(j, i)| (i, j))
        .collect();

    let links = grow_diag_final_and(&fwd_links, &rev_links, src.len(), trg.len());

    // Collapse repeated (source, target) links within the verse
    let mut pairs: Vec<AlignmentPair> = Vec::new();
    let mut seen: HashMap<(&str, &str), usize> = HashMap::new();
    for (i, j) in links {
        let score = (fwd_post[j * fwd_width + i + 1] + rev_post[i * rev_width + j + 1]) / 2.0;
        let key = (source_words[i], target_words[j]);
        match seen.get(&key) {
            Some(&idx) => {
                let pair = &mut pairs[idx];
                let n = pair.pair_count as f64;
                pair.alignment_score = (pair.alignment_score * n + score) / (n + 1.0);
                pair.pair_count += 1;
            }
            None => {
                seen.insert(key, pairs.len());
                pairs.push(AlignmentPair {
                    verse_id: record.verse_id.clone(),
                    source_word: key.0.to_string(),
                    target_word: key.1.to_string(),
                    alignment_score: score,
                    pair_count: 1,
                });
            }
        }
    }
    pairs
}

/// Align every verse of the corpus. Output follows corpus order.
pub fn align(model: &SymmetrizedModel, corpus: &CondensedCorpus) -> Vec<AlignmentPair> {
    let per_verse: Vec<Vec<AlignmentPair>> = corpus
        .records
        .par_iter()
        .map(|record| align_verse(model, record))
        .collect();

    let pairs: Vec<AlignmentPair> = per_verse.into_iter().flatten().collect();
    debug!(verses = corpus.len(), pairs = pairs.len(), "aligned corpus");
    pairs
}

/// Group per-verse pairs by (source, target) in first-seen order.
///
/// `alignment_count` is the number of verses the pair was aligned in and
/// `alignment_score` the mean of the per-verse scores.
pub fn aggregate_alignments(pairs: &[AlignmentPair]) -> Vec<AlignmentSummary> {
    let mut summaries: Vec<AlignmentSummary> = Vec::new();
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();

    for pair in pairs {
        let key = (pair.source_word.as_str(), pair.target_word.as_str());
        match index.get(&key) {
            Some(&idx) => {
                let summary = &mut summaries[idx];
                summary.alignment_count += 1;
                summary.alignment_score += pair.alignment_score;
            }
            None => {
                index.insert(key, summaries.len());
                summaries.push(AlignmentSummary {
                    source_word: pair.source_word.clone(),
                    target_word: pair.target_word.clone(),
                    alignment_count: 1,
                    alignment_score: pair.alignment_score,
                });
            }
        }
    }

    for summary in &mut summaries {
        summary.alignment_score /= summary.alignment_count as f64;
    }
    summaries
}

/// Verse-independent lexical translation score of a surface word pair:
/// the mean of `t(target | source)` and `t(source | target)`. Unknown words
/// score 0.
pub fn translation_score(model: &SymmetrizedModel, source_word: &str, target_word: &str) -> f64 {
    let (Some(s), Some(t)) = (model.source_vocab.id(source_word), model.target_vocab.id(target_word)) else {
        return 0.0;
    };
    (model.forward.table.prob(s, t) + model.reverse.table.prob(t, s)) / 2.0
}

/// Translation scores for every distinct (source, target) surface pair
/// that co-occurs in a condensed verse, in first-seen order, with the number
/// of verses in which both words occur.
pub fn translation_scores(model: &SymmetrizedModel, corpus: &CondensedCorpus) -> Vec<TranslationScore> {
    let mut pairs: Vec<((&str, &str), u32)> = Vec::new();
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();

    for record in &corpus.records {
        let targets = unique(record.target_words());
        for source in unique(record.source_words()) {
            for &target in &targets {
                match index.get(&(source, target)) {
                    Some(&idx) => pairs[idx].1 += 1,
                    None => {
                        index.insert((source, target), pairs.len());
                        pairs.push(((source, target), 1));
                    }
                }
            }
        }
    }

    let scores: Vec<TranslationScore> = pairs
        .par_iter()
        .map(|&((source, target), co_occurrence_count)| TranslationScore {
            source_word: source.to_string(),
            target_word: target.to_string(),
            translation_score: translation_score(model, source, target),
            co_occurrence_count,
        })
        .collect();

    debug!(pairs = scores.len(), verses = corpus.len(), "scored co-occurring pairs");
    scores
}

/// Words in first-occurrence order with repeats removed.
fn unique(words: Vec<&str>) -> Vec<&str> {
    let mut seen = HashSet::new();
    words.into_iter().filter(|w| seen.insert(*w)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condense::condense;
    use crate::models::DEFAULT_RANGE_MARKER;

    fn corpus(source: &[&str], target: &[&str]) -> CondensedCorpus {
        let refs: Vec<String> = (1..=source.len()).map(|i| format!("V{}", i)).collect();
        condense(source, target, &refs, DEFAULT_RANGE_MARKER).unwrap()
    }

    fn sample_lines() -> Vec<&'static str> {
        vec![
            "in the beginning god created heaven",
            "the earth was without form",
            "god said let there be light",
            "and there was light",
            "god saw the light was good",
            "god divided light from darkness",
        ]
    }

    #[test]
    fn test_empty_corpus_rejected() {
        let empty = corpus(&["", " "], &["a", ""]);
        let err = train(&empty, &TrainingConfig::default()).unwrap_err();
        assert_eq!(err, TrainingError::EmptyCorpus);
    }

    #[test]
    fn test_zero_timeout_drops_model() {
        let lines = sample_lines();
        let c = corpus(&lines, &lines);
        let config = TrainingConfig {
            timeout_secs: Some(0),
            ..TrainingConfig::default()
        };
        let err = train(&c, &config).unwrap_err();
        assert!(matches!(err, TrainingError::Timeout { completed: 0, .. }));
    }

    #[test]
    fn test_self_alignment_is_confident() {
        let lines = sample_lines();
        let c = corpus(&lines, &lines);
        let model = train(&c, &TrainingConfig::default()).unwrap();
        let pairs = align(&model, &c);

        assert!(!pairs.is_empty());
        for pair in pairs.iter().filter(|p| p.source_word == p.target_word) {
            assert!(
                pair.alignment_score > 0.85,
                "{} -> {} scored {}",
                pair.source_word,
                pair.target_word,
                pair.alignment_score
            );
        }

        // Every word of every verse is linked to itself
        for record in &c.records {
            for word in record.source_words() {
                assert!(pairs
                    .iter()
                    .any(|p| p.verse_id == record.verse_id && p.source_word == word && p.target_word == word));
            }
        }
    }

    #[test]
    fn test_training_is_deterministic() {
        let lines = sample_lines();
        let c = corpus(&lines, &lines);
        let a = align(&train(&c, &TrainingConfig::default()).unwrap(), &c);
        let b = align(&train(&c, &TrainingConfig::default()).unwrap(), &c);
        assert_eq!(a, b);
    }

    #[test]
    fn test_translation_score_prefers_true_pair() {
        let lines = sample_lines();
        let c = corpus(&lines, &lines);
        let model = train(&c, &TrainingConfig::default()).unwrap();

        let same = translation_score(&model, "god", "god");
        let other = translation_score(&model, "god", "darkness");
        assert!(same > other);
        assert_eq!(translation_score(&model, "god", "missing"), 0.0);
    }

    #[test]
    fn test_grow_diag_final_and() {
        // Grows (1,1) off the agreed (0,0), then (2,1) since source 2 is still free
        let links = grow_diag_final_and(&[(0, 0), (2, 1)], &[(0, 0), (1, 1)], 3, 2);
        assert_eq!(links, vec![(0, 0), (1, 1), (2, 1)]);

        // A link outside the union is never grown
        let links = grow_diag_final_and(&[(0, 0)], &[(0, 0), (1, 1)], 3, 2);
        assert_eq!(links, vec![(0, 0), (1, 1)]);

        // Disjoint directions: final-and only adds links covering two free words
        let links = grow_diag_final_and(&[(0, 0)], &[(0, 1), (1, 1)], 2, 2);
        assert_eq!(links, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_grow_requires_union_membership() {
        let links = grow_diag_final_and(&[(0, 0)], &[(0, 0)], 2, 2);
        assert_eq!(links, vec![(0, 0)]);
    }

    #[test]
    fn test_viterbi_prefers_null_on_ties() {
        let post = vec![0.5, 0.5, 0.0, 0.0, 0.2, 0.8];
        assert_eq!(viterbi(&post, 3), vec![(1, 1)]);
    }

    fn pair(verse: &str, s: &str, t: &str, score: f64) -> AlignmentPair {
        AlignmentPair {
            verse_id: verse.into(),
            source_word: s.into(),
            target_word: t.into(),
            alignment_score: score,
            pair_count: 3,
        }
    }

    #[test]
    fn test_aggregate_counts_verses_and_averages() {
        let pairs = vec![
            pair("V1", "god", "mungu", 0.8),
            pair("V1", "light", "nuru", 0.9),
            pair("V2", "god", "mungu", 0.6),
        ];
        let summaries = aggregate_alignments(&pairs);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].source_word, "god");
        assert_eq!(summaries[0].alignment_count, 2);
        assert!((summaries[0].alignment_score - 0.7).abs() < 1e-12);
        assert_eq!(summaries[1].alignment_count, 1);
    }

    #[test]
    fn test_translation_scores_co_occurrence() {
        let c = corpus(&["a b", "a c", "b"], &["x y", "x", "y y"]);
        let model = train(&c, &TrainingConfig::default()).unwrap();

        let scores = translation_scores(&model, &c);
        let rows: Vec<(&str, &str, u32)> = scores
            .iter()
            .map(|s| (s.source_word.as_str(), s.target_word.as_str(), s.co_occurrence_count))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("a", "x", 2),
                ("a", "y", 1),
                ("b", "x", 1),
                ("b", "y", 2),
                ("c", "x", 1),
            ]
        );
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(&s.translation_score)));
    }

    #[test]
    fn test_translation_scores_cover_unaligned_pairs() {
        let lines = sample_lines();
        let mut target = lines.clone();
        target.rotate_left(1);
        let c = corpus(&lines, &target);
        let model = train(&c, &TrainingConfig::default()).unwrap();
        let summaries = aggregate_alignments(&align(&model, &c));

        let scores = translation_scores(&model, &c);
        assert!(scores.len() > summaries.len());
        for score in &scores {
            assert_eq!(
                score.translation_score,
                translation_score(&model, &score.source_word, &score.target_word)
            );
        }
    }
}
