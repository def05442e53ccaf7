//! Word index: normalized word -> verse-ids where it occurs.
//!
//! One index is built per text and persisted through the cache layer, then
//! narrowed to the verse-ids of a specific condensed corpus before use.

use crate::cache::{Cache, CacheKey, CacheStore};
use crate::models::WordIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Case-fold and strip punctuation.
///
/// A token made only of punctuation keeps its original form so distinct
/// symbols do not collapse onto the empty word.
pub fn normalize_word(token: &str) -> String {
    let normalized: String = token
        .chars()
        .filter(|&c| !is_punctuation(c))
        .flat_map(char::to_lowercase)
        .collect();

    if normalized.is_empty() {
        token.to_string()
    } else {
        normalized
    }
}

/// ASCII punctuation plus the quotation marks, dashes and sentence marks
/// common in scripture translations. Combining marks are never stripped.
#[inline]
fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '‘' | '’' | '‚' | '‛' | '“' | '”' | '„' | '«' | '»' | '‹' | '›'
                | '–' | '—' | '―' | '…' | '¿' | '¡' | '·' | '¶' | '§'
                | '、' | '。' | '，' | '；' | '：' | '！' | '？' | '「' | '」'
                | '।' | '॥' | '؟' | '،' | '؛' | '۔'
        )
}

impl WordIndex {
    /// Build an index from `(verse_id, text)` pairs.
    ///
    /// Lines equal to `marker` carry no words of their own and are skipped.
    pub fn build<'a, I>(verses: I, marker: &str) -> WordIndex
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut entries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (verse_id, text) in verses {
            let text = text.trim();
            if text.is_empty() || text == marker {
                continue;
            }
            for token in text.split_whitespace() {
                entries
                    .entry(normalize_word(token))
                    .or_default()
                    .insert(verse_id.to_string());
            }
        }

        WordIndex { entries }
    }

    /// Build from a line sequence aligned to the canonical verse list.
    pub fn from_lines<S: AsRef<str>>(verse_refs: &[String], lines: &[S], marker: &str) -> WordIndex {
        WordIndex::build(
            verse_refs
                .iter()
                .map(String::as_str)
                .zip(lines.iter().map(AsRef::as_ref)),
            marker,
        )
    }

    /// Re-home occurrences recorded under merged range ids onto their host
    /// verse, so the words of a merged verse count toward the verse that
    /// absorbed it.
    pub fn fold_merged(&self, merge_map: &HashMap<String, String>) -> WordIndex {
        if merge_map.is_empty() {
            return self.clone();
        }

        let entries = self
            .entries
            .iter()
            .map(|(word, verses)| {
                let folded = verses
                    .iter()
                    .map(|v| merge_map.get(v).unwrap_or(v).clone())
                    .collect();
                (word.clone(), folded)
            })
            .collect();

        WordIndex { entries }
    }

    /// Intersect every word's verse set with `subset`. Words left with no
    /// verses are dropped.
    pub fn restrict(&self, subset: &HashSet<String>) -> WordIndex {
        let entries = self
            .entries
            .iter()
            .filter_map(|(word, verses)| {
                let kept: BTreeSet<String> = verses
                    .iter()
                    .filter(|v| subset.contains(v.as_str()))
                    .cloned()
                    .collect();
                (!kept.is_empty()).then(|| (word.clone(), kept))
            })
            .collect();

        WordIndex { entries }
    }

    /// Verse-ids for an already normalized word.
    pub fn verses(&self, word: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(word)
    }

    pub fn contains(&self, word: &str) -> bool {
        self.entries.contains_key(word)
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Return the cached index for `key`, building and persisting it on a miss
/// or when `refresh` is set.
pub fn get_or_build<S, T>(
    cache: &Cache<S>,
    key: &CacheKey,
    refresh: bool,
    verse_refs: &[String],
    lines: &[T],
    marker: &str,
) -> WordIndex
where
    S: CacheStore,
    T: AsRef<str>,
{
    cache.get_or_build(key, refresh, || {
        let index = WordIndex::from_lines(verse_refs, lines, marker);
        debug!(key = key.as_str(), words = index.len(), "built word index");
        index
    })
}
