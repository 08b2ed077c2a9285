//! Finds non-overlapping placements of note patterns over a word stream.
//!
//! Every anchor where a pattern's first segment matches yields at most one
//! candidate; later segments are located leftmost-first after the previous
//! one. Candidates are then accepted longest first, leftmost first among
//! equal lengths, skipping any that touch an already claimed word.

use crate::pattern::Pattern;
use crate::text::TokenStream;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub start: usize,
    /// Covered span including gap words, not the sum of segment lengths.
    pub length: usize,
    pub pattern_id: String,
}

impl Match {
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn covers(&self, position: usize) -> bool {
        position >= self.start && position < self.end()
    }
}

/// Accepted matches keyed by starting word position; pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementMap {
    placements: BTreeMap<usize, Match>,
}

impl PlacementMap {
    pub fn get(&self, start: usize) -> Option<&Match> {
        self.placements.get(&start)
    }

    /// The accepted match covering word `position`, if any.
    pub fn covering(&self, position: usize) -> Option<&Match> {
        self.placements
            .range(..=position)
            .next_back()
            .map(|(_, found)| found)
            .filter(|found| found.covers(position))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Match> + '_ {
        self.placements.values()
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn into_vec(self) -> Vec<Match> {
        self.placements.into_values().collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    start: usize,
    length: usize,
    pattern: usize,
}

/// Runs candidate generation and conflict resolution over a token stream.
pub fn find_matches(patterns: &[Pattern], stream: &TokenStream) -> PlacementMap {
    find_matches_in(patterns, &stream.normalized_words())
}

/// Same as [`find_matches`] over bare normalized words.
pub fn find_matches_in<S: AsRef<str>>(patterns: &[Pattern], words: &[S]) -> PlacementMap {
    let mut candidates = Vec::new();
    for (idx, pattern) in patterns.iter().enumerate() {
        collect_candidates(idx, &pattern.segments, words, &mut candidates);
    }
    resolve(patterns, candidates, words.len())
}

fn collect_candidates<S: AsRef<str>>(
    pattern: usize,
    segments: &[Vec<String>],
    words: &[S],
    out: &mut Vec<Candidate>,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if first.is_empty() || first.len() > words.len() {
        return;
    }
    'anchor: for start in 0..=words.len() - first.len() {
        if !segment_at(words, first, start) {
            continue;
        }
        let mut end = start + first.len();
        for segment in rest {
            match find_segment(words, segment, end) {
                Some(found) => end = found + segment.len(),
                None => continue 'anchor,
            }
        }
        out.push(Candidate {
            start,
            length: end - start,
            pattern,
        });
    }
}

fn segment_at<S: AsRef<str>>(words: &[S], segment: &[String], at: usize) -> bool {
    at + segment.len() <= words.len()
        && segment
            .iter()
            .zip(&words[at..])
            .all(|(expected, word)| expected == word.as_ref())
}

/// Leftmost position at or after `from` where `segment` matches contiguously.
fn find_segment<S: AsRef<str>>(words: &[S], segment: &[String], from: usize) -> Option<usize> {
    if segment.is_empty() {
        return None;
    }
    let last = words.len().checked_sub(segment.len())?;
    (from..=last).find(|&at| segment_at(words, segment, at))
}

fn resolve(patterns: &[Pattern], mut candidates: Vec<Candidate>, word_count: usize) -> PlacementMap {
    candidates.sort_by(|a, b| b.length.cmp(&a.length).then(a.start.cmp(&b.start)));
    let mut claimed = vec![false; word_count];
    let mut map = PlacementMap::default();
    for candidate in candidates {
        let span = candidate.start..candidate.start + candidate.length;
        if claimed[span.clone()].iter().any(|&taken| taken) {
            continue;
        }
        claimed[span].iter_mut().for_each(|taken| *taken = true);
        map.placements.insert(
            candidate.start,
            Match {
                start: candidate.start,
                length: candidate.length,
                pattern_id: patterns[candidate.pattern].id.clone(),
            },
        );
    }
    map
}
