//! Compiles annotation references into ordered word segments.
//!
//! A reference such as `"alii ... faverent partibus"` becomes the segments
//! `[["alii"], ["faverent", "partibus"]]`; any gap of words is allowed
//! between consecutive segments when matching.

use crate::data::NoteEntry;
use crate::text::{normalize, split_words};
use serde::Serialize;

const ELLIPSIS: &str = "...";
const ELLIPSIS_GLYPH: char = '\u{2026}';
const MAX_DISPLAY_WORDS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pattern {
    pub id: String,
    pub reference: String,
    pub display_ref: String,
    pub body: String,
    /// Never empty, and no segment is empty.
    pub segments: Vec<Vec<String>>,
    pub flat_tokens: Vec<String>,
}

impl Pattern {
    /// Compiles `reference`, returning `None` when it holds no words.
    pub fn compile(id: impl Into<String>, reference: &str, body: impl Into<String>) -> Option<Self> {
        let segments = compile_segments(reference);
        if segments.is_empty() {
            return None;
        }
        Some(Self::from_segments(id.into(), reference, body.into(), segments))
    }

    /// A wildcard-free pattern over already normalized words.
    pub fn contiguous(
        id: impl Into<String>,
        reference: &str,
        tokens: Vec<String>,
        body: impl Into<String>,
    ) -> Option<Self> {
        let tokens: Vec<String> = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            return None;
        }
        Some(Self::from_segments(
            id.into(),
            reference,
            body.into(),
            vec![tokens],
        ))
    }

    fn from_segments(id: String, reference: &str, body: String, segments: Vec<Vec<String>>) -> Self {
        let flat_tokens = segments.concat();
        Self {
            id,
            reference: reference.to_string(),
            display_ref: display_reference(reference),
            body,
            segments,
            flat_tokens,
        }
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments.len() > 1
    }
}

/// Splits a reference on whitespace and groups normalized words into segments.
///
/// A word containing `...` or `…` closes the current segment and contributes
/// no token itself.
pub fn compile_segments(reference: &str) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for raw in split_words(reference) {
        if raw.contains(ELLIPSIS) || raw.contains(ELLIPSIS_GLYPH) {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            continue;
        }
        let word = normalize(raw);
        if !word.is_empty() {
            current.push(word);
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Compiles the entries that apply to `chapter`; ids are `note-{file index}`.
pub fn compile_notes(entries: &[NoteEntry], chapter: u32) -> Vec<Pattern> {
    entries
        .iter()
        .filter(|entry| entry.applies_to(chapter))
        .filter_map(|entry| {
            Pattern::compile(
                format!("note-{}", entry.index),
                &entry.reference,
                entry.body.clone(),
            )
        })
        .collect()
}

/// Shortens references longer than twelve words to `first six … last six`.
pub fn display_reference(reference: &str) -> String {
    let words: Vec<&str> = split_words(reference).collect();
    if words.len() <= MAX_DISPLAY_WORDS {
        return reference.to_string();
    }
    let head = MAX_DISPLAY_WORDS.div_ceil(2);
    let tail = MAX_DISPLAY_WORDS / 2;
    format!(
        "{} … {}",
        words[..head].join(" "),
        words[words.len() - tail..].join(" ")
    )
}
