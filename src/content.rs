//! Chapter-scoped text and annotation loading with fallback paths.
//!
//! Load failures never propagate: a missing text produces an empty token
//! stream and a placeholder, missing or malformed notes produce an empty
//! note set.

use crate::data::{NoteEntry, parse_note_map};
use crate::error::ContentError;
use crate::matcher::{PlacementMap, find_matches};
use crate::pattern::{Pattern, compile_notes};
use crate::text::{TokenStream, tokenize};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHAPTER_PLACEHOLDER: &str = "{chapter}";

#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub root: PathBuf,
    pub text_template: String,
    pub notes_template: String,
    pub fallback_notes: String,
    pub default_chapter: u32,
    pub chapters: Vec<u32>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("content"),
            text_template: "texts/atticus-ch{chapter}.txt".to_string(),
            notes_template: "notes/notes-ch{chapter}.json".to_string(),
            fallback_notes: "notes.json".to_string(),
            default_chapter: 2,
            chapters: vec![1, 2],
        }
    }
}

impl ContentConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn text_path(&self, chapter: u32) -> PathBuf {
        self.root.join(fill_template(&self.text_template, chapter))
    }

    pub fn notes_path(&self, chapter: u32) -> PathBuf {
        self.root.join(fill_template(&self.notes_template, chapter))
    }

    pub fn fallback_notes_path(&self) -> PathBuf {
        self.root.join(&self.fallback_notes)
    }
}

fn fill_template(template: &str, chapter: u32) -> String {
    template.replace(CHAPTER_PLACEHOLDER, &chapter.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TextStatus {
    Loaded,
    /// The default chapter's text stands in for the requested one.
    Fallback { chapter: u32 },
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotesStatus {
    Loaded,
    Fallback,
    Missing,
    Malformed,
}

#[derive(Debug, Clone)]
pub struct NotesAsset {
    pub entries: Vec<NoteEntry>,
    pub status: NotesStatus,
}

#[derive(Debug, Clone)]
pub struct ContentSource {
    config: ContentConfig,
}

impl ContentSource {
    pub fn new(config: ContentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContentConfig {
        &self.config
    }

    /// Reads the chapter text, falling back to the default chapter's text.
    pub fn load_text(&self, chapter: u32) -> (Option<String>, TextStatus) {
        match read_resource(&self.config.text_path(chapter)) {
            Ok(text) => return (Some(unescape_newlines(&text)), TextStatus::Loaded),
            Err(err) => debug!(chapter, error = %err, "chapter text unavailable"),
        }
        let fallback = self.config.default_chapter;
        if fallback != chapter {
            match read_resource(&self.config.text_path(fallback)) {
                Ok(text) => {
                    return (
                        Some(unescape_newlines(&text)),
                        TextStatus::Fallback { chapter: fallback },
                    );
                }
                Err(err) => warn!(chapter, fallback, error = %err, "fallback text unavailable"),
            }
        }
        (None, TextStatus::Missing)
    }

    /// Reads the chapter annotation map, falling back to the shared notes file.
    ///
    /// A resource that exists but does not parse is reported as malformed and
    /// is not retried against the fallback.
    pub fn load_notes(&self, chapter: u32) -> NotesAsset {
        let primary = self.config.notes_path(chapter);
        match read_notes(&primary) {
            Ok(entries) => {
                return NotesAsset {
                    entries,
                    status: NotesStatus::Loaded,
                };
            }
            Err(err @ ContentError::Parse { .. }) => {
                warn!(chapter, error = %err, "malformed chapter notes");
                return NotesAsset {
                    entries: Vec::new(),
                    status: NotesStatus::Malformed,
                };
            }
            Err(err) => debug!(chapter, error = %err, "chapter notes unavailable"),
        }
        match read_notes(&self.config.fallback_notes_path()) {
            Ok(entries) => NotesAsset {
                entries,
                status: NotesStatus::Fallback,
            },
            Err(err @ ContentError::Parse { .. }) => {
                warn!(chapter, error = %err, "malformed fallback notes");
                NotesAsset {
                    entries: Vec::new(),
                    status: NotesStatus::Malformed,
                }
            }
            Err(err) => {
                debug!(chapter, error = %err, "fallback notes unavailable");
                NotesAsset {
                    entries: Vec::new(),
                    status: NotesStatus::Missing,
                }
            }
        }
    }

    /// Builds a fresh context for `chapter`; nothing is shared with earlier ones.
    pub fn load_chapter(&self, chapter: u32) -> ChapterContext {
        let notes = self.load_notes(chapter);
        let (text, text_status) = self.load_text(chapter);
        let mut context = ChapterContext::new(chapter, text.unwrap_or_default(), &notes.entries);
        context.text_status = text_status;
        context.notes_status = notes.status;
        context
    }
}

fn read_resource(path: &Path) -> Result<String, ContentError> {
    fs::read_to_string(path).map_err(|source| ContentError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_notes(path: &Path) -> Result<Vec<NoteEntry>, ContentError> {
    let json = read_resource(path)?;
    parse_note_map(&json).map_err(|source| ContentError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Converts literal `\r\n` and `\n` escape sequences into real newlines.
pub fn unescape_newlines(text: &str) -> String {
    text.replace("\\r\\n", "\n").replace("\\n", "\n")
}

/// Everything the reader needs for one chapter.
#[derive(Debug, Clone)]
pub struct ChapterContext {
    pub chapter: u32,
    pub text: String,
    pub stream: TokenStream,
    pub patterns: Vec<Pattern>,
    pub text_status: TextStatus,
    pub notes_status: NotesStatus,
}

impl ChapterContext {
    pub fn new(chapter: u32, text: String, entries: &[NoteEntry]) -> Self {
        let stream = tokenize(&text);
        Self {
            chapter,
            stream,
            text,
            patterns: compile_notes(entries, chapter),
            text_status: TextStatus::Loaded,
            notes_status: NotesStatus::Loaded,
        }
    }

    /// Recomputed on every call.
    pub fn placements(&self) -> PlacementMap {
        find_matches(&self.patterns, &self.stream)
    }

    pub fn pattern(&self, id: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|pattern| pattern.id == id)
    }

    pub fn text_placeholder(&self) -> Option<String> {
        match self.text_status {
            TextStatus::Missing => Some(format!(
                "Sorry — text for chapter {} is not available.",
                self.chapter
            )),
            _ => None,
        }
    }

    pub fn notes_placeholder(&self) -> Option<String> {
        match self.notes_status {
            NotesStatus::Missing => Some(format!(
                "Notes not available for chapter {}. Check that the content directory holds the chapter's notes file.",
                self.chapter
            )),
            NotesStatus::Malformed => Some(format!(
                "Notes could not be parsed for chapter {}.",
                self.chapter
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_substitute_the_chapter() {
        let config = ContentConfig::with_root("/srv/reader");
        assert_eq!(
            config.text_path(7),
            PathBuf::from("/srv/reader/texts/atticus-ch7.txt")
        );
        assert_eq!(
            config.notes_path(12),
            PathBuf::from("/srv/reader/notes/notes-ch12.json")
        );
    }

    #[test]
    fn escaped_newlines_become_real_ones() {
        assert_eq!(unescape_newlines(r"one\r\ntwo\nthree"), "one\ntwo\nthree");
        assert_eq!(unescape_newlines("plain\ntext"), "plain\ntext");
    }

    #[test]
    fn context_placements_use_chapter_scoped_notes() {
        let entries = parse_note_map(
            r#"{
                "Pater mature decessit": "his father died young",
                "Ipse": {"note": "Atticus himself", "chapter": 3}
            }"#,
        )
        .unwrap();
        let context = ChapterContext::new(2, "Pater mature decessit. Ipse".to_string(), &entries);
        assert_eq!(context.patterns.len(), 1);
        let placements = context.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements.get(0).map(|m| m.length), Some(3));
        assert_eq!(
            context.pattern("note-0").map(|p| p.body.as_str()),
            Some("his father died young")
        );
    }

    #[test]
    fn missing_statuses_have_placeholders() {
        let mut context = ChapterContext::new(4, String::new(), &[]);
        assert!(context.text_placeholder().is_none());
        context.text_status = TextStatus::Missing;
        context.notes_status = NotesStatus::Malformed;
        assert_eq!(
            context.text_placeholder().as_deref(),
            Some("Sorry — text for chapter 4 is not available.")
        );
        assert_eq!(
            context.notes_placeholder().as_deref(),
            Some("Notes could not be parsed for chapter 4.")
        );
        assert!(context.placements().is_empty());
    }
}
