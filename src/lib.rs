pub mod content;
pub mod data;
pub mod dictionary;
pub mod error;
pub mod matcher;
pub mod pattern;
pub mod render;
pub mod store;
pub mod text;

#[cfg(feature = "web")]
pub mod web;

pub use content::{ChapterContext, ContentConfig, ContentSource, NotesStatus, TextStatus};
pub use data::{NoteEntry, UserEntry, parse_note_map};
pub use dictionary::{Endpoint, LookupGate, LookupOutcome, lookup_candidates};
pub use error::{ContentError, LookupError, StoreError};
pub use matcher::{Match, PlacementMap, find_matches, find_matches_in};
pub use pattern::{Pattern, compile_notes, compile_segments, display_reference};
pub use render::{Annotator, Layer, Segment, escape_html, render_html, render_rich_text};
pub use store::{UserKind, UserStore};
pub use text::{
    Token, TokenStream, WordToken, is_space, normalize, split_words, strip_enclitic, tokenize,
};

/// Compiles `notes_json` for `chapter` and places it over `text`.
///
/// Malformed annotation JSON is treated as an empty note set.
pub fn annotate(chapter: u32, text: &str, notes_json: &str) -> (ChapterContext, PlacementMap) {
    let entries = parse_note_map(notes_json).unwrap_or_default();
    let context = ChapterContext::new(chapter, text.to_string(), &entries);
    let placements = context.placements();
    (context, placements)
}
