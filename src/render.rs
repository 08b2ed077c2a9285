//! Turns a token stream and its placements into annotated output.

use crate::matcher::PlacementMap;
use crate::pattern::Pattern;
use crate::text::{Token, TokenStream};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

static STRONG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
static EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.+?)\*").expect("valid regex"));

/// Link from a rendered word back to the note that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteLink {
    pub note_id: String,
    /// Shared by every word of one placed phrase: `{note_id}-{token index}`.
    pub group: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Segment<'a> {
    Space {
        raw: &'a str,
    },
    Word {
        raw: &'a str,
        position: usize,
        note: Option<NoteLink>,
        gloss: Option<String>,
        user_note: Option<String>,
    },
}

/// Placements together with the patterns they refer to.
#[derive(Debug, Clone, Copy)]
pub struct Layer<'a> {
    pub placements: &'a PlacementMap,
    pub patterns: &'a [Pattern],
}

impl<'a> Layer<'a> {
    pub fn new(placements: &'a PlacementMap, patterns: &'a [Pattern]) -> Self {
        Self {
            placements,
            patterns,
        }
    }

    fn bodies(&self) -> HashMap<&'a str, &'a str> {
        self.patterns
            .iter()
            .map(|pattern| (pattern.id.as_str(), pattern.body.as_str()))
            .collect()
    }

    fn body_at(&self, bodies: &HashMap<&'a str, &'a str>, position: usize) -> Option<String> {
        self.placements
            .covering(position)
            .and_then(|found| bodies.get(found.pattern_id.as_str()))
            .map(|body| body.to_string())
    }
}

/// Walks the token stream once, attaching notes and optional user overlays.
pub struct Annotator<'a> {
    stream: &'a TokenStream,
    notes: Layer<'a>,
    vocab: Option<Layer<'a>>,
    user_notes: Option<Layer<'a>>,
}

impl<'a> Annotator<'a> {
    pub fn new(stream: &'a TokenStream, notes: Layer<'a>) -> Self {
        Self {
            stream,
            notes,
            vocab: None,
            user_notes: None,
        }
    }

    pub fn with_vocab(mut self, layer: Layer<'a>) -> Self {
        self.vocab = Some(layer);
        self
    }

    pub fn with_user_notes(mut self, layer: Layer<'a>) -> Self {
        self.user_notes = Some(layer);
        self
    }

    pub fn segments(&self) -> Vec<Segment<'a>> {
        let note_bodies = self.notes.bodies();
        let vocab_bodies = self.vocab.map(|layer| layer.bodies()).unwrap_or_default();
        let user_bodies = self.user_notes.map(|layer| layer.bodies()).unwrap_or_default();

        self.stream
            .tokens()
            .iter()
            .map(|token| match token {
                Token::Space { raw } => Segment::Space { raw: raw.as_str() },
                Token::Word(word) => {
                    let note = self.notes.placements.covering(word.position).map(|found| {
                        let first_token = self.stream.token_index(found.start).unwrap_or_default();
                        NoteLink {
                            note_id: found.pattern_id.clone(),
                            group: format!("{}-{}", found.pattern_id, first_token),
                            body: note_bodies
                                .get(found.pattern_id.as_str())
                                .map(|body| body.to_string())
                                .unwrap_or_default(),
                        }
                    });
                    Segment::Word {
                        raw: &word.raw,
                        position: word.position,
                        note,
                        gloss: self
                            .vocab
                            .and_then(|layer| layer.body_at(&vocab_bodies, word.position)),
                        user_note: self
                            .user_notes
                            .and_then(|layer| layer.body_at(&user_bodies, word.position)),
                    }
                }
            })
            .collect()
    }

    pub fn render_html(&self) -> String {
        render_html(&self.segments())
    }
}

/// Emits one `<p>` of word spans; whitespace is preserved verbatim.
pub fn render_html(segments: &[Segment<'_>]) -> String {
    let mut html = String::from("<p>");
    for segment in segments {
        match segment {
            Segment::Space { raw } => html.push_str(&escape_attr(raw)),
            Segment::Word {
                raw,
                note,
                gloss,
                user_note,
                ..
            } => {
                let mut classes = vec!["word"];
                if note.is_some() {
                    classes.push("note-available");
                }
                if gloss.is_some() {
                    classes.push("user-vocab");
                }
                if user_note.is_some() {
                    classes.push("user-note");
                }
                html.push_str(&format!(
                    r#"<span class="{}" data-raw="{}""#,
                    classes.join(" "),
                    escape_attr(raw)
                ));
                if let Some(link) = note {
                    let body = escape_attr(&link.body);
                    html.push_str(&format!(
                        r#" data-note-id="{}" data-note-group="{}" data-note-text="{body}" title="{body}""#,
                        escape_attr(&link.note_id),
                        escape_attr(&link.group),
                    ));
                }
                if let Some(gloss) = gloss {
                    html.push_str(&format!(r#" data-gloss="{}""#, escape_attr(gloss)));
                }
                if let Some(text) = user_note {
                    html.push_str(&format!(r#" data-user-note="{}""#, escape_attr(text)));
                }
                html.push('>');
                html.push_str(&escape_attr(raw));
                html.push_str("</span>");
            }
        }
    }
    html.push_str("</p>");
    html
}

/// Escapes HTML metacharacters and turns newlines into `<br>`.
pub fn escape_html(input: &str) -> String {
    escape_attr(input).replace('\n', "<br>")
}

fn escape_attr(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Escapes first, then reintroduces `**bold**` and `*italic*` only.
pub fn render_rich_text(raw: &str) -> String {
    let escaped = escape_html(raw);
    let strong = STRONG.replace_all(&escaped, "<strong>$1</strong>");
    EMPHASIS.replace_all(&strong, "<em>$1</em>").into_owned()
}
