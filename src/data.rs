use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One entry of an annotation map, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteEntry {
    pub index: usize,
    pub reference: String,
    pub body: String,
    /// `None` applies the entry to every chapter.
    pub chapters: Option<Vec<u32>>,
}

impl NoteEntry {
    pub fn applies_to(&self, chapter: u32) -> bool {
        self.chapters
            .as_ref()
            .is_none_or(|chapters| chapters.contains(&chapter))
    }
}

/// Parses an annotation map: a JSON object from reference phrase to note.
///
/// A value is either the note body, or an object carrying `note` and an
/// optional `chapter`/`chapters` scope.
pub fn parse_note_map(json: &str) -> Result<Vec<NoteEntry>, serde_json::Error> {
    let map: Map<String, Value> = serde_json::from_str(json)?;
    Ok(map
        .into_iter()
        .enumerate()
        .map(|(index, (reference, value))| note_entry(index, reference, value))
        .collect())
}

fn note_entry(index: usize, reference: String, value: Value) -> NoteEntry {
    match value {
        Value::Object(mut fields) if fields.contains_key("note") => {
            let body = fields.remove("note").map(body_text).unwrap_or_default();
            let mut chapters: Vec<u32> = Vec::new();
            if let Some(chapter) = fields.get("chapter").and_then(chapter_number) {
                chapters.push(chapter);
            }
            if let Some(Value::Array(list)) = fields.get("chapters") {
                chapters.extend(list.iter().filter_map(chapter_number));
            }
            let scoped = fields.contains_key("chapter") || fields.contains_key("chapters");
            NoteEntry {
                index,
                reference,
                body,
                chapters: scoped.then_some(chapters),
            }
        }
        other => NoteEntry {
            index,
            reference,
            body: body_text(other),
            chapters: None,
        },
    }
}

fn body_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn chapter_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(num) => num.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// A user-authored gloss or note, keyed by its normalized word sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub phrase: String,
    pub tokens: Vec<String>,
    pub body: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterCollections {
    #[serde(default)]
    pub vocab: Vec<UserEntry>,
    #[serde(default)]
    pub notes: Vec<UserEntry>,
}

impl ChapterCollections {
    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty() && self.notes.is_empty()
    }
}

/// Whole-store document written by the user-content store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub chapters: BTreeMap<u32, ChapterCollections>,
}

pub const STORE_FILE_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_map_keeps_file_order() {
        let entries =
            parse_note_map(r#"{"zeta": "last letter", "alpha": "first", "mu": "middle"}"#).unwrap();
        let refs: Vec<_> = entries.iter().map(|e| e.reference.as_str()).collect();
        assert_eq!(refs, vec!["zeta", "alpha", "mu"]);
        assert_eq!(entries[1].index, 1);
        assert!(entries.iter().all(|e| e.chapters.is_none()));
    }

    #[test]
    fn scoped_entries_carry_their_chapters() {
        let entries = parse_note_map(
            r#"{
                "Pater mature": {"note": "his father died early", "chapter": 2},
                "Athenas": {"note": "to Athens", "chapters": [2, "3"]},
                "studiis": {"note": "dative", "chapters": []}
            }"#,
        )
        .unwrap();
        assert_eq!(entries[0].chapters, Some(vec![2]));
        assert_eq!(entries[0].body, "his father died early");
        assert!(entries[1].applies_to(3));
        assert!(!entries[1].applies_to(1));
        assert!(!entries[2].applies_to(2));
    }

    #[test]
    fn non_string_bodies_are_stringified() {
        let entries = parse_note_map(r#"{"a": 12, "b": null, "c": {"gloss": "x"}}"#).unwrap();
        assert_eq!(entries[0].body, "12");
        assert_eq!(entries[1].body, "");
        assert_eq!(entries[2].body, r#"{"gloss":"x"}"#);
    }

    #[test]
    fn non_object_maps_are_rejected() {
        assert!(parse_note_map("[1, 2]").is_err());
        assert!(parse_note_map("{not json").is_err());
    }
}
