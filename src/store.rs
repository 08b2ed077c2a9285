use crate::data::{ChapterCollections, STORE_FILE_VERSION, StoreFile, UserEntry};
use crate::error::StoreError;
use crate::matcher::{PlacementMap, find_matches};
use crate::pattern::Pattern;
use crate::text::{TokenStream, normalize, split_words};
use parking_lot::RwLock;
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Vocab,
    Notes,
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKind::Vocab => write!(f, "vocab"),
            UserKind::Notes => write!(f, "notes"),
        }
    }
}

impl FromStr for UserKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "vocab" => Ok(UserKind::Vocab),
            "notes" => Ok(UserKind::Notes),
            other => Err(StoreError::UnknownKind(other.to_string())),
        }
    }
}

/// Chapter-scoped vocabulary and notes written by the reader.
///
/// Clones share the same data. A persistent store rewrites its file after
/// every mutation, and a mutation whose write fails is not applied.
#[derive(Clone)]
pub struct UserStore {
    shared: Arc<StoreShared>,
}

struct StoreShared {
    inner: RwLock<StoreFile>,
    path: Option<PathBuf>,
}

impl UserStore {
    /// Opens the store at `path`; a missing or unreadable file starts empty.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = load_store(&path);
        Self::with_data(data, Some(path))
    }

    pub fn ephemeral() -> Self {
        Self::with_data(StoreFile::default(), None)
    }

    fn with_data(data: StoreFile, path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                inner: RwLock::new(data),
                path,
            }),
        }
    }

    /// Adds an entry, or replaces the body of the entry with the same words.
    pub fn add(
        &self,
        chapter: u32,
        kind: UserKind,
        phrase: &str,
        body: &str,
    ) -> Result<UserEntry, StoreError> {
        let tokens = phrase_tokens(phrase);
        if tokens.is_empty() {
            return Err(StoreError::EmptyPhrase(phrase.to_string()));
        }
        let body = body.trim();
        if body.is_empty() {
            return Err(StoreError::EmptyBody);
        }

        let mut guard = self.shared.inner.write();
        let mut next = StoreFile::clone(&guard);
        let entries = collection_mut(&mut next, chapter, kind);
        let entry = match entries.iter_mut().find(|entry| entry.tokens == tokens) {
            Some(existing) => {
                existing.body = body.to_string();
                existing.phrase = phrase.trim().to_string();
                existing.clone()
            }
            None => {
                let entry = UserEntry {
                    id: generate_entry_id(),
                    phrase: phrase.trim().to_string(),
                    tokens,
                    body: body.to_string(),
                    created_at: now_ts(),
                };
                entries.push(entry.clone());
                entry
            }
        };
        self.persist(&next)?;
        *guard = next;
        Ok(entry)
    }

    pub fn remove(&self, chapter: u32, kind: UserKind, id: &str) -> Result<UserEntry, StoreError> {
        let mut guard = self.shared.inner.write();
        let Some(idx) = guard
            .chapters
            .get(&chapter)
            .and_then(|collections| collection(collections, kind).iter().position(|entry| entry.id == id))
        else {
            return Err(StoreError::UnknownEntry {
                chapter,
                id: id.to_string(),
            });
        };
        let mut next = StoreFile::clone(&guard);
        let removed = collection_mut(&mut next, chapter, kind).remove(idx);
        if next
            .chapters
            .get(&chapter)
            .is_some_and(ChapterCollections::is_empty)
        {
            next.chapters.remove(&chapter);
        }
        self.persist(&next)?;
        *guard = next;
        Ok(removed)
    }

    pub fn list(&self, chapter: u32, kind: UserKind) -> Vec<UserEntry> {
        let guard = self.shared.inner.read();
        guard
            .chapters
            .get(&chapter)
            .map(|collections| collection(collections, kind).to_vec())
            .unwrap_or_default()
    }

    /// Wildcard-free patterns for one collection, ids taken from the entries.
    pub fn patterns(&self, chapter: u32, kind: UserKind) -> Vec<Pattern> {
        self.list(chapter, kind)
            .into_iter()
            .filter_map(|entry| Pattern::contiguous(entry.id, &entry.phrase, entry.tokens, entry.body))
            .collect()
    }

    /// Places a collection over `stream` with the note matcher.
    pub fn matches(
        &self,
        chapter: u32,
        kind: UserKind,
        stream: &TokenStream,
    ) -> (Vec<Pattern>, PlacementMap) {
        let patterns = self.patterns(chapter, kind);
        let placements = find_matches(&patterns, stream);
        (patterns, placements)
    }

    fn persist(&self, data: &StoreFile) -> Result<(), StoreError> {
        let Some(path) = &self.shared.path else {
            return Ok(());
        };
        write_store(path, data).inspect_err(|err| {
            warn!(path = %path.display(), error = %err, "failed to persist user store");
        })
    }
}

fn collection(collections: &ChapterCollections, kind: UserKind) -> &[UserEntry] {
    match kind {
        UserKind::Vocab => &collections.vocab,
        UserKind::Notes => &collections.notes,
    }
}

fn collection_mut(data: &mut StoreFile, chapter: u32, kind: UserKind) -> &mut Vec<UserEntry> {
    let collections = data.chapters.entry(chapter).or_default();
    match kind {
        UserKind::Vocab => &mut collections.vocab,
        UserKind::Notes => &mut collections.notes,
    }
}

/// Normalized, non-empty words of a user phrase.
pub fn phrase_tokens(phrase: &str) -> Vec<String> {
    split_words(phrase)
        .map(normalize)
        .filter(|word| !word.is_empty())
        .collect()
}

fn load_store(path: &Path) -> StoreFile {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StoreFile::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read user store");
            return StoreFile::default();
        }
    };
    match serde_json::from_slice::<StoreFile>(&bytes) {
        Ok(data) => data,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring corrupt user store");
            StoreFile::default()
        }
    }
}

fn write_store(path: &Path, data: &StoreFile) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let document = StoreFile {
        version: STORE_FILE_VERSION,
        chapters: data.chapters.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&document)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn generate_entry_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("user-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::tokenize;

    #[test]
    fn add_rejects_empty_phrases_and_bodies() {
        let store = UserStore::ephemeral();
        assert!(matches!(
            store.add(2, UserKind::Vocab, " — ... ", "gloss"),
            Err(StoreError::EmptyPhrase(_))
        ));
        assert!(matches!(
            store.add(2, UserKind::Vocab, "rosa", "   "),
            Err(StoreError::EmptyBody)
        ));
        assert!(store.list(2, UserKind::Vocab).is_empty());
    }

    #[test]
    fn same_words_replace_the_existing_body() {
        let store = UserStore::ephemeral();
        let first = store.add(2, UserKind::Vocab, "Se contulit", "went").unwrap();
        let second = store.add(2, UserKind::Vocab, "se contulit,", "betook himself").unwrap();
        assert_eq!(first.id, second.id);
        let entries = store.list(2, UserKind::Vocab);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, "betook himself");
        assert_eq!(entries[0].tokens, vec!["se", "contulit"]);
    }

    #[test]
    fn collections_are_scoped_by_chapter_and_kind() {
        let store = UserStore::ephemeral();
        store.add(1, UserKind::Vocab, "pater", "father").unwrap();
        store.add(2, UserKind::Notes, "pater", "his father").unwrap();
        assert_eq!(store.list(1, UserKind::Vocab).len(), 1);
        assert!(store.list(1, UserKind::Notes).is_empty());
        assert!(store.list(2, UserKind::Vocab).is_empty());
        assert_eq!(store.list(2, UserKind::Notes)[0].body, "his father");
    }

    #[test]
    fn remove_unknown_entry_is_an_error() {
        let store = UserStore::ephemeral();
        let entry = store.add(2, UserKind::Notes, "Athenas", "to Athens").unwrap();
        assert!(matches!(
            store.remove(2, UserKind::Notes, "user-missing"),
            Err(StoreError::UnknownEntry { chapter: 2, .. })
        ));
        assert_eq!(store.remove(2, UserKind::Notes, &entry.id).unwrap(), entry);
        assert!(store.list(2, UserKind::Notes).is_empty());
    }

    #[test]
    fn failed_removal_leaves_no_empty_chapter() {
        let store = UserStore::ephemeral();
        for chapter in 100..105 {
            assert!(store.remove(chapter, UserKind::Vocab, "nope").is_err());
        }
        store.add(2, UserKind::Vocab, "pater", "father").unwrap();
        let chapters: Vec<u32> = store.shared.inner.read().chapters.keys().copied().collect();
        assert_eq!(chapters, vec![2]);
    }

    #[test]
    fn matches_use_contiguous_longest_first_placement() {
        let store = UserStore::ephemeral();
        store.add(2, UserKind::Vocab, "tempus", "time").unwrap();
        store.add(2, UserKind::Vocab, "idoneum tempus", "a suitable time").unwrap();
        store.add(2, UserKind::Vocab, "ratus studiis", "across a comma").unwrap();
        let stream = tokenize("idoneum tempus ratus, studiis obsequendi suis");
        let (patterns, placements) = store.matches(2, UserKind::Vocab, &stream);
        assert_eq!(patterns.len(), 3);
        let placed: Vec<_> = placements.iter().map(|m| (m.start, m.length)).collect();
        assert_eq!(placed, vec![(0, 2), (2, 2)]);
    }

    #[test]
    fn kinds_parse_from_path_segments() {
        assert_eq!("vocab".parse::<UserKind>().unwrap(), UserKind::Vocab);
        assert_eq!("notes".parse::<UserKind>().unwrap(), UserKind::Notes);
        assert!("glosses".parse::<UserKind>().is_err());
        assert_eq!(UserKind::Notes.to_string(), "notes");
    }

    #[test]
    fn entry_ids_are_prefixed_and_random() {
        let a = generate_entry_id();
        let b = generate_entry_id();
        assert!(a.starts_with("user-"));
        assert_eq!(a.len(), 17);
        assert_ne!(a, b);
    }
}
