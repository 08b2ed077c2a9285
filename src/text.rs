//! Word normalization and whitespace-preserving tokenization.

use serde::Serialize;

const STRIPPED_CHARS: &[char] = &[
    '(', ')', '[', ']', '{', '}', '.', ',', ';', ':', '!', '?', '\'', '"', '“', '”', '‘', '’',
    '«', '»', '-', '–', '—',
];

/// Whitespace as a JavaScript `\s` class sees it: Unicode `White_Space`
/// without U+0085, plus the byte-order mark U+FEFF.
pub fn is_space(ch: char) -> bool {
    match ch {
        '\u{feff}' => true,
        '\u{85}' => false,
        other => other.is_whitespace(),
    }
}

/// Non-empty runs of `text` between [`is_space`] characters.
pub fn split_words(text: &str) -> impl Iterator<Item = &str> + '_ {
    text.split(is_space).filter(|word| !word.is_empty())
}

/// Lowercases a raw word, removes punctuation and quote marks, and trims it.
///
/// Total over every input; an empty or all-punctuation word yields `""`.
pub fn normalize(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|ch| !STRIPPED_CHARS.contains(ch))
        .collect::<String>()
        .trim_matches(is_space)
        .to_string()
}

/// Drops a single enclitic suffix (`-que`, then `-ve`, then `-ne`).
///
/// The length guard applies to the word before stripping: `-que` needs more
/// than four characters, `-ve`/`-ne` more than three.
pub fn strip_enclitic(word: &str) -> &str {
    let len = word.chars().count();
    if word.ends_with("que") && len > 4 {
        return &word[..word.len() - 3];
    }
    if (word.ends_with("ve") || word.ends_with("ne")) && len > 3 {
        return &word[..word.len() - 2];
    }
    word
}

/// A non-whitespace run of the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordToken {
    pub raw: String,
    pub normalized: String,
    /// Index among word tokens only.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Token {
    Word(WordToken),
    Space { raw: String },
}

impl Token {
    pub fn raw(&self) -> &str {
        match self {
            Token::Word(word) => &word.raw,
            Token::Space { raw } => raw,
        }
    }

    pub fn as_word(&self) -> Option<&WordToken> {
        match self {
            Token::Word(word) => Some(word),
            Token::Space { .. } => None,
        }
    }
}

/// Ordered tokens of one chapter plus an index from word position to token index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenStream {
    tokens: Vec<Token>,
    word_indices: Vec<usize>,
}

impl TokenStream {
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn word_count(&self) -> usize {
        self.word_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn word(&self, position: usize) -> Option<&WordToken> {
        self.word_indices
            .get(position)
            .and_then(|&idx| self.tokens[idx].as_word())
    }

    pub fn words(&self) -> impl Iterator<Item = &WordToken> + '_ {
        self.tokens.iter().filter_map(Token::as_word)
    }

    /// Token-stream index of the word at `position`.
    pub fn token_index(&self, position: usize) -> Option<usize> {
        self.word_indices.get(position).copied()
    }

    pub fn normalized_words(&self) -> Vec<&str> {
        self.words().map(|word| word.normalized.as_str()).collect()
    }

    /// Concatenates every token's raw text; always equals the tokenized input.
    pub fn reconstruct(&self) -> String {
        self.tokens.iter().map(Token::raw).collect()
    }
}

/// Splits `text` into alternating word and whitespace runs.
pub fn tokenize(text: &str) -> TokenStream {
    let mut stream = TokenStream::default();
    let mut run_start = 0;
    let mut run_is_space: Option<bool> = None;

    for (idx, ch) in text.char_indices() {
        let space = is_space(ch);
        match run_is_space {
            Some(current) if current != space => {
                push_run(&mut stream, &text[run_start..idx], current);
                run_start = idx;
                run_is_space = Some(space);
            }
            None => run_is_space = Some(space),
            _ => {}
        }
    }
    if let Some(current) = run_is_space {
        push_run(&mut stream, &text[run_start..], current);
    }
    stream
}

fn push_run(stream: &mut TokenStream, raw: &str, is_space: bool) {
    if is_space {
        stream.tokens.push(Token::Space {
            raw: raw.to_string(),
        });
        return;
    }
    let position = stream.word_indices.len();
    stream.word_indices.push(stream.tokens.len());
    stream.tokens.push(Token::Word(WordToken {
        raw: raw.to_string(),
        normalized: normalize(raw),
        position,
    }));
}
