//! Morphological dictionary lookup against third-party endpoints.
//!
//! Endpoints are URL templates with a `{word}` placeholder. A lookup walks
//! every candidate spelling against every endpoint in order and stops at the
//! first response that formats into at least one block of text.

use crate::text::{normalize, strip_enclitic};
use once_cell::sync::Lazy;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_PLACEHOLDER: &str = "{word}";
const MAX_REPORTED_ERRORS: usize = 5;

/// Characters left alone by JavaScript's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

static BLOCK_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").expect("valid regex"));
static LEADING_BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\n").expect("valid regex"));
static PRE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<pre\b[^>]*>(.*?)</pre\s*>").expect("valid regex"));
static BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<body\b[^>]*>(.*)</body\s*>").expect("valid regex"));
static SCRIPT_OR_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<head\b[^>]*>.*?</head\s*>")
        .expect("valid regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static NUMERIC_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid regex"));

const ARRAY_KEYS: &[&str] = &["entries", "Entries", "results", "result", "words", "word", "data"];
const HEAD_KEYS: &[&str] = &["entry", "head", "lemma", "word", "title"];
const DEFINITION_KEYS: &[&str] = &[
    "definitions",
    "definition",
    "glosses",
    "gloss",
    "meanings",
    "meaning",
    "senses",
    "sense",
    "translations",
    "translation",
    "body",
    "text",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub label: String,
    pub template: String,
}

impl Endpoint {
    pub fn new(label: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            template: template.into(),
        }
    }

    /// Parses `label=template` or a bare template labelled by its host part.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        if let Some((label, template)) = spec.split_once('=') {
            let label = label.trim();
            if !label.is_empty() && !label.contains("://") && template.contains("://") {
                return Some(Self::new(label, template.trim()));
            }
        }
        Some(Self::new(strip_scheme(spec), spec))
    }

    pub fn build_url(&self, word: &str) -> String {
        let encoded = utf8_percent_encode(word, COMPONENT).to_string();
        self.template.replace(WORD_PLACEHOLDER, &encoded)
    }
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

pub fn default_lookup_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new(
            "latin.ucant.org",
            "https://latin.ucant.org/api/words?word={word}",
        ),
        Endpoint::new(
            "latin.ucant.org (html)",
            "https://latin.ucant.org/cgi-bin/words?keyword={word}",
        ),
        Endpoint::new(
            "archives.nd.edu",
            "https://archives.nd.edu/cgi-bin/wordz.pl?keyword={word}",
        ),
    ]
}

/// Upstreams addressed by index through the forwarding proxy.
pub fn default_proxy_endpoints() -> Vec<Endpoint> {
    [
        "https://latin-words.com/cgi-bin/translate.cgi?latin={word}",
        "https://latin-words.com/cgi-bin/translate.cgi?backup=1&latin={word}",
        "https://archives.nd.edu/cgi-bin/wordz.pl?keyword={word}",
    ]
    .into_iter()
    .map(|template| Endpoint::new(strip_scheme(template), template))
    .collect()
}

/// Normalized spellings to try, in order, without duplicates.
///
/// The clicked word comes first, then any extra candidates, then the clicked
/// word with its enclitic removed.
pub fn lookup_candidates(raw: &str, extras: &[String]) -> Vec<String> {
    let mut queue: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !candidate.is_empty() && !queue.contains(&candidate) {
            queue.push(candidate);
        }
    };
    let base = normalize(raw);
    push(base.clone());
    for extra in extras {
        push(normalize(extra));
    }
    let stripped = strip_enclitic(&base);
    if stripped != base {
        push(stripped.to_string());
    }
    queue
}

/// Issues monotonically increasing tickets; only the newest one is current.
#[derive(Debug, Default)]
pub struct LookupGate {
    latest: AtomicU64,
}

impl LookupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation, superseding every earlier ticket.
    pub fn issue(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.latest.load(Ordering::Acquire) == ticket
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LookupOutcome {
    Found {
        word: String,
        query: String,
        source: String,
        blocks: Vec<String>,
        /// The response did not match a known format and is shown verbatim.
        raw: bool,
    },
    NotFound {
        word: String,
        errors: Vec<String>,
    },
    Superseded,
}

impl LookupOutcome {
    pub fn not_found(word: impl Into<String>, mut errors: Vec<String>) -> Self {
        errors.truncate(MAX_REPORTED_ERRORS);
        LookupOutcome::NotFound {
            word: word.into(),
            errors,
        }
    }
}

/// Blocks extracted from one upstream body, or why none were.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Blocks(Vec<String>),
    Raw(String),
    Empty,
}

/// Formats a response body by content type.
pub fn extract_blocks(content_type: &str, body: &str) -> Result<Extracted, serde_json::Error> {
    if content_type.contains("application/json") {
        let data: Value = serde_json::from_str(body)?;
        let blocks = format_json(&data);
        if !blocks.is_empty() {
            return Ok(Extracted::Blocks(blocks));
        }
        let pretty = serde_json::to_string_pretty(&data)?;
        if pretty.trim().is_empty() {
            return Ok(Extracted::Empty);
        }
        return Ok(Extracted::Raw(pretty));
    }
    let blocks = format_html(body);
    if !blocks.is_empty() {
        return Ok(Extracted::Blocks(blocks));
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        Ok(Extracted::Empty)
    } else {
        Ok(Extracted::Raw(trimmed.to_string()))
    }
}

/// Splits plain text on blank lines into trimmed, non-empty blocks.
pub fn split_blocks(text: &str) -> Vec<String> {
    let cleaned = text.replace('\r', "");
    BLOCK_BREAK
        .split(&cleaned)
        .map(|segment| {
            LEADING_BLANK_LINE
                .replace(segment, "")
                .trim_end()
                .to_string()
        })
        .filter(|segment| !segment.trim().is_empty())
        .collect()
}

/// Prefers `<pre>` contents, then body text, then the raw input.
pub fn format_html(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    let pre_blocks: Vec<String> = PRE_BLOCK
        .captures_iter(raw)
        .map(|caps| text_content(&caps[1]))
        .collect();
    if !pre_blocks.is_empty() {
        let combined = pre_blocks.join("\n\n");
        if !combined.trim().is_empty() {
            return split_blocks(&combined);
        }
    }
    let without_scripts = SCRIPT_OR_STYLE.replace_all(raw, "");
    let body = BODY
        .captures(&without_scripts)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| without_scripts.to_string());
    let body_text = text_content(&body);
    if !body_text.trim().is_empty() {
        return split_blocks(&body_text);
    }
    split_blocks(raw)
}

fn text_content(html: &str) -> String {
    decode_entities(&TAG.replace_all(html, ""))
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", "\u{a0}");
    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures<'_>| {
        let code = &caps[1];
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse().ok(),
        };
        value
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    numeric.replace("&amp;", "&")
}

/// Formats JSON dictionary payloads into one text block per entry.
pub fn format_json(data: &Value) -> Vec<String> {
    if !truthy(data) {
        return Vec::new();
    }
    let mut arrays: Vec<&Vec<Value>> = Vec::new();
    if let Value::Array(items) = data {
        arrays.push(items);
    }
    if let Value::Object(fields) = data {
        for key in ARRAY_KEYS {
            if let Some(Value::Array(items)) = fields.get(*key) {
                arrays.push(items);
            }
        }
        if arrays.is_empty() {
            arrays.extend(fields.values().filter_map(Value::as_array));
        }
    }

    let mut collected = Vec::new();
    for items in arrays {
        collected.extend(
            items
                .iter()
                .map(format_entry)
                .filter(|text| !text.is_empty()),
        );
        if !collected.is_empty() {
            break;
        }
    }
    if collected.is_empty() && data.is_object() {
        let text = format_entry(data);
        if !text.is_empty() {
            collected.push(text);
        }
    }
    collected
}

/// Renders one entry as head line, definitions, then remaining fields.
pub fn format_entry(entry: &Value) -> String {
    let fields = match entry {
        Value::Null => return String::new(),
        Value::String(text) => return text.clone(),
        Value::Object(fields) => fields,
        other => return js_string(other),
    };

    let mut lines: Vec<String> = Vec::new();
    if let Some(head) = HEAD_KEYS
        .iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| truthy(value))
    {
        lines.push(js_string(head));
    }

    let mut definitions = Vec::new();
    for key in DEFINITION_KEYS {
        let Some(value) = fields.get(*key).filter(|value| truthy(value)) else {
            continue;
        };
        match value {
            Value::Array(items) => definitions.extend(
                items
                    .iter()
                    .filter(|item| truthy(item) || is_zero(item))
                    .map(|item| match item {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    }),
            ),
            Value::Object(_) => definitions.push(value.to_string()),
            other => definitions.push(js_string(other)),
        }
    }
    if !definitions.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(definitions.join("\n"));
    }

    let extras: Vec<String> = fields
        .iter()
        .filter(|(key, _)| !HEAD_KEYS.contains(&key.as_str()) && !DEFINITION_KEYS.contains(&key.as_str()))
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}: {text}"),
            other => format!("{key}: {other}"),
        })
        .collect();
    if !extras.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(extras.join("\n"));
    }
    lines.join("\n").trim().to_string()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn is_zero(value: &Value) -> bool {
    matches!(value, Value::Number(num) if num.as_f64() == Some(0.0))
}

fn js_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(feature = "web")]
pub use client::{DictionaryClient, Upstream};

#[cfg(feature = "web")]
mod client {
    use super::{
        Endpoint, Extracted, LookupGate, LookupOutcome, WORD_PLACEHOLDER, extract_blocks,
        lookup_candidates,
    };
    use crate::error::LookupError;
    use reqwest::header::{CONTENT_TYPE, USER_AGENT};
    use std::time::Duration;
    use tracing::debug;

    const PROXY_USER_AGENT: &str = "Mozilla/5.0 (compatible; LectorProxy/1.0)";
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    /// One upstream response, read fully.
    #[derive(Debug, Clone)]
    pub struct Upstream {
        pub status: u16,
        pub content_type: String,
        pub body: String,
    }

    impl Upstream {
        pub fn is_success(&self) -> bool {
            (200..300).contains(&self.status)
        }
    }

    #[derive(Debug, Clone)]
    pub struct DictionaryClient {
        http: reqwest::Client,
        endpoints: Vec<Endpoint>,
    }

    impl DictionaryClient {
        pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, LookupError> {
            if let Some(bad) = endpoints
                .iter()
                .find(|endpoint| !endpoint.template.contains(WORD_PLACEHOLDER))
            {
                return Err(LookupError::Endpoint(bad.template.clone()));
            }
            let http = reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?;
            Ok(Self { http, endpoints })
        }

        pub fn endpoints(&self) -> &[Endpoint] {
            &self.endpoints
        }

        pub async fn fetch(&self, url: &str) -> Result<Upstream, LookupError> {
            let response = self
                .http
                .get(url)
                .header(USER_AGENT, PROXY_USER_AGENT)
                .send()
                .await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = response.text().await?;
            Ok(Upstream {
                status,
                content_type,
                body,
            })
        }

        /// Looks up `raw` (and `extras`) until an endpoint yields text.
        ///
        /// With a gate, the lookup gives up as soon as a newer ticket exists.
        pub async fn lookup(
            &self,
            raw: &str,
            extras: &[String],
            gate: Option<(&LookupGate, u64)>,
        ) -> LookupOutcome {
            let queue = lookup_candidates(raw, extras);
            let display = match raw.trim() {
                "" => queue.first().cloned().unwrap_or_default(),
                trimmed => trimmed.to_string(),
            };
            let superseded = || gate.is_some_and(|(gate, ticket)| !gate.is_current(ticket));
            let mut errors = Vec::new();

            for query in &queue {
                for endpoint in &self.endpoints {
                    if superseded() {
                        return LookupOutcome::Superseded;
                    }
                    let url = endpoint.build_url(query);
                    let upstream = match self.fetch(&url).await {
                        Ok(upstream) => upstream,
                        Err(err) => {
                            debug!(endpoint = %endpoint.label, error = %err, "dictionary request failed");
                            errors.push(format!("{}: {err}", endpoint.label));
                            continue;
                        }
                    };
                    if !upstream.is_success() {
                        errors.push(format!("{}: HTTP {}", endpoint.label, upstream.status));
                        continue;
                    }
                    if superseded() {
                        return LookupOutcome::Superseded;
                    }
                    let is_json = upstream.content_type.contains("application/json");
                    match extract_blocks(&upstream.content_type, &upstream.body) {
                        Ok(Extracted::Blocks(blocks)) => {
                            return found(&display, query, endpoint, blocks, false);
                        }
                        Ok(Extracted::Raw(text)) => {
                            return found(&display, query, endpoint, vec![text], true);
                        }
                        Ok(Extracted::Empty) if is_json => {
                            errors.push(format!("{}: empty JSON response", endpoint.label));
                        }
                        Ok(Extracted::Empty) => {
                            errors.push(format!("{}: empty response", endpoint.label));
                        }
                        Err(err) => {
                            errors.push(format!("{}: invalid JSON ({err})", endpoint.label));
                        }
                    }
                }
            }
            if superseded() {
                return LookupOutcome::Superseded;
            }
            LookupOutcome::not_found(display, errors)
        }
    }

    fn found(
        display: &str,
        query: &str,
        endpoint: &Endpoint,
        blocks: Vec<String>,
        raw: bool,
    ) -> LookupOutcome {
        LookupOutcome::Found {
            word: display.to_string(),
            query: query.to_string(),
            source: endpoint.label.clone(),
            blocks,
            raw,
        }
    }
}
