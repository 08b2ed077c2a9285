use crate::content::{ChapterContext, ContentConfig, ContentSource, NotesStatus, TextStatus};
use crate::data::UserEntry;
use crate::dictionary::{
    DictionaryClient, Endpoint, LookupGate, LookupOutcome, default_lookup_endpoints,
    default_proxy_endpoints, lookup_candidates,
};
use crate::error::{LookupError, StoreError};
use crate::matcher::Match;
use crate::pattern::Pattern;
use crate::render::{Annotator, Layer, render_rich_text};
use crate::store::{UserKind, UserStore};
use crate::text::Token;
use askama::Template;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{delete, get},
};
use include_dir::{Dir, include_dir};
use lru::LruCache;
use parking_lot::Mutex;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

type SharedState = Arc<AppState>;

static STATIC_ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/static");

const GATE_CAPACITY: usize = 1024;
const MISSING_WORD: &str = "Missing 'word' parameter";
const CORS_ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Client-Info, Apikey";

pub struct AppState {
    pub theme: WebTheme,
    pub base_url: String,
    pub content: ContentSource,
    pub store: UserStore,
    pub lookup: DictionaryClient,
    pub proxy: DictionaryClient,
    lookup_cache: Mutex<LruCache<String, LookupOutcome>>,
    gates: Mutex<LruCache<String, Arc<LookupGate>>>,
}

impl AppState {
    pub fn from_config(config: &WebConfig) -> Result<Self, WebError> {
        let store = match &config.store_path {
            Some(path) => UserStore::persistent(path),
            None => UserStore::ephemeral(),
        };
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        let gate_size = NonZeroUsize::new(GATE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            theme: config.theme,
            base_url: config.base_url.clone(),
            content: ContentSource::new(config.content.clone()),
            store,
            lookup: DictionaryClient::new(config.lookup_endpoints.clone())?,
            proxy: DictionaryClient::new(config.proxy_endpoints.clone())?,
            lookup_cache: Mutex::new(LruCache::new(cache_size)),
            gates: Mutex::new(LruCache::new(gate_size)),
        })
    }

    /// The gate for `client`, created on first use.
    fn gate_for(&self, client: &str) -> Arc<LookupGate> {
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get(client) {
            return Arc::clone(gate);
        }
        let gate = Arc::new(LookupGate::new());
        gates.put(client.to_string(), Arc::clone(&gate));
        gate
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum WebTheme {
    #[default]
    Tailwind,
    Bootstrap,
}

impl fmt::Display for WebTheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebTheme::Tailwind => write!(f, "tailwind"),
            WebTheme::Bootstrap => write!(f, "bootstrap"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Chrome {
    use_tailwind: bool,
    body_class: &'static str,
    main_class: &'static str,
    layout_class: &'static str,
    pane_class: &'static str,
    eyebrow_class: &'static str,
    headline_class: &'static str,
    lede_class: &'static str,
    nav_class: &'static str,
    button_class: &'static str,
    button_active_class: &'static str,
    note_class: &'static str,
}

impl Chrome {
    fn new(theme: WebTheme) -> Self {
        match theme {
            WebTheme::Tailwind => Self {
                use_tailwind: true,
                body_class: "bg-slate-50 text-slate-900",
                main_class: "min-h-screen max-w-7xl mx-auto py-8 px-4 space-y-6",
                layout_class: "grid gap-6 lg:grid-cols-3",
                pane_class: "bg-white shadow rounded p-5",
                eyebrow_class: "uppercase tracking-wide text-sm text-slate-500",
                headline_class: "text-3xl font-extrabold tracking-tight",
                lede_class: "text-slate-600",
                nav_class: "flex flex-wrap gap-2",
                button_class: "inline-flex items-center rounded-md bg-slate-200 px-3 py-1 text-slate-800 font-semibold hover:bg-slate-300",
                button_active_class: "inline-flex items-center rounded-md bg-slate-900 px-3 py-1 text-white font-semibold",
                note_class: "border-b border-slate-200 py-3",
            },
            WebTheme::Bootstrap => Self {
                use_tailwind: false,
                body_class: "bg-light text-dark",
                main_class: "container py-4",
                layout_class: "row g-4",
                pane_class: "col-lg-4 card card-body",
                eyebrow_class: "text-uppercase text-muted mb-2",
                headline_class: "display-6 fw-bold",
                lede_class: "lead",
                nav_class: "d-flex flex-wrap gap-2",
                button_class: "btn btn-outline-secondary btn-sm",
                button_active_class: "btn btn-primary btn-sm",
                note_class: "border-bottom py-2",
            },
        }
    }

    fn stylesheet_tags(&self) -> (&'static str, &'static str) {
        if self.use_tailwind {
            (
                r#"<script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>"#,
                "",
            )
        } else {
            (
                r#"<link href="https://cdn.jsdelivr.net/npm/bootstrap@5.3.8/dist/css/bootstrap.min.css" rel="stylesheet" integrity="sha384-sRIl4kxILFvY47J16cr9ZwB07vP4J8+LH7qKQnuqkuIAvNWLzeN8tE5YBujZqJLB" crossorigin="anonymous">"#,
                r#"<script src="https://cdn.jsdelivr.net/npm/bootstrap@5.3.8/dist/js/bootstrap.bundle.min.js" integrity="sha384-FKyoEForCGlyvwx9Hj09JcYn3nv7wiPVlz7YYwJrWVcXK/BmnVDxM+D2scQbITxI" crossorigin="anonymous"></script>"#,
            )
        }
    }
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub theme: WebTheme,
    pub base_url: String,
    pub content: ContentConfig,
    pub lookup_endpoints: Vec<Endpoint>,
    pub proxy_endpoints: Vec<Endpoint>,
    /// `None` keeps user vocabulary and notes in memory only.
    pub store_path: Option<PathBuf>,
    pub cache_size: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            theme: WebTheme::default(),
            base_url: "http://127.0.0.1:8080".to_string(),
            content: ContentConfig::default(),
            lookup_endpoints: default_lookup_endpoints(),
            proxy_endpoints: default_proxy_endpoints(),
            store_path: Some(PathBuf::from("lector-user.json")),
            cache_size: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dictionary client error: {0}")]
    Lookup(#[from] LookupError),
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let state = Arc::new(AppState::from_config(&config)?);
    let router = build_router(state);
    info!(
        %config.addr,
        theme = %config.theme,
        base = %config.base_url,
        content = %config.content.root.display(),
        store = ?config.store_path,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::EmptyPhrase(_) | StoreError::EmptyBody | StoreError::UnknownKind(_) => {
                StatusCode::BAD_REQUEST
            }
            StoreError::UnknownEntry { .. } => StatusCode::NOT_FOUND,
            StoreError::Io(_) | StoreError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/chapter/:chapter", get(chapter_page))
        .route("/api/chapter/:chapter", get(api_chapter))
        .route("/api/lookup", get(api_lookup))
        .route(
            "/proxy",
            get(proxy_lookup).post(proxy_lookup).options(proxy_preflight),
        )
        .route("/api/user/:kind/:chapter", get(user_list).post(user_add))
        .route("/api/user/:kind/:chapter/:id", delete(user_remove))
        .route("/static/*path", get(static_asset))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "lector-web" }))
}

async fn home(State(state): State<SharedState>) -> Html<String> {
    let chapter = state.content.config().default_chapter;
    reader_page(&state, chapter).await
}

async fn chapter_page(
    State(state): State<SharedState>,
    Path(chapter): Path<u32>,
) -> Html<String> {
    reader_page(&state, chapter).await
}

async fn reader_page(state: &SharedState, chapter: u32) -> Html<String> {
    match load_chapter(state, chapter).await {
        Ok(context) => Html(
            render_reader(state, &context)
                .unwrap_or_else(|err| render_error_page(state.theme, err.to_string())),
        ),
        Err(err) => Html(render_error_page(state.theme, err.message)),
    }
}

/// Loads a fresh context off the async runtime; chapter files are read from disk.
async fn load_chapter(state: &SharedState, chapter: u32) -> Result<ChapterContext, ApiError> {
    let source = state.content.clone();
    tokio::task::spawn_blocking(move || source.load_chapter(chapter))
        .await
        .map_err(|err| ApiError::internal(format!("failed to load chapter {chapter}: {err}")))
}

fn render_reader(state: &AppState, context: &ChapterContext) -> Result<String, askama::Error> {
    let chrome = Chrome::new(state.theme);
    let (css_tag, js_tag) = chrome.stylesheet_tags();
    let chapter = context.chapter;
    let placements = context.placements();
    let (vocab, vocab_placements) = state.store.matches(chapter, UserKind::Vocab, &context.stream);
    let (user_notes, user_placements) =
        state.store.matches(chapter, UserKind::Notes, &context.stream);

    let text_html = if context.stream.is_empty() {
        String::new()
    } else {
        Annotator::new(&context.stream, Layer::new(&placements, &context.patterns))
            .with_vocab(Layer::new(&vocab_placements, &vocab))
            .with_user_notes(Layer::new(&user_placements, &user_notes))
            .render_html()
    };

    let placed: HashSet<&str> = placements
        .iter()
        .map(|found| found.pattern_id.as_str())
        .collect();
    let notes = context
        .patterns
        .iter()
        .map(|pattern| NoteView {
            id: pattern.id.clone(),
            display_ref: pattern.display_ref.clone(),
            body_html: render_rich_text(&pattern.body),
            placed: placed.contains(pattern.id.as_str()),
        })
        .collect();

    let mut chapters: Vec<u32> = state.content.config().chapters.clone();
    if !chapters.contains(&chapter) {
        chapters.push(chapter);
        chapters.sort_unstable();
    }
    let chapters = chapters
        .into_iter()
        .map(|number| ChapterLink {
            number,
            href: format!("/chapter/{number}"),
            current: number == chapter,
        })
        .collect();

    let fallback_notice = match context.text_status {
        TextStatus::Fallback { chapter: shown } => Some(format!(
            "Text for chapter {chapter} is not available; showing chapter {shown}."
        )),
        _ => None,
    };

    ReaderTemplate {
        chrome,
        css_tag,
        js_tag,
        version: env!("CARGO_PKG_VERSION"),
        canonical_url: format!("{}/chapter/{chapter}", state.base_url.trim_end_matches('/')),
        chapter,
        chapters,
        text_html,
        text_placeholder: context.text_placeholder(),
        fallback_notice,
        notes,
        notes_placeholder: context.notes_placeholder(),
        vocab: user_entry_views(state.store.list(chapter, UserKind::Vocab)),
        user_notes: user_entry_views(state.store.list(chapter, UserKind::Notes)),
    }
    .render()
}

fn user_entry_views(entries: Vec<UserEntry>) -> Vec<UserEntryView> {
    entries
        .into_iter()
        .map(|entry| UserEntryView {
            body_html: render_rich_text(&entry.body),
            id: entry.id,
            phrase: entry.phrase,
        })
        .collect()
}

async fn api_chapter(
    State(state): State<SharedState>,
    Path(chapter): Path<u32>,
) -> Result<Response, ApiError> {
    let context = load_chapter(&state, chapter).await?;
    let payload = ChapterPayload {
        chapter: context.chapter,
        text_status: context.text_status,
        notes_status: context.notes_status,
        text_placeholder: context.text_placeholder(),
        notes_placeholder: context.notes_placeholder(),
        tokens: context.stream.tokens(),
        notes: &context.patterns,
        placements: context.placements().into_vec(),
    };
    Ok(Json(payload).into_response())
}

async fn api_lookup(
    State(state): State<SharedState>,
    Query(params): Query<LookupParams>,
) -> Result<Json<LookupOutcome>, ApiError> {
    let word = params
        .word
        .as_deref()
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .ok_or_else(|| ApiError::bad_request("Query parameter `word` is required"))?
        .to_string();
    let extras: Vec<String> = params
        .candidates
        .as_deref()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let queue = lookup_candidates(&word, &extras);
    if queue.is_empty() {
        return Ok(Json(LookupOutcome::not_found(word, Vec::new())));
    }
    let gate = params
        .client
        .as_deref()
        .filter(|client| !client.is_empty())
        .map(|client| state.gate_for(client));
    let ticket = gate.as_ref().map(|gate| gate.issue());

    let cache_key = queue.join("\t");
    let cached = state.lookup_cache.lock().get(&cache_key).cloned();
    if let Some(mut hit) = cached {
        if let LookupOutcome::Found { word: display, .. } = &mut hit {
            *display = word;
        }
        return Ok(Json(hit));
    }

    let outcome = state
        .lookup
        .lookup(&word, &extras, gate.as_deref().zip(ticket))
        .await;

    if matches!(outcome, LookupOutcome::Found { .. }) {
        state.lookup_cache.lock().put(cache_key, outcome.clone());
    }
    Ok(Json(outcome))
}

async fn proxy_lookup(
    State(state): State<SharedState>,
    Query(params): Query<ProxyParams>,
) -> Response {
    let Some(word) = params.word.filter(|word| !word.trim().is_empty()) else {
        return with_cors(
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": MISSING_WORD })),
            )
                .into_response(),
        );
    };
    let endpoints = state.proxy.endpoints();
    if endpoints.is_empty() {
        return with_cors(
            ApiError::internal("No dictionary endpoints are configured").into_response(),
        );
    }
    let index = parse_endpoint_index(params.endpoint.as_deref(), endpoints.len());
    let url = endpoints[index].build_url(&word);

    let response = match state.proxy.fetch(&url).await {
        Ok(upstream) if upstream.is_success() => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            upstream.body,
        )
            .into_response(),
        Ok(upstream) => {
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (
                status,
                Json(json!({
                    "error": format!("Dictionary service returned status {}", upstream.status),
                    "status": upstream.status,
                })),
            )
                .into_response()
        }
        Err(err) => {
            warn!(endpoint = index, error = %err, "dictionary proxy request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to fetch from dictionary service",
                    "message": err.to_string(),
                })),
            )
                .into_response()
        }
    };
    with_cors(response)
}

async fn proxy_preflight() -> Response {
    with_cors(StatusCode::OK.into_response())
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    response
}

/// Leading-integer parse clamped to `0..len`; anything unparseable selects 0.
fn parse_endpoint_index(raw: Option<&str>, len: usize) -> usize {
    let Some(raw) = raw.map(str::trim) else {
        return 0;
    };
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let digits: &str = &digits[..digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len())];
    if negative || digits.is_empty() {
        return 0;
    }
    let value = digits.bytes().fold(0usize, |acc, digit| {
        acc.saturating_mul(10).saturating_add(usize::from(digit - b'0'))
    });
    value.min(len.saturating_sub(1))
}

async fn user_list(
    State(state): State<SharedState>,
    Path((kind, chapter)): Path<(String, u32)>,
) -> Result<Json<Vec<UserEntry>>, ApiError> {
    let kind: UserKind = kind.parse()?;
    Ok(Json(state.store.list(chapter, kind)))
}

async fn user_add(
    State(state): State<SharedState>,
    Path((kind, chapter)): Path<(String, u32)>,
    Json(request): Json<NewUserEntry>,
) -> Result<(StatusCode, Json<UserEntry>), ApiError> {
    let kind: UserKind = kind.parse()?;
    let entry = state.store.add(chapter, kind, &request.phrase, &request.body)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn user_remove(
    State(state): State<SharedState>,
    Path((kind, chapter, id)): Path<(String, u32, String)>,
) -> Result<Json<UserEntry>, ApiError> {
    let kind: UserKind = kind.parse()?;
    Ok(Json(state.store.remove(chapter, kind, &id)?))
}

async fn static_asset(Path(path): Path<String>) -> Response {
    let path = path.trim_start_matches('/');
    match STATIC_ASSETS.get_file(path) {
        Some(file) => (
            [(header::CONTENT_TYPE, asset_mime(path).to_string())],
            file.contents(),
        )
            .into_response(),
        None => ApiError::not_found(format!("No asset named {}", encode_component(path)))
            .into_response(),
    }
}

fn asset_mime(path: &str) -> mime::Mime {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("js") => mime::APPLICATION_JAVASCRIPT_UTF_8,
        Some("css") => mime::TEXT_CSS_UTF_8,
        Some("json") => mime::APPLICATION_JSON,
        Some("svg") => mime::IMAGE_SVG,
        Some("html") => mime::TEXT_HTML_UTF_8,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

fn render_error_page(theme: WebTheme, message: impl Into<String>) -> String {
    let chrome = Chrome::new(theme);
    let (css_tag, js_tag) = chrome.stylesheet_tags();
    ErrorTemplate {
        chrome,
        css_tag,
        js_tag,
        message: message.into(),
    }
    .render()
    .unwrap_or_else(|err| format!("<!DOCTYPE html><p>Something went wrong: {err}</p>"))
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    word: Option<String>,
    /// Comma-separated extra spellings tried after the clicked word.
    candidates: Option<String>,
    /// Per-client id; a newer lookup from the same client supersedes older ones.
    client: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyParams {
    word: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewUserEntry {
    phrase: String,
    body: String,
}

#[derive(Serialize)]
struct ChapterPayload<'a> {
    chapter: u32,
    text_status: TextStatus,
    notes_status: NotesStatus,
    text_placeholder: Option<String>,
    notes_placeholder: Option<String>,
    tokens: &'a [Token],
    notes: &'a [Pattern],
    placements: Vec<Match>,
}

struct ChapterLink {
    number: u32,
    href: String,
    current: bool,
}

struct NoteView {
    id: String,
    display_ref: String,
    body_html: String,
    placed: bool,
}

struct UserEntryView {
    id: String,
    phrase: String,
    body_html: String,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Lector • Chapter {{ chapter }}</title>
    {{ css_tag|safe }}
    {{ js_tag|safe }}
    <link rel="stylesheet" href="/static/reader.css">
    <link rel="canonical" href="{{ canonical_url }}">
  </head>
  <body class="{{ chrome.body_class }}" data-chapter="{{ chapter }}">
    <main class="{{ chrome.main_class }}">
      <header>
        <p class="{{ chrome.eyebrow_class }}">Lector v{{ version }}</p>
        <h1 class="{{ chrome.headline_class }}">Chapter {{ chapter }}</h1>
        <p class="{{ chrome.lede_class }}">Hover a highlighted phrase to see its note, shift-click to jump to it, click any word to look it up.</p>
        <nav class="{{ chrome.nav_class }}" aria-label="Chapters">
          {% for link in chapters %}
          {% if link.current %}
          <a href="{{ link.href }}" class="{{ chrome.button_active_class }}" aria-current="page">Chapter {{ link.number }}</a>
          {% else %}
          <a href="{{ link.href }}" class="{{ chrome.button_class }}">Chapter {{ link.number }}</a>
          {% endif %}
          {% endfor %}
        </nav>
      </header>

      <div class="{{ chrome.layout_class }}">
        <section id="text-pane" class="{{ chrome.pane_class }} reader-text">
          {% if let Some(notice) = fallback_notice %}
          <p class="placeholder fallback">{{ notice }}</p>
          {% endif %}
          {% if let Some(message) = text_placeholder %}
          <p class="placeholder">{{ message }}</p>
          {% else %}
          {{ text_html|safe }}
          {% endif %}
        </section>

        <section id="notes-pane" class="{{ chrome.pane_class }}">
          <h2 class="{{ chrome.eyebrow_class }}">Notes</h2>
          {% if let Some(message) = notes_placeholder %}
          <p class="placeholder">{{ message }}</p>
          {% endif %}
          {% for note in notes %}
          <article class="{{ chrome.note_class }} note{% if !note.placed %} unplaced{% endif %}" id="{{ note.id }}" data-note-id="{{ note.id }}">
            <p class="note-ref"><strong>{{ note.display_ref }}</strong></p>
            <div class="note-body">{{ note.body_html|safe }}</div>
          </article>
          {% endfor %}
          {% if user_notes.len() > 0 %}
          <h3 class="{{ chrome.eyebrow_class }}">Your notes</h3>
          {% for entry in user_notes %}
          <article class="{{ chrome.note_class }} user-note-entry" data-entry-id="{{ entry.id }}" data-kind="notes">
            <p class="note-ref"><strong>{{ entry.phrase }}</strong></p>
            <div class="note-body">{{ entry.body_html|safe }}</div>
          </article>
          {% endfor %}
          {% endif %}
        </section>

        <section id="vocab-pane" class="{{ chrome.pane_class }}">
          <h2 class="{{ chrome.eyebrow_class }}">Vocabulary</h2>
          <div id="lookup-result">
            <p class="placeholder">Click a word in the text to look it up.</p>
          </div>
          {% if vocab.len() > 0 %}
          <h3 class="{{ chrome.eyebrow_class }}">Your vocabulary</h3>
          {% for entry in vocab %}
          <article class="{{ chrome.note_class }} user-vocab-entry" data-entry-id="{{ entry.id }}" data-kind="vocab">
            <p class="note-ref"><strong>{{ entry.phrase }}</strong></p>
            <div class="note-body">{{ entry.body_html|safe }}</div>
          </article>
          {% endfor %}
          {% endif %}
        </section>
      </div>
    </main>
    <script src="/static/reader.js" defer></script>
  </body>
</html>"#,
    ext = "html"
)]
struct ReaderTemplate {
    chrome: Chrome,
    css_tag: &'static str,
    js_tag: &'static str,
    version: &'static str,
    canonical_url: String,
    chapter: u32,
    chapters: Vec<ChapterLink>,
    text_html: String,
    text_placeholder: Option<String>,
    fallback_notice: Option<String>,
    notes: Vec<NoteView>,
    notes_placeholder: Option<String>,
    vocab: Vec<UserEntryView>,
    user_notes: Vec<UserEntryView>,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Lector • Error</title>
    {{ css_tag|safe }}
    {{ js_tag|safe }}
  </head>
  <body class="{{ chrome.body_class }}">
    <main class="{{ chrome.main_class }}">
      <h1 class="{{ chrome.headline_class }}">Something went wrong</h1>
      <p class="{{ chrome.lede_class }}">{{ message }}</p>
      <a href="/" class="{{ chrome.button_class }}">Back to the reader</a>
    </main>
  </body>
</html>"#,
    ext = "html"
)]
struct ErrorTemplate {
    chrome: Chrome,
    css_tag: &'static str,
    js_tag: &'static str,
    message: String,
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use axum::{body, body::Body, http::Request};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn content_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("content")
    }

    fn test_config(upstream: Option<SocketAddr>) -> WebConfig {
        let base = upstream
            .map(|addr| format!("http://{addr}"))
            .unwrap_or_else(|| "http://127.0.0.1:9".to_string());
        WebConfig {
            content: ContentConfig::with_root(content_root()),
            lookup_endpoints: vec![
                Endpoint::new("missing", format!("{base}/missing?w={{word}}")),
                Endpoint::new("fake", format!("{base}/words?w={{word}}")),
            ],
            proxy_endpoints: vec![
                Endpoint::new("fake", format!("{base}/words?w={{word}}")),
                Endpoint::new("json", format!("{base}/json?w={{word}}")),
            ],
            store_path: None,
            ..WebConfig::default()
        }
    }

    fn test_router(upstream: Option<SocketAddr>) -> Router {
        let state = AppState::from_config(&test_config(upstream)).unwrap();
        build_router(Arc::new(state))
    }

    /// Serves `<pre>` output for `amo`, `senatus` and a slow `tardus`;
    /// everything else is a 404.
    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new()
            .route(
                "/words",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    match query.get("w").map(String::as_str) {
                        Some("amo") => (
                            [(header::CONTENT_TYPE, "text/html")],
                            "<html><body><pre>amo, amare, amavi, amatus  V\nlove, like\n\namor N M</pre></body></html>",
                        )
                            .into_response(),
                        Some("tardus") => {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            (
                                [(header::CONTENT_TYPE, "text/html")],
                                "<pre>tardus, tarda, tardum  ADJ\nslow, late</pre>",
                            )
                                .into_response()
                        }
                        Some("senatus") => (
                            [(header::CONTENT_TYPE, "text/html")],
                            "<pre>senatus, senatus N M\nsenate</pre>",
                        )
                            .into_response(),
                        _ => StatusCode::NOT_FOUND.into_response(),
                    }
                }),
            )
            .route(
                "/json",
                get(|| async {
                    Json(json!({"entries": [{"lemma": "amo", "definitions": ["love"]}]}))
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn body_string(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn assert_cors(response: &Response) {
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], CORS_ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], CORS_ALLOW_HEADERS);
    }

    #[tokio::test]
    async fn reader_page_renders_placed_notes() {
        let response = test_router(None)
            .oneshot(Request::get("/chapter/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let html = body_string(response).await;
        assert!(html.contains(r#"data-note-group="note-0-0""#));
        assert!(html.contains(r#"data-note-id="note-4""#));
        assert!(html.contains("/static/reader.js"));
        assert!(html.contains(r#"aria-current="page">Chapter 2"#));
    }

    #[tokio::test]
    async fn home_renders_default_chapter() {
        let response = test_router(None)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let html = body_string(response).await;
        assert!(html.contains("Chapter 2</h1>"));
    }

    #[tokio::test]
    async fn missing_chapter_shows_fallback_notice() {
        let response = test_router(None)
            .oneshot(Request::get("/chapter/9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let html = body_string(response).await;
        assert!(html.contains("Text for chapter 9 is not available; showing chapter 2."));
        assert!(html.contains("Chapter 9</h1>"));
    }

    #[tokio::test]
    async fn api_chapter_reports_sorted_placements() {
        let response = test_router(None)
            .oneshot(Request::get("/api/chapter/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let payload = body_json(response).await;
        assert_eq!(payload["chapter"], 2);
        assert_eq!(payload["text_status"]["status"], "loaded");
        assert_eq!(payload["notes_status"], "loaded");
        let starts: Vec<u64> = payload["placements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|placement| placement["start"].as_u64().unwrap())
            .collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
        assert_eq!(payload["placements"][0]["pattern_id"], "note-0");
        assert_eq!(payload["tokens"][0]["kind"], "word");
    }

    #[tokio::test]
    async fn proxy_passes_upstream_html_through() {
        let upstream = spawn_upstream().await;
        let response = test_router(Some(upstream))
            .oneshot(
                Request::get("/proxy?word=amo&endpoint=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert!(body_string(response).await.contains("amo, amare"));
    }

    #[tokio::test]
    async fn proxy_clamps_endpoint_index() {
        let upstream = spawn_upstream().await;
        let response = test_router(Some(upstream))
            .oneshot(
                Request::get("/proxy?word=amo&endpoint=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("definitions"));
    }

    #[tokio::test]
    async fn proxy_forwards_upstream_status() {
        let upstream = spawn_upstream().await;
        let response = test_router(Some(upstream))
            .oneshot(
                Request::get("/proxy?word=nihil")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_cors(&response);
        let payload = body_json(response).await;
        assert_eq!(payload["status"], 404);
        assert_eq!(payload["error"], "Dictionary service returned status 404");
    }

    #[tokio::test]
    async fn proxy_requires_a_word() {
        let router = test_router(None);
        for uri in ["/proxy?word=", "/proxy?word=%20%20", "/proxy"] {
            let response = router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri {uri}");
            assert_cors(&response);
            assert_eq!(body_json(response).await["error"], MISSING_WORD);
        }
    }

    #[tokio::test]
    async fn proxy_preflight_is_empty() {
        let response = test_router(None)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/proxy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn proxy_transport_failure_is_500() {
        let response = test_router(None)
            .oneshot(Request::get("/proxy?word=amo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&response);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "Failed to fetch from dictionary service");
        assert!(payload["message"].is_string());
    }

    #[tokio::test]
    async fn lookup_falls_back_to_stripped_enclitic() {
        let upstream = spawn_upstream().await;
        let response = test_router(Some(upstream))
            .oneshot(
                Request::get("/api/lookup?word=Senatusque&client=tab-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        let payload = body_json(response).await;
        assert_eq!(payload["outcome"], "found");
        assert_eq!(payload["word"], "Senatusque");
        assert_eq!(payload["query"], "senatus");
        assert_eq!(payload["source"], "fake");
        assert_eq!(payload["blocks"][0], "senatus, senatus N M\nsenate");
    }

    async fn lookup(router: &Router, query: &str) -> serde_json::Value {
        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/api/lookup?{query}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        body_json(response).await
    }

    #[tokio::test]
    async fn cached_lookup_still_supersedes_pending_ones() {
        let upstream = spawn_upstream().await;
        let router = test_router(Some(upstream));
        assert_eq!(lookup(&router, "word=amo&client=tab-1").await["outcome"], "found");

        let slow = {
            let router = router.clone();
            tokio::spawn(async move { lookup(&router, "word=tardus&client=tab-1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cached = lookup(&router, "word=Amo%2C&client=tab-1").await;
        assert_eq!(cached["outcome"], "found");
        assert_eq!(cached["word"], "Amo,");
        assert_eq!(cached["query"], "amo");

        let stale = slow.await.unwrap();
        assert_eq!(stale["outcome"], "superseded");
    }

    #[tokio::test]
    async fn lookup_reports_not_found_errors() {
        let upstream = spawn_upstream().await;
        let response = test_router(Some(upstream))
            .oneshot(
                Request::get("/api/lookup?word=nihil&candidates=nil")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let payload = body_json(response).await;
        assert_eq!(payload["outcome"], "not_found");
        let errors = payload["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0], "missing: HTTP 404");
    }

    #[tokio::test]
    async fn lookup_requires_a_word() {
        let response = test_router(None)
            .oneshot(Request::get("/api/lookup").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn user_entries_round_trip_through_the_api() {
        let router = test_router(None);
        let response = router
            .clone()
            .oneshot(
                Request::post("/api/user/vocab/2")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"phrase": "Athenas", "body": "to Athens"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let entry = body_json(response).await;
        let id = entry["id"].as_str().unwrap().to_string();

        let page = router
            .clone()
            .oneshot(Request::get("/chapter/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_string(page).await.contains(r#"data-gloss="to Athens""#));

        let response = router
            .clone()
            .oneshot(
                Request::delete(format!("/api/user/vocab/2/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());

        let response = router
            .oneshot(Request::get("/api/user/vocab/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn user_api_rejects_bad_input() {
        let router = test_router(None);
        let response = router
            .clone()
            .oneshot(Request::get("/api/user/glosses/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/user/notes/2")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"phrase": "...", "body": "nothing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(
                Request::delete("/api/user/notes/2/user-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_assets_are_embedded() {
        let response = test_router(None)
            .oneshot(Request::get("/static/reader.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/javascript; charset=utf-8"
        );

        let response = test_router(None)
            .oneshot(Request::get("/static/nope.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn endpoint_index_parses_leading_digits_and_clamps() {
        assert_eq!(parse_endpoint_index(None, 3), 0);
        assert_eq!(parse_endpoint_index(Some("1"), 3), 1);
        assert_eq!(parse_endpoint_index(Some("2abc"), 3), 2);
        assert_eq!(parse_endpoint_index(Some("7"), 3), 2);
        assert_eq!(parse_endpoint_index(Some("-1"), 3), 0);
        assert_eq!(parse_endpoint_index(Some("abc"), 3), 0);
        assert_eq!(parse_endpoint_index(Some("99999999999999999999999"), 3), 2);
    }
}
