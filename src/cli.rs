use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;

use atty::Stream;
use clap::{Parser, Subcommand};
use lector_rs::{
    Annotator, ChapterContext, ContentConfig, ContentSource, Layer, PlacementMap, Token, tokenize,
};
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "lector_rs=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(
    name = "lector-rs",
    about = "Read annotated Latin chapters in the terminal or the browser",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable tables.
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding chapter texts and annotation maps.
    #[arg(long, global = true, default_value = "content")]
    content: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a chapter with annotated phrases bracketed and footnoted.
    Annotate {
        chapter: u32,
    },
    /// List where each note was placed in a chapter.
    Matches {
        chapter: u32,
    },
    /// List the compiled notes of a chapter.
    Notes {
        chapter: u32,
    },
    /// Show how a literal string is tokenized.
    Tokens {
        /// Text to tokenize; quote it to keep whitespace.
        text: String,
    },
    /// Start the HTTP reader.
    #[cfg(feature = "web")]
    Serve(ServeArgs),
}

#[cfg(feature = "web")]
#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: std::net::SocketAddr,
    #[arg(long, value_enum, default_value_t = lector_rs::web::WebTheme::Tailwind)]
    theme: lector_rs::web::WebTheme,
    /// Public base URL used for canonical links; defaults to the bind address.
    #[arg(long)]
    base_url: Option<String>,
    /// Where user vocabulary and notes are saved.
    #[arg(long, default_value = "lector-user.json")]
    store: PathBuf,
    /// Keep user vocabulary and notes in memory only.
    #[arg(long)]
    ephemeral: bool,
    /// Chapter shown at `/` and used when a chapter's text is missing.
    #[arg(long, default_value_t = 2)]
    default_chapter: u32,
    /// Chapters offered in the chapter picker.
    #[arg(long, value_delimiter = ',', default_value = "1,2")]
    chapters: Vec<u32>,
    /// Dictionary endpoint for lookups, `label=template` or a bare template
    /// containing `{word}`. Repeat to set several; replaces the defaults.
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,
    /// Upstream for the `/proxy` route, addressed by position. Repeatable.
    #[arg(long = "proxy-endpoint")]
    proxy_endpoints: Vec<String>,
    /// Successful lookups kept in memory.
    #[arg(long, default_value_t = 256)]
    cache_size: usize,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    let content = ContentConfig::with_root(&cli.content);
    match cli.command {
        Command::Annotate { chapter } => handle_annotate(content, chapter, cli.json),
        Command::Matches { chapter } => handle_matches(content, chapter, cli.json),
        Command::Notes { chapter } => handle_notes(content, chapter, cli.json),
        Command::Tokens { text } => handle_tokens(&text, cli.json),
        #[cfg(feature = "web")]
        Command::Serve(args) => handle_serve(content, args),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_chapter(content: ContentConfig, chapter: u32) -> ChapterContext {
    ContentSource::new(content).load_chapter(chapter)
}

fn handle_annotate(content: ContentConfig, chapter: u32, as_json: bool) -> Result<(), Box<dyn Error>> {
    let context = load_chapter(content, chapter);
    let placements = context.placements();

    if as_json {
        let segments =
            Annotator::new(&context.stream, Layer::new(&placements, &context.patterns)).segments();
        let payload = json!({
            "chapter": context.chapter,
            "text_status": context.text_status,
            "notes_status": context.notes_status,
            "segments": segments,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if let Some(message) = context.text_placeholder() {
        println!("{message}");
        return Ok(());
    }
    let (text, footnotes) = bracket_text(&context, &placements);
    println!("{text}");
    if let Some(message) = context.notes_placeholder() {
        println!("\n{message}");
    }
    if !footnotes.is_empty() {
        println!("\nNotes:");
    }
    for (number, pattern_id) in footnotes.iter().enumerate() {
        let Some(pattern) = context.pattern(pattern_id) else {
            continue;
        };
        render_rich_block(&format!("[{}] {}", number + 1, pattern.display_ref), &pattern.body);
    }
    Ok(())
}

/// Brackets every placed phrase and numbers it in reading order.
fn bracket_text(context: &ChapterContext, placements: &PlacementMap) -> (String, Vec<String>) {
    let mut numbers: HashMap<&str, usize> = HashMap::new();
    let mut footnotes: Vec<String> = Vec::new();
    let mut out = String::with_capacity(context.text.len());

    for token in context.stream.tokens() {
        let Token::Word(word) = token else {
            out.push_str(token.raw());
            continue;
        };
        if placements.get(word.position).is_some() {
            out.push('[');
        }
        out.push_str(&word.raw);
        let Some(found) = placements.covering(word.position) else {
            continue;
        };
        if found.end() == word.position + 1 {
            let number = *numbers.entry(found.pattern_id.as_str()).or_insert_with(|| {
                footnotes.push(found.pattern_id.clone());
                footnotes.len()
            });
            out.push_str(&format!("][{number}]"));
        }
    }
    (out, footnotes)
}

fn handle_matches(content: ContentConfig, chapter: u32, as_json: bool) -> Result<(), Box<dyn Error>> {
    let context = load_chapter(content, chapter);
    let placements = context.placements();

    if as_json {
        let payload = json!({
            "chapter": context.chapter,
            "placements": placements.iter().collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if placements.is_empty() {
        println!("No notes were placed in chapter {chapter}.");
        return Ok(());
    }
    let rows: Vec<(usize, usize, &str, String)> = placements
        .iter()
        .map(|found| {
            let words: Vec<&str> = (found.start..found.end())
                .filter_map(|position| context.stream.word(position))
                .map(|word| word.raw.as_str())
                .collect();
            (found.start, found.length, found.pattern_id.as_str(), words.join(" "))
        })
        .collect();
    let width = rows
        .iter()
        .map(|(_, _, id, _)| id.len())
        .max()
        .unwrap_or(4)
        .max("NOTE".len());
    println!("{:>5}  {:>6}  {:<width$}  {}", "START", "LENGTH", "NOTE", "WORDS", width = width);
    println!("{:->5}  {:->6}  {:-<width$}  {}", "", "", "", "-----", width = width);
    for (start, length, id, words) in rows {
        println!("{:>5}  {:>6}  {:<width$}  {}", start, length, id, words, width = width);
    }
    Ok(())
}

fn handle_notes(content: ContentConfig, chapter: u32, as_json: bool) -> Result<(), Box<dyn Error>> {
    let context = load_chapter(content, chapter);
    let placements = context.placements();
    let placed = |id: &str| placements.iter().any(|found| found.pattern_id == id);

    if as_json {
        let payload = json!({
            "chapter": context.chapter,
            "notes_status": context.notes_status,
            "notes": context.patterns.iter().map(|pattern| json!({
                "id": pattern.id,
                "reference": pattern.reference,
                "display_ref": pattern.display_ref,
                "segments": pattern.segments,
                "body": pattern.body,
                "placed": placed(&pattern.id),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if let Some(message) = context.notes_placeholder() {
        println!("{message}");
        return Ok(());
    }
    if context.patterns.is_empty() {
        println!("Chapter {chapter} has no notes.");
        return Ok(());
    }
    let width = context
        .patterns
        .iter()
        .map(|pattern| pattern.id.len())
        .max()
        .unwrap_or(2)
        .max("ID".len());
    println!("{:<width$}  {:>8}  {:<6}  {}", "ID", "SEGMENTS", "PLACED", "REFERENCE", width = width);
    println!("{:-<width$}  {:->8}  {:-<6}  {}", "", "", "", "---------", width = width);
    for pattern in &context.patterns {
        println!(
            "{:<width$}  {:>8}  {:<6}  {}",
            pattern.id,
            pattern.segments.len(),
            if placed(&pattern.id) { "yes" } else { "no" },
            pattern.display_ref,
            width = width
        );
    }
    Ok(())
}

fn handle_tokens(text: &str, as_json: bool) -> Result<(), Box<dyn Error>> {
    let stream = tokenize(text);
    if as_json {
        println!("{}", serde_json::to_string_pretty(stream.tokens())?);
        return Ok(());
    }
    if stream.tokens().is_empty() {
        println!("No tokens.");
        return Ok(());
    }
    println!("{:>5}  {:<5}  {:>8}  {:<20}  {}", "INDEX", "KIND", "POSITION", "RAW", "NORMALIZED");
    println!("{:->5}  {:-<5}  {:->8}  {:-<20}  {}", "", "", "", "", "----------");
    for (index, token) in stream.tokens().iter().enumerate() {
        match token {
            Token::Word(word) => println!(
                "{:>5}  {:<5}  {:>8}  {:<20}  {}",
                index,
                "word",
                word.position,
                format!("{:?}", word.raw),
                word.normalized
            ),
            Token::Space { raw } => println!(
                "{:>5}  {:<5}  {:>8}  {:<20}",
                index,
                "space",
                "",
                format!("{raw:?}")
            ),
        }
    }
    println!("\n{} word(s)", stream.word_count());
    Ok(())
}

#[cfg(feature = "web")]
fn handle_serve(mut content: ContentConfig, args: ServeArgs) -> Result<(), Box<dyn Error>> {
    use lector_rs::Endpoint;
    use lector_rs::web::{WebConfig, serve};

    fn parse_endpoints(specs: &[String]) -> Result<Vec<Endpoint>, Box<dyn Error>> {
        specs
            .iter()
            .map(|spec| {
                Endpoint::parse(spec)
                    .ok_or_else(|| Box::<dyn Error>::from(format!("Invalid endpoint {spec:?}")))
            })
            .collect()
    }

    content.default_chapter = args.default_chapter;
    content.chapters = args.chapters;
    let mut config = WebConfig {
        addr: args.addr,
        theme: args.theme,
        base_url: args
            .base_url
            .unwrap_or_else(|| format!("http://{}", args.addr)),
        content,
        store_path: (!args.ephemeral).then_some(args.store),
        cache_size: args.cache_size,
        ..WebConfig::default()
    };
    if !args.endpoints.is_empty() {
        config.lookup_endpoints = parse_endpoints(&args.endpoints)?;
    }
    if !args.proxy_endpoints.is_empty() {
        config.proxy_endpoints = parse_endpoints(&args.proxy_endpoints)?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))?;
    Ok(())
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn markdown_skin() -> MadSkin {
    MadSkin::default()
}

/// Prints a footnote body; `**bold**` and `*italic*` are styled on a terminal.
fn render_rich_block(title: &str, body: &str) {
    println!("\n{title}");
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    if stdout_is_tty() {
        let skin = markdown_skin();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        print!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lector_rs::annotate;

    #[test]
    fn brackets_number_notes_in_reading_order() {
        let (context, placements) = annotate(
            2,
            "Pater mature decessit. Ipse  Athenas se contulit.",
            r#"{"Athenas se contulit": "went to Athens", "Pater mature": "his father"}"#,
        );
        let (text, footnotes) = bracket_text(&context, &placements);
        assert_eq!(
            text,
            "[Pater mature][1] decessit. Ipse  [Athenas se contulit.][2]"
        );
        assert_eq!(footnotes, vec!["note-1", "note-0"]);
    }

    #[test]
    fn unplaced_text_is_left_untouched() {
        let (context, placements) = annotate(1, "Hic, prout ipse amabat litteras", "{}");
        let (text, footnotes) = bracket_text(&context, &placements);
        assert_eq!(text, "Hic, prout ipse amabat litteras");
        assert!(footnotes.is_empty());
    }
}
