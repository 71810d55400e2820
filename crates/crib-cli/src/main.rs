//! crib - page-to-answer quiz analyzer CLI

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crib_ai::{DEFAULT_TEMPERATURE, GeminiClient, GenerationConfig};
use crib_pipeline::{
    DEFAULT_MAX_SOURCE_CHARS, DEFAULT_MODEL, Error as PipelineError, GeminiGenerator, JsonStore,
    MemoryStore, PageInfo, Pipeline, PipelineConfig, PipelineEvent, Session, Stage, StateStore,
    Status, Tone, parse_answer,
};

/// crib - extract a quiz from page text, answer it, explain it
#[derive(Parser, Debug)]
#[command(name = "crib")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File with the page text to analyze ("-" for stdin)
    input: Option<PathBuf>,

    /// Model to use (default: gemini-2.5-flash)
    #[arg(short, long)]
    model: Option<String>,

    /// Sampling temperature in [0, 1]
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Tab (session slot) to operate on
    #[arg(long, default_value_t = 1)]
    tab: u32,

    /// Page title recorded with the analysis
    #[arg(long)]
    title: Option<String>,

    /// Page URL recorded with the analysis
    #[arg(long)]
    url: Option<String>,

    /// Explanation tone (casual, formal)
    #[arg(long)]
    tone: Option<String>,

    /// Also request an explanation after the answer
    #[arg(short, long)]
    explain: bool,

    /// Print the tab's session state as JSON
    #[arg(long)]
    state: bool,

    /// Discard the tab's session before doing anything else
    #[arg(long)]
    rescan: bool,

    /// Print the analysis history
    #[arg(long)]
    history: bool,

    /// Write the analysis history as JSON to a file
    #[arg(long)]
    export_history: Option<PathBuf>,

    /// Delete the analysis history
    #[arg(long)]
    clear_history: bool,

    /// Verify the configured API key against the model
    #[arg(long)]
    check_key: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Keep sessions and history in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Directory for persisted sessions and history
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_tone(s: &str) -> Tone {
    match s.to_lowercase().as_str() {
        "formal" => Tone::Formal,
        _ => Tone::Casual,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("crib=debug")
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Load config file
    let cfg = config::Config::load();

    // Merge config with CLI args (CLI takes precedence)
    let model = args
        .model
        .clone()
        .or(cfg.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let temperature = resolve_temperature(args.temperature, cfg.temperature)?;

    let tone = args
        .tone
        .as_deref()
        .map(parse_tone)
        .or(cfg.tone)
        .unwrap_or_default();

    let api_key = cfg.resolve_api_key();

    // Verify the key and exit
    if args.check_key {
        let Some(ref key) = api_key else {
            print_missing_key_help();
            std::process::exit(1);
        };
        let client = GeminiClient::new(key.clone());
        match client.check_key(&model).await {
            Ok(()) => println!("API key OK."),
            Err(e) => {
                eprintln!("API key check failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let pipeline_config = PipelineConfig {
        api_key: api_key.clone(),
        model,
        generation: GenerationConfig { temperature },
        prompts: cfg.prompts.clone(),
        tone,
        max_source_chars: DEFAULT_MAX_SOURCE_CHARS,
    };

    let store: Arc<dyn StateStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let dir = args.data_dir.clone().unwrap_or_else(JsonStore::default_dir);
        Arc::new(JsonStore::new(dir))
    };
    let generator = Arc::new(GeminiGenerator::new(GeminiClient::new(
        api_key.unwrap_or_default(),
    )));

    let pipeline = Pipeline::new(pipeline_config, generator, store);
    if let Err(e) = pipeline.load_state().await {
        eprintln!("Warning: Failed to load saved state: {}", e);
    }

    // Print session state and exit
    if args.state {
        match pipeline.tab_state(args.tab) {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => println!("No session for tab {}.", args.tab),
        }
        return Ok(());
    }

    // History modes
    if args.history {
        print_history(&pipeline);
        return Ok(());
    }
    if let Some(ref path) = args.export_history {
        let entries = pipeline.history();
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        println!("Exported {} entries to {}", entries.len(), path.display());
        return Ok(());
    }
    if args.clear_history {
        pipeline.clear_history().await?;
        println!("History cleared.");
        return Ok(());
    }

    if args.rescan {
        pipeline.clear_and_rescan(args.tab).await?;
    }

    match read_source(args.input.as_deref())? {
        Some(text) => run_analysis(&pipeline, &args, text).await,
        None if args.rescan => {
            println!("Session for tab {} cleared.", args.tab);
            Ok(())
        }
        None if args.explain => run_explanation(&pipeline, args.tab).await,
        None => {
            eprintln!("Error: No input. Pass a file, or pipe the page text on stdin.");
            std::process::exit(2);
        }
    }
}

/// Read the page text from a file argument or piped stdin.
/// Returns `None` when nothing was provided and stdin is a terminal.
fn read_source(input: Option<&Path>) -> anyhow::Result<Option<String>> {
    use std::io::{IsTerminal, Read};

    match input {
        Some(path) if path.as_os_str() == "-" => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(Some(text))
        }
        Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
        None => {
            let mut stdin = std::io::stdin();
            if stdin.is_terminal() {
                return Ok(None);
            }
            let mut text = String::new();
            stdin.read_to_string(&mut text)?;
            Ok(Some(text))
        }
    }
}

async fn run_analysis(pipeline: &Pipeline, args: &Args, text: String) -> anyhow::Result<()> {
    let page = match (args.title.clone(), args.url.clone()) {
        (None, None) => None,
        (title, url) => Some(PageInfo {
            title: title.unwrap_or_default(),
            url: url.unwrap_or_default(),
        }),
    };

    let handle = spawn_printer(pipeline.subscribe());

    if let Err(e) = pipeline.start_analysis(args.tab, text, page).await {
        if matches!(e, PipelineError::MissingApiKey) {
            print_missing_key_help();
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }

    let completed = matches!(
        pipeline.tab_state(args.tab).map(|s| s.status),
        Some(Status::Complete)
    );
    if args.explain && completed {
        pipeline.get_explanation(args.tab).await?;
    }

    // Wait a bit for final events
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    handle.abort();

    let Some(session) = pipeline.tab_state(args.tab) else {
        return Ok(());
    };
    if session.status == Status::Error {
        if let Some(ref message) = session.error {
            eprintln!("Analysis failed: {}", message);
        }
        std::process::exit(1);
    }
    print_summary(&session);
    Ok(())
}

async fn run_explanation(pipeline: &Pipeline, tab: u32) -> anyhow::Result<()> {
    let handle = spawn_printer(pipeline.subscribe());

    if let Err(e) = pipeline.get_explanation(tab).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    handle.abort();

    match pipeline.tab_state(tab) {
        Some(session) if session.status == Status::Error => {
            if let Some(ref message) = session.error {
                eprintln!("Explanation failed: {}", message);
            }
            std::process::exit(1);
        }
        _ => Ok(()),
    }
}

/// Forward stream events to stdout as they arrive
fn spawn_printer(
    mut receiver: tokio::sync::broadcast::Receiver<PipelineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use std::io::Write;

        let mut current: Option<Stage> = None;
        while let Ok(event) = receiver.recv().await {
            match event {
                PipelineEvent::StreamChunk {
                    request_type, text, ..
                } => {
                    if current != Some(request_type) {
                        if current.is_some() {
                            println!();
                        }
                        println!("[{}]", request_type.as_str());
                        current = Some(request_type);
                    }
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                PipelineEvent::StreamEnd {
                    request_type, text, ..
                } => {
                    if current == Some(request_type) {
                        println!();
                    } else {
                        // The whole stage arrived in a single terminal event
                        println!("[{}]", request_type.as_str());
                        println!("{}", text);
                    }
                    current = None;
                }
                PipelineEvent::StreamError { message, .. } => {
                    eprintln!("\nError: {}", message);
                    current = None;
                }
                PipelineEvent::StateUpdate { .. } => {}
            }
        }
    })
}

fn print_summary(session: &Session) {
    let Some(ref answer) = session.answer else {
        return;
    };
    let parsed = parse_answer(answer);
    println!();
    println!("Answer:     {}", parsed.answer);
    if let Some(confidence) = parsed.confidence {
        println!("Confidence: {}", confidence.as_str());
    }
    if let Some(ref reason) = parsed.reason {
        println!("Reason:     {}", reason);
    }
}

fn print_history(pipeline: &Pipeline) {
    let entries = pipeline.history();
    if entries.is_empty() {
        println!("History is empty.");
        return;
    }

    for entry in &entries {
        let when = chrono::DateTime::from_timestamp_millis(entry.id)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| entry.timestamp.clone());
        let confidence = entry.confidence.map(|c| c.as_str()).unwrap_or("-");
        let answer = parse_answer(&entry.answer).answer;
        let first_line = answer.lines().next().unwrap_or("");
        println!("{}  {:<8} {}", when, confidence, truncate_chars(first_line, 60));
        if !entry.title.is_empty() || !entry.url.is_empty() {
            println!("    {} ({})", entry.title, entry.url);
        }
    }
    println!();
    println!("{} entries", entries.len());
}

fn print_missing_key_help() {
    eprintln!("Error: API Key has not been set.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  1. Set the environment variable: export GEMINI_API_KEY=your-key");
    eprintln!("  2. Add api_key to the config file: crib --init-config");
}

fn resolve_temperature(cli: Option<f32>, cfg: Option<f32>) -> anyhow::Result<f32> {
    if let Some(t) = cli {
        if !(0.0..=1.0).contains(&t) {
            anyhow::bail!("temperature must be between 0 and 1, got {}", t);
        }
        return Ok(t);
    }
    if let Some(t) = cfg {
        if (0.0..=1.0).contains(&t) {
            return Ok(t);
        }
        eprintln!("Warning: Ignoring out-of-range temperature {} from config", t);
    }
    Ok(DEFAULT_TEMPERATURE)
}

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on char boundaries, not bytes.
fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
