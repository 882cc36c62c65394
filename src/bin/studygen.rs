//! CLI binary for edgequake-studygen.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `GenerationConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_studygen::{
    generate, preview_chunks, write_atomic, ChunkRange, FsObjectStore, GenerationConfig,
    GenerationMode, GenerationOutput, GenerationProgressCallback, GenerationRequest,
    ProgressCallback, SynthesisMinimums,
};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback. The bar counts slides, not chunks, because
/// split children report completion for sub-ranges.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Parsing lecture…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total_slides: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} slides  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_slides as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn advance(&self, range: ChunkRange) {
        let len = self.bar.length().unwrap_or(0);
        let next = self.bar.position() + u64::from(range.end - range.start + 1);
        self.bar.set_position(next.min(len));
    }
}

impl GenerationProgressCallback for CliProgressCallback {
    fn on_generation_start(&self, total_chunks: usize, total_slides: usize) {
        self.activate_bar(total_slides);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{total_slides} slides in {total_chunks} chunks"))
        ));
    }

    fn on_chunk_start(&self, range: ChunkRange, _index: usize, _total: usize) {
        self.bar.set_message(format!("slides {range}"));
    }

    fn on_chunk_complete(&self, range: ChunkRange, from_cache: bool) {
        let source = if from_cache { "cached" } else { "extracted" };
        self.bar.println(format!(
            "  {} Slides {:<9} {}",
            green("✓"),
            range.to_string(),
            dim(source)
        ));
        self.advance(range);
    }

    fn on_chunk_split(&self, range: ChunkRange, left: ChunkRange, right: ChunkRange) {
        self.bar.println(format!(
            "  {} Slides {:<9} {}",
            cyan("↳"),
            range.to_string(),
            dim(&format!("split into {left} and {right}"))
        ));
    }

    fn on_chunk_error(&self, range: ChunkRange, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Slides {:<9} {}",
            red("✗"),
            range.to_string(),
            red(&msg)
        ));
        self.advance(range);
    }

    fn on_stage(&self, stage: &str) {
        self.bar.set_prefix("Synthesis");
        self.bar.set_message(stage.to_string());
    }

    fn on_generation_complete(&self, processed_slides: usize, total_slides: usize) {
        self.bar.finish_and_clear();
        if processed_slides == total_slides {
            eprintln!(
                "{} {} slides covered",
                green("✔"),
                bold(&processed_slides.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} slides covered  ({} range errors)",
                cyan("⚠"),
                bold(&processed_slides.to_string()),
                total_slides,
                red(&self.errors.load(Ordering::SeqCst).to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Study guide to stdout
  studygen lecture.txt --title "Renal Physiology"

  # Exam cram sheet to a file
  studygen lecture.txt --mode exam-cram -o cram.md

  # Read the lecture from stdin
  cat lecture.txt | studygen - --doc-id renal-01

  # Show how the lecture would be chunked (no API key needed)
  studygen --plan-only lecture.txt

  # Full JSON output (Step A/B/C payloads, coverage, stats)
  studygen --json lecture.txt > run.json

INPUT FORMAT:
  One marker line per slide or page, body text below it:
    --- Slide 12 ---        === Page 3 ===
    ## Slide 4: Hemostasis  [Slide 7]

MODELS:
  Only gpt-4.1-mini and gpt-4.1 are accepted.
  Step A (extraction)  gpt-4.1-mini
  Step B (synthesis)   gpt-4.1
  Step C (review)      gpt-4.1-mini

CACHE:
  Chunk extractions, derived structures and synthesis results are stored
  under --cache-dir. Rerunning the same lecture, mode and prompt version
  makes no model calls for work that already succeeded.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, azure)
  STUDYGEN_CACHE_DIR      Cache / document store directory
"#;

/// Turn normalized lecture text into a study guide.
#[derive(Parser, Debug)]
#[command(
    name = "studygen",
    version,
    about = "Turn normalized lecture text into a fact-dense study guide",
    long_about = "Turn page/slide-delimited lecture text into a study guide or exam cram sheet \
with a resumable three-stage LLM pipeline: per-chunk extraction, synthesis, and review. \
Every run produces a document; missing slides are listed in its Coverage & QA section.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Lecture text file, or `-` for stdin.
    input: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "STUDYGEN_OUTPUT")]
    output: Option<PathBuf>,

    /// Lecture title. Default: the title the model reports.
    #[arg(short, long, env = "STUDYGEN_TITLE")]
    title: Option<String>,

    /// Stable document id used in cache keys. Default: input file stem,
    /// or a hash of the text when reading stdin.
    #[arg(long, env = "STUDYGEN_DOC_ID")]
    doc_id: Option<String>,

    /// Output mode.
    #[arg(short, long, env = "STUDYGEN_MODE", value_enum, default_value = "study-guide")]
    mode: ModeArg,

    /// Cache and document store directory.
    #[arg(long, env = "STUDYGEN_CACHE_DIR", default_value = ".studygen")]
    cache_dir: PathBuf,

    /// LLM provider: openai, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Step A model.
    #[arg(long, env = "STUDYGEN_EXTRACTION_MODEL", default_value = "gpt-4.1-mini")]
    extraction_model: String,

    /// Step B model.
    #[arg(long, env = "STUDYGEN_SYNTHESIS_MODEL", default_value = "gpt-4.1")]
    synthesis_model: String,

    /// Step C model.
    #[arg(long, env = "STUDYGEN_REVIEW_MODEL", default_value = "gpt-4.1-mini")]
    review_model: String,

    /// Maximum slides per chunk.
    #[arg(long, env = "STUDYGEN_MAX_SLIDES", default_value_t = 6)]
    max_slides: usize,

    /// Maximum characters per chunk.
    #[arg(long, env = "STUDYGEN_MAX_CHARS", default_value_t = 12_000)]
    max_chars: usize,

    /// Maximum recursive split depth for failing chunks.
    #[arg(long, env = "STUDYGEN_MAX_SPLIT_DEPTH", default_value_t = 3)]
    max_split_depth: u32,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long, env = "STUDYGEN_TIME_BUDGET", default_value_t = 900)]
    time_budget: u64,

    /// Chunks extracted concurrently.
    #[arg(short, long, env = "STUDYGEN_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Transport retries per LLM call.
    #[arg(long, env = "STUDYGEN_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "STUDYGEN_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Minimum high-yield summary bullets (overrides the mode default).
    #[arg(long)]
    min_summary: Option<usize>,

    /// Minimum pitfalls (overrides the mode default).
    #[arg(long)]
    min_pitfalls: Option<usize>,

    /// Output structured JSON (GenerationOutput) instead of Markdown.
    #[arg(long, env = "STUDYGEN_JSON")]
    json: bool,

    /// Print the chunk plan only, no model calls.
    #[arg(long)]
    plan_only: bool,

    /// Disable progress bar.
    #[arg(long, env = "STUDYGEN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "STUDYGEN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "STUDYGEN_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    StudyGuide,
    ExamCram,
}

impl From<ModeArg> for GenerationMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::StudyGuide => GenerationMode::StudyGuide,
            ModeArg::ExamCram => GenerationMode::ExamCram,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.plan_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let text = read_input(&cli.input).await?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn GenerationProgressCallback>)
    } else {
        None
    };
    let mode: GenerationMode = cli.mode.into();
    let config = build_config(&cli, mode, progress_cb)?;

    // ── Plan-only mode ───────────────────────────────────────────────────
    if cli.plan_only {
        let preview = preview_chunks(&text, &config).context("Failed to chunk lecture")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&preview).context("Failed to serialize preview")?
            );
        } else {
            println!("Slides:          {}", preview.total_slides);
            println!("Empty slides:    {}", preview.empty_slides);
            println!("Prompt version:  {}", preview.prompt_version);
            println!("Chunks:          {}", preview.chunks.len());
            for chunk in &preview.chunks {
                println!(
                    "  {:<9} {:>2} slides  {:>6} chars  ~{} tokens",
                    chunk.range.to_string(),
                    chunk.slides,
                    chunk.chars,
                    chunk.estimated_tokens
                );
            }
        }
        return Ok(());
    }

    // ── Run generation ───────────────────────────────────────────────────
    let doc_id = cli
        .doc_id
        .clone()
        .unwrap_or_else(|| default_doc_id(&cli.input, &text));
    let request = GenerationRequest::new(text, cli.title.clone().unwrap_or_default(), doc_id, mode);
    let store = FsObjectStore::new(&cli.cache_dir);

    let output = generate(&request, &config, &store)
        .await
        .context("Generation failed")?;

    if let Some(ref path) = cli.output {
        write_atomic(path, &output.markdown)
            .await
            .context("Failed to write output")?;
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if cli.output.is_none() {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.markdown.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet {
        print_summary(&output, cli.output.as_deref());
    }
    Ok(())
}

fn print_summary(output: &GenerationOutput, path: Option<&Path>) {
    let stats = &output.stats;
    let target = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| output.stored_key.clone());
    eprintln!(
        "{}  {}/{} slides  {} calls  {}ms  →  {}",
        if output.partial { cyan("⚠") } else { green("✔") },
        output.coverage.processed,
        output.coverage.total,
        stats.llm_calls,
        stats.total_duration_ms,
        bold(&target),
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out  /  {} cache hits",
        dim(&stats.total_input_tokens.to_string()),
        dim(&stats.total_output_tokens.to_string()),
        dim(&stats.cache_hits.to_string()),
    );
    for warning in &output.warnings {
        eprintln!("   {} {}", cyan("•"), warning);
    }
}

async fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read {input}"))
    }
}

/// File stem for files; a short content hash for stdin.
fn default_doc_id(input: &str, text: &str) -> String {
    let stem = Path::new(input)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|_| input != "-")
        .map(|s| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
                .collect::<String>()
        })
        .filter(|s| !s.is_empty() && !s.contains(".."));
    stem.unwrap_or_else(|| {
        let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
        format!("stdin-{}", &digest[..12])
    })
}

/// Map CLI args to `GenerationConfig`.
fn build_config(
    cli: &Cli,
    mode: GenerationMode,
    progress: Option<ProgressCallback>,
) -> Result<GenerationConfig> {
    let mut builder = GenerationConfig::builder()
        .extraction_model(&cli.extraction_model)
        .synthesis_model(&cli.synthesis_model)
        .review_model(&cli.review_model)
        .max_slides_per_chunk(cli.max_slides)
        .max_chars_per_chunk(cli.max_chars)
        .max_split_depth(cli.max_split_depth)
        .time_budget_secs(cli.time_budget)
        .concurrency(cli.concurrency)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout);

    if cli.min_summary.is_some() || cli.min_pitfalls.is_some() {
        let mut minimums = SynthesisMinimums::for_mode(mode);
        if let Some(n) = cli.min_summary {
            minimums.high_yield_summary = n;
        }
        if let Some(n) = cli.min_pitfalls {
            minimums.pitfalls = n;
        }
        builder = builder.minimums(minimums);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
