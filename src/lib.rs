//! # edgequake-studygen
//!
//! Turn normalized lecture text into a fact-dense study guide (or exam cram
//! sheet) with a three-stage LLM pipeline.
//!
//! ## Why this crate?
//!
//! A single "summarise these slides" prompt loses facts: long lectures blow
//! through the output-token ceiling, truncated JSON takes the whole run down
//! with it, and a rerun pays for every slide again. This crate extracts the
//! lecture in small slide chunks, caches each chunk under a content-addressed
//! key, splits chunks that keep failing, and always produces a document,
//! marking exactly which slides are missing and why.
//!
//! ## Pipeline Overview
//!
//! ```text
//! normalized text
//!  │
//!  ├─ 1. Parse     slide/page markers → numbered slides
//!  ├─ 2. Chunk     greedy slide/char limits, adaptive halving for dense text
//!  ├─ 3. Step A    per-chunk extraction (cache → retry → split), then derive
//!  ├─ 4. Step B    plan → outline → pack → validate → rewrite → minimum gate
//!  ├─ 5. Step C    review over compact statistics
//!  ├─ 6. Render    pure Markdown assembly plus Coverage & QA appendix
//!  └─ 7. Store     documents/<docId>/<mode>/study_guide.md
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_studygen::{generate, GenerationConfig, GenerationMode, GenerationRequest, FsObjectStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY and friends
//!     let config = GenerationConfig::default();
//!     let store = FsObjectStore::new(".studygen");
//!     let text = std::fs::read_to_string("lecture.txt")?;
//!     let request = GenerationRequest::new(text, "Renal Physiology", "renal-01", GenerationMode::StudyGuide);
//!     let output = generate(&request, &config, &store).await?;
//!     println!("{}", output.markdown);
//!     eprintln!("coverage: {}/{} slides", output.coverage.processed, output.coverage.total);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `studygen` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-studygen = { version = "0.1", default-features = false }
//! ```
//!
//! ## Models
//!
//! Only `gpt-4.1-mini` and `gpt-4.1` are accepted; any other model id is
//! rejected before a single call is made.
//!
//! | Stage | Default model | Why |
//! |-------|---------------|-----|
//! | Step A extraction + derive | `gpt-4.1-mini` | Many small calls, faithful copying |
//! | Step B synthesis | `gpt-4.1` | One large reasoning-heavy document |
//! | Step C review | `gpt-4.1-mini` | Reads statistics, not the lecture |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod generate;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{GenerationConfig, GenerationConfigBuilder, GenerationMode, SynthesisMinimums};
pub use error::{FailureKind, LlmCallError, StageFailure, StoreError, StudyGenError};
pub use generate::{
    document_key, generate, generate_sync, generate_to_file, generate_with_client, preview_chunks,
    write_atomic, GenerationRequest,
};
pub use output::{ChunkPreview, ChunkSummary, Coverage, GenerationOutput, GenerationStats};
pub use pipeline::llm::{CallPurpose, LlmClient, LlmRequest, LlmResponse, ProviderClient};
pub use pipeline::render::CoverageReport;
pub use progress::{GenerationProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use types::ChunkRange;
