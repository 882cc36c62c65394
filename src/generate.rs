//! Generation entry points.
//!
//! [`generate`] resolves providers from the config; [`generate_with_client`]
//! takes any [`LlmClient`] and is what tests and embedding services use.
//! Both run the same pipeline:
//!
//! ```text
//! parse ─▶ chunk ─▶ extract (cache) ─▶ merge/derive ─▶ compile ─▶ gate ─▶ review ─▶ render ─▶ store
//! ```
//!
//! The run always yields a document unless the input or config is unusable
//! or the store rejects a write. The diagnostics trace is persisted whether
//! the run succeeds or not.

use crate::config::{GenerationConfig, GenerationMode, SynthesisMinimums};
use crate::error::StudyGenError;
use crate::output::{ChunkPreview, ChunkSummary, Coverage, GenerationOutput, GenerationStats};
use crate::pipeline::chunker::{chunk_slides, ChunkLimits};
use crate::pipeline::compile::compile;
use crate::pipeline::extract::extract_all;
use crate::pipeline::gate::enforce_minimums;
use crate::pipeline::llm::{LlmClient, ProviderClient, RunContext};
use crate::pipeline::manifest::{cache_prefix, ChunkCache};
use crate::pipeline::merge::{derive, merge_chunk_outputs, DeriveSource};
use crate::pipeline::postprocess::clean_document;
use crate::pipeline::render::{qa_lines, render_document, CoverageReport, RenderInput};
use crate::pipeline::review::{review, ReviewStats};
use crate::pipeline::slides::parse_slides;
use crate::prompts::prompt_version;
use crate::store::ObjectStore;
use crate::types::{StepAOutput, StepBOutput, StepBPlan, StepCOutput};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One document-generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Page/slide-delimited lecture text.
    pub normalized_text: String,
    /// Preferred title; empty means "use the title the model reports".
    pub lecture_title: String,
    /// Stable document id; part of every cache key.
    pub doc_id: String,
    pub mode: GenerationMode,
}

impl GenerationRequest {
    pub fn new(
        normalized_text: impl Into<String>,
        lecture_title: impl Into<String>,
        doc_id: impl Into<String>,
        mode: GenerationMode,
    ) -> Self {
        Self {
            normalized_text: normalized_text.into(),
            lecture_title: lecture_title.into(),
            doc_id: doc_id.into(),
            mode,
        }
    }

    fn validate(&self) -> Result<(), StudyGenError> {
        if self.normalized_text.trim().is_empty() {
            return Err(StudyGenError::InvalidInput("lecture text is empty".into()));
        }
        let id = self.doc_id.trim();
        if id.is_empty() {
            return Err(StudyGenError::InvalidInput("document id is empty".into()));
        }
        if id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(StudyGenError::InvalidInput(format!(
                "document id '{id}' must not contain path separators or '..'"
            )));
        }
        Ok(())
    }
}

/// Store key of the final document.
pub fn document_key(doc_id: &str, mode: GenerationMode) -> String {
    format!("documents/{}/{}/study_guide.md", doc_id.trim(), mode.as_str())
}

/// Generate a study document, resolving LLM providers from `config`.
///
/// # Errors
/// Only fatal conditions: disallowed model, provider not configured, empty
/// input, or a store write failure. Failed chunks and fallback synthesis
/// are reported through [`GenerationOutput::partial`] and
/// [`GenerationOutput::warnings`].
pub async fn generate(
    request: &GenerationRequest,
    config: &GenerationConfig,
    store: &dyn ObjectStore,
) -> Result<GenerationOutput, StudyGenError> {
    config.validate_models()?;
    request.validate()?;
    let client = ProviderClient::from_config(config).await?;
    generate_with_client(request, config, store, &client).await
}

/// Generate a study document with an injected [`LlmClient`].
pub async fn generate_with_client(
    request: &GenerationRequest,
    config: &GenerationConfig,
    store: &dyn ObjectStore,
    client: &dyn LlmClient,
) -> Result<GenerationOutput, StudyGenError> {
    config.validate_models()?;
    request.validate()?;

    let request_id = Uuid::new_v4().to_string();
    let ctx = RunContext::new(request_id, request.doc_id.trim(), client, config, request.mode);
    info!(
        request_id = %ctx.request_id,
        doc_id = %request.doc_id,
        mode = %request.mode,
        "Starting generation"
    );

    let result = run(&ctx, request, store).await;
    let diagnostics_key = ctx.diagnostics.persist(store).await;

    match result {
        Ok(mut output) => {
            output.diagnostics_key = diagnostics_key;
            Ok(output)
        }
        Err(e) => {
            warn!(request_id = %ctx.request_id, "Generation failed: {}", e);
            Err(e)
        }
    }
}

/// Generate and write the Markdown to `output_path` atomically.
pub async fn generate_to_file(
    request: &GenerationRequest,
    config: &GenerationConfig,
    store: &dyn ObjectStore,
    output_path: impl AsRef<Path>,
) -> Result<GenerationOutput, StudyGenError> {
    let output = generate(request, config, store).await?;
    write_atomic(output_path.as_ref(), &output.markdown).await?;
    Ok(output)
}

/// Synchronous wrapper around [`generate`].
///
/// Creates a temporary tokio runtime internally.
pub fn generate_sync(
    request: &GenerationRequest,
    config: &GenerationConfig,
    store: &dyn ObjectStore,
) -> Result<GenerationOutput, StudyGenError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| StudyGenError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(generate(request, config, store))
}

/// Parse and chunk without calling the model.
///
/// Does not require an LLM provider or API key.
pub fn preview_chunks(text: &str, config: &GenerationConfig) -> Result<ChunkPreview, StudyGenError> {
    if text.trim().is_empty() {
        return Err(StudyGenError::InvalidInput("lecture text is empty".into()));
    }
    let slides = parse_slides(text);
    let chunks = chunk_slides(&slides, chunk_limits(config));
    Ok(ChunkPreview {
        total_slides: slides.len(),
        empty_slides: slides.iter().filter(|s| s.is_empty()).count(),
        prompt_version: prompt_version(&config.pipeline_version),
        chunks: chunks
            .iter()
            .map(|c| ChunkSummary {
                range: c.range(),
                slides: c.slides.len(),
                chars: c.text.chars().count(),
                estimated_tokens: c.estimated_tokens(),
            })
            .collect(),
    })
}

/// Write `contents` to a temp file next to `path`, then rename into place.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), StudyGenError> {
    let fail = |source: std::io::Error| StudyGenError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, contents).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;
    Ok(())
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn chunk_limits(config: &GenerationConfig) -> ChunkLimits {
    ChunkLimits {
        max_slides: config.max_slides_per_chunk,
        max_chars: config.max_chars_per_chunk,
        adaptive_token_threshold: config.adaptive_token_threshold,
    }
}

/// Step B + Step C as stored in the synthesis cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSynthesis {
    plan: StepBPlan,
    step_b: StepBOutput,
    step_c: StepCOutput,
}

/// Hash of everything Step B and Step C depend on.
fn synthesis_hash(
    step_a: &StepAOutput,
    config: &GenerationConfig,
    mode: GenerationMode,
    minimums: &SynthesisMinimums,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(step_a).unwrap_or_default());
    hasher.update(serde_json::to_vec(minimums).unwrap_or_default());
    for part in [
        mode.as_str(),
        config.synthesis_model.as_str(),
        config.review_model.as_str(),
        config.pipeline_version.as_str(),
    ] {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

struct Synthesis {
    plan: StepBPlan,
    step_b: StepBOutput,
    step_c: StepCOutput,
    notes: Vec<String>,
    used_fallback: bool,
    cached: bool,
}

async fn synthesize(
    ctx: &RunContext<'_>,
    cache: &ChunkCache<'_>,
    step_a: &StepAOutput,
    coverage: &CoverageReport,
) -> Result<Synthesis, StudyGenError> {
    let minimums = ctx.config.minimums_for(ctx.mode);
    let key = cache.synthesis_key(&synthesis_hash(step_a, ctx.config, ctx.mode, &minimums));

    if let Some(hit) = cache.get_json::<CachedSynthesis>(&key).await {
        info!(request_id = %ctx.request_id, "Synthesis served from cache");
        ctx.diagnostics.event("synthesis", "cache hit");
        return Ok(Synthesis {
            plan: hit.plan,
            step_b: hit.step_b,
            step_c: hit.step_c,
            notes: Vec::new(),
            used_fallback: false,
            cached: true,
        });
    }

    let compiled = compile(ctx, step_a, &minimums).await;
    let mut notes = compiled.notes;
    let gated = enforce_minimums(ctx, step_a, &compiled.plan, compiled.document, &minimums).await;
    let used_fallback = compiled.used_fallback || gated.used_fallback();
    notes.extend(gated.notes.iter().cloned());

    let stats = ReviewStats::build(step_a, &gated.document, &coverage.missing_ranges());
    let (step_c, reviewed) = review(ctx, &stats).await;

    let synthesis = Synthesis {
        plan: compiled.plan,
        step_b: gated.document,
        step_c,
        notes,
        used_fallback,
        cached: false,
    };

    if !synthesis.used_fallback && reviewed {
        cache
            .put_json(
                &key,
                &CachedSynthesis {
                    plan: synthesis.plan.clone(),
                    step_b: synthesis.step_b.clone(),
                    step_c: synthesis.step_c.clone(),
                },
            )
            .await?;
    } else {
        debug!("Synthesis not cached (fallback or default review)");
    }
    Ok(synthesis)
}

async fn run(
    ctx: &RunContext<'_>,
    request: &GenerationRequest,
    store: &dyn ObjectStore,
) -> Result<GenerationOutput, StudyGenError> {
    let total_start = Instant::now();
    let config = ctx.config;
    let mode = request.mode;
    let title = request.lecture_title.trim();

    // ── Step 1: Parse and chunk ──────────────────────────────────────────
    let slides = parse_slides(&request.normalized_text);
    let chunks = chunk_slides(&slides, chunk_limits(config));
    let total_chunks = chunks.len();
    info!(
        request_id = %ctx.request_id,
        "Parsed {} slides into {} chunks",
        slides.len(),
        total_chunks
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_generation_start(total_chunks, slides.len());
    }

    // ── Step 2: Extract (Step A) ─────────────────────────────────────────
    let extraction_start = Instant::now();
    let prefix = cache_prefix(request.doc_id.trim(), mode, &prompt_version(&config.pipeline_version));
    let cache = ChunkCache::load(store, prefix).await;
    let outcome = extract_all(ctx, &cache, chunks, title).await?;

    // ── Step 3: Merge and derive ─────────────────────────────────────────
    ctx.stage("merge");
    let (merged, mut warnings) = merge_chunk_outputs(&outcome.outputs, title);
    let has_slides = !merged.slides.is_empty();
    let (derived, source) = derive(ctx, &cache, &merged).await?;
    if source == DeriveSource::Default && has_slides {
        warnings.push("Derive call failed; topic buckets and exam atoms are empty".to_string());
    }
    let step_a = StepAOutput::assemble(merged, derived);
    let extraction_duration_ms = extraction_start.elapsed().as_millis() as u64;

    let numbers: Vec<u32> = slides.iter().map(|s| s.number).collect();
    let coverage = CoverageReport::new(
        &numbers,
        outcome.ok_ranges(),
        outcome.failed.clone(),
        outcome.unprocessed.clone(),
    );
    if let Err(e) = coverage.verify_tiling() {
        warn!(request_id = %ctx.request_id, "Coverage does not tile the lecture: {}", e);
    }
    warnings.extend(qa_lines(&coverage));

    // ── Step 4: Synthesis and review (Step B, Step C) ────────────────────
    let synthesis_start = Instant::now();
    let synthesis = synthesize(ctx, &cache, &step_a, &coverage).await?;
    warnings.extend(synthesis.notes.iter().cloned());
    let synthesis_duration_ms = synthesis_start.elapsed().as_millis() as u64;

    // ── Step 5: Render and store ─────────────────────────────────────────
    ctx.stage("render");
    let markdown = clean_document(&render_document(&RenderInput {
        mode,
        step_a: &step_a,
        step_b: &synthesis.step_b,
        step_c: &synthesis.step_c,
        coverage: &coverage,
        notes: &synthesis.notes,
    }));

    let stored_key = document_key(&request.doc_id, mode);
    store
        .put(&stored_key, markdown.as_bytes().to_vec())
        .await
        .map_err(|source| StudyGenError::StorageWrite {
            key: stored_key.clone(),
            source,
        })?;

    let stats = GenerationStats {
        total_slides: coverage.total_slides,
        processed_slides: coverage.processed_slides,
        total_chunks,
        cache_hits: outcome.cache_hits,
        splits: outcome.splits,
        failed_ranges: coverage.failed.len(),
        unprocessed_ranges: coverage.unprocessed.len(),
        llm_calls: ctx.usage.calls(),
        step_a_calls: ctx.usage.step_a(),
        total_input_tokens: ctx.usage.input_tokens.load(Ordering::Relaxed) as u64,
        total_output_tokens: ctx.usage.output_tokens.load(Ordering::Relaxed) as u64,
        synthesis_fallback: synthesis.used_fallback,
        synthesis_cached: synthesis.cached,
        extraction_duration_ms,
        synthesis_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        request_id = %ctx.request_id,
        "Generation complete: {}/{} slides, {} LLM calls, {}ms",
        stats.processed_slides,
        stats.total_slides,
        stats.llm_calls,
        stats.total_duration_ms
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_generation_complete(coverage.processed_slides, coverage.total_slides);
    }

    Ok(GenerationOutput {
        markdown,
        stored_key,
        partial: !coverage.is_complete(),
        coverage: Coverage {
            processed: coverage.processed_slides,
            total: coverage.total_slides,
        },
        coverage_report: coverage,
        warnings,
        step_a,
        plan: synthesis.plan,
        step_b: synthesis.step_b,
        step_c: synthesis.step_c,
        stats,
        request_id: ctx.request_id.clone(),
        diagnostics_key: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use crate::pipeline::llm::testing::ScriptedClient;

    fn lecture(n: u32) -> String {
        (1..=n)
            .map(|i| format!("--- Slide {i} ---\nTopic {i}\n- point {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn request_validation() {
        let ok = GenerationRequest::new("--- Slide 1 ---\nx", "T", "doc-1", GenerationMode::StudyGuide);
        assert!(ok.validate().is_ok());
        let empty = GenerationRequest::new("  \n ", "T", "doc-1", GenerationMode::StudyGuide);
        assert!(matches!(empty.validate(), Err(StudyGenError::InvalidInput(_))));
        let bad_id = GenerationRequest::new("x", "T", "../etc", GenerationMode::StudyGuide);
        assert!(bad_id.validate().is_err());
    }

    #[test]
    fn document_key_layout() {
        assert_eq!(
            document_key("lec-7", GenerationMode::ExamCram),
            "documents/lec-7/exam_cram/study_guide.md"
        );
    }

    #[test]
    fn preview_makes_no_calls_and_reports_chunks() {
        let preview = preview_chunks(&lecture(40), &GenerationConfig::default()).unwrap();
        assert_eq!(preview.total_slides, 40);
        assert_eq!(preview.chunks.len(), 7);
        assert_eq!(preview.chunks[0].range.to_string(), "1\u{2013}6");
        assert_eq!(preview.prompt_version.len(), 16);
        assert!(preview_chunks("", &GenerationConfig::default()).is_err());
    }

    #[test]
    fn synthesis_hash_depends_on_mode() {
        let a = StepAOutput::default();
        let c = GenerationConfig::default();
        let m = SynthesisMinimums::default();
        assert_ne!(
            synthesis_hash(&a, &c, GenerationMode::StudyGuide, &m),
            synthesis_hash(&a, &c, GenerationMode::ExamCram, &m)
        );
    }

    #[tokio::test]
    async fn disallowed_model_fails_before_any_call() {
        let client = ScriptedClient::new(|_| panic!("no calls expected"));
        let mut config = GenerationConfig::default();
        config.synthesis_model = "gpt-4o".into();
        let store = MemoryObjectStore::new();
        let request = GenerationRequest::new(lecture(3), "T", "d", GenerationMode::StudyGuide);
        let err = generate_with_client(&request, &config, &store, &client).await.unwrap_err();
        assert!(matches!(err, StudyGenError::DisallowedModel { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn write_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/guide.md");
        write_atomic(&path, "# Guide\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# Guide\n");
        assert!(!dir.path().join("out/guide.md.tmp").exists());
    }
}
