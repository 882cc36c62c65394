//! Output types returned by the generation entry points.

use crate::pipeline::render::CoverageReport;
use crate::types::{ChunkRange, StepAOutput, StepBOutput, StepBPlan, StepCOutput};
use serde::{Deserialize, Serialize};

/// Slide coverage of the final document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub processed: usize,
    pub total: usize,
}

/// Result of one generation run.
///
/// A run that reaches this struct always has a document, even when some
/// slides failed (`partial == true`) or Step B fell back to the
/// deterministic document (listed in `warnings`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// The final, cleaned Markdown document.
    pub markdown: String,
    /// Store key the document was written to.
    pub stored_key: String,
    /// Some slide range failed or was not processed.
    pub partial: bool,
    pub coverage: Coverage,
    pub coverage_report: CoverageReport,
    /// Every degradation of the run, in the order it happened.
    pub warnings: Vec<String>,
    pub step_a: StepAOutput,
    pub plan: StepBPlan,
    pub step_b: StepBOutput,
    pub step_c: StepCOutput,
    pub stats: GenerationStats,
    pub request_id: String,
    /// Store key of the diagnostics trace, when it could be persisted.
    pub diagnostics_key: Option<String>,
}

impl GenerationOutput {
    pub fn document_bytes(&self) -> &[u8] {
        self.markdown.as_bytes()
    }
}

/// Aggregate statistics for a generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub total_slides: usize,
    pub processed_slides: usize,
    /// Top-level chunks produced by the chunker.
    pub total_chunks: usize,
    pub cache_hits: usize,
    pub splits: usize,
    pub failed_ranges: usize,
    pub unprocessed_ranges: usize,
    /// Every model call, including strict retries.
    pub llm_calls: usize,
    /// Chunk extraction and derive calls.
    pub step_a_calls: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Step B ended on the deterministic fallback document.
    pub synthesis_fallback: bool,
    /// Step B and Step C were served from the synthesis cache.
    pub synthesis_cached: bool,
    pub extraction_duration_ms: u64,
    pub synthesis_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// One chunk as the chunker would submit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub range: ChunkRange,
    pub slides: usize,
    pub chars: usize,
    pub estimated_tokens: usize,
}

/// Parse + chunk result, produced without any model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPreview {
    pub total_slides: usize,
    pub empty_slides: usize,
    pub prompt_version: String,
    pub chunks: Vec<ChunkSummary>,
}
