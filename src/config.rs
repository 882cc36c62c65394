//! Configuration types for study-guide generation.
//!
//! All pipeline behaviour is controlled through [`GenerationConfig`], built
//! via its [`GenerationConfigBuilder`]. Every knob lives in one struct so a
//! run can be reproduced from its config alone, and so the CLI and library
//! callers share exactly one set of defaults.

use crate::error::StudyGenError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The only model identifiers the pipeline will call.
pub const ALLOWED_MODELS: [&str; 2] = ["gpt-4.1-mini", "gpt-4.1"];

/// Pipeline version string mixed into the prompt version hash.
///
/// Bump this whenever chunk-output semantics change without the extraction
/// prompt text changing; every cached chunk is then ignored on the next run.
pub const PIPELINE_VERSION: &str = "studygen-pipeline/3";

/// Upper bound for [`GenerationConfig::time_budget_secs`] set via the builder (one day).
pub const MAX_TIME_BUDGET_SECS: u64 = 24 * 60 * 60;

/// Upper bound for [`GenerationConfig::max_retries`] set via the builder.
pub const MAX_TRANSPORT_RETRIES: u32 = 10;

/// Ceiling for a single transport backoff delay, in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Check a model id against [`ALLOWED_MODELS`].
pub fn ensure_allowed_model(model: &str) -> Result<(), StudyGenError> {
    if ALLOWED_MODELS.contains(&model) {
        Ok(())
    } else {
        Err(StudyGenError::DisallowedModel {
            model: model.to_string(),
            allowed: ALLOWED_MODELS.iter().map(|m| m.to_string()).collect(),
        })
    }
}

/// Configuration for one generation run.
///
/// Built via [`GenerationConfig::builder()`] or using
/// [`GenerationConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_studygen::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .max_slides_per_chunk(8)
///     .time_budget_secs(300)
///     .synthesis_model("gpt-4.1")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct GenerationConfig {
    /// Model used for per-chunk extraction and the derive call. Default: `gpt-4.1-mini`.
    pub extraction_model: String,

    /// Model used for every Step B call (plan, outline, pack, rewrites). Default: `gpt-4.1`.
    pub synthesis_model: String,

    /// Model used for the Step C review. Default: `gpt-4.1-mini`.
    pub review_model: String,

    /// LLM provider name (e.g. "openai", "azure").
    /// If None along with `provider`, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`
    /// and is used for every model.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Extraction must be faithful to the slides; low temperature keeps the
    /// JSON shape stable across retries.
    pub temperature: f32,

    /// Output-token ceiling for chunk extraction and derive calls. Default: 8192.
    pub extraction_max_tokens: usize,

    /// Output-token ceiling for Step B calls. Default: 8192.
    pub synthesis_max_tokens: usize,

    /// Output-token ceiling for the Step C review. Default: 2048.
    pub review_max_tokens: usize,

    /// Maximum slides per chunk before the adaptive pass. Default: 6.
    pub max_slides_per_chunk: usize,

    /// Maximum characters of slide text per chunk. Default: 12 000.
    pub max_chars_per_chunk: usize,

    /// Estimated-token density above which chunking is redone with half the
    /// slide limit. Default: 2 800.
    ///
    /// Dense chunks (tables, long bullet lists) produce proportionally longer
    /// JSON; above this estimate the extraction output tends to hit the
    /// output-token ceiling and come back truncated.
    pub adaptive_token_threshold: usize,

    /// Maximum recursive split depth for a failing chunk. Default: 3.
    pub max_split_depth: u32,

    /// Wall-clock budget for the whole run, in seconds. Default: 900.
    ///
    /// Checked before each top-level chunk and between Step B sub-calls.
    /// Work already written to the cache stays valid for the next run.
    pub time_budget_secs: u64,

    /// Top-level chunks extracted concurrently. Default: 1 (sequential).
    pub concurrency: usize,

    /// Transport-level retries per LLM call. Default: 3.
    pub max_retries: u32,

    /// Initial transport retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Character cap on the merged-extraction view sent to the derive call. Default: 60 000.
    pub derive_input_max_chars: usize,

    /// Pipeline version mixed into the prompt version. Default: [`PIPELINE_VERSION`].
    pub pipeline_version: String,

    /// Absolute minimum item counts enforced by the synthesis gate.
    /// Default: `None` (use the mode's defaults).
    pub minimums: Option<SynthesisMinimums>,

    /// Receives per-chunk and per-stage events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            extraction_model: "gpt-4.1-mini".to_string(),
            synthesis_model: "gpt-4.1".to_string(),
            review_model: "gpt-4.1-mini".to_string(),
            provider_name: None,
            provider: None,
            temperature: 0.1,
            extraction_max_tokens: 8192,
            synthesis_max_tokens: 8192,
            review_max_tokens: 2048,
            max_slides_per_chunk: 6,
            max_chars_per_chunk: 12_000,
            adaptive_token_threshold: 2_800,
            max_split_depth: 3,
            time_budget_secs: 900,
            concurrency: 1,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            derive_input_max_chars: 60_000,
            pipeline_version: PIPELINE_VERSION.to_string(),
            minimums: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("extraction_model", &self.extraction_model)
            .field("synthesis_model", &self.synthesis_model)
            .field("review_model", &self.review_model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_slides_per_chunk", &self.max_slides_per_chunk)
            .field("max_chars_per_chunk", &self.max_chars_per_chunk)
            .field("adaptive_token_threshold", &self.adaptive_token_threshold)
            .field("max_split_depth", &self.max_split_depth)
            .field("time_budget_secs", &self.time_budget_secs)
            .field("concurrency", &self.concurrency)
            .field("pipeline_version", &self.pipeline_version)
            .field("minimums", &self.minimums)
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Reject any configured model outside [`ALLOWED_MODELS`].
    pub fn validate_models(&self) -> Result<(), StudyGenError> {
        ensure_allowed_model(&self.extraction_model)?;
        ensure_allowed_model(&self.synthesis_model)?;
        ensure_allowed_model(&self.review_model)
    }

    /// Distinct model ids this config will call, in a stable order.
    pub fn models(&self) -> Vec<String> {
        let mut models = vec![
            self.extraction_model.clone(),
            self.synthesis_model.clone(),
            self.review_model.clone(),
        ];
        models.sort();
        models.dedup();
        models
    }

    /// Minimums for `mode`, honouring an explicit override.
    pub fn minimums_for(&self, mode: GenerationMode) -> SynthesisMinimums {
        self.minimums.clone().unwrap_or_else(|| SynthesisMinimums::for_mode(mode))
    }
}

/// Builder for [`GenerationConfig`].
#[derive(Debug)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl GenerationConfigBuilder {
    pub fn extraction_model(mut self, model: impl Into<String>) -> Self {
        self.config.extraction_model = model.into();
        self
    }

    pub fn synthesis_model(mut self, model: impl Into<String>) -> Self {
        self.config.synthesis_model = model.into();
        self
    }

    pub fn review_model(mut self, model: impl Into<String>) -> Self {
        self.config.review_model = model.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn extraction_max_tokens(mut self, n: usize) -> Self {
        self.config.extraction_max_tokens = n;
        self
    }

    pub fn synthesis_max_tokens(mut self, n: usize) -> Self {
        self.config.synthesis_max_tokens = n;
        self
    }

    pub fn review_max_tokens(mut self, n: usize) -> Self {
        self.config.review_max_tokens = n;
        self
    }

    pub fn max_slides_per_chunk(mut self, n: usize) -> Self {
        self.config.max_slides_per_chunk = n.max(1);
        self
    }

    pub fn max_chars_per_chunk(mut self, n: usize) -> Self {
        self.config.max_chars_per_chunk = n.max(500);
        self
    }

    pub fn adaptive_token_threshold(mut self, n: usize) -> Self {
        self.config.adaptive_token_threshold = n;
        self
    }

    pub fn max_split_depth(mut self, depth: u32) -> Self {
        self.config.max_split_depth = depth.min(8);
        self
    }

    pub fn time_budget_secs(mut self, secs: u64) -> Self {
        self.config.time_budget_secs = secs.min(MAX_TIME_BUDGET_SECS);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(MAX_TRANSPORT_RETRIES);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms.min(MAX_BACKOFF_MS);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn derive_input_max_chars(mut self, n: usize) -> Self {
        self.config.derive_input_max_chars = n;
        self
    }

    pub fn pipeline_version(mut self, v: impl Into<String>) -> Self {
        self.config.pipeline_version = v.into();
        self
    }

    pub fn minimums(mut self, m: SynthesisMinimums) -> Self {
        self.config.minimums = Some(m);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, StudyGenError> {
        let c = &self.config;
        c.validate_models()?;
        if c.time_budget_secs == 0 {
            return Err(StudyGenError::InvalidConfig(
                "Time budget must be ≥ 1 second".into(),
            ));
        }
        if c.extraction_max_tokens < 256 || c.synthesis_max_tokens < 256 {
            return Err(StudyGenError::InvalidConfig(format!(
                "Output token budgets must be ≥ 256, got extraction={} synthesis={}",
                c.extraction_max_tokens, c.synthesis_max_tokens
            )));
        }
        if c.pipeline_version.trim().is_empty() {
            return Err(StudyGenError::InvalidConfig(
                "Pipeline version must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// What kind of document to produce.
///
/// The mode is part of every cache key, so switching modes never reuses the
/// other mode's chunk extractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Full study guide: balanced coverage of every slide. (default)
    #[default]
    StudyGuide,
    /// Exam cram sheet: denser summary, more discriminators and pitfalls.
    ExamCram,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::StudyGuide => "study_guide",
            GenerationMode::ExamCram => "exam_cram",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationMode {
    type Err = StudyGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "study_guide" | "guide" => Ok(GenerationMode::StudyGuide),
            "exam_cram" | "cram" | "exam" => Ok(GenerationMode::ExamCram),
            other => Err(StudyGenError::InvalidInput(format!(
                "unknown mode '{other}' (expected study_guide or exam_cram)"
            ))),
        }
    }
}

/// Absolute minimum item counts a synthesis document must meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisMinimums {
    pub high_yield_summary: usize,
    pub one_page_review: usize,
    pub rapid_approach: usize,
    pub pitfalls: usize,
    pub glossary: usize,
}

impl SynthesisMinimums {
    pub fn for_mode(mode: GenerationMode) -> Self {
        match mode {
            GenerationMode::StudyGuide => Self {
                high_yield_summary: 8,
                one_page_review: 5,
                rapid_approach: 3,
                pitfalls: 3,
                glossary: 0,
            },
            GenerationMode::ExamCram => Self {
                high_yield_summary: 10,
                one_page_review: 6,
                rapid_approach: 4,
                pitfalls: 4,
                glossary: 0,
            },
        }
    }
}

impl Default for SynthesisMinimums {
    fn default() -> Self {
        Self::for_mode(GenerationMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let c = GenerationConfig::builder().build().expect("defaults are valid");
        assert_eq!(c.max_slides_per_chunk, 6);
        assert_eq!(c.max_chars_per_chunk, 12_000);
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn disallowed_model_rejected_at_build() {
        let err = GenerationConfig::builder()
            .synthesis_model("gpt-4o")
            .build()
            .unwrap_err();
        assert!(matches!(err, StudyGenError::DisallowedModel { ref model, .. } if model == "gpt-4o"));
    }

    #[test]
    fn builder_clamps() {
        let c = GenerationConfig::builder()
            .max_slides_per_chunk(0)
            .concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.max_slides_per_chunk, 1);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn huge_time_budget_is_clamped() {
        let c = GenerationConfig::builder().time_budget_secs(u64::MAX).build().unwrap();
        assert_eq!(c.time_budget_secs, MAX_TIME_BUDGET_SECS);
    }

    #[test]
    fn huge_retry_settings_are_clamped() {
        let c = GenerationConfig::builder()
            .max_retries(u32::MAX)
            .retry_backoff_ms(u64::MAX)
            .build()
            .unwrap();
        assert_eq!(c.max_retries, MAX_TRANSPORT_RETRIES);
        assert_eq!(c.retry_backoff_ms, MAX_BACKOFF_MS);
    }

    #[test]
    fn zero_time_budget_is_invalid() {
        assert!(GenerationConfig::builder().time_budget_secs(0).build().is_err());
    }

    #[test]
    fn models_are_deduplicated() {
        let c = GenerationConfig::default();
        assert_eq!(c.models(), vec!["gpt-4.1".to_string(), "gpt-4.1-mini".to_string()]);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("exam-cram".parse::<GenerationMode>().unwrap(), GenerationMode::ExamCram);
        assert_eq!("Study_Guide".parse::<GenerationMode>().unwrap(), GenerationMode::StudyGuide);
        assert!("poster".parse::<GenerationMode>().is_err());
    }

    #[test]
    fn explicit_minimums_override_mode_defaults() {
        let m = SynthesisMinimums {
            high_yield_summary: 1,
            one_page_review: 1,
            rapid_approach: 0,
            pitfalls: 0,
            glossary: 0,
        };
        let c = GenerationConfig::builder().minimums(m.clone()).build().unwrap();
        assert_eq!(c.minimums_for(GenerationMode::ExamCram), m);
        assert_eq!(
            GenerationConfig::default().minimums_for(GenerationMode::ExamCram).high_yield_summary,
            10
        );
    }
}
