//! Error types for the edgequake-studygen library.
//!
//! Three layers of failure, from most to least severe:
//!
//! * [`StudyGenError`]: **Fatal.** The run cannot proceed at all (disallowed
//!   model id, provider not configured, cache write failure). Returned as
//!   `Err(StudyGenError)` from the top-level `generate*` functions.
//!
//! * [`FailureKind`] / [`StageFailure`]: **Non-fatal.** One LLM attempt
//!   produced output that could not be used. The extractor retries, splits,
//!   and finally records the kind in the chunk manifest; Step B and Step C fall
//!   back to deterministic documents. These never abort a run.
//!
//! * [`LlmCallError`] / [`StoreError`]: transport-level failures of the two
//!   external collaborators. A failed LLM call is classified as
//!   [`FailureKind::Extract`]; a failed store write is escalated to
//!   [`StudyGenError::StorageWrite`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-studygen library.
#[derive(Debug, Error)]
pub enum StudyGenError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configured model id is not on the allow-list.
    #[error("Model '{model}' is not allowed.\nAllowed models: {}", .allowed.join(", "))]
    DisallowedModel { model: String, allowed: Vec<String> },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// The request itself is unusable (empty text, blank document id).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ── Storage errors ────────────────────────────────────────────────────
    /// A chunk payload, manifest, or final document could not be persisted.
    #[error("Failed to write '{key}' to the object store: {source}")]
    StorageWrite {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a single LLM attempt could not be used.
///
/// The serialized names are the ones written into the chunk manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Empty or otherwise unusable model output (including transport failure).
    Extract,
    /// JSON was present but could not be parsed, even after syntactic repair.
    Parse,
    /// JSON started but never finished: unbalanced braces or an open string.
    Truncated,
    /// JSON parsed but does not have the expected shape.
    Schema,
}

impl FailureKind {
    /// Manifest code, e.g. `TRUNCATED`.
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::Extract => "EXTRACT",
            FailureKind::Parse => "PARSE",
            FailureKind::Truncated => "TRUNCATED",
            FailureKind::Schema => "SCHEMA",
        }
    }

    /// Reader-facing description used by the coverage appendix.
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::Extract => "Model returned no usable output",
            FailureKind::Parse => "JSON could not be parsed",
            FailureKind::Truncated => "JSON appears truncated",
            FailureKind::Schema => "JSON did not match the expected structure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified, non-fatal failure of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Transport-level failure of an LLM call (after the client's own retries).
#[derive(Debug, Clone, Error)]
pub enum LlmCallError {
    /// The provider returned an error on every attempt.
    #[error("LLM call failed after {retries} retries: {detail}")]
    Failed { retries: u32, detail: String },

    /// The call did not finish within the per-call timeout.
    #[error("LLM call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The request named a model outside the allow-list.
    #[error("model '{0}' is not allowed")]
    DisallowedModel(String),
}

impl From<LlmCallError> for StageFailure {
    fn from(e: LlmCallError) -> Self {
        StageFailure::new(FailureKind::Extract, e.to_string())
    }
}

/// Failure of the durable object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key '{0}'")]
    InvalidKey(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallowed_model_display_lists_allowed() {
        let e = StudyGenError::DisallowedModel {
            model: "gpt-3.5".into(),
            allowed: vec!["gpt-4.1-mini".into(), "gpt-4.1".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("gpt-3.5"), "got: {msg}");
        assert!(msg.contains("gpt-4.1-mini, gpt-4.1"), "got: {msg}");
    }

    #[test]
    fn failure_kind_serializes_as_manifest_code() {
        let json = serde_json::to_string(&FailureKind::Truncated).unwrap();
        assert_eq!(json, "\"TRUNCATED\"");
        let back: FailureKind = serde_json::from_str("\"SCHEMA\"").unwrap();
        assert_eq!(back, FailureKind::Schema);
    }

    #[test]
    fn truncated_description_matches_appendix_wording() {
        assert_eq!(FailureKind::Truncated.describe(), "JSON appears truncated");
    }

    #[test]
    fn llm_call_error_maps_to_extract() {
        let f: StageFailure = LlmCallError::Timeout { secs: 30 }.into();
        assert_eq!(f.kind, FailureKind::Extract);
        assert!(f.detail.contains("30s"));
    }

    #[test]
    fn storage_write_display() {
        let e = StudyGenError::StorageWrite {
            key: "cache/doc/manifest.json".into(),
            source: StoreError::Backend("disk full".into()),
        };
        let msg = e.to_string();
        assert!(msg.contains("manifest.json"));
        assert!(msg.contains("disk full"));
    }
}
