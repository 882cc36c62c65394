//! Per-run trace of every stage attempt.
//!
//! The recorder is append-only and never feeds back into control flow. It is
//! owned by the run context and shared by reference, so concurrently
//! running chunk extractions append to the same trace. At the end of a run
//! the trace is snapshotted and written to `diagnostics/<requestId>.json`.

use crate::error::FailureKind;
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// One LLM attempt (or one notable non-LLM event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    /// Stage name: `extract`, `derive`, `plan`, `outline`, `pack`, …
    pub stage: String,
    /// Human label, e.g. `extract 13–18`.
    pub label: String,
    pub model: String,
    pub strict: bool,
    pub input_chars: usize,
    pub output_chars: usize,
    /// `ok`, `repaired`, `failed`, or `event`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_failures: Vec<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Serializable snapshot of a run's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsRecord {
    pub request_id: String,
    pub doc_id: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: Vec<StageAttempt>,
}

/// Append-only recorder shared by every stage of one run.
#[derive(Debug)]
pub struct Diagnostics {
    request_id: String,
    doc_id: String,
    mode: String,
    started_at: DateTime<Utc>,
    attempts: Mutex<Vec<StageAttempt>>,
}

impl Diagnostics {
    pub fn new(request_id: impl Into<String>, doc_id: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            doc_id: doc_id.into(),
            mode: mode.into(),
            started_at: Utc::now(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn record(&self, attempt: StageAttempt) {
        debug!(
            request_id = %self.request_id,
            stage = %attempt.stage,
            outcome = %attempt.outcome,
            "{}",
            attempt.label
        );
        match self.attempts.lock() {
            Ok(mut attempts) => attempts.push(attempt),
            Err(poisoned) => poisoned.into_inner().push(attempt),
        }
    }

    /// Record a non-LLM event such as a cache hit or a fallback.
    pub fn event(&self, stage: &str, label: impl Into<String>) {
        self.record(StageAttempt {
            stage: stage.to_string(),
            label: label.into(),
            model: String::new(),
            strict: false,
            input_chars: 0,
            output_chars: 0,
            outcome: "event".to_string(),
            failure_kind: None,
            repairs: Vec::new(),
            validation_failures: Vec::new(),
            duration_ms: 0,
            at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        match self.attempts.lock() {
            Ok(a) => a.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> DiagnosticsRecord {
        let attempts = match self.attempts.lock() {
            Ok(a) => a.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        DiagnosticsRecord {
            request_id: self.request_id.clone(),
            doc_id: self.doc_id.clone(),
            mode: self.mode.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            attempts,
        }
    }

    pub fn store_key(&self) -> String {
        format!("diagnostics/{}.json", self.request_id)
    }

    /// Write the snapshot to the store. Failures are logged, never returned.
    pub async fn persist(&self, store: &dyn ObjectStore) -> Option<String> {
        let key = self.store_key();
        let bytes = match serde_json::to_vec_pretty(&self.snapshot()) {
            Ok(b) => b,
            Err(e) => {
                warn!(request_id = %self.request_id, "Could not serialise diagnostics: {}", e);
                return None;
            }
        };
        match store.put(&key, bytes).await {
            Ok(()) => Some(key),
            Err(e) => {
                warn!(request_id = %self.request_id, "Could not write diagnostics to {}: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".into()))
        }
    }

    #[tokio::test]
    async fn persists_snapshot_under_request_id() {
        let d = Diagnostics::new("req-1", "doc-1", "study_guide");
        d.event("extract", "cache hit 1\u{2013}6");
        let store = MemoryObjectStore::new();
        let key = d.persist(&store).await.unwrap();
        assert_eq!(key, "diagnostics/req-1.json");

        let bytes = store.get(&key).await.unwrap().unwrap();
        let record: DiagnosticsRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.attempts[0].outcome, "event");
    }

    #[tokio::test]
    async fn persist_failure_is_swallowed() {
        let d = Diagnostics::new("req-2", "doc", "exam_cram");
        assert!(d.persist(&FailingStore).await.is_none());
    }

    #[test]
    fn records_are_append_only_in_order() {
        let d = Diagnostics::new("r", "d", "m");
        d.event("plan", "first");
        d.event("pack", "second");
        let snap = d.snapshot();
        let labels: Vec<&str> = snap.attempts.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, ["first", "second"]);
        assert_eq!(d.len(), 2);
    }
}
