//! Chunk cache and manifest: the resumable ledger of Step A work.
//!
//! Everything lives under one prefix per `(docId, mode, promptVersion)`:
//!
//! ```text
//! cache/<docId>/<mode>/stepA/<promptVersion>/
//!     manifest.json              one entry per chunk range ever attempted
//!     chunk_<start>_<end>.json   validated StepAChunkOutput payload
//!     derived_<hash16>.json      derive-call result for one merged extraction
//!     synthesis_<hash16>.json    Step B + Step C for one Step A document
//! ```
//!
//! A changed prompt version is a different prefix, so stale entries simply
//! never match. The manifest is rewritten wholesale on every update under a
//! mutex, which serializes read-modify-write across concurrent chunks. A
//! payload is always written before the entry that points at it.

use crate::config::GenerationMode;
use crate::error::{FailureKind, StageFailure, StoreError, StudyGenError};
use crate::pipeline::schema::validate_cached_chunk;
use crate::store::ObjectStore;
use crate::types::{ChunkRange, StepAChunkOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Ok,
    Failed,
    /// Split; the children's entries supersede this one.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub start: u32,
    pub end: u32,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_key: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.start, self.end)
    }
}

/// The ledger. Entries are kept sorted by `(start, end)`; one per range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn get(&self, range: ChunkRange) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.range() == range)
    }

    /// Insert or replace the entry for `entry`'s range.
    pub fn upsert(&mut self, entry: ManifestEntry) {
        match self.entries.iter_mut().find(|e| e.range() == entry.range()) {
            Some(existing) => *existing = entry,
            None => {
                self.entries.push(entry);
                self.entries.sort_by_key(|e| (e.start, e.end));
            }
        }
    }

    /// `ok` entries strictly inside `range` that tile it exactly, in order.
    ///
    /// Returns `None` on gaps, and also on overlapping children (stale
    /// entries from an older chunking); the latter is logged.
    pub fn contiguous_children(&self, range: ChunkRange) -> Option<Vec<&ManifestEntry>> {
        let mut children: Vec<&ManifestEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Ok && e.range() != range && range.contains_range(&e.range()))
            .collect();
        if children.is_empty() {
            return None;
        }
        children.sort_by_key(|e| (e.start, e.end));

        if children.windows(2).any(|w| w[0].range().overlaps(&w[1].range())) {
            warn!("Overlapping cached entries inside {}; treating as cache miss", range);
            return None;
        }

        let mut next = range.start;
        for child in &children {
            if child.start != next {
                return None;
            }
            next = child.end + 1;
        }
        (next == range.end + 1).then_some(children)
    }
}

/// Store key prefix for one `(docId, mode, promptVersion)`.
pub fn cache_prefix(doc_id: &str, mode: GenerationMode, prompt_version: &str) -> String {
    format!("cache/{doc_id}/{}/stepA/{prompt_version}/", mode.as_str())
}

/// Cached lookup outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheHit {
    /// The range's own `ok` entry.
    Exact(StepAChunkOutput),
    /// Rebuilt from `n` contiguous child entries.
    Children(StepAChunkOutput, usize),
}

impl CacheHit {
    pub fn into_output(self) -> StepAChunkOutput {
        match self {
            CacheHit::Exact(o) | CacheHit::Children(o, _) => o,
        }
    }
}

/// Manifest + payload access for one run.
pub struct ChunkCache<'s> {
    store: &'s dyn ObjectStore,
    prefix: String,
    manifest: Mutex<Manifest>,
}

impl<'s> ChunkCache<'s> {
    /// Load the manifest. A missing or unreadable manifest starts empty.
    pub async fn load(store: &'s dyn ObjectStore, prefix: String) -> Self {
        let key = format!("{prefix}manifest.json");
        let manifest = match store.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(m) => {
                    debug!("Loaded manifest {} ({} entries)", key, m.entries.len());
                    m
                }
                Err(e) => {
                    warn!("Unreadable manifest {}: {}; starting empty", key, e);
                    Manifest::default()
                }
            },
            Ok(None) => Manifest::default(),
            Err(e) => {
                warn!("Could not read manifest {}: {}; starting empty", key, e);
                Manifest::default()
            }
        };
        Self {
            store,
            prefix,
            manifest: Mutex::new(manifest),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn manifest_key(&self) -> String {
        format!("{}manifest.json", self.prefix)
    }

    pub fn chunk_key(&self, range: ChunkRange) -> String {
        format!("{}chunk_{}_{}.json", self.prefix, range.start, range.end)
    }

    pub fn derived_key(&self, content_hash: &str) -> String {
        format!("{}derived_{}.json", self.prefix, content_hash)
    }

    /// Validated Step B + Step C result for a Step A hash.
    pub fn synthesis_key(&self, input_hash: &str) -> String {
        format!("{}synthesis_{}.json", self.prefix, input_hash)
    }

    pub async fn manifest(&self) -> Manifest {
        self.manifest.lock().await.clone()
    }

    pub async fn is_partial(&self, range: ChunkRange) -> bool {
        self.manifest
            .lock()
            .await
            .get(range)
            .map(|e| e.status == EntryStatus::Partial)
            .unwrap_or(false)
    }

    /// Cache hit for `range`, from its own entry or from contiguous children.
    ///
    /// Read or validation problems degrade to a miss.
    pub async fn lookup(&self, range: ChunkRange) -> Option<CacheHit> {
        let (exact, children) = {
            let manifest = self.manifest.lock().await;
            let exact = manifest
                .get(range)
                .filter(|e| e.status == EntryStatus::Ok)
                .map(|e| e.stored_key.clone().unwrap_or_else(|| self.chunk_key(range)));
            let children: Option<Vec<(ChunkRange, String)>> = if exact.is_none() {
                manifest.contiguous_children(range).map(|c| {
                    c.iter()
                        .map(|e| {
                            (
                                e.range(),
                                e.stored_key.clone().unwrap_or_else(|| self.chunk_key(e.range())),
                            )
                        })
                        .collect()
                })
            } else {
                None
            };
            (exact, children)
        };

        if let Some(key) = exact {
            return self.read_payload(&key, range).await.map(CacheHit::Exact);
        }

        let children = children?;
        let count = children.len();
        let mut lecture_title = String::new();
        let mut slides = Vec::new();
        for (child_range, key) in children {
            let out = self.read_payload(&key, child_range).await?;
            if lecture_title.is_empty() {
                lecture_title = out.lecture_title;
            }
            slides.extend(out.slides);
        }
        debug!("Rebuilt {} from {} cached children", range, count);
        Some(CacheHit::Children(
            StepAChunkOutput {
                lecture_title,
                chunk: range,
                slides,
            },
            count,
        ))
    }

    async fn read_payload(&self, key: &str, range: ChunkRange) -> Option<StepAChunkOutput> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => match validate_cached_chunk(&bytes, range) {
                Ok(out) => Some(out),
                Err(e) => {
                    warn!("Cached payload {} is invalid ({}); treating as miss", key, e);
                    None
                }
            },
            Ok(None) => {
                warn!("Manifest points at missing payload {}; treating as miss", key);
                None
            }
            Err(e) => {
                warn!("Could not read cached payload {}: {}; treating as miss", key, e);
                None
            }
        }
    }

    /// Write the payload, then its `ok` entry.
    pub async fn record_ok(&self, output: &StepAChunkOutput, retries: u32) -> Result<(), StudyGenError> {
        let key = self.chunk_key(output.chunk);
        let bytes = serde_json::to_vec_pretty(output)
            .map_err(|e| StudyGenError::Internal(format!("serialise chunk {}: {e}", output.chunk)))?;
        self.store
            .put(&key, bytes)
            .await
            .map_err(|source| StudyGenError::StorageWrite {
                key: key.clone(),
                source,
            })?;

        self.write_entry(ManifestEntry {
            start: output.chunk.start,
            end: output.chunk.end,
            status: EntryStatus::Ok,
            stored_key: Some(key),
            retries,
            error_kind: None,
            error_detail: None,
            updated_at: Utc::now(),
        })
        .await
    }

    pub async fn record_failed(
        &self,
        range: ChunkRange,
        failure: &StageFailure,
        retries: u32,
    ) -> Result<(), StudyGenError> {
        self.write_entry(ManifestEntry {
            start: range.start,
            end: range.end,
            status: EntryStatus::Failed,
            stored_key: None,
            retries,
            error_kind: Some(failure.kind),
            error_detail: Some(failure.detail.clone()),
            updated_at: Utc::now(),
        })
        .await
    }

    /// Mark `range` as split. `failure` is the reason it was split, if it
    /// was attempted in this run.
    pub async fn mark_partial(
        &self,
        range: ChunkRange,
        failure: Option<&StageFailure>,
        retries: u32,
    ) -> Result<(), StudyGenError> {
        self.write_entry(ManifestEntry {
            start: range.start,
            end: range.end,
            status: EntryStatus::Partial,
            stored_key: None,
            retries,
            error_kind: failure.map(|f| f.kind),
            error_detail: failure.map(|f| f.detail.clone()),
            updated_at: Utc::now(),
        })
        .await
    }

    async fn write_entry(&self, entry: ManifestEntry) -> Result<(), StudyGenError> {
        let key = self.manifest_key();
        let mut manifest = self.manifest.lock().await;
        let mut next = manifest.clone();
        next.upsert(entry);
        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| StudyGenError::Internal(format!("serialise manifest: {e}")))?;
        self.store
            .put(&key, bytes)
            .await
            .map_err(|source| StudyGenError::StorageWrite { key, source })?;
        *manifest = next;
        Ok(())
    }

    /// Read a cached JSON value (derived structures). Problems are a miss.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Cached value {} is invalid ({}); treating as miss", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read {}: {}; treating as miss", key, e);
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StudyGenError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StudyGenError::Internal(format!("serialise {key}: {e}")))?;
        self.store
            .put(key, bytes)
            .await
            .map_err(|source: StoreError| StudyGenError::StorageWrite {
                key: key.to_string(),
                source,
            })
    }
}
