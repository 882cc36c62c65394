//! Progress-callback trait for per-chunk and per-stage generation events.
//!
//! Inject an [`Arc<dyn GenerationProgressCallback>`] via
//! [`crate::config::GenerationConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through the lecture.
//!
//! The callback is the least-invasive integration point: callers can forward
//! events to a progress bar, a job-status row, or a channel without the
//! library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_studygen::{ChunkRange, GenerationConfig, GenerationProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     cached: AtomicUsize,
//! }
//!
//! impl GenerationProgressCallback for CountingCallback {
//!     fn on_chunk_complete(&self, range: ChunkRange, from_cache: bool) {
//!         if from_cache {
//!             self.cached.fetch_add(1, Ordering::SeqCst);
//!         }
//!         eprintln!("slides {range} done");
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { cached: AtomicUsize::new(0) });
//! let config = GenerationConfig::builder()
//!     .progress_callback(cb as Arc<dyn GenerationProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::types::ChunkRange;
use std::sync::Arc;

/// Called by the pipeline as it processes a lecture.
///
/// Implementations must be `Send + Sync`: with `concurrency > 1` chunk
/// events arrive from concurrently running extraction futures. All methods
/// default to no-ops so callers only override what they care about.
pub trait GenerationProgressCallback: Send + Sync {
    /// Called once, after chunking, before any LLM call.
    fn on_generation_start(&self, total_chunks: usize, total_slides: usize) {
        let _ = (total_chunks, total_slides);
    }

    /// Called before a top-level chunk is looked up or extracted.
    fn on_chunk_start(&self, range: ChunkRange, index: usize, total_chunks: usize) {
        let _ = (range, index, total_chunks);
    }

    /// Called when a range (top-level or split child) yields usable output.
    fn on_chunk_complete(&self, range: ChunkRange, from_cache: bool) {
        let _ = (range, from_cache);
    }

    /// Called when a range is split after repeated failure.
    fn on_chunk_split(&self, range: ChunkRange, left: ChunkRange, right: ChunkRange) {
        let _ = (range, left, right);
    }

    /// Called when a range fails terminally or is skipped by the time budget.
    fn on_chunk_error(&self, range: ChunkRange, error: &str) {
        let _ = (range, error);
    }

    /// Called when a pipeline stage begins ("derive", "plan", "review", …).
    fn on_stage(&self, stage: &str) {
        let _ = stage;
    }

    /// Called once with the final slide coverage.
    fn on_generation_complete(&self, processed_slides: usize, total_slides: usize) {
        let _ = (processed_slides, total_slides);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl GenerationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::GenerationConfig`].
pub type ProgressCallback = Arc<dyn GenerationProgressCallback>;
