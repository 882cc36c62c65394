//! Step A chunk extraction.
//!
//! Each top-level chunk runs a small state machine over an explicit work
//! stack instead of recursion:
//!
//! ```text
//! pending ──cache hit──────────────────────────────▶ ok
//!    │
//!    └─▶ extracting ──ok (standard or strict)──────▶ ok
//!              │
//!              ├─ fails, splittable ──▶ push [mark-partial, right, left]
//!              └─ fails, not splittable ───────────▶ failed
//! ```
//!
//! The mark-partial item sits below the children on the stack, so both
//! children's entries are written before the parent is marked `partial`.
//! A parent already marked `partial` by an earlier run is split without
//! calling the model again.
//!
//! The wall-clock budget is checked before each top-level chunk; once it is
//! spent, the remaining chunks are reported as unprocessed without any call.

use crate::error::{StageFailure, StudyGenError};
use crate::pipeline::chunker::Chunk;
use crate::pipeline::llm::{request_json, CallPurpose, RunContext};
use crate::pipeline::manifest::{CacheHit, ChunkCache};
use crate::pipeline::schema::decode_chunk_output;
use crate::prompts::build_extraction_prompt;
use crate::types::{ChunkRange, StepAChunkOutput};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A range that failed terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRange {
    pub range: ChunkRange,
    pub failure: StageFailure,
}

/// Everything Step A extraction produced for one run.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    /// Successful outputs (fresh or cached), in no particular order.
    pub outputs: Vec<StepAChunkOutput>,
    pub failed: Vec<FailedRange>,
    /// Top-level chunks skipped because the time budget ran out.
    pub unprocessed: Vec<ChunkRange>,
    pub cache_hits: usize,
    pub splits: usize,
    pub top_level_chunks: usize,
}

impl ExtractionOutcome {
    pub fn ok_ranges(&self) -> Vec<ChunkRange> {
        let mut ranges: Vec<ChunkRange> = self.outputs.iter().map(|o| o.chunk).collect();
        ranges.sort();
        ranges
    }
}

enum WorkItem {
    Extract { chunk: Chunk, depth: u32 },
    MarkPartial { range: ChunkRange, failure: Option<StageFailure>, retries: u32 },
}

/// Result of one top-level chunk.
#[derive(Debug, Default)]
struct ChunkRun {
    outputs: Vec<StepAChunkOutput>,
    failed: Vec<FailedRange>,
    skipped: Option<ChunkRange>,
    cache_hits: usize,
    splits: usize,
}

/// Run extraction over every top-level chunk.
///
/// Store write failures are fatal; every model failure is absorbed into the
/// outcome.
pub async fn extract_all(
    ctx: &RunContext<'_>,
    cache: &ChunkCache<'_>,
    chunks: Vec<Chunk>,
    lecture_title: &str,
) -> Result<ExtractionOutcome, StudyGenError> {
    let total = chunks.len();
    let concurrency = ctx.config.concurrency.max(1);

    let runs: Vec<ChunkRun> = stream::iter(chunks.into_iter().enumerate())
        .map(|(index, chunk)| run_top_level(ctx, cache, chunk, index, total, lecture_title))
        .buffered(concurrency)
        .try_collect()
        .await?;

    let mut outcome = ExtractionOutcome {
        top_level_chunks: total,
        ..Default::default()
    };
    for run in runs {
        outcome.outputs.extend(run.outputs);
        outcome.failed.extend(run.failed);
        outcome.unprocessed.extend(run.skipped);
        outcome.cache_hits += run.cache_hits;
        outcome.splits += run.splits;
    }
    outcome.failed.sort_by_key(|f| f.range);
    outcome.unprocessed.sort();

    info!(
        request_id = %ctx.request_id,
        "Step A extraction: {} chunks, {} cache hits, {} splits, {} failed, {} unprocessed",
        total,
        outcome.cache_hits,
        outcome.splits,
        outcome.failed.len(),
        outcome.unprocessed.len()
    );
    Ok(outcome)
}

async fn run_top_level(
    ctx: &RunContext<'_>,
    cache: &ChunkCache<'_>,
    chunk: Chunk,
    index: usize,
    total: usize,
    lecture_title: &str,
) -> Result<ChunkRun, StudyGenError> {
    let range = chunk.range();
    let callback = ctx.config.progress_callback.as_ref();

    if ctx.time_exhausted() {
        warn!(request_id = %ctx.request_id, range = %range, "Time budget exhausted; chunk not processed");
        ctx.diagnostics.event("extract", format!("unprocessed {range} (time budget)"));
        if let Some(cb) = callback {
            cb.on_chunk_error(range, "time budget exhausted");
        }
        return Ok(ChunkRun {
            skipped: Some(range),
            ..Default::default()
        });
    }

    if let Some(cb) = callback {
        cb.on_chunk_start(range, index, total);
    }

    let mut run = ChunkRun::default();
    let mut stack = vec![WorkItem::Extract { chunk, depth: 0 }];

    while let Some(item) = stack.pop() {
        match item {
            WorkItem::MarkPartial { range, failure, retries } => {
                cache.mark_partial(range, failure.as_ref(), retries).await?;
            }
            WorkItem::Extract { chunk, depth } => {
                let range = chunk.range();

                if let Some(hit) = cache.lookup(range).await {
                    let label = match &hit {
                        CacheHit::Exact(_) => format!("cache hit {range}"),
                        CacheHit::Children(_, n) => format!("cache hit {range} from {n} children"),
                    };
                    debug!("{}", label);
                    ctx.diagnostics.event("extract", label);
                    run.cache_hits += 1;
                    run.outputs.push(hit.into_output());
                    if let Some(cb) = callback {
                        cb.on_chunk_complete(range, true);
                    }
                    continue;
                }

                let splittable = chunk.can_split() && depth < ctx.config.max_split_depth;

                let (failure, retries) = if splittable && cache.is_partial(range).await {
                    info!(range = %range, "Previously split; splitting without a model call");
                    (None, 0)
                } else {
                    match extract_chunk(ctx, &chunk, lecture_title).await {
                        Ok((output, retries)) => {
                            cache.record_ok(&output, retries).await?;
                            run.outputs.push(output);
                            if let Some(cb) = callback {
                                cb.on_chunk_complete(range, false);
                            }
                            continue;
                        }
                        Err(failure) if !splittable => {
                            warn!(
                                request_id = %ctx.request_id,
                                range = %range,
                                kind = %failure.kind,
                                "Chunk failed terminally: {}",
                                failure.detail
                            );
                            cache.record_failed(range, &failure, 1).await?;
                            if let Some(cb) = callback {
                                cb.on_chunk_error(range, failure.kind.describe());
                            }
                            run.failed.push(FailedRange { range, failure });
                            continue;
                        }
                        Err(failure) => (Some(failure), 1),
                    }
                };

                // Splittable is checked above, so split() succeeds here.
                let Some((left, right)) = chunk.split() else {
                    continue;
                };
                info!(
                    request_id = %ctx.request_id,
                    range = %range,
                    "Splitting into {} and {}",
                    left.range(),
                    right.range()
                );
                if let Some(cb) = callback {
                    cb.on_chunk_split(range, left.range(), right.range());
                }
                run.splits += 1;
                stack.push(WorkItem::MarkPartial { range, failure, retries });
                stack.push(WorkItem::Extract {
                    chunk: right,
                    depth: depth + 1,
                });
                stack.push(WorkItem::Extract {
                    chunk: left,
                    depth: depth + 1,
                });
            }
        }
    }

    Ok(run)
}

/// Standard attempt, then strict. Returns the output and the retry count.
async fn extract_chunk(
    ctx: &RunContext<'_>,
    chunk: &Chunk,
    lecture_title: &str,
) -> Result<(StepAChunkOutput, u32), StageFailure> {
    let range = chunk.range();
    let expected = chunk.slide_numbers();
    let prompt = build_extraction_prompt(lecture_title, ctx.mode, range, &chunk.text);
    let reply = request_json(
        ctx,
        CallPurpose::ChunkExtract { range },
        &ctx.config.extraction_model,
        &prompt,
        ctx.config.extraction_max_tokens,
        |raw| decode_chunk_output(raw, range, &expected),
    )
    .await?;
    Ok((reply.value, reply.attempts.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationConfig, GenerationMode};
    use crate::error::FailureKind;
    use crate::pipeline::chunker::{chunk_slides, ChunkLimits};
    use crate::pipeline::llm::testing::{chunk_json, ScriptedClient, TRUNCATED};
    use crate::pipeline::manifest::EntryStatus;
    use crate::store::MemoryObjectStore;
    use crate::types::Slide;

    fn chunks(n: u32, per_chunk: usize) -> Vec<Chunk> {
        let slides: Vec<Slide> = (1..=n)
            .map(|i| Slide {
                number: i,
                page_label: format!("Slide {i}"),
                body_text: format!("Body of slide {i}"),
            })
            .collect();
        chunk_slides(
            &slides,
            ChunkLimits {
                max_slides: per_chunk,
                max_chars: 12_000,
                adaptive_token_threshold: 10_000,
            },
        )
    }

    fn range_of(p: &CallPurpose) -> Option<ChunkRange> {
        match p {
            CallPurpose::ChunkExtract { range } => Some(*range),
            _ => None,
        }
    }

    /// Truncates any extraction touching slides 16..=18.
    fn failing_16_18() -> ScriptedClient {
        ScriptedClient::new(|req| match req.purpose {
            CallPurpose::ChunkExtract { range } if range.overlaps(&ChunkRange::new(16, 18)) => {
                Ok(TRUNCATED.to_string())
            }
            CallPurpose::ChunkExtract { range } => Ok(chunk_json(range)),
            _ => Ok("{}".to_string()),
        })
    }

    #[tokio::test]
    async fn all_chunks_succeed() {
        let client = ScriptedClient::new(|req| Ok(chunk_json(range_of(&req.purpose).unwrap())));
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "doc", &client, &config, GenerationMode::StudyGuide);
        let store = MemoryObjectStore::new();
        let cache = ChunkCache::load(&store, "p/".into()).await;

        let outcome = extract_all(&ctx, &cache, chunks(40, 6), "Renal").await.unwrap();
        assert_eq!(outcome.outputs.len(), 7);
        assert_eq!(outcome.splits, 0);
        assert_eq!(outcome.cache_hits, 0);
        assert!(outcome.failed.is_empty());
        assert_eq!(ctx.usage.calls(), 7);
    }

    #[tokio::test]
    async fn truncated_chunk_splits_and_right_half_fails() {
        let client = failing_16_18();
        let config = GenerationConfig::builder().max_split_depth(1).build().unwrap();
        let ctx = RunContext::new("r", "doc", &client, &config, GenerationMode::StudyGuide);
        let store = MemoryObjectStore::new();
        let cache = ChunkCache::load(&store, "p/".into()).await;

        let outcome = extract_all(&ctx, &cache, chunks(18, 6), "Renal").await.unwrap();
        assert_eq!(outcome.splits, 1);
        assert_eq!(outcome.ok_ranges(), vec![
            ChunkRange::new(1, 6),
            ChunkRange::new(7, 12),
            ChunkRange::new(13, 15)
        ]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].range, ChunkRange::new(16, 18));
        assert_eq!(outcome.failed[0].failure.kind, FailureKind::Truncated);

        // [13,18] standard + strict, [13,15] once, [16,18] standard + strict.
        let calls_13_18 = client.count(|p| range_of(p) == Some(ChunkRange::new(13, 18)));
        assert_eq!(calls_13_18, 2);
        assert_eq!(client.count(|p| range_of(p) == Some(ChunkRange::new(16, 18))), 2);

        let m = cache.manifest().await;
        assert_eq!(m.get(ChunkRange::new(13, 18)).unwrap().status, EntryStatus::Partial);
        assert_eq!(m.get(ChunkRange::new(13, 15)).unwrap().status, EntryStatus::Ok);
        assert_eq!(m.get(ChunkRange::new(16, 18)).unwrap().status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn rerun_skips_straight_to_split_for_partial_parent() {
        let store = MemoryObjectStore::new();
        let config = GenerationConfig::builder().max_split_depth(1).build().unwrap();
        {
            let client = failing_16_18();
            let ctx = RunContext::new("r1", "doc", &client, &config, GenerationMode::StudyGuide);
            let cache = ChunkCache::load(&store, "p/".into()).await;
            extract_all(&ctx, &cache, chunks(18, 6), "Renal").await.unwrap();
        }

        let client = failing_16_18();
        let ctx = RunContext::new("r2", "doc", &client, &config, GenerationMode::StudyGuide);
        let cache = ChunkCache::load(&store, "p/".into()).await;
        let outcome = extract_all(&ctx, &cache, chunks(18, 6), "Renal").await.unwrap();

        // Only the failed child is retried.
        assert_eq!(client.count(|p| range_of(p) == Some(ChunkRange::new(13, 18))), 0);
        assert_eq!(client.count(|p| range_of(p) == Some(ChunkRange::new(16, 18))), 2);
        assert_eq!(ctx.usage.calls(), 2);
        assert_eq!(outcome.cache_hits, 3);
    }

    #[tokio::test]
    async fn deep_split_fails_single_slides() {
        let client = failing_16_18();
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "doc", &client, &config, GenerationMode::StudyGuide);
        let store = MemoryObjectStore::new();
        let cache = ChunkCache::load(&store, "p/".into()).await;

        let outcome = extract_all(&ctx, &cache, chunks(18, 6), "Renal").await.unwrap();
        let failed: Vec<ChunkRange> = outcome.failed.iter().map(|f| f.range).collect();
        assert_eq!(failed, vec![
            ChunkRange::new(16, 16),
            ChunkRange::new(17, 17),
            ChunkRange::new(18, 18)
        ]);
        assert_eq!(outcome.splits, 3);
    }

    #[tokio::test]
    async fn exhausted_budget_leaves_chunks_unprocessed() {
        let client = ScriptedClient::new(|req| Ok(chunk_json(range_of(&req.purpose).unwrap())));
        let mut config = GenerationConfig::default();
        config.time_budget_secs = 0;
        let ctx = RunContext::new("r", "doc", &client, &config, GenerationMode::StudyGuide);
        let store = MemoryObjectStore::new();
        let cache = ChunkCache::load(&store, "p/".into()).await;

        let outcome = extract_all(&ctx, &cache, chunks(12, 6), "Renal").await.unwrap();
        assert_eq!(outcome.unprocessed, vec![ChunkRange::new(1, 6), ChunkRange::new(7, 12)]);
        assert!(outcome.outputs.is_empty());
        assert_eq!(ctx.usage.calls(), 0);
        assert!(cache.manifest().await.entries.is_empty());
    }

    #[tokio::test]
    async fn concurrent_extraction_matches_sequential() {
        let client = ScriptedClient::new(|req| Ok(chunk_json(range_of(&req.purpose).unwrap())));
        let config = GenerationConfig::builder().concurrency(4).build().unwrap();
        let ctx = RunContext::new("r", "doc", &client, &config, GenerationMode::StudyGuide);
        let store = MemoryObjectStore::new();
        let cache = ChunkCache::load(&store, "p/".into()).await;

        let outcome = extract_all(&ctx, &cache, chunks(40, 6), "Renal").await.unwrap();
        assert_eq!(outcome.ok_ranges().len(), 7);
        assert_eq!(cache.manifest().await.entries.len(), 7);
    }
}
