//! Step A merge and derive.
//!
//! Merge is pure: sort chunk outputs by start slide, concatenate, and keep
//! the first occurrence of every slide number. Derive is one more model call
//! over the merged extraction; its result is cached by a hash of the merged
//! extraction so a fully cached re-run makes no Step A calls at all.

use crate::error::StudyGenError;
use crate::pipeline::llm::{request_json, CallPurpose, RunContext};
use crate::pipeline::manifest::ChunkCache;
use crate::pipeline::schema::{decode, validate_derived};
use crate::prompts::build_derive_prompt;
use crate::types::{DerivedStructures, MergedExtraction, StepAChunkOutput};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Merge chunk outputs into one ordered, duplicate-free slide list.
///
/// Returns the merged extraction and one warning per dropped duplicate.
/// `lecture_title` wins over titles reported by the model when non-empty.
pub fn merge_chunk_outputs(
    outputs: &[StepAChunkOutput],
    lecture_title: &str,
) -> (MergedExtraction, Vec<String>) {
    let mut ordered: Vec<&StepAChunkOutput> = outputs.iter().collect();
    ordered.sort_by_key(|o| (o.chunk.start, o.chunk.end));

    let mut seen = BTreeSet::new();
    let mut slides = Vec::new();
    let mut warnings = Vec::new();

    for output in &ordered {
        for slide in &output.slides {
            if seen.insert(slide.slide_number) {
                slides.push(slide.clone());
            } else {
                let msg = format!(
                    "Duplicate extraction for slide {} in chunk {} dropped",
                    slide.slide_number, output.chunk
                );
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
    }

    let title = if lecture_title.trim().is_empty() {
        ordered
            .iter()
            .map(|o| o.lecture_title.trim())
            .find(|t| !t.is_empty())
            .unwrap_or("Untitled lecture")
            .to_string()
    } else {
        lecture_title.trim().to_string()
    };

    (
        MergedExtraction {
            lecture_title: title,
            slides,
        },
        warnings,
    )
}

/// First 16 hex chars of SHA-256 over the merged extraction's JSON.
pub fn content_hash(merged: &MergedExtraction) -> String {
    let bytes = serde_json::to_vec(merged).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(&bytes));
    digest[..16].to_string()
}

/// Compact JSON view of the merged extraction, capped at `max_chars`.
pub fn extraction_view(merged: &MergedExtraction, max_chars: usize) -> String {
    let full = serde_json::to_string(merged).unwrap_or_default();
    if full.chars().count() <= max_chars {
        return full;
    }
    let cut: String = full.chars().take(max_chars).collect();
    format!("{cut}\n[extraction truncated at {max_chars} characters]")
}

/// How the derived structures were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeriveSource {
    Cached,
    Model,
    /// Model output unusable or nothing to derive from; all-empty default.
    Default,
}

/// Run (or reuse) the derive call.
///
/// Failures fall back to [`DerivedStructures::default`], which is not
/// cached so the next run tries again. Only a store write failure is fatal.
pub async fn derive(
    ctx: &RunContext<'_>,
    cache: &ChunkCache<'_>,
    merged: &MergedExtraction,
) -> Result<(DerivedStructures, DeriveSource), StudyGenError> {
    if merged.slides.is_empty() {
        warn!(request_id = %ctx.request_id, "Nothing extracted; skipping derive");
        return Ok((DerivedStructures::default(), DeriveSource::Default));
    }

    let key = cache.derived_key(&content_hash(merged));
    if let Some(derived) = cache.get_json::<DerivedStructures>(&key).await {
        info!(request_id = %ctx.request_id, "Derived structures served from cache");
        ctx.diagnostics.event("derive", "cache hit");
        return Ok((derived, DeriveSource::Cached));
    }

    ctx.stage("derive");
    let prompt = build_derive_prompt(
        &merged.lecture_title,
        &extraction_view(merged, ctx.config.derive_input_max_chars),
    );
    match request_json(
        ctx,
        CallPurpose::Derive,
        &ctx.config.extraction_model,
        &prompt,
        ctx.config.extraction_max_tokens,
        |raw| decode::<DerivedStructures, _>(raw, validate_derived),
    )
    .await
    {
        Ok(reply) => {
            let derived = normalize(reply.value);
            cache.put_json(&key, &derived).await?;
            Ok((derived, DeriveSource::Model))
        }
        Err(failure) => {
            warn!(
                request_id = %ctx.request_id,
                kind = %failure.kind,
                "Derive failed; using empty derived structures: {}",
                failure.detail
            );
            Ok((DerivedStructures::default(), DeriveSource::Default))
        }
    }
}

/// Trim items and drop blanks and case-insensitive duplicates.
fn normalize(mut d: DerivedStructures) -> DerivedStructures {
    fn clean(items: &mut Vec<String>) {
        let mut seen = BTreeSet::new();
        items.retain_mut(|s| {
            *s = s.trim().to_string();
            !s.is_empty() && seen.insert(s.to_lowercase())
        });
    }
    let b = &mut d.buckets;
    for list in [
        &mut b.dx,
        &mut b.pathophys,
        &mut b.clinical,
        &mut b.labs,
        &mut b.imaging,
        &mut b.treatment,
        &mut b.complications,
        &mut b.risk_factors,
        &mut b.epidemiology,
        &mut b.red_flags,
        &mut b.buzzwords,
    ] {
        clean(list);
    }
    clean(&mut d.exam_atoms);
    d.discriminators.retain(|x| !x.topic.trim().is_empty());
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationConfig, GenerationMode};
    use crate::pipeline::llm::testing::ScriptedClient;
    use crate::store::MemoryObjectStore;
    use crate::types::{ChunkRange, SlideExtraction};

    fn output(start: u32, end: u32, title: &str) -> StepAChunkOutput {
        StepAChunkOutput {
            lecture_title: "Model title".into(),
            chunk: ChunkRange::new(start, end),
            slides: (start..=end)
                .map(|n| SlideExtraction {
                    slide_number: n,
                    title: format!("{title} {n}"),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn merge_orders_by_start_and_keeps_first_duplicate() {
        let outputs = vec![output(4, 6, "second"), output(1, 4, "first")];
        let (merged, warnings) = merge_chunk_outputs(&outputs, "Renal");
        let numbers: Vec<u32> = merged.slides.iter().map(|s| s.slide_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(merged.slides[3].title, "first 4");
        assert_eq!(warnings.len(), 1);
        assert_eq!(merged.lecture_title, "Renal");
    }

    #[test]
    fn merged_count_never_exceeds_input() {
        let outputs = vec![output(1, 3, "a"), output(1, 3, "b"), output(2, 5, "c")];
        let (merged, _) = merge_chunk_outputs(&outputs, "");
        assert_eq!(merged.slides.len(), 5);
        assert_eq!(merged.lecture_title, "Model title");
    }

    #[test]
    fn content_hash_tracks_content() {
        let (a, _) = merge_chunk_outputs(&[output(1, 2, "a")], "T");
        let (b, _) = merge_chunk_outputs(&[output(1, 2, "b")], "T");
        assert_eq!(content_hash(&a), content_hash(&a.clone()));
        assert_ne!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 16);
    }

    #[test]
    fn view_is_capped() {
        let (m, _) = merge_chunk_outputs(&[output(1, 30, "long title text")], "T");
        let v = extraction_view(&m, 100);
        assert!(v.ends_with("[extraction truncated at 100 characters]"));
    }

    #[tokio::test]
    async fn derive_is_cached_by_content() {
        let client = ScriptedClient::new(|_| {
            Ok(r#"{"buckets": {"dx": ["AKI", " aki ", ""]}, "exam_atoms": ["FeNa < 1% suggests prerenal AKI"]}"#.into())
        });
        let config = GenerationConfig::default();
        let store = MemoryObjectStore::new();
        let (merged, _) = merge_chunk_outputs(&[output(1, 2, "a")], "T");

        let ctx = RunContext::new("r1", "d", &client, &config, GenerationMode::StudyGuide);
        let cache = ChunkCache::load(&store, "p/".into()).await;
        let (first, source) = derive(&ctx, &cache, &merged).await.unwrap();
        assert_eq!(source, DeriveSource::Model);
        assert_eq!(first.buckets.dx, vec!["AKI".to_string()]);

        let ctx2 = RunContext::new("r2", "d", &client, &config, GenerationMode::StudyGuide);
        let (second, source) = derive(&ctx2, &cache, &merged).await.unwrap();
        assert_eq!(source, DeriveSource::Cached);
        assert_eq!(first, second);
        assert_eq!(ctx2.usage.calls(), 0);
    }

    #[tokio::test]
    async fn derive_failure_falls_back_to_default() {
        let client = ScriptedClient::new(|_| Ok("no json here".into()));
        let config = GenerationConfig::default();
        let store = MemoryObjectStore::new();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::StudyGuide);
        let cache = ChunkCache::load(&store, "p/".into()).await;
        let (merged, _) = merge_chunk_outputs(&[output(1, 2, "a")], "T");

        let (derived, source) = derive(&ctx, &cache, &merged).await.unwrap();
        assert_eq!(source, DeriveSource::Default);
        assert_eq!(derived, DerivedStructures::default());
        assert_eq!(ctx.usage.calls(), 2);
        assert!(store.keys().await.iter().all(|k| !k.contains("derived_")));
    }
}
