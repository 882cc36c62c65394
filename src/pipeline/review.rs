//! Step C quality review.
//!
//! The model never sees the full documents, only [`ReviewStats`]: headings,
//! counts, entity sets and section-presence flags. Any failure yields
//! [`StepCOutput::default`] and rendering continues.

use crate::pipeline::llm::{request_json, CallPurpose, RunContext};
use crate::pipeline::schema::{decode, validate_step_c};
use crate::prompts::build_review_prompt;
use crate::types::{ChunkRange, StepAOutput, StepBOutput, StepCOutput};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

const MAX_HEADINGS: usize = 80;
const MAX_ENTITIES_PER_BUCKET: usize = 25;

/// Compact summary of Step A + Step B sent to the reviewer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewStats {
    pub lecture_title: String,
    pub slide_count: usize,
    pub empty_slides: usize,
    pub fact_count: usize,
    pub table_count: usize,
    pub headings: Vec<String>,
    pub exam_atom_count: usize,
    pub discriminator_count: usize,
    /// Bucket name → entities, capped per bucket.
    pub entities: BTreeMap<String, Vec<String>>,
    pub abbreviations: Vec<String>,
    /// Item count per synthesis section.
    pub section_sizes: BTreeMap<String, usize>,
    pub sections_present: BTreeMap<String, bool>,
    /// Slide ranges missing from the extraction.
    pub missing_ranges: Vec<String>,
}

impl ReviewStats {
    pub fn build(step_a: &StepAOutput, step_b: &StepBOutput, missing: &[ChunkRange]) -> Self {
        let headings: Vec<String> = step_a
            .slides
            .iter()
            .filter(|s| !s.title.trim().is_empty())
            .map(|s| format!("{}: {}", s.slide_number, s.title.trim()))
            .take(MAX_HEADINGS)
            .collect();

        let entities = step_a
            .buckets
            .entries()
            .into_iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(name, items)| {
                (
                    name.to_string(),
                    items.iter().take(MAX_ENTITIES_PER_BUCKET).cloned().collect(),
                )
            })
            .collect();

        let sizes = [
            ("high_yield_summary", step_b.high_yield_summary.len()),
            ("rapid_approach", step_b.rapid_approach.len()),
            ("one_page_review", step_b.one_page_review.len()),
            ("compare_tables", step_b.compare_tables.len()),
            ("quant_cutoffs", step_b.quant_cutoffs.len()),
            ("pitfalls", step_b.pitfalls.len()),
            ("glossary", step_b.glossary.len()),
        ];

        Self {
            lecture_title: step_a.lecture_title.clone(),
            slide_count: step_a.slides.len(),
            empty_slides: step_a.slides.iter().filter(|s| s.fact_count() == 0 && s.tables.is_empty()).count(),
            fact_count: step_a.raw_facts.len(),
            table_count: step_a.table_count(),
            headings,
            exam_atom_count: step_a.exam_atoms.len(),
            discriminator_count: step_a.discriminators.len(),
            entities,
            abbreviations: step_a.abbrev_map.keys().cloned().collect(),
            section_sizes: sizes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            sections_present: sizes.iter().map(|(k, v)| (format!("{k}_present"), *v > 0)).collect(),
            missing_ranges: missing.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Run the review. Never fails; unusable output becomes the default record.
pub async fn review(ctx: &RunContext<'_>, stats: &ReviewStats) -> (StepCOutput, bool) {
    if ctx.time_exhausted() {
        warn!(request_id = %ctx.request_id, "Time budget exhausted; skipping review");
        ctx.diagnostics.event("review", "skipped: time budget exhausted");
        return (StepCOutput::default(), false);
    }

    ctx.stage("review");
    let stats_json = serde_json::to_string_pretty(stats).unwrap_or_default();
    let prompt = build_review_prompt(ctx.mode, &stats_json);
    match request_json(
        ctx,
        CallPurpose::Review,
        &ctx.config.review_model,
        &prompt,
        ctx.config.review_max_tokens,
        |raw| decode::<StepCOutput, _>(raw, validate_step_c),
    )
    .await
    {
        Ok(reply) => (reply.value, true),
        Err(failure) => {
            warn!(
                request_id = %ctx.request_id,
                kind = %failure.kind,
                "Review failed; using default review: {}",
                failure.detail
            );
            (StepCOutput::default(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationConfig, GenerationMode};
    use crate::pipeline::llm::testing::ScriptedClient;
    use crate::types::{Buckets, CoverageConfidence, FactSection, FactTable, SlideExtraction};

    fn step_a() -> StepAOutput {
        StepAOutput {
            lecture_title: "Shock".into(),
            slides: vec![
                SlideExtraction {
                    slide_number: 1,
                    title: "Types of shock".into(),
                    sections: vec![FactSection {
                        heading: "Types".into(),
                        facts: vec!["Distributive".into(), "Cardiogenic".into()],
                    }],
                    tables: vec![FactTable::default()],
                    ..Default::default()
                },
                SlideExtraction {
                    slide_number: 2,
                    ..Default::default()
                },
            ],
            buckets: Buckets {
                dx: vec!["Septic shock".into()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn stats_summarise_without_full_documents() {
        let b = StepBOutput {
            high_yield_summary: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let stats = ReviewStats::build(&step_a(), &b, &[ChunkRange::new(16, 18)]);
        assert_eq!(stats.slide_count, 2);
        assert_eq!(stats.empty_slides, 1);
        assert_eq!(stats.table_count, 1);
        assert_eq!(stats.headings, vec!["1: Types of shock".to_string()]);
        assert_eq!(stats.entities.len(), 1);
        assert_eq!(stats.section_sizes["high_yield_summary"], 2);
        assert!(stats.sections_present["high_yield_summary_present"]);
        assert!(!stats.sections_present["glossary_present"]);
        assert_eq!(stats.missing_ranges, vec!["16\u{2013}18".to_string()]);
    }

    #[tokio::test]
    async fn review_parses_model_output() {
        let client = ScriptedClient::new(|_| {
            Ok(r#"{"coverage_confidence": "high", "omissions": ["Obstructive shock"], "checks": {"summary_present": true}}"#.into())
        });
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::StudyGuide);
        let stats = ReviewStats::build(&step_a(), &StepBOutput::default(), &[]);
        let (c, from_model) = review(&ctx, &stats).await;
        assert!(from_model);
        assert_eq!(c.coverage_confidence, CoverageConfidence::High);
        assert_eq!(c.omissions, vec!["Obstructive shock".to_string()]);
    }

    #[tokio::test]
    async fn invalid_confidence_falls_back_to_default() {
        let client = ScriptedClient::new(|_| Ok(r#"{"coverage_confidence": "excellent"}"#.into()));
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::StudyGuide);
        let stats = ReviewStats::build(&step_a(), &StepBOutput::default(), &[]);
        let (c, from_model) = review(&ctx, &stats).await;
        assert!(!from_model);
        assert_eq!(c, StepCOutput::default());
        assert_eq!(ctx.usage.calls(), 2);
    }
}
