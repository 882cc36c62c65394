//! Synthesis minimum gate.
//!
//! Runs after the compiler and checks absolute item counts only. Ladder:
//! validate → rewrite with the failure list → one fresh "strict minima"
//! redraft → deterministic fallback. A rung's document is accepted only if
//! it passes both the minimum counts and the structural validator.

use crate::config::SynthesisMinimums;
use crate::pipeline::compile::{capped_json, document_view, plan_view, validate_structure};
use crate::pipeline::fallback::fallback_document;
use crate::pipeline::llm::{attempt_json, CallPurpose, RunContext};
use crate::pipeline::schema::{decode, validate_step_b};
use crate::prompts::{build_redraft_prompt, build_rewrite_prompt};
use crate::types::{StepAOutput, StepBOutput, StepBPlan};
use tracing::{info, warn};

fn non_blank<'a>(items: impl Iterator<Item = &'a str>) -> usize {
    items.filter(|s| !s.trim().is_empty()).count()
}

/// Minimum-count failures, one message per short section.
pub fn validate_minimums(doc: &StepBOutput, minimums: &SynthesisMinimums) -> Vec<String> {
    let counts = [
        (
            "high_yield_summary",
            non_blank(doc.high_yield_summary.iter().map(String::as_str)),
            minimums.high_yield_summary,
        ),
        (
            "one_page_review",
            non_blank(doc.one_page_review.iter().map(String::as_str)),
            minimums.one_page_review,
        ),
        (
            "rapid_approach",
            non_blank(doc.rapid_approach.iter().map(|r| r.clue.as_str())),
            minimums.rapid_approach,
        ),
        (
            "pitfalls",
            non_blank(doc.pitfalls.iter().map(String::as_str)),
            minimums.pitfalls,
        ),
        (
            "glossary",
            non_blank(doc.glossary.iter().map(|g| g.term.as_str())),
            minimums.glossary,
        ),
    ];

    counts
        .into_iter()
        .filter(|(_, have, need)| have < need)
        .map(|(name, have, need)| format!("{name}: {have} items, need at least {need}"))
        .collect()
}

/// Which rung of the ladder produced the final document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRung {
    /// The incoming document already met every minimum.
    Passed,
    Rewrite,
    Redraft,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub document: StepBOutput,
    pub rung: GateRung,
    pub notes: Vec<String>,
}

impl GateOutcome {
    pub fn used_fallback(&self) -> bool {
        self.rung == GateRung::Fallback
    }
}

fn all_failures(doc: &StepBOutput, plan: &StepBPlan, minimums: &SynthesisMinimums) -> Vec<String> {
    let mut failures = validate_minimums(doc, minimums);
    failures.extend(validate_structure(doc, plan));
    failures
}

/// Enforce the synthesis minimums on `doc`.
pub async fn enforce_minimums(
    ctx: &RunContext<'_>,
    step_a: &StepAOutput,
    plan: &StepBPlan,
    doc: StepBOutput,
    minimums: &SynthesisMinimums,
) -> GateOutcome {
    let failures = validate_minimums(&doc, minimums);
    if failures.is_empty() {
        return GateOutcome {
            document: doc,
            rung: GateRung::Passed,
            notes: Vec::new(),
        };
    }
    info!(
        request_id = %ctx.request_id,
        "Synthesis below minimums: {}",
        failures.join("; ")
    );

    let mut notes = Vec::new();
    let model = ctx.config.synthesis_model.as_str();
    let max_tokens = ctx.config.synthesis_max_tokens;
    let plan_text = plan_view(plan);
    let decode_doc = |raw: &str| decode::<StepBOutput, _>(raw, validate_step_b);

    if !ctx.time_exhausted() {
        ctx.stage("gate_rewrite");
        let prompt = build_rewrite_prompt(ctx.mode, &failures, &plan_text, &document_view(&doc));
        match attempt_json(ctx, CallPurpose::GateRewrite, model, &prompt, max_tokens, false, &decode_doc).await {
            Ok(decoded) => {
                let remaining = all_failures(&decoded.value, plan, minimums);
                if remaining.is_empty() {
                    return GateOutcome {
                        document: decoded.value,
                        rung: GateRung::Rewrite,
                        notes,
                    };
                }
                warn!(request_id = %ctx.request_id, "Gate rewrite still failing: {}", remaining.join("; "));
            }
            Err(failure) => {
                warn!(request_id = %ctx.request_id, kind = %failure.kind, "Gate rewrite failed");
            }
        }
    }

    if !ctx.time_exhausted() {
        ctx.stage("redraft");
        let prompt = build_redraft_prompt(
            &step_a.lecture_title,
            ctx.mode,
            minimums,
            &plan_text,
            &capped_json(step_a, ctx.config.derive_input_max_chars),
        );
        match attempt_json(ctx, CallPurpose::Redraft, model, &prompt, max_tokens, false, &decode_doc).await {
            Ok(decoded) => {
                let remaining = all_failures(&decoded.value, plan, minimums);
                if remaining.is_empty() {
                    notes.push("Synthesis was redrafted to meet minimum section sizes".to_string());
                    return GateOutcome {
                        document: decoded.value,
                        rung: GateRung::Redraft,
                        notes,
                    };
                }
                warn!(request_id = %ctx.request_id, "Redraft still failing: {}", remaining.join("; "));
            }
            Err(failure) => {
                warn!(request_id = %ctx.request_id, kind = %failure.kind, "Redraft failed");
            }
        }
    } else {
        notes.push("Time budget exhausted during the minimum gate".to_string());
    }

    notes.push(format!(
        "Synthesis did not meet minimum section sizes ({}); using fallback synthesis",
        failures.join("; ")
    ));
    GateOutcome {
        document: fallback_document(step_a, plan, minimums),
        rung: GateRung::Fallback,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationConfig, GenerationMode};
    use crate::pipeline::llm::testing::ScriptedClient;
    use crate::types::{ApproachRow, RawFact};

    fn doc_with(summary: usize, review: usize, approach: usize, pitfalls: usize) -> StepBOutput {
        StepBOutput {
            high_yield_summary: (0..summary).map(|i| format!("Summary point {i}")).collect(),
            one_page_review: (0..review).map(|i| format!("Review point {i}")).collect(),
            rapid_approach: (0..approach)
                .map(|i| ApproachRow {
                    clue: format!("Clue {i}"),
                    think: format!("Think {i}"),
                    next_step: String::new(),
                })
                .collect(),
            pitfalls: (0..pitfalls).map(|i| format!("Pitfall {i}")).collect(),
            ..Default::default()
        }
    }

    fn step_a() -> StepAOutput {
        StepAOutput {
            lecture_title: "Anemia".into(),
            raw_facts: (1..=3)
                .map(|i| RawFact {
                    slide: i,
                    text: format!("Anemia fact {i}"),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn minimum_messages() {
        let m = SynthesisMinimums::default();
        let failures = validate_minimums(&doc_with(8, 5, 3, 2), &m);
        assert_eq!(failures, vec!["pitfalls: 2 items, need at least 3".to_string()]);
        assert!(validate_minimums(&doc_with(8, 5, 3, 3), &m).is_empty());
    }

    #[test]
    fn blank_items_do_not_count() {
        let mut doc = doc_with(8, 5, 3, 3);
        doc.pitfalls[0] = "   ".into();
        assert_eq!(validate_minimums(&doc, &SynthesisMinimums::default()).len(), 1);
    }

    #[tokio::test]
    async fn passing_document_makes_no_calls() {
        let client = ScriptedClient::new(|_| panic!("no calls expected"));
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::StudyGuide);
        let out = enforce_minimums(
            &ctx,
            &step_a(),
            &StepBPlan::default(),
            doc_with(8, 5, 3, 3),
            &SynthesisMinimums::default(),
        )
        .await;
        assert_eq!(out.rung, GateRung::Passed);
    }

    #[tokio::test]
    async fn rewrite_rung_accepts_fixed_document() {
        let client = ScriptedClient::new(|req| {
            assert_eq!(req.purpose, CallPurpose::GateRewrite);
            assert!(req.prompt.contains("- high_yield_summary: 2 items, need at least 8"));
            Ok(serde_json::to_string(&doc_with(8, 5, 3, 3)).unwrap())
        });
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::StudyGuide);
        let out = enforce_minimums(
            &ctx,
            &step_a(),
            &StepBPlan::default(),
            doc_with(2, 5, 3, 3),
            &SynthesisMinimums::default(),
        )
        .await;
        assert_eq!(out.rung, GateRung::Rewrite);
        assert!(out.notes.is_empty());
    }

    #[tokio::test]
    async fn redraft_rung_after_failed_rewrite() {
        let client = ScriptedClient::new(|req| match req.purpose {
            CallPurpose::GateRewrite => Ok(serde_json::to_string(&doc_with(3, 5, 3, 3)).unwrap()),
            CallPurpose::Redraft => Ok(serde_json::to_string(&doc_with(10, 6, 4, 4)).unwrap()),
            other => panic!("unexpected call {other:?}"),
        });
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::ExamCram);
        let m = SynthesisMinimums::for_mode(GenerationMode::ExamCram);
        let out = enforce_minimums(&ctx, &step_a(), &StepBPlan::default(), doc_with(1, 1, 1, 1), &m).await;
        assert_eq!(out.rung, GateRung::Redraft);
        assert_eq!(ctx.usage.calls(), 2);
    }

    #[tokio::test]
    async fn structurally_broken_redraft_is_rejected() {
        let client = ScriptedClient::new(|req| match req.purpose {
            CallPurpose::GateRewrite => Ok("garbage".into()),
            _ => {
                let mut doc = doc_with(8, 5, 3, 3);
                doc.pitfalls[1] = "TBD".into();
                Ok(serde_json::to_string(&doc).unwrap())
            }
        });
        let config = GenerationConfig::default();
        let ctx = RunContext::new("r", "d", &client, &config, GenerationMode::StudyGuide);
        let m = SynthesisMinimums::default();
        let plan = StepBPlan::default();
        let out = enforce_minimums(&ctx, &step_a(), &plan, doc_with(0, 0, 0, 0), &m).await;
        assert!(out.used_fallback());
        assert!(validate_minimums(&out.document, &m).is_empty());
        assert!(validate_structure(&out.document, &plan).is_empty());
        assert!(out.notes.last().unwrap().ends_with("using fallback synthesis"));
    }
}
