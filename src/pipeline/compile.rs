//! Step B compiler: plan → outline → pack → validate → rewrite.
//!
//! Each sub-call either produces something usable or is replaced by a
//! deterministic stand-in from [`crate::pipeline::fallback`]. Nothing here is
//! fatal: the worst case is the fallback document, which always validates.
//!
//! ```text
//!  StepAOutput ──► plan ──(fail)──► fallback_plan
//!                   │
//!                   ▼
//!                outline ──(fail)──► fallback_outline
//!                   │
//!                   ▼
//!                 pack ──(fail)──────────────┐
//!                   │                        │
//!                   ▼                        ▼
//!            validate_structure ──► rewrite ──► fallback_document
//! ```

use crate::config::SynthesisMinimums;
use crate::pipeline::fallback::{fallback_document, fallback_outline, fallback_plan};
use crate::pipeline::llm::{attempt_json, request_json, request_text, CallPurpose, RunContext};
use crate::pipeline::schema::{decode, validate_plan, validate_step_b};
use crate::prompts::{build_outline_prompt, build_pack_prompt, build_plan_prompt, build_rewrite_prompt};
use crate::types::{Buckets, Discriminator, StepAOutput, StepBOutput, StepBPlan};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(TBD|TODO)\b").unwrap());

/// Placeholder text a model sometimes leaves behind instead of content.
///
/// `TBD`, `TODO`, `N/A`, `...` count only as the whole item; `lorem ipsum`
/// and upper-case `TBD`/`TODO` words anywhere in the item also count.
pub fn is_placeholder(text: &str) -> bool {
    let t = text.trim();
    let lower = t.to_lowercase();
    matches!(lower.as_str(), "tbd" | "todo" | "n/a" | "..." | "\u{2026}")
        || lower.contains("lorem ipsum")
        || RE_PLACEHOLDER.is_match(t)
}

// ── Structural validator ─────────────────────────────────────────────────

fn check_list(name: &str, items: &[String], out: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for (i, item) in items.iter().enumerate() {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            out.push(format!("{name}[{i}]: blank item"));
        } else if is_placeholder(trimmed) {
            out.push(format!("{name}[{i}]: placeholder text '{trimmed}'"));
        } else if !seen.insert(trimmed.to_lowercase()) {
            out.push(format!("{name}[{i}]: duplicate item '{trimmed}'"));
        }
    }
}

fn check_text(path: String, text: &str, required: bool, out: &mut Vec<String>) {
    if text.trim().is_empty() {
        if required {
            out.push(format!("{path}: blank"));
        }
    } else if is_placeholder(text) {
        out.push(format!("{path}: placeholder text '{}'", text.trim()));
    }
}

/// Structural and coverage rules for a synthesis document.
///
/// Returns one human-readable failure per violated rule; the list is passed
/// verbatim to the rewrite prompt, so messages name the section and index.
pub fn validate_structure(doc: &StepBOutput, plan: &StepBPlan) -> Vec<String> {
    let mut out = Vec::new();

    if doc.high_yield_summary.is_empty() {
        out.push("high_yield_summary: must not be empty".to_string());
    }
    check_list("high_yield_summary", &doc.high_yield_summary, &mut out);
    check_list("one_page_review", &doc.one_page_review, &mut out);
    check_list("pitfalls", &doc.pitfalls, &mut out);
    check_list("supplemental_notes", &doc.supplemental_notes, &mut out);

    let mut clues = BTreeSet::new();
    for (i, row) in doc.rapid_approach.iter().enumerate() {
        let path = format!("rapid_approach[{i}]");
        check_text(format!("{path}.clue"), &row.clue, true, &mut out);
        check_text(format!("{path}.think"), &row.think, true, &mut out);
        check_text(format!("{path}.next_step"), &row.next_step, false, &mut out);
        let clue = row.clue.trim().to_lowercase();
        if !clue.is_empty() && !clues.insert(clue) {
            out.push(format!("{path}: duplicate clue '{}'", row.clue.trim()));
        }
    }

    for (i, table) in doc.compare_tables.iter().enumerate() {
        let path = format!("compare_tables[{i}]");
        let width = table.columns.len();
        if width < 2 {
            out.push(format!("{path}: needs at least 2 columns, has {width}"));
        }
        if table.rows.is_empty() {
            out.push(format!("{path}: has no rows"));
        }
        for (j, row) in table.rows.iter().enumerate() {
            if row.len() != width {
                out.push(format!("{path}.rows[{j}]: {} cells, expected {width}", row.len()));
            }
            for (k, cell) in row.iter().enumerate() {
                check_text(format!("{path}.rows[{j}][{k}]"), cell, false, &mut out);
            }
        }
    }

    for (i, c) in doc.quant_cutoffs.iter().enumerate() {
        let path = format!("quant_cutoffs[{i}]");
        check_text(format!("{path}.item"), &c.item, true, &mut out);
        check_text(format!("{path}.value"), &c.value, true, &mut out);
        check_text(format!("{path}.significance"), &c.significance, false, &mut out);
    }

    let mut terms = BTreeSet::new();
    for (i, g) in doc.glossary.iter().enumerate() {
        let path = format!("glossary[{i}]");
        check_text(format!("{path}.term"), &g.term, true, &mut out);
        check_text(format!("{path}.definition"), &g.definition, true, &mut out);
        let term = g.term.trim().to_lowercase();
        if !term.is_empty() && !terms.insert(term) {
            out.push(format!("{path}: duplicate term '{}'", g.term.trim()));
        }
    }

    let text = doc.searchable_text();
    for atom in &plan.selected_exam_atoms {
        let atom = atom.trim();
        if atom.is_empty() || is_placeholder(atom) {
            continue;
        }
        if !text.contains(&atom.to_lowercase()) {
            out.push(format!("exam atom not covered: '{atom}'"));
        }
    }

    out
}

// ── Plan handling ────────────────────────────────────────────────────────

/// Drop blank, placeholder and duplicate atoms from a model plan.
pub fn sanitize_plan(mut plan: StepBPlan) -> StepBPlan {
    let mut seen = BTreeSet::new();
    plan.selected_exam_atoms.retain_mut(|a| {
        *a = a.trim().to_string();
        !a.is_empty() && !is_placeholder(a) && seen.insert(a.to_lowercase())
    });
    plan.atom_to_section_map.retain(|m| seen.contains(&m.atom.trim().to_lowercase()));
    plan.compare_topics.retain(|t| !t.trim().is_empty() && !is_placeholder(t));
    plan
}

#[derive(Serialize)]
struct PlanOverview<'a> {
    lecture_title: &'a str,
    slide_count: usize,
    exam_atoms: &'a [String],
    discriminators: &'a [Discriminator],
    buckets: &'a Buckets,
}

/// JSON text capped at `max_chars`, with a visible marker when cut.
pub(crate) fn capped_json<T: Serialize>(value: &T, max_chars: usize) -> String {
    let full = serde_json::to_string(value).unwrap_or_default();
    if full.chars().count() <= max_chars {
        return full;
    }
    let cut: String = full.chars().take(max_chars).collect();
    format!("{cut}\n[input truncated at {max_chars} characters]")
}

pub(crate) fn plan_view(plan: &StepBPlan) -> String {
    serde_json::to_string_pretty(plan).unwrap_or_default()
}

pub(crate) fn document_view(doc: &StepBOutput) -> String {
    serde_json::to_string_pretty(doc).unwrap_or_default()
}

async fn plan_stage(
    ctx: &RunContext<'_>,
    step_a: &StepAOutput,
    minimums: &SynthesisMinimums,
    notes: &mut Vec<String>,
) -> StepBPlan {
    if ctx.time_exhausted() {
        notes.push("Time budget exhausted before planning; plan built from the extraction".into());
        return fallback_plan(step_a, ctx.mode, minimums);
    }

    ctx.stage("plan");
    let overview = PlanOverview {
        lecture_title: &step_a.lecture_title,
        slide_count: step_a.slides.len(),
        exam_atoms: &step_a.exam_atoms,
        discriminators: &step_a.discriminators,
        buckets: &step_a.buckets,
    };
    let prompt = build_plan_prompt(
        &step_a.lecture_title,
        ctx.mode,
        minimums,
        &capped_json(&overview, ctx.config.derive_input_max_chars),
    );

    match request_json(
        ctx,
        CallPurpose::Plan,
        &ctx.config.synthesis_model,
        &prompt,
        ctx.config.synthesis_max_tokens,
        |raw| decode::<StepBPlan, _>(raw, validate_plan),
    )
    .await
    {
        Ok(reply) => sanitize_plan(reply.value),
        Err(failure) => {
            warn!(request_id = %ctx.request_id, kind = %failure.kind, "Plan failed; deriving plan from extraction");
            notes.push(format!(
                "Plan call failed ({}); plan built from the extraction",
                failure.kind
            ));
            fallback_plan(step_a, ctx.mode, minimums)
        }
    }
}

// ── Compiler ─────────────────────────────────────────────────────────────

/// Result of the Step B compiler.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub document: StepBOutput,
    pub plan: StepBPlan,
    /// The deterministic fallback document was used.
    pub used_fallback: bool,
    /// Reader-facing notes about degraded sub-stages.
    pub notes: Vec<String>,
}

impl CompileOutcome {
    fn accepted(document: StepBOutput, plan: StepBPlan, notes: Vec<String>) -> Self {
        Self {
            document,
            plan,
            used_fallback: false,
            notes,
        }
    }

    fn coerced(
        step_a: &StepAOutput,
        plan: StepBPlan,
        minimums: &SynthesisMinimums,
        mut notes: Vec<String>,
        reason: String,
    ) -> Self {
        warn!("Step B coerced to fallback document: {}", reason);
        notes.push(reason);
        Self {
            document: fallback_document(step_a, &plan, minimums),
            plan,
            used_fallback: true,
            notes,
        }
    }
}

/// Run the Step B compiler over a finished Step A document.
pub async fn compile(
    ctx: &RunContext<'_>,
    step_a: &StepAOutput,
    minimums: &SynthesisMinimums,
) -> CompileOutcome {
    let mut notes = Vec::new();
    let plan = plan_stage(ctx, step_a, minimums, &mut notes).await;
    let model = ctx.config.synthesis_model.as_str();
    let max_tokens = ctx.config.synthesis_max_tokens;
    let plan_text = plan_view(&plan);

    // Outline
    if ctx.time_exhausted() {
        let reason = "Time budget exhausted before the outline; using fallback synthesis".to_string();
        return CompileOutcome::coerced(step_a, plan, minimums, notes, reason);
    }
    ctx.stage("outline");
    let outline_prompt = build_outline_prompt(&step_a.lecture_title, ctx.mode, &plan_text);
    let outline = match request_text(ctx, CallPurpose::Outline, model, &outline_prompt, max_tokens).await {
        Ok(text) => text,
        Err(failure) => {
            notes.push(format!("Outline call failed ({}); fallback outline used", failure.kind));
            fallback_outline(&fallback_document(step_a, &plan, minimums))
        }
    };

    // Pack
    if ctx.time_exhausted() {
        let reason = "Time budget exhausted before packing; using fallback synthesis".to_string();
        return CompileOutcome::coerced(step_a, plan, minimums, notes, reason);
    }
    ctx.stage("pack");
    let extraction = capped_json(step_a, ctx.config.derive_input_max_chars);
    let pack_prompt = build_pack_prompt(
        &step_a.lecture_title,
        ctx.mode,
        minimums,
        &plan_text,
        &outline,
        &extraction,
    );
    let decode_doc = |raw: &str| decode::<StepBOutput, _>(raw, validate_step_b);
    let packed = match attempt_json(ctx, CallPurpose::Pack, model, &pack_prompt, max_tokens, false, &decode_doc).await
    {
        Ok(decoded) => decoded.value,
        Err(failure) => {
            let reason = format!("Pack call failed ({}); using fallback synthesis", failure.kind);
            return CompileOutcome::coerced(step_a, plan, minimums, notes, reason);
        }
    };

    let failures = validate_structure(&packed, &plan);
    if failures.is_empty() {
        info!(request_id = %ctx.request_id, "Packed document passed validation");
        return CompileOutcome::accepted(packed, plan, notes);
    }
    info!(
        request_id = %ctx.request_id,
        failures = failures.len(),
        "Packed document failed validation; rewriting"
    );

    // Rewrite (once)
    if ctx.time_exhausted() {
        let reason = "Time budget exhausted before the rewrite; using fallback synthesis".to_string();
        return CompileOutcome::coerced(step_a, plan, minimums, notes, reason);
    }
    ctx.stage("rewrite");
    let rewrite_prompt = build_rewrite_prompt(ctx.mode, &failures, &plan_text, &document_view(&packed));
    match attempt_json(ctx, CallPurpose::Rewrite, model, &rewrite_prompt, max_tokens, false, &decode_doc).await {
        Ok(decoded) => {
            let remaining = validate_structure(&decoded.value, &plan);
            if remaining.is_empty() {
                CompileOutcome::accepted(decoded.value, plan, notes)
            } else {
                let reason = format!(
                    "Rewritten synthesis still failed {} structural check(s); using fallback synthesis",
                    remaining.len()
                );
                CompileOutcome::coerced(step_a, plan, minimums, notes, reason)
            }
        }
        Err(failure) => {
            let reason = format!("Rewrite call failed ({}); using fallback synthesis", failure.kind);
            CompileOutcome::coerced(step_a, plan, minimums, notes, reason)
        }
    }
}
