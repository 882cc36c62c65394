//! Deterministic fallbacks for Step B.
//!
//! Built from Step A alone, no model calls. The fallback document satisfies
//! both the structural validator and the minimum-count gate for any input,
//! including an empty Step A: when the lecture yields too few distinct
//! items, numbered coverage notes fill the gap.

use crate::config::{GenerationMode, SynthesisMinimums};
use crate::pipeline::compile::is_placeholder;
use crate::types::{
    ApproachRow, AtomAssignment, CompareTable, GlossaryEntry, SectionCounts, StepAOutput, StepBOutput,
    StepBPlan,
};
use std::collections::BTreeSet;

const FALLBACK_NOTE: &str = "This document was assembled automatically from the extracted slide facts \
because the model-written synthesis could not be validated.";

fn atom_budget(mode: GenerationMode) -> usize {
    match mode {
        GenerationMode::StudyGuide => 12,
        GenerationMode::ExamCram => 16,
    }
}

/// Plan derived directly from Step A's exam atoms and discriminators.
pub fn fallback_plan(step_a: &StepAOutput, mode: GenerationMode, minimums: &SynthesisMinimums) -> StepBPlan {
    let mut seen = BTreeSet::new();
    let selected: Vec<String> = step_a
        .exam_atoms
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty() && !is_placeholder(a) && seen.insert(a.to_lowercase()))
        .take(atom_budget(mode))
        .map(str::to_string)
        .collect();

    let compare_topics: Vec<String> = step_a
        .discriminators
        .iter()
        .map(|d| d.topic.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    StepBPlan {
        atom_to_section_map: selected
            .iter()
            .map(|atom| AtomAssignment {
                atom: atom.clone(),
                section: "one_page_review".to_string(),
            })
            .collect(),
        section_counts: SectionCounts {
            high_yield_summary: minimums.high_yield_summary.max(8),
            rapid_approach: minimums.rapid_approach.max(3),
            one_page_review: minimums.one_page_review.max(selected.len()),
            compare_tables: usize::from(!compare_topics.is_empty()),
            quant_cutoffs: 0,
            pitfalls: minimums.pitfalls.max(3),
            glossary: minimums.glossary.max(step_a.abbrev_map.len()),
        },
        selected_exam_atoms: selected,
        compare_topics,
        warnings: vec!["Plan built deterministically from the extraction".to_string()],
    }
}

/// Distinct, non-placeholder items accumulated in order.
struct DistinctList {
    seen: BTreeSet<String>,
    items: Vec<String>,
}

impl DistinctList {
    fn new() -> Self {
        Self {
            seen: BTreeSet::new(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, item: impl Into<String>) -> bool {
        let item = item.into().trim().to_string();
        if item.is_empty() || is_placeholder(&item) || !self.seen.insert(item.to_lowercase()) {
            return false;
        }
        self.items.push(item);
        true
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    /// Pad with numbered coverage notes until `min` items exist.
    fn pad(&mut self, min: usize, section: &str) {
        let mut k = 1;
        while self.len() < min {
            self.push(format!(
                "Coverage note {k} ({section}): fewer distinct items were extracted than this section requires; review the source slides directly."
            ));
            k += 1;
        }
    }
}

/// Rapid-approach rows with distinct clues.
#[derive(Default)]
struct ApproachRows {
    clues: BTreeSet<String>,
    rows: Vec<ApproachRow>,
}

impl ApproachRows {
    fn add(&mut self, clue: String, think: String, next_step: String) {
        let clue = clue.trim().to_string();
        let think = think.trim().to_string();
        if clue.is_empty() || think.is_empty() || is_placeholder(&clue) || is_placeholder(&think) {
            return;
        }
        let next_step = if is_placeholder(&next_step) {
            String::new()
        } else {
            next_step.trim().to_string()
        };
        if self.clues.insert(clue.to_lowercase()) {
            self.rows.push(ApproachRow { clue, think, next_step });
        }
    }
}

fn cell(text: &str) -> String {
    if is_placeholder(text) {
        String::new()
    } else {
        text.trim().to_string()
    }
}

/// Minimal, always-valid synthesis document.
pub fn fallback_document(step_a: &StepAOutput, plan: &StepBPlan, minimums: &SynthesisMinimums) -> StepBOutput {
    // High-yield summary: distinct raw facts.
    let summary_target = minimums.high_yield_summary.max(plan.section_counts.high_yield_summary);
    let mut summary = DistinctList::new();
    for fact in &step_a.raw_facts {
        if summary.len() >= summary_target {
            break;
        }
        summary.push(format!("{} (slide {})", fact.text.trim(), fact.slide));
    }
    summary.pad(minimums.high_yield_summary.max(1), "high-yield summary");

    // One-page review: every selected atom, then slide titles.
    let mut review = DistinctList::new();
    for atom in &plan.selected_exam_atoms {
        review.push(atom.as_str());
    }
    for slide in &step_a.slides {
        if review.len() >= minimums.one_page_review.max(plan.selected_exam_atoms.len()) {
            break;
        }
        if !slide.title.trim().is_empty() {
            review.push(format!("Slide {}: {}", slide.slide_number, slide.title.trim()));
        }
    }
    review.pad(minimums.one_page_review, "one-page review");

    // Rapid approach: discriminators, then red flags, then slide titles.
    let approach_target = minimums.rapid_approach.max(3);
    let mut approach = ApproachRows::default();
    for d in &step_a.discriminators {
        let clue = if d.key_difference.trim().is_empty() {
            d.topic.clone()
        } else {
            d.key_difference.clone()
        };
        approach.add(clue, d.topic.clone(), format!("Distinguish from {}", d.versus.trim()));
    }
    for flag in &step_a.buckets.red_flags {
        approach.add(flag.clone(), "Red flag".to_string(), "Escalate per lecture guidance".to_string());
    }
    for slide in &step_a.slides {
        if approach.rows.len() >= approach_target {
            break;
        }
        if !slide.title.trim().is_empty() {
            approach.add(
                format!("Slide {}: {}", slide.slide_number, slide.title.trim()),
                format!("Review slide {}", slide.slide_number),
                String::new(),
            );
        }
    }
    let mut k = 1;
    while approach.rows.len() < minimums.rapid_approach {
        approach.add(
            format!("Coverage note {k} (rapid approach)"),
            "Work through the source slides for this pattern".to_string(),
            String::new(),
        );
        k += 1;
    }

    // Pitfalls: discriminator confusions, then padding.
    let mut pitfalls = DistinctList::new();
    for d in &step_a.discriminators {
        if !d.versus.trim().is_empty() {
            pitfalls.push(format!(
                "Do not confuse {} with {}: {}",
                d.topic.trim(),
                d.versus.trim(),
                d.key_difference.trim()
            ));
        }
    }
    pitfalls.pad(minimums.pitfalls, "pitfalls");

    // Compare table from discriminators.
    let compare_tables = if step_a.discriminators.is_empty() {
        Vec::new()
    } else {
        vec![CompareTable {
            title: "Key discriminators".to_string(),
            columns: vec!["Topic".into(), "Versus".into(), "Key difference".into()],
            rows: step_a
                .discriminators
                .iter()
                .map(|d| vec![cell(&d.topic), cell(&d.versus), cell(&d.key_difference)])
                .collect(),
        }]
    };

    // Glossary from the abbreviation map.
    let mut terms = BTreeSet::new();
    let mut glossary: Vec<GlossaryEntry> = step_a
        .abbrev_map
        .iter()
        .filter(|(t, d)| {
            !t.trim().is_empty() && !d.trim().is_empty() && !is_placeholder(t) && !is_placeholder(d)
        })
        .filter(|(t, _)| terms.insert(t.trim().to_lowercase()))
        .map(|(t, d)| GlossaryEntry {
            term: t.trim().to_string(),
            definition: d.trim().to_string(),
        })
        .collect();
    let mut k = 1;
    while glossary.len() < minimums.glossary {
        glossary.push(GlossaryEntry {
            term: format!("Coverage note {k}"),
            definition: "Term list incomplete; see the lecture slides.".to_string(),
        });
        k += 1;
    }

    StepBOutput {
        high_yield_summary: summary.items,
        rapid_approach: approach.rows,
        one_page_review: review.items,
        compare_tables,
        quant_cutoffs: Vec::new(),
        pitfalls: pitfalls.items,
        glossary,
        supplemental_notes: vec![FALLBACK_NOTE.to_string()],
    }
}

/// Plain-text outline derived from a document (used when the outline call fails).
pub fn fallback_outline(doc: &StepBOutput) -> String {
    let mut lines = Vec::new();
    let mut section = |heading: &str, items: Vec<String>| {
        lines.push(heading.to_string());
        lines.extend(items.into_iter().map(|i| format!("- {i}")));
    };
    section("HIGH-YIELD SUMMARY", doc.high_yield_summary.clone());
    section(
        "RAPID APPROACH",
        doc.rapid_approach
            .iter()
            .map(|r| format!("{} -> {}", r.clue, r.think))
            .collect(),
    );
    section("ONE-PAGE REVIEW", doc.one_page_review.clone());
    section(
        "COMPARE TABLES",
        doc.compare_tables.iter().map(|t| t.title.clone()).collect(),
    );
    section("PITFALLS", doc.pitfalls.clone());
    section(
        "GLOSSARY",
        doc.glossary.iter().map(|g| g.term.clone()).collect(),
    );
    lines.join("\n")
}
