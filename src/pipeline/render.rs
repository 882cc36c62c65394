//! Final document assembly: Step A + Step B + Step C + coverage → Markdown.
//!
//! The synthesis sections come first, then the Step A material they were
//! built from (slide-by-slide facts and tables, topic buckets,
//! discriminators, abbreviations), then the review and the QA appendix.
//!
//! Rendering is a pure function. It never calls the model and never drops
//! information about missing slides: whenever a range failed or was left
//! unprocessed, a "Coverage & QA" section lists it with the reason.
//!
//! ## Why coalesce ranges?
//!
//! Recursive splitting reports failures per leaf. A chunk `16–18` that fails
//! down to single slides produces three `failed` entries with the same kind;
//! readers want one line, `Slide 16–18: JSON appears truncated.`, so
//! adjacent ranges with the same reason are merged before rendering.

use crate::config::GenerationMode;
use crate::pipeline::extract::FailedRange;
use crate::types::{Buckets, ChunkRange, SlideExtraction, StepAOutput, StepBOutput, StepCOutput};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Reader-facing reason for ranges skipped by the time budget.
pub const UNPROCESSED_REASON: &str = "Not processed (time budget exhausted)";

// ── Coverage ─────────────────────────────────────────────────────────────

/// Which slides made it into the document, and why the others did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub total_slides: usize,
    pub processed_slides: usize,
    pub ok_ranges: Vec<ChunkRange>,
    /// Coalesced: adjacent ranges with the same failure kind are merged.
    pub failed: Vec<FailedRange>,
    /// Coalesced.
    pub unprocessed: Vec<ChunkRange>,
    #[serde(skip)]
    slide_numbers: Vec<u32>,
}

impl CoverageReport {
    pub fn new(
        slide_numbers: &[u32],
        mut ok_ranges: Vec<ChunkRange>,
        failed: Vec<FailedRange>,
        unprocessed: Vec<ChunkRange>,
    ) -> Self {
        ok_ranges.sort();
        let processed_slides = slide_numbers
            .iter()
            .filter(|n| ok_ranges.iter().any(|r| r.contains(**n)))
            .count();

        Self {
            total_slides: slide_numbers.len(),
            processed_slides,
            ok_ranges,
            failed: coalesce_failed(failed, slide_numbers),
            unprocessed: coalesce_ranges(unprocessed, slide_numbers),
            slide_numbers: slide_numbers.to_vec(),
        }
    }

    /// `true` when every slide is represented.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.unprocessed.is_empty()
    }

    /// Failed and unprocessed ranges, in slide order.
    pub fn missing_ranges(&self) -> Vec<ChunkRange> {
        let mut ranges: Vec<ChunkRange> = self
            .failed
            .iter()
            .map(|f| f.range)
            .chain(self.unprocessed.iter().copied())
            .collect();
        ranges.sort();
        ranges
    }

    /// Check that ok, failed and unprocessed ranges cover every slide
    /// exactly once.
    pub fn verify_tiling(&self) -> Result<(), String> {
        let all: Vec<ChunkRange> = self
            .ok_ranges
            .iter()
            .copied()
            .chain(self.missing_ranges())
            .collect();

        for n in &self.slide_numbers {
            match all.iter().filter(|r| r.contains(*n)).count() {
                1 => {}
                0 => return Err(format!("slide {n} is not covered by any range")),
                k => return Err(format!("slide {n} is covered by {k} ranges")),
            }
        }
        for (i, a) in all.iter().enumerate() {
            if let Some(b) = all[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(format!("ranges {a} and {b} overlap"));
            }
        }
        Ok(())
    }
}

/// `b` starts at the first slide after `a` ends.
fn adjacent(a: ChunkRange, b: ChunkRange, slide_numbers: &[u32]) -> bool {
    b.start > a.end && !slide_numbers.iter().any(|&n| n > a.end && n < b.start)
}

fn coalesce_ranges(mut ranges: Vec<ChunkRange>, slide_numbers: &[u32]) -> Vec<ChunkRange> {
    ranges.sort();
    let mut out: Vec<ChunkRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match out.last_mut() {
            Some(last) if adjacent(*last, r, slide_numbers) => last.end = r.end,
            _ => out.push(r),
        }
    }
    out
}

fn coalesce_failed(mut failed: Vec<FailedRange>, slide_numbers: &[u32]) -> Vec<FailedRange> {
    failed.sort_by_key(|f| f.range);
    let mut out: Vec<FailedRange> = Vec::with_capacity(failed.len());
    for f in failed {
        match out.last_mut() {
            Some(last)
                if last.failure.kind == f.failure.kind && adjacent(last.range, f.range, slide_numbers) =>
            {
                last.range.end = f.range.end;
            }
            _ => out.push(f),
        }
    }
    out
}

/// One QA line per missing range, e.g. `Slide 16–18: JSON appears truncated.`
pub fn qa_lines(coverage: &CoverageReport) -> Vec<String> {
    let mut lines: Vec<(ChunkRange, String)> = coverage
        .failed
        .iter()
        .map(|f| (f.range, qa_line(f.range, f.failure.kind.describe())))
        .chain(
            coverage
                .unprocessed
                .iter()
                .map(|r| (*r, qa_line(*r, UNPROCESSED_REASON))),
        )
        .collect();
    lines.sort_by_key(|(r, _)| *r);
    lines.into_iter().map(|(_, l)| l).collect()
}

fn qa_line(range: ChunkRange, reason: &str) -> String {
    format!("Slide {range}: {reason}.")
}

// ── Document ─────────────────────────────────────────────────────────────

/// Everything the renderer reads.
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub mode: GenerationMode,
    pub step_a: &'a StepAOutput,
    pub step_b: &'a StepBOutput,
    pub step_c: &'a StepCOutput,
    pub coverage: &'a CoverageReport,
    /// Degradation notes (fallback synthesis etc.) shown in the QA section.
    pub notes: &'a [String],
}

fn mode_title(mode: GenerationMode) -> &'static str {
    match mode {
        GenerationMode::StudyGuide => "Study Guide",
        GenerationMode::ExamCram => "Exam Cram Sheet",
    }
}

fn cell(text: &str) -> String {
    text.trim().replace('|', "\\|").replace('\n', " ")
}

fn table(out: &mut String, columns: &[&str], rows: impl Iterator<Item = Vec<String>>) {
    let _ = writeln!(out, "| {} |", columns.iter().map(|c| cell(c)).collect::<Vec<_>>().join(" | "));
    let _ = writeln!(out, "|{}|", vec!["---"; columns.len()].join("|"));
    for row in rows {
        let _ = writeln!(out, "| {} |", row.iter().map(|c| cell(c)).collect::<Vec<_>>().join(" | "));
    }
    out.push('\n');
}

fn bullets(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {heading}\n");
    for item in items {
        let _ = writeln!(out, "- {}", item.trim());
    }
    out.push('\n');
}

fn bucket_label(name: &str) -> &'static str {
    match name {
        "dx" => "Diagnosis",
        "pathophys" => "Pathophysiology",
        "clinical" => "Clinical features",
        "labs" => "Labs",
        "imaging" => "Imaging",
        "treatment" => "Treatment",
        "complications" => "Complications",
        "risk_factors" => "Risk factors",
        "epidemiology" => "Epidemiology",
        "red_flags" => "Red flags",
        _ => "Buzzwords",
    }
}

fn slide_notes(out: &mut String, slide: &SlideExtraction) {
    let title = slide.title.trim();
    if title.is_empty() {
        let _ = writeln!(out, "### Slide {}\n", slide.slide_number);
    } else {
        let _ = writeln!(out, "### Slide {}: {}\n", slide.slide_number, title);
    }
    for section in &slide.sections {
        if section.facts.is_empty() {
            continue;
        }
        if !section.heading.trim().is_empty() {
            let _ = writeln!(out, "**{}**\n", section.heading.trim());
        }
        for fact in &section.facts {
            let _ = writeln!(out, "- {}", fact.trim());
        }
        out.push('\n');
    }
    for t in &slide.tables {
        if t.columns.is_empty() {
            continue;
        }
        if !t.title.trim().is_empty() {
            let _ = writeln!(out, "**{}**\n", t.title.trim());
        }
        let columns: Vec<&str> = t.columns.iter().map(String::as_str).collect();
        table(out, &columns, t.rows.iter().cloned());
    }
    if !slide.exam_clues.is_empty() {
        for clue in &slide.exam_clues {
            let _ = writeln!(out, "- _Exam clue:_ {}", clue.trim());
        }
        out.push('\n');
    }
}

fn topic_buckets(out: &mut String, buckets: &Buckets) {
    if buckets.is_empty() {
        return;
    }
    out.push_str("## Topic Buckets\n\n");
    for (name, items) in buckets.entries() {
        if !items.is_empty() {
            let joined: Vec<&str> = items.iter().map(|i| i.trim()).collect();
            let _ = writeln!(out, "- **{}**: {}", bucket_label(name), joined.join("; "));
        }
    }
    out.push('\n');
}

/// Step A content: per-slide facts and tables, topic buckets,
/// discriminators and the abbreviation list.
fn step_a_sections(out: &mut String, step_a: &StepAOutput) {
    let has_notes = step_a
        .slides
        .iter()
        .any(|s| s.fact_count() > 0 || !s.tables.is_empty() || !s.exam_clues.is_empty());
    if has_notes {
        out.push_str("## Slide-by-Slide Notes\n\n");
        for slide in &step_a.slides {
            slide_notes(out, slide);
        }
    }

    topic_buckets(out, &step_a.buckets);

    if !step_a.discriminators.is_empty() {
        out.push_str("## Discriminators\n\n");
        table(
            out,
            &["Topic", "Versus", "Key difference"],
            step_a
                .discriminators
                .iter()
                .map(|d| vec![d.topic.clone(), d.versus.clone(), d.key_difference.clone()]),
        );
    }

    if !step_a.abbrev_map.is_empty() {
        out.push_str("## Abbreviations\n\n");
        for (abbrev, expansion) in &step_a.abbrev_map {
            let _ = writeln!(out, "- **{}**: {}", abbrev.trim(), expansion.trim());
        }
        out.push('\n');
    }
}

/// Render the final Markdown document.
pub fn render_document(input: &RenderInput<'_>) -> String {
    let RenderInput {
        mode,
        step_a,
        step_b,
        step_c,
        coverage,
        notes,
    } = *input;
    let mut out = String::new();

    let _ = writeln!(out, "# {}: {}\n", step_a.lecture_title.trim(), mode_title(mode));
    let _ = writeln!(
        out,
        "_Slides covered: {} of {}._\n",
        coverage.processed_slides, coverage.total_slides
    );

    bullets(&mut out, "High-Yield Summary", &step_b.high_yield_summary);

    if !step_b.rapid_approach.is_empty() {
        out.push_str("## Rapid Approach\n\n");
        table(
            &mut out,
            &["Clue", "Think", "Next step"],
            step_b
                .rapid_approach
                .iter()
                .map(|r| vec![r.clue.clone(), r.think.clone(), r.next_step.clone()]),
        );
    }

    bullets(&mut out, "One-Page Review", &step_b.one_page_review);

    if !step_b.compare_tables.is_empty() {
        out.push_str("## Compare Tables\n\n");
        for t in &step_b.compare_tables {
            if !t.title.trim().is_empty() {
                let _ = writeln!(out, "### {}\n", t.title.trim());
            }
            let columns: Vec<&str> = t.columns.iter().map(String::as_str).collect();
            table(&mut out, &columns, t.rows.iter().cloned());
        }
    }

    if !step_b.quant_cutoffs.is_empty() {
        out.push_str("## Quantitative Cutoffs\n\n");
        table(
            &mut out,
            &["Item", "Value", "Significance"],
            step_b
                .quant_cutoffs
                .iter()
                .map(|c| vec![c.item.clone(), c.value.clone(), c.significance.clone()]),
        );
    }

    bullets(&mut out, "Pitfalls", &step_b.pitfalls);

    if !step_b.glossary.is_empty() {
        out.push_str("## Glossary\n\n");
        for g in &step_b.glossary {
            let _ = writeln!(out, "- **{}**: {}", g.term.trim(), g.definition.trim());
        }
        out.push('\n');
    }

    bullets(&mut out, "Supplemental Notes", &step_b.supplemental_notes);

    step_a_sections(&mut out, step_a);

    out.push_str("## Quality Review\n\n");
    let _ = writeln!(out, "Coverage confidence: **{}**\n", step_c.coverage_confidence);
    for (heading, items) in [
        ("Possible omissions", &step_c.omissions),
        ("Conflicts", &step_c.conflicts),
        ("Unparsed items", &step_c.unparsed_items),
    ] {
        if !items.is_empty() {
            let _ = writeln!(out, "### {heading}\n");
            for item in items {
                let _ = writeln!(out, "- {}", item.trim());
            }
            out.push('\n');
        }
    }

    if !coverage.is_complete() || !notes.is_empty() {
        out.push_str("## Coverage & QA\n\n");
        if !coverage.is_complete() {
            let _ = writeln!(
                out,
                "This document is incomplete: {} of {} slides are represented.\n",
                coverage.processed_slides, coverage.total_slides
            );
            for line in qa_lines(coverage) {
                let _ = writeln!(out, "- {line}");
            }
            out.push('\n');
        }
        for note in notes {
            let _ = writeln!(out, "- {}", note.trim());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, StageFailure};
    use crate::types::{ApproachRow, CompareTable, FactSection, FactTable, GlossaryEntry};

    fn failed(start: u32, end: u32, kind: FailureKind) -> FailedRange {
        FailedRange {
            range: ChunkRange::new(start, end),
            failure: StageFailure::new(kind, "detail"),
        }
    }

    fn numbers(n: u32) -> Vec<u32> {
        (1..=n).collect()
    }

    #[test]
    fn single_slide_failures_coalesce_into_one_line() {
        let cov = CoverageReport::new(
            &numbers(40),
            vec![ChunkRange::new(1, 12), ChunkRange::new(13, 15), ChunkRange::new(19, 40)],
            vec![
                failed(17, 17, FailureKind::Truncated),
                failed(16, 16, FailureKind::Truncated),
                failed(18, 18, FailureKind::Truncated),
            ],
            vec![],
        );
        assert_eq!(cov.failed.len(), 1);
        assert_eq!(cov.processed_slides, 37);
        assert_eq!(qa_lines(&cov), vec!["Slide 16\u{2013}18: JSON appears truncated.".to_string()]);
        assert!(cov.verify_tiling().is_ok());
    }

    #[test]
    fn different_kinds_stay_separate() {
        let cov = CoverageReport::new(
            &numbers(6),
            vec![ChunkRange::new(1, 4)],
            vec![failed(5, 5, FailureKind::Truncated), failed(6, 6, FailureKind::Schema)],
            vec![],
        );
        assert_eq!(
            qa_lines(&cov),
            vec![
                "Slide 5: JSON appears truncated.".to_string(),
                "Slide 6: JSON did not match the expected structure.".to_string(),
            ]
        );
    }

    #[test]
    fn unprocessed_ranges_coalesce_across_numbering_gaps() {
        let slides = vec![1, 2, 3, 10, 11, 12];
        let cov = CoverageReport::new(
            &slides,
            vec![ChunkRange::new(1, 3)],
            vec![],
            vec![ChunkRange::new(11, 12), ChunkRange::new(10, 10)],
        );
        assert_eq!(cov.unprocessed, vec![ChunkRange::new(10, 12)]);
        assert_eq!(
            qa_lines(&cov),
            vec!["Slide 10\u{2013}12: Not processed (time budget exhausted).".to_string()]
        );
        assert!(cov.verify_tiling().is_ok());
    }

    #[test]
    fn tiling_detects_gaps_and_overlaps() {
        let gap = CoverageReport::new(&numbers(6), vec![ChunkRange::new(1, 4)], vec![], vec![]);
        assert!(gap.verify_tiling().unwrap_err().contains("slide 5"));

        let overlap = CoverageReport::new(
            &numbers(6),
            vec![ChunkRange::new(1, 4), ChunkRange::new(4, 6)],
            vec![],
            vec![],
        );
        assert!(overlap.verify_tiling().is_err());
    }

    fn sample_b() -> StepBOutput {
        StepBOutput {
            high_yield_summary: vec!["Hyperkalemia peaks T waves".into()],
            rapid_approach: vec![ApproachRow {
                clue: "Peaked T | wide QRS".into(),
                think: "Hyperkalemia".into(),
                next_step: "Calcium gluconate".into(),
            }],
            compare_tables: vec![CompareTable {
                title: "K+ disorders".into(),
                columns: vec!["Disorder".into(), "ECG".into()],
                rows: vec![vec!["Hypo".into(), "U waves".into()]],
            }],
            glossary: vec![GlossaryEntry {
                term: "ECG".into(),
                definition: "Electrocardiogram".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn complete_document_has_no_qa_section() {
        let a = StepAOutput {
            lecture_title: "Electrolytes".into(),
            ..Default::default()
        };
        let b = sample_b();
        let c = StepCOutput::default();
        let cov = CoverageReport::new(&numbers(3), vec![ChunkRange::new(1, 3)], vec![], vec![]);
        let md = render_document(&RenderInput {
            mode: GenerationMode::StudyGuide,
            step_a: &a,
            step_b: &b,
            step_c: &c,
            coverage: &cov,
            notes: &[],
        });
        assert!(md.starts_with("# Electrolytes: Study Guide\n"));
        assert!(md.contains("## High-Yield Summary\n\n- Hyperkalemia peaks T waves\n"));
        assert!(md.contains("| Peaked T \\| wide QRS | Hyperkalemia | Calcium gluconate |"));
        assert!(md.contains("### K+ disorders"));
        assert!(md.contains("- **ECG**: Electrocardiogram"));
        assert!(md.contains("Coverage confidence: **medium**"));
        assert!(!md.contains("## Coverage & QA"));
    }

    #[test]
    fn step_a_facts_tables_and_abbreviations_are_rendered() {
        let mut a = StepAOutput {
            lecture_title: "Acute Kidney Injury".into(),
            slides: vec![SlideExtraction {
                slide_number: 4,
                title: "KDIGO criteria".into(),
                sections: vec![FactSection {
                    heading: "Definition".into(),
                    facts: vec!["Creatinine rise >= 0.3 mg/dL in 48h".into()],
                }],
                tables: vec![FactTable {
                    title: "Stages".into(),
                    columns: vec!["Stage".into(), "Creatinine".into()],
                    rows: vec![vec!["1".into(), "1.5-1.9x baseline".into()]],
                }],
                exam_clues: vec!["Oliguria < 0.5 mL/kg/h".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        a.abbrev_map.insert("AKI".into(), "acute kidney injury".into());
        a.buckets.labs = vec!["Creatinine".into(), "Urine output".into()];
        let b = StepBOutput::default();
        let c = StepCOutput::default();
        let cov = CoverageReport::new(&[4], vec![ChunkRange::new(4, 4)], vec![], vec![]);
        let md = render_document(&RenderInput {
            mode: GenerationMode::StudyGuide,
            step_a: &a,
            step_b: &b,
            step_c: &c,
            coverage: &cov,
            notes: &[],
        });
        assert!(md.contains("## Slide-by-Slide Notes\n\n### Slide 4: KDIGO criteria\n"));
        assert!(md.contains("**Definition**\n\n- Creatinine rise >= 0.3 mg/dL in 48h\n"));
        assert!(md.contains("| 1 | 1.5-1.9x baseline |"));
        assert!(md.contains("- _Exam clue:_ Oliguria < 0.5 mL/kg/h"));
        assert!(md.contains("- **Labs**: Creatinine; Urine output"));
        assert!(md.contains("## Abbreviations\n\n- **AKI**: acute kidney injury\n"));
        assert!(md.find("## Abbreviations").unwrap() < md.find("## Quality Review").unwrap());
    }

    #[test]
    fn incomplete_document_lists_missing_ranges_and_notes() {
        let a = StepAOutput {
            lecture_title: "Electrolytes".into(),
            ..Default::default()
        };
        let b = sample_b();
        let c = StepCOutput::default();
        let cov = CoverageReport::new(
            &numbers(18),
            vec![ChunkRange::new(1, 15)],
            vec![failed(16, 18, FailureKind::Truncated)],
            vec![],
        );
        let notes = vec!["Pack call failed (PARSE); using fallback synthesis".to_string()];
        let md = render_document(&RenderInput {
            mode: GenerationMode::ExamCram,
            step_a: &a,
            step_b: &b,
            step_c: &c,
            coverage: &cov,
            notes: &notes,
        });
        assert!(md.starts_with("# Electrolytes: Exam Cram Sheet\n"));
        assert!(md.contains("## Coverage & QA"));
        assert!(md.contains("15 of 18 slides are represented"));
        assert!(md.contains("- Slide 16\u{2013}18: JSON appears truncated."));
        assert!(md.contains("- Pack call failed (PARSE); using fallback synthesis"));
    }
}
