//! Data model shared by every pipeline stage.
//!
//! Everything here is plain `serde` data: slides parsed from the input, the
//! JSON contracts the LLM must honour at each stage, and the merged documents
//! the renderer consumes. Stage logic lives in [`crate::pipeline`]; nothing in
//! this module talks to the network or the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel body for a slide that is present but carries no text.
pub const NO_TEXT: &str = "[NO TEXT]";

// ── Input ────────────────────────────────────────────────────────────────

/// One numbered unit of source content. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    pub number: u32,
    pub page_label: String,
    pub body_text: String,
}

impl Slide {
    pub fn is_empty(&self) -> bool {
        self.body_text == NO_TEXT
    }
}

/// Inclusive slide-number range, e.g. `13–18`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u32,
    pub end: u32,
}

impl ChunkRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slide: u32) -> bool {
        slide >= self.start && slide <= self.end
    }

    pub fn contains_range(&self, other: &ChunkRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}\u{2013}{}", self.start, self.end)
        }
    }
}

// ── Step A ───────────────────────────────────────────────────────────────

/// A headed group of facts on one slide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSection {
    #[serde(default)]
    pub heading: String,
    #[serde(default)]
    pub facts: Vec<String>,
}

/// A table transcribed from a slide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactTable {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// Structured extraction of a single slide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideExtraction {
    pub slide_number: u32,
    #[serde(default)]
    pub page_label: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<FactSection>,
    #[serde(default)]
    pub tables: Vec<FactTable>,
    #[serde(default)]
    pub exam_clues: Vec<String>,
}

impl SlideExtraction {
    pub fn fact_count(&self) -> usize {
        self.sections.iter().map(|s| s.facts.len()).sum()
    }
}

/// Raw per-chunk extraction as returned by the model (after validation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAChunkOutput {
    #[serde(default)]
    pub lecture_title: String,
    pub chunk: ChunkRange,
    pub slides: Vec<SlideExtraction>,
}

/// Ordered, deduplicated union of all successful chunk outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedExtraction {
    pub lecture_title: String,
    pub slides: Vec<SlideExtraction>,
}

/// Topic buckets derived across the whole lecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Buckets {
    pub dx: Vec<String>,
    pub pathophys: Vec<String>,
    pub clinical: Vec<String>,
    pub labs: Vec<String>,
    pub imaging: Vec<String>,
    pub treatment: Vec<String>,
    pub complications: Vec<String>,
    pub risk_factors: Vec<String>,
    pub epidemiology: Vec<String>,
    pub red_flags: Vec<String>,
    pub buzzwords: Vec<String>,
}

impl Buckets {
    /// Field names in display order; also the keys the derive prompt asks for.
    pub const NAMES: [&'static str; 11] = [
        "dx",
        "pathophys",
        "clinical",
        "labs",
        "imaging",
        "treatment",
        "complications",
        "risk_factors",
        "epidemiology",
        "red_flags",
        "buzzwords",
    ];

    /// `(name, items)` pairs in display order.
    pub fn entries(&self) -> [(&'static str, &Vec<String>); 11] {
        [
            ("dx", &self.dx),
            ("pathophys", &self.pathophys),
            ("clinical", &self.clinical),
            ("labs", &self.labs),
            ("imaging", &self.imaging),
            ("treatment", &self.treatment),
            ("complications", &self.complications),
            ("risk_factors", &self.risk_factors),
            ("epidemiology", &self.epidemiology),
            ("red_flags", &self.red_flags),
            ("buzzwords", &self.buzzwords),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, items)| items.is_empty())
    }

    pub fn total(&self) -> usize {
        self.entries().iter().map(|(_, items)| items.len()).sum()
    }
}

/// "How to tell A from B" record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discriminator {
    pub topic: String,
    #[serde(default)]
    pub versus: String,
    #[serde(default)]
    pub key_difference: String,
    #[serde(default)]
    pub slides: Vec<u32>,
}

/// Slide range a topic was taught from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub label: String,
    pub start_slide: u32,
    pub end_slide: u32,
}

/// Cross-cutting structures returned by the derive call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedStructures {
    pub buckets: Buckets,
    pub discriminators: Vec<Discriminator>,
    pub exam_atoms: Vec<String>,
    pub abbrev_map: BTreeMap<String, String>,
    pub source_spans: Vec<SourceSpan>,
}

/// One fact flattened out of the merged slides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFact {
    pub slide: u32,
    pub text: String,
}

/// The complete Step A document. Never mutated after Step A completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAOutput {
    pub lecture_title: String,
    pub slides: Vec<SlideExtraction>,
    pub raw_facts: Vec<RawFact>,
    pub buckets: Buckets,
    pub discriminators: Vec<Discriminator>,
    pub exam_atoms: Vec<String>,
    pub abbrev_map: BTreeMap<String, String>,
    pub source_spans: Vec<SourceSpan>,
}

impl StepAOutput {
    /// Combine the merged extraction with the derived structures.
    pub fn assemble(merged: MergedExtraction, derived: DerivedStructures) -> Self {
        let raw_facts = merged
            .slides
            .iter()
            .flat_map(|s| {
                s.sections.iter().flat_map(move |sec| {
                    sec.facts.iter().map(move |f| RawFact {
                        slide: s.slide_number,
                        text: f.clone(),
                    })
                })
            })
            .collect();

        Self {
            lecture_title: merged.lecture_title,
            slides: merged.slides,
            raw_facts,
            buckets: derived.buckets,
            discriminators: derived.discriminators,
            exam_atoms: derived.exam_atoms,
            abbrev_map: derived.abbrev_map,
            source_spans: derived.source_spans,
        }
    }

    pub fn table_count(&self) -> usize {
        self.slides.iter().map(|s| s.tables.len()).sum()
    }
}

// ── Step B ───────────────────────────────────────────────────────────────

/// Target item counts per synthesis section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionCounts {
    pub high_yield_summary: usize,
    pub rapid_approach: usize,
    pub one_page_review: usize,
    pub compare_tables: usize,
    pub quant_cutoffs: usize,
    pub pitfalls: usize,
    pub glossary: usize,
}

/// Which section an exam atom is meant to land in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomAssignment {
    pub atom: String,
    pub section: String,
}

/// Content-allocation plan, read-only for every later Step B sub-stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepBPlan {
    pub selected_exam_atoms: Vec<String>,
    pub section_counts: SectionCounts,
    pub compare_topics: Vec<String>,
    pub atom_to_section_map: Vec<AtomAssignment>,
    pub warnings: Vec<String>,
}

/// One row of the rapid-approach table: clue → think → next step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproachRow {
    #[serde(default)]
    pub clue: String,
    #[serde(default)]
    pub think: String,
    #[serde(default)]
    pub next_step: String,
}

/// A compare / differential table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareTable {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantCutoff {
    #[serde(default)]
    pub item: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub significance: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    #[serde(default)]
    pub term: String,
    #[serde(default)]
    pub definition: String,
}

/// The synthesis document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepBOutput {
    pub high_yield_summary: Vec<String>,
    pub rapid_approach: Vec<ApproachRow>,
    pub one_page_review: Vec<String>,
    pub compare_tables: Vec<CompareTable>,
    pub quant_cutoffs: Vec<QuantCutoff>,
    pub pitfalls: Vec<String>,
    pub glossary: Vec<GlossaryEntry>,
    pub supplemental_notes: Vec<String>,
}

impl StepBOutput {
    /// Every piece of text in the document, lower-cased, newline-joined.
    /// Used for exam-atom coverage checks.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        parts.extend(self.high_yield_summary.iter().map(String::as_str));
        for row in &self.rapid_approach {
            parts.extend([row.clue.as_str(), row.think.as_str(), row.next_step.as_str()]);
        }
        parts.extend(self.one_page_review.iter().map(String::as_str));
        for table in &self.compare_tables {
            parts.push(&table.title);
            parts.extend(table.columns.iter().map(String::as_str));
            for row in &table.rows {
                parts.extend(row.iter().map(String::as_str));
            }
        }
        for c in &self.quant_cutoffs {
            parts.extend([c.item.as_str(), c.value.as_str(), c.significance.as_str()]);
        }
        parts.extend(self.pitfalls.iter().map(String::as_str));
        for g in &self.glossary {
            parts.extend([g.term.as_str(), g.definition.as_str()]);
        }
        parts.extend(self.supplemental_notes.iter().map(String::as_str));
        parts.join("\n").to_lowercase()
    }
}

// ── Step C ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageConfidence {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for CoverageConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoverageConfidence::High => "high",
            CoverageConfidence::Medium => "medium",
            CoverageConfidence::Low => "low",
        })
    }
}

/// Quality-review record. The default is "medium confidence, nothing flagged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepCOutput {
    pub coverage_confidence: CoverageConfidence,
    pub unparsed_items: Vec<String>,
    pub omissions: Vec<String>,
    pub conflicts: Vec<String>,
    pub checks: BTreeMap<String, bool>,
}

impl StepCOutput {
    pub fn has_findings(&self) -> bool {
        !(self.unparsed_items.is_empty() && self.omissions.is_empty() && self.conflicts.is_empty())
    }
}
