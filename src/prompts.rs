//! Prompt templates for every LLM call in the pipeline.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing what a stage asks for requires
//!    editing exactly one place.
//!
//! 2. **Cache invalidation**: [`EXTRACTION_PROMPT_TEMPLATE`] is hashed into the
//!    prompt version (see [`prompt_version`]). Editing it makes every cached
//!    chunk extraction unreachable on the next run, without touching the store.
//!
//! Templates use `{placeholder}` markers filled by the `build_*` functions
//! below. Unit tests inspect the built prompts directly.

use crate::config::{GenerationMode, SynthesisMinimums};
use crate::types::ChunkRange;
use sha2::{Digest, Sha256};

/// System message sent with every call.
pub const SYSTEM_PROMPT: &str = "You are a meticulous medical educator who turns lecture slides into \
exam-focused study material. You never invent facts that are not supported by the material you are given.";

/// Extra system instruction for calls that must return JSON.
pub const JSON_SYSTEM_SUFFIX: &str = " Respond with a single JSON object and nothing else.";

/// Appended to a prompt for the second ("strict") attempt of any JSON stage.
pub const STRICT_JSON_SUFFIX: &str = r#"

STRICT OUTPUT MODE
Your previous answer could not be used. Return ONLY one JSON object.
- No Markdown fences, no commentary before or after the object.
- Escape every double quote inside string values as \".
- No trailing commas. Close every bracket and brace.
- Keep each fact short so the whole object fits in the output budget."#;

/// Per-chunk extraction prompt (Step A).
pub const EXTRACTION_PROMPT_TEMPLATE: &str = r#"Extract every testable fact from the lecture slides below.

Lecture: {lecture_title}
Document type: {mode}
Slides in this chunk: {chunk_range}

Return one JSON object with this exact shape:
{
  "lecture_title": "string",
  "slides": [
    {
      "slide_number": 0,
      "page_label": "string",
      "title": "string",
      "sections": [{"heading": "string", "facts": ["string"]}],
      "tables": [{"title": "string", "columns": ["string"], "rows": [["string"]]}],
      "exam_clues": ["string"]
    }
  ]
}

Rules:
1. Include one entry per slide, using the slide numbers given in the [[SLIDE n | label]] tags.
   Every slide_number must be between {chunk_start} and {chunk_end}.
2. A slide whose body is [NO TEXT] still gets an entry with empty sections.
3. Copy numbers, doses, cutoffs, and eponyms exactly as written.
4. Transcribe tables row by row; every row has as many cells as there are columns.
5. exam_clues lists phrases a question writer would use to point at this slide's topic.

SLIDES
{slides}"#;

const DERIVE_PROMPT_TEMPLATE: &str = r#"Below is the merged fact extraction for the lecture "{lecture_title}".
Derive cross-cutting study structures from it.

Return one JSON object with this exact shape:
{
  "buckets": {
    "dx": [], "pathophys": [], "clinical": [], "labs": [], "imaging": [], "treatment": [],
    "complications": [], "risk_factors": [], "epidemiology": [], "red_flags": [], "buzzwords": []
  },
  "discriminators": [{"topic": "string", "versus": "string", "key_difference": "string", "slides": [0]}],
  "exam_atoms": ["string"],
  "abbrev_map": {"ABBR": "expansion"},
  "source_spans": [{"label": "string", "start_slide": 0, "end_slide": 0}]
}

Rules:
1. Bucket items are short noun phrases taken from the extraction.
2. exam_atoms are single, self-contained testable statements (one fact each).
3. source_spans give the slide range each major topic was taught in.
4. Use only information present in the extraction.

EXTRACTION
{extraction}"#;

const PLAN_PROMPT_TEMPLATE: &str = r#"Plan a {mode_label} for the lecture "{lecture_title}".

You are given the lecture's exam atoms, discriminators, and topic buckets.
Decide which exam atoms the document must cover and how many items each section gets.

Minimum item counts: high_yield_summary {min_summary}, one_page_review {min_review},
rapid_approach {min_approach}, pitfalls {min_pitfalls}, glossary {min_glossary}.

Return one JSON object with this exact shape:
{
  "selected_exam_atoms": ["string"],
  "section_counts": {
    "high_yield_summary": 0, "rapid_approach": 0, "one_page_review": 0,
    "compare_tables": 0, "quant_cutoffs": 0, "pitfalls": 0, "glossary": 0
  },
  "compare_topics": ["string"],
  "atom_to_section_map": [{"atom": "string", "section": "string"}],
  "warnings": ["string"]
}

Select exam atoms verbatim from the list; do not reword them.

LECTURE OVERVIEW
{overview}"#;

const OUTLINE_PROMPT_TEMPLATE: &str = r#"Write a plain-text outline for a {mode_label} on "{lecture_title}".

Follow the plan below. Use one line per planned item, grouped under these headings:
HIGH-YIELD SUMMARY, RAPID APPROACH, ONE-PAGE REVIEW, COMPARE TABLES, QUANTITATIVE CUTOFFS,
PITFALLS, GLOSSARY. Do not return JSON.

PLAN
{plan}"#;

const PACK_PROMPT_TEMPLATE: &str = r#"Turn the outline into the final {mode_label} for "{lecture_title}".

Use the full extraction for exact wording, numbers, and table contents.
Every selected exam atom from the plan must appear verbatim somewhere in the document.

Return one JSON object with this exact shape:
{
  "high_yield_summary": ["string"],
  "rapid_approach": [{"clue": "string", "think": "string", "next_step": "string"}],
  "one_page_review": ["string"],
  "compare_tables": [{"title": "string", "columns": ["string"], "rows": [["string"]]}],
  "quant_cutoffs": [{"item": "string", "value": "string", "significance": "string"}],
  "pitfalls": ["string"],
  "glossary": [{"term": "string", "definition": "string"}],
  "supplemental_notes": ["string"]
}

Minimum item counts: high_yield_summary {min_summary}, one_page_review {min_review},
rapid_approach {min_approach}, pitfalls {min_pitfalls}, glossary {min_glossary}.
Never use placeholder text such as TBD, TODO, N/A, or "...".

PLAN
{plan}

OUTLINE
{outline}

EXTRACTION
{extraction}"#;

const REWRITE_PROMPT_TEMPLATE: &str = r#"The {mode_label} JSON below failed validation.
Fix exactly these problems and keep everything else unchanged:

{failures}

Return the corrected document as one JSON object with the same shape.

PLAN
{plan}

DOCUMENT
{document}"#;

const REDRAFT_PROMPT_TEMPLATE: &str = r#"Draft a {mode_label} for "{lecture_title}" from scratch.

HARD MINIMUMS (the document is rejected if any is missed):
- high_yield_summary: at least {min_summary} distinct bullets
- one_page_review: at least {min_review} distinct bullets
- rapid_approach: at least {min_approach} rows, each with clue and think
- pitfalls: at least {min_pitfalls} distinct items
- glossary: at least {min_glossary} entries

Include every selected exam atom verbatim. No placeholders, no duplicate items.

Return one JSON object with this exact shape:
{
  "high_yield_summary": ["string"],
  "rapid_approach": [{"clue": "string", "think": "string", "next_step": "string"}],
  "one_page_review": ["string"],
  "compare_tables": [{"title": "string", "columns": ["string"], "rows": [["string"]]}],
  "quant_cutoffs": [{"item": "string", "value": "string", "significance": "string"}],
  "pitfalls": ["string"],
  "glossary": [{"term": "string", "definition": "string"}],
  "supplemental_notes": ["string"]
}

PLAN
{plan}

EXTRACTION
{extraction}"#;

const REVIEW_PROMPT_TEMPLATE: &str = r#"Review the coverage of a generated {mode_label}.

You are given compact statistics about the source extraction and the generated document,
not the documents themselves. Flag likely omissions and internal conflicts.

Return one JSON object with this exact shape:
{
  "coverage_confidence": "high | medium | low",
  "unparsed_items": ["string"],
  "omissions": ["string"],
  "conflicts": ["string"],
  "checks": {"summary_present": true, "tables_present": true, "glossary_present": true}
}

STATISTICS
{stats}"#;

/// Stable hash of the extraction prompt template plus the pipeline version.
///
/// First 16 hex characters of SHA-256 over `template \0 pipeline_version`.
pub fn prompt_version(pipeline_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(EXTRACTION_PROMPT_TEMPLATE.as_bytes());
    hasher.update([0u8]);
    hasher.update(pipeline_version.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Append the strict-JSON instruction block.
pub fn strict_variant(prompt: &str) -> String {
    format!("{prompt}{STRICT_JSON_SUFFIX}")
}

fn mode_label(mode: GenerationMode) -> &'static str {
    match mode {
        GenerationMode::StudyGuide => "study guide",
        GenerationMode::ExamCram => "exam cram sheet",
    }
}

fn fill_minimums(template: &str, m: &SynthesisMinimums) -> String {
    template
        .replace("{min_summary}", &m.high_yield_summary.to_string())
        .replace("{min_review}", &m.one_page_review.to_string())
        .replace("{min_approach}", &m.rapid_approach.to_string())
        .replace("{min_pitfalls}", &m.pitfalls.to_string())
        .replace("{min_glossary}", &m.glossary.to_string())
}

pub fn build_extraction_prompt(
    lecture_title: &str,
    mode: GenerationMode,
    range: ChunkRange,
    chunk_text: &str,
) -> String {
    EXTRACTION_PROMPT_TEMPLATE
        .replace("{lecture_title}", lecture_title)
        .replace("{mode}", mode.as_str())
        .replace("{chunk_range}", &range.to_string())
        .replace("{chunk_start}", &range.start.to_string())
        .replace("{chunk_end}", &range.end.to_string())
        .replace("{slides}", chunk_text)
}

pub fn build_derive_prompt(lecture_title: &str, extraction: &str) -> String {
    DERIVE_PROMPT_TEMPLATE
        .replace("{lecture_title}", lecture_title)
        .replace("{extraction}", extraction)
}

pub fn build_plan_prompt(
    lecture_title: &str,
    mode: GenerationMode,
    minimums: &SynthesisMinimums,
    overview: &str,
) -> String {
    fill_minimums(PLAN_PROMPT_TEMPLATE, minimums)
        .replace("{mode_label}", mode_label(mode))
        .replace("{lecture_title}", lecture_title)
        .replace("{overview}", overview)
}

pub fn build_outline_prompt(lecture_title: &str, mode: GenerationMode, plan: &str) -> String {
    OUTLINE_PROMPT_TEMPLATE
        .replace("{mode_label}", mode_label(mode))
        .replace("{lecture_title}", lecture_title)
        .replace("{plan}", plan)
}

pub fn build_pack_prompt(
    lecture_title: &str,
    mode: GenerationMode,
    minimums: &SynthesisMinimums,
    plan: &str,
    outline: &str,
    extraction: &str,
) -> String {
    fill_minimums(PACK_PROMPT_TEMPLATE, minimums)
        .replace("{mode_label}", mode_label(mode))
        .replace("{lecture_title}", lecture_title)
        .replace("{plan}", plan)
        .replace("{outline}", outline)
        .replace("{extraction}", extraction)
}

/// Rewrite prompt carrying the validator's failure list verbatim.
pub fn build_rewrite_prompt(
    mode: GenerationMode,
    failures: &[String],
    plan: &str,
    document: &str,
) -> String {
    let failures = failures
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    REWRITE_PROMPT_TEMPLATE
        .replace("{mode_label}", mode_label(mode))
        .replace("{failures}", &failures)
        .replace("{plan}", plan)
        .replace("{document}", document)
}

pub fn build_redraft_prompt(
    lecture_title: &str,
    mode: GenerationMode,
    minimums: &SynthesisMinimums,
    plan: &str,
    extraction: &str,
) -> String {
    fill_minimums(REDRAFT_PROMPT_TEMPLATE, minimums)
        .replace("{mode_label}", mode_label(mode))
        .replace("{lecture_title}", lecture_title)
        .replace("{plan}", plan)
        .replace("{extraction}", extraction)
}

pub fn build_review_prompt(mode: GenerationMode, stats: &str) -> String {
    REVIEW_PROMPT_TEMPLATE
        .replace("{mode_label}", mode_label(mode))
        .replace("{stats}", stats)
}
