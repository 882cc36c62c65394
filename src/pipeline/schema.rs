//! Shape validation for every JSON contract the model must honour.
//!
//! Validators walk a parsed [`serde_json::Value`] and report field-level
//! violations (`slides[2].slide_number: outside chunk 13–18`) rather than a
//! bare pass/fail, so rewrite prompts and diagnostics can say exactly what
//! was wrong. [`decode`] ties parsing, validation, and typed deserialization
//! together.

use crate::error::{FailureKind, StageFailure};
use crate::pipeline::json_repair::parse_model_json;
use crate::types::{ChunkRange, StepAChunkOutput};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;

/// A typed, validated value decoded from model output.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub value: T,
    /// Syntactic repair was needed; the value is provisional.
    pub repaired: bool,
    pub repairs: Vec<&'static str>,
}

/// Parse `raw`, run `validate`, then deserialize into `T`.
///
/// Any violation is reported as [`FailureKind::Schema`] with the violations
/// joined into the detail.
pub fn decode<T, F>(raw: &str, validate: F) -> Result<Decoded<T>, StageFailure>
where
    T: DeserializeOwned,
    F: Fn(&Value) -> Vec<String>,
{
    let parsed = parse_model_json(raw)?;
    let violations = validate(&parsed.value);
    if !violations.is_empty() {
        return Err(schema_failure(&violations));
    }
    let value = serde_json::from_value(parsed.value)
        .map_err(|e| StageFailure::new(FailureKind::Schema, e.to_string()))?;
    Ok(Decoded {
        value,
        repaired: parsed.repaired,
        repairs: parsed.repairs,
    })
}

/// Decode one chunk's extraction and stamp it with its range.
///
/// `expected` holds the chunk's slide numbers; each must have an entry.
pub fn decode_chunk_output(
    raw: &str,
    range: ChunkRange,
    expected: &[u32],
) -> Result<Decoded<StepAChunkOutput>, StageFailure> {
    let parsed = parse_model_json(raw)?;
    let violations = validate_chunk_output(&parsed.value, range, expected);
    if !violations.is_empty() {
        return Err(schema_failure(&violations));
    }
    let mut value = parsed.value;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("chunk".into(), json!({ "start": range.start, "end": range.end }));
    }
    let output = serde_json::from_value(value)
        .map_err(|e| StageFailure::new(FailureKind::Schema, e.to_string()))?;
    Ok(Decoded {
        value: output,
        repaired: parsed.repaired,
        repairs: parsed.repairs,
    })
}

/// Validate a payload read back from the chunk cache.
pub fn validate_cached_chunk(bytes: &[u8], range: ChunkRange) -> Result<StepAChunkOutput, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let mut violations = validate_chunk_output(&value, range, &[]);
    match value.get("chunk") {
        Some(c)
            if c.get("start").and_then(Value::as_u64) == Some(u64::from(range.start))
                && c.get("end").and_then(Value::as_u64) == Some(u64::from(range.end)) => {}
        _ => violations.push(format!("chunk: does not match {range}")),
    }
    if !violations.is_empty() {
        return Err(violations.join("; "));
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn schema_failure(violations: &[String]) -> StageFailure {
    debug!("Schema violations: {:?}", violations);
    StageFailure::new(FailureKind::Schema, violations.join("; "))
}

// ── Field helpers ────────────────────────────────────────────────────────

fn as_object<'a>(value: &'a Value, path: &str, out: &mut Vec<String>) -> Option<&'a Map<String, Value>> {
    match value.as_object() {
        Some(obj) => Some(obj),
        None => {
            out.push(format!("{path}: expected object"));
            None
        }
    }
}

fn string_array(obj: &Map<String, Value>, field: &str, required: bool, out: &mut Vec<String>) {
    match obj.get(field) {
        None | Some(Value::Null) => {
            if required {
                out.push(format!("{field}: missing"));
            }
        }
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    out.push(format!("{field}[{i}]: expected string"));
                }
            }
        }
        Some(_) => out.push(format!("{field}: expected array of strings")),
    }
}

fn object_array<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    required: bool,
    out: &mut Vec<String>,
) -> Vec<(String, &'a Map<String, Value>)> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            if required {
                out.push(format!("{field}: missing"));
            }
            Vec::new()
        }
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let path = format!("{field}[{i}]");
                as_object(item, &path, out).map(|o| (path, o))
            })
            .collect(),
        Some(_) => {
            out.push(format!("{field}: expected array"));
            Vec::new()
        }
    }
}

fn string_field(obj: &Map<String, Value>, path: &str, field: &str, required: bool, out: &mut Vec<String>) {
    match obj.get(field) {
        Some(Value::String(_)) => {}
        None | Some(Value::Null) if !required => {}
        None | Some(Value::Null) => out.push(format!("{path}.{field}: missing")),
        Some(_) => out.push(format!("{path}.{field}: expected string")),
    }
}

fn uint_field(obj: &Map<String, Value>, path: &str, field: &str, out: &mut Vec<String>) -> Option<u64> {
    match obj.get(field) {
        Some(v) => match v.as_u64() {
            Some(n) => Some(n),
            None => {
                out.push(format!("{path}.{field}: expected non-negative integer"));
                None
            }
        },
        None => {
            out.push(format!("{path}.{field}: missing"));
            None
        }
    }
}

fn rows_field(obj: &Map<String, Value>, path: &str, out: &mut Vec<String>) {
    match obj.get("rows") {
        None | Some(Value::Null) => {}
        Some(Value::Array(rows)) => {
            for (r, row) in rows.iter().enumerate() {
                match row.as_array() {
                    Some(cells) if cells.iter().all(Value::is_string) => {}
                    _ => out.push(format!("{path}.rows[{r}]: expected array of strings")),
                }
            }
        }
        Some(_) => out.push(format!("{path}.rows: expected array")),
    }
}

fn nested_string_array(obj: &Map<String, Value>, path: &str, field: &str, out: &mut Vec<String>) {
    let mut inner = Vec::new();
    string_array(obj, field, false, &mut inner);
    out.extend(inner.into_iter().map(|v| format!("{path}.{v}")));
}

// ── Step A ───────────────────────────────────────────────────────────────

/// Per-chunk extraction: `{lecture_title?, slides: [{slide_number, ...}]}`.
///
/// Every slide number must fall inside `range`, and every number in
/// `expected` must appear in `slides`.
pub fn validate_chunk_output(value: &Value, range: ChunkRange, expected: &[u32]) -> Vec<String> {
    let mut out = Vec::new();
    let Some(obj) = as_object(value, "$", &mut out) else {
        return out;
    };

    if let Some(title) = obj.get("lecture_title") {
        if !title.is_string() && !title.is_null() {
            out.push("lecture_title: expected string".into());
        }
    }

    let slides = object_array(obj, "slides", true, &mut out);
    if slides.is_empty() && obj.get("slides").map(Value::is_array).unwrap_or(false) {
        out.push("slides: expected at least one slide".into());
    }

    let mut present = Vec::with_capacity(slides.len());
    for (path, slide) in slides {
        if let Some(n) = uint_field(slide, &path, "slide_number", &mut out) {
            match u32::try_from(n) {
                Ok(n) if range.contains(n) => present.push(n),
                _ => out.push(format!("{path}.slide_number: {n} outside chunk {range}")),
            }
        }
        string_field(slide, &path, "title", false, &mut out);
        string_field(slide, &path, "page_label", false, &mut out);
        nested_string_array(slide, &path, "exam_clues", &mut out);

        let mut inner = Vec::new();
        for (sec_path, section) in object_array(slide, "sections", false, &mut inner) {
            string_field(section, &sec_path, "heading", false, &mut inner);
            nested_string_array(section, &sec_path, "facts", &mut inner);
        }
        for (tab_path, table) in object_array(slide, "tables", false, &mut inner) {
            string_field(table, &tab_path, "title", false, &mut inner);
            nested_string_array(table, &tab_path, "columns", &mut inner);
            rows_field(table, &tab_path, &mut inner);
        }
        out.extend(inner.into_iter().map(|v| format!("{path}.{v}")));
    }

    if !present.is_empty() {
        for n in expected.iter().filter(|n| !present.contains(n)) {
            out.push(format!("slides: no entry for slide {n}"));
        }
    }
    out
}

/// Derived structures: buckets, discriminators, exam atoms, abbreviations, spans.
pub fn validate_derived(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(obj) = as_object(value, "$", &mut out) else {
        return out;
    };

    match obj.get("buckets") {
        None | Some(Value::Null) => {}
        Some(Value::Object(buckets)) => {
            for name in crate::types::Buckets::NAMES {
                nested_string_array(buckets, "buckets", name, &mut out);
            }
        }
        Some(_) => out.push("buckets: expected object".into()),
    }

    for (path, d) in object_array(obj, "discriminators", false, &mut out) {
        string_field(d, &path, "topic", true, &mut out);
        string_field(d, &path, "versus", false, &mut out);
        string_field(d, &path, "key_difference", false, &mut out);
        if let Some(slides) = d.get("slides") {
            let ok = slides
                .as_array()
                .map(|s| s.iter().all(|n| n.as_u64().is_some()))
                .unwrap_or(false);
            if !ok {
                out.push(format!("{path}.slides: expected array of slide numbers"));
            }
        }
    }

    string_array(obj, "exam_atoms", true, &mut out);

    match obj.get("abbrev_map") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (k, v) in map {
                if !v.is_string() {
                    out.push(format!("abbrev_map.{k}: expected string"));
                }
            }
        }
        Some(_) => out.push("abbrev_map: expected object".into()),
    }

    for (path, span) in object_array(obj, "source_spans", false, &mut out) {
        string_field(span, &path, "label", true, &mut out);
        let start = uint_field(span, &path, "start_slide", &mut out);
        let end = uint_field(span, &path, "end_slide", &mut out);
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                out.push(format!("{path}: start_slide {s} after end_slide {e}"));
            }
        }
    }
    out
}

// ── Step B ───────────────────────────────────────────────────────────────

/// Content-allocation plan.
pub fn validate_plan(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(obj) = as_object(value, "$", &mut out) else {
        return out;
    };

    string_array(obj, "selected_exam_atoms", true, &mut out);
    string_array(obj, "compare_topics", false, &mut out);
    string_array(obj, "warnings", false, &mut out);

    match obj.get("section_counts") {
        None => out.push("section_counts: missing".into()),
        Some(Value::Object(counts)) => {
            for (k, v) in counts {
                if v.as_u64().is_none() {
                    out.push(format!("section_counts.{k}: expected non-negative integer"));
                }
            }
        }
        Some(_) => out.push("section_counts: expected object".into()),
    }

    for (path, a) in object_array(obj, "atom_to_section_map", false, &mut out) {
        string_field(a, &path, "atom", true, &mut out);
        string_field(a, &path, "section", true, &mut out);
    }
    out
}

/// Synthesis document JSON shape (content rules live in the compiler).
pub fn validate_step_b(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(obj) = as_object(value, "$", &mut out) else {
        return out;
    };

    string_array(obj, "high_yield_summary", true, &mut out);
    string_array(obj, "one_page_review", true, &mut out);
    string_array(obj, "pitfalls", true, &mut out);
    string_array(obj, "supplemental_notes", false, &mut out);

    for (path, row) in object_array(obj, "rapid_approach", true, &mut out) {
        string_field(row, &path, "clue", true, &mut out);
        string_field(row, &path, "think", true, &mut out);
        string_field(row, &path, "next_step", false, &mut out);
    }
    for (path, table) in object_array(obj, "compare_tables", false, &mut out) {
        string_field(table, &path, "title", false, &mut out);
        nested_string_array(table, &path, "columns", &mut out);
        rows_field(table, &path, &mut out);
    }
    for (path, c) in object_array(obj, "quant_cutoffs", false, &mut out) {
        string_field(c, &path, "item", true, &mut out);
        string_field(c, &path, "value", true, &mut out);
        string_field(c, &path, "significance", false, &mut out);
    }
    for (path, g) in object_array(obj, "glossary", false, &mut out) {
        string_field(g, &path, "term", true, &mut out);
        string_field(g, &path, "definition", true, &mut out);
    }
    out
}

// ── Step C ───────────────────────────────────────────────────────────────

/// Review record.
pub fn validate_step_c(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(obj) = as_object(value, "$", &mut out) else {
        return out;
    };

    match obj.get("coverage_confidence").and_then(Value::as_str) {
        Some("high" | "medium" | "low") => {}
        Some(other) => out.push(format!(
            "coverage_confidence: '{other}' is not one of high, medium, low"
        )),
        None => out.push("coverage_confidence: missing".into()),
    }
    for field in ["unparsed_items", "omissions", "conflicts"] {
        string_array(obj, field, false, &mut out);
    }
    match obj.get("checks") {
        None | Some(Value::Null) => {}
        Some(Value::Object(checks)) => {
            for (k, v) in checks {
                if !v.is_boolean() {
                    out.push(format!("checks.{k}: expected boolean"));
                }
            }
        }
        Some(_) => out.push("checks: expected object".into()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepBPlan, StepCOutput};

    #[test]
    fn chunk_output_accepts_valid_payload() {
        let v = json!({
            "lecture_title": "Renal",
            "slides": [{
                "slide_number": 13,
                "title": "Nephritic",
                "sections": [{"heading": "Signs", "facts": ["Hematuria"]}],
                "tables": [{"title": "", "columns": ["a", "b"], "rows": [["1", "2"]]}]
            }]
        });
        assert!(validate_chunk_output(&v, ChunkRange::new(13, 18), &[13]).is_empty());
    }

    #[test]
    fn chunk_output_reports_field_level_violations() {
        let v = json!({
            "slides": [
                {"slide_number": 40, "sections": [{"facts": "not a list"}]},
                {"title": "no number"}
            ]
        });
        let errs = validate_chunk_output(&v, ChunkRange::new(13, 18), &[]);
        assert!(errs.iter().any(|e| e == "slides[0].slide_number: 40 outside chunk 13\u{2013}18"), "{errs:?}");
        assert!(errs.iter().any(|e| e.starts_with("slides[0].sections[0].facts")), "{errs:?}");
        assert!(errs.iter().any(|e| e == "slides[1].slide_number: missing"), "{errs:?}");
    }

    #[test]
    fn empty_slide_list_is_rejected() {
        let errs = validate_chunk_output(&json!({"slides": []}), ChunkRange::new(1, 6), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(errs, vec!["slides: expected at least one slide".to_string()]);
    }

    #[test]
    fn decode_chunk_stamps_range() {
        let raw = r#"{"lecture_title": "T", "slides": [{"slide_number": 2}, {"slide_number": 3}]}"#;
        let d = decode_chunk_output(raw, ChunkRange::new(2, 3), &[2, 3]).unwrap();
        assert_eq!(d.value.chunk, ChunkRange::new(2, 3));
        assert_eq!(d.value.slides[0].slide_number, 2);
    }

    #[test]
    fn chunk_output_must_cover_every_slide() {
        let raw = r#"{"slides": [{"slide_number": 1}, {"slide_number": 4}]}"#;
        let err = decode_chunk_output(raw, ChunkRange::new(1, 6), &[1, 2, 3, 4, 5, 6]).unwrap_err();
        assert_eq!(err.kind, FailureKind::Schema);
        assert_eq!(
            err.detail,
            "slides: no entry for slide 2; slides: no entry for slide 3; \
             slides: no entry for slide 5; slides: no entry for slide 6"
        );

        // Numbering gaps inside the range are not required.
        let gapped = r#"{"slides": [{"slide_number": 3}, {"slide_number": 10}]}"#;
        assert!(decode_chunk_output(gapped, ChunkRange::new(3, 10), &[3, 10]).is_ok());
    }

    #[test]
    fn decode_reports_schema_kind() {
        let err = decode::<StepBPlan, _>(r#"{"section_counts": {}}"#, validate_plan).unwrap_err();
        assert_eq!(err.kind, FailureKind::Schema);
        assert!(err.detail.contains("selected_exam_atoms: missing"));
    }

    #[test]
    fn cached_chunk_must_match_range() {
        let out = StepAChunkOutput {
            lecture_title: "T".into(),
            chunk: ChunkRange::new(1, 3),
            slides: vec![crate::types::SlideExtraction {
                slide_number: 1,
                ..Default::default()
            }],
        };
        let bytes = serde_json::to_vec(&out).unwrap();
        assert!(validate_cached_chunk(&bytes, ChunkRange::new(1, 3)).is_ok());
        assert!(validate_cached_chunk(&bytes, ChunkRange::new(1, 4)).is_err());
        assert!(validate_cached_chunk(b"{not json", ChunkRange::new(1, 3)).is_err());
    }

    #[test]
    fn step_b_requires_core_sections() {
        let errs = validate_step_b(&json!({"high_yield_summary": ["a"]}));
        assert!(errs.contains(&"one_page_review: missing".to_string()));
        assert!(errs.contains(&"rapid_approach: missing".to_string()));
    }

    #[test]
    fn step_c_confidence_is_enumerated() {
        assert!(!validate_step_c(&json!({"coverage_confidence": "great"})).is_empty());
        let ok = decode::<StepCOutput, _>(
            r#"{"coverage_confidence": "high", "omissions": ["AKI staging"], "checks": {"tables": true}}"#,
            validate_step_c,
        )
        .unwrap();
        assert_eq!(ok.value.omissions, vec!["AKI staging".to_string()]);
    }

    #[test]
    fn derived_spans_must_be_ordered() {
        let errs = validate_derived(&json!({
            "exam_atoms": [],
            "source_spans": [{"label": "AKI", "start_slide": 9, "end_slide": 3}]
        }));
        assert_eq!(errs, vec!["source_spans[0]: start_slide 9 after end_slide 3".to_string()]);
    }
}
