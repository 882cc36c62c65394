//! Parse and repair model JSON.
//!
//! Every JSON-producing stage runs raw model text through
//! [`parse_model_json`]:
//!
//! 1. strip Markdown code fences
//! 2. scan for the first balanced top-level object (string/escape aware)
//! 3. classify a missing or unterminated object as `PARSE` or `TRUNCATED`
//! 4. parse directly
//! 5. on failure apply syntactic repairs one at a time, re-parsing after each
//!
//! Repairs only touch syntax: trailing commas, unescaped inner quotes, and
//! missing closing brackets inside an otherwise complete object. A truncated
//! object is never completed; the caller retries or splits instead.
//!
//! All functions here are pure.

use crate::error::{FailureKind, StageFailure};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)(?:```|\z)").unwrap());

/// Successfully parsed model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJson {
    pub value: Value,
    /// True when at least one syntactic repair was needed.
    pub repaired: bool,
    /// Names of the repairs applied, in order.
    pub repairs: Vec<&'static str>,
}

/// Result of scanning text for the first top-level object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectScan<'a> {
    /// A brace-balanced object slice.
    Complete(&'a str),
    /// An object started but never closed (open braces or an open string).
    Truncated(&'a str),
    /// No `{` at all.
    NotFound,
}

/// Remove a surrounding code fence, if present.
pub fn strip_code_fences(raw: &str) -> &str {
    match RE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) if inner.as_str().contains('{') => inner.as_str().trim(),
        _ => raw.trim(),
    }
}

/// Find the first balanced top-level `{...}`.
///
/// Only braces decide where the object ends; brackets are left to
/// [`balance_brackets`]. Braces inside strings are ignored.
pub fn extract_json_object(text: &str) -> ObjectScan<'_> {
    let Some(start) = text.find('{') else {
        return ObjectScan::NotFound;
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return ObjectScan::Complete(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    ObjectScan::Truncated(&text[start..])
}

/// Drop commas that directly precede `}` or `]` (outside strings).
pub fn remove_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Escape quotes that appear inside a string value.
///
/// A quote inside a string only closes it when the next non-space character
/// is one of `, : } ]` (or the end of input). Anything else is treated as a
/// literal quote and escaped. This covers the common `"the "classic" sign"`
/// mistake and nothing more.
pub fn escape_inner_quotes(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, None | Some(',') | Some(':') | Some('}') | Some(']')) {
                    in_string = false;
                    out.push(ch);
                } else {
                    out.push_str("\\\"");
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Insert missing closers so every `[`/`{` is matched.
///
/// A closer that does not match the innermost open bracket first closes the
/// inner one; a closer with nothing open is dropped.
pub fn balance_brackets(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in json.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if !stack.contains(&ch) {
                    continue;
                }
                while let Some(expected) = stack.pop() {
                    out.push(expected);
                    if expected == ch {
                        break;
                    }
                }
            }
            _ => out.push(ch),
        }
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Classify and parse raw model text into a JSON object.
pub fn parse_model_json(raw: &str) -> Result<ParsedJson, StageFailure> {
    if raw.trim().is_empty() {
        return Err(StageFailure::new(FailureKind::Extract, "empty model output"));
    }

    let body = strip_code_fences(raw);
    let candidate = match extract_json_object(body) {
        ObjectScan::Complete(slice) => slice,
        ObjectScan::Truncated(slice) => {
            return Err(StageFailure::new(
                FailureKind::Truncated,
                format!(
                    "unterminated JSON object after {} chars",
                    slice.chars().count()
                ),
            ));
        }
        ObjectScan::NotFound => {
            return Err(StageFailure::new(
                FailureKind::Parse,
                "no JSON object found in model output",
            ));
        }
    };

    let first_error = match parse_object(candidate) {
        Ok(value) => {
            return Ok(ParsedJson {
                value,
                repaired: false,
                repairs: Vec::new(),
            })
        }
        Err(e) => e,
    };

    let steps: [(&'static str, fn(&str) -> String); 3] = [
        ("trailing_commas", remove_trailing_commas),
        ("inner_quotes", escape_inner_quotes),
        ("bracket_balance", balance_brackets),
    ];

    let mut current = candidate.to_string();
    let mut repairs = Vec::new();
    for (name, step) in steps {
        let next = step(&current);
        if next == current {
            continue;
        }
        current = next;
        repairs.push(name);
        if let Ok(value) = parse_object(&current) {
            return Ok(ParsedJson {
                value,
                repaired: true,
                repairs,
            });
        }
    }

    Err(StageFailure::new(FailureKind::Parse, first_error))
}

fn parse_object(text: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err("top-level JSON value is not an object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
