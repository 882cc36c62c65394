//! Slide parsing: normalized lecture text → ordered [`Slide`]s.
//!
//! Upstream OCR/normalization emits one marker line per slide or page, e.g.
//! `--- Slide 12 ---`, `=== Page 3 ===`, `## Slide 4: Hemostasis` or
//! `[Slide 7]`. Everything between two markers is the body of the first.

use crate::types::{Slide, NO_TEXT};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

static RE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[-=#]+\s*|\[\s*)?(slide|page)\s+(\d{1,5})\s*(?:[:.\-\u{2013}\u{2014}]\s*([^\]=]*?))?\s*(?:\]|[-=]+)?\s*$",
    )
    .unwrap()
});

/// Parse normalized text into slides.
///
/// Slide numbers strictly increase: a marker whose number does not exceed
/// the previous one is renumbered to previous + 1. Text before the first
/// marker is dropped when markers exist. Without any marker the whole text
/// becomes slide 1. Empty bodies become [`NO_TEXT`].
pub fn parse_slides(text: &str) -> Vec<Slide> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut slides: Vec<Slide> = Vec::new();
    let mut current: Option<(u32, String, Vec<&str>)> = None;
    let mut saw_marker = false;

    for line in normalized.lines() {
        if let Some(caps) = RE_MARKER.captures(line) {
            saw_marker = true;
            if let Some((number, label, body)) = current.take() {
                slides.push(finish_slide(number, label, &body));
            }

            let kind = capitalize(&caps[1].to_lowercase());
            let declared: u32 = caps[2].parse().unwrap_or(0);
            let previous = slides.last().map(|s| s.number).unwrap_or(0);
            let number = if declared > previous {
                declared
            } else {
                warn!(
                    "{} marker {} does not increase (previous {}), renumbering to {}",
                    kind,
                    declared,
                    previous,
                    previous + 1
                );
                previous + 1
            };

            let label = format!("{kind} {declared}");
            let mut body = Vec::new();
            if let Some(title) = caps.get(3).map(|m| m.as_str().trim()).filter(|t| !t.is_empty()) {
                body.push(title);
            }
            current = Some((number, label, body));
        } else if let Some((_, _, ref mut body)) = current {
            body.push(line);
        }
    }

    if let Some((number, label, body)) = current.take() {
        slides.push(finish_slide(number, label, &body));
    }

    if !saw_marker && !normalized.trim().is_empty() {
        let lines: Vec<&str> = normalized.lines().collect();
        slides.push(finish_slide(1, "Slide 1".to_string(), &lines));
    }

    debug!("Parsed {} slides", slides.len());
    slides
}

fn finish_slide(number: u32, page_label: String, body: &[&str]) -> Slide {
    let joined = body
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = joined.trim();
    Slide {
        number,
        page_label,
        body_text: if trimmed.is_empty() {
            NO_TEXT.to_string()
        } else {
            trimmed.to_string()
        },
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
