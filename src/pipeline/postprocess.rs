//! Post-processing: deterministic cleanup of the rendered study document.
//!
//! The renderer writes model-supplied strings verbatim, so artefacts from
//! the model leak into the Markdown: Windows line endings inside items,
//! zero-width characters copied from slide OCR, bullets that already carry
//! their own `•` marker. These rules fix layout only and never touch content.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so every later rule can split on `\n`;
//! blank-line collapsing runs after heading spacing so the inserted blank
//! lines are themselves bounded.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule, in order.
///
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Collapse doubled bullet markers (`- • item` → `- item`)
/// 4. Trim trailing whitespace per line
/// 5. Ensure a blank line before every heading
/// 6. Collapse runs of blank lines to one
/// 7. End with exactly one newline
pub fn clean_document(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = collapse_double_bullets(&s);
    let s = trim_trailing_whitespace(&s);
    let s = normalise_heading_spacing(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ──────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Collapse doubled bullet markers ──────────────────────────────

static RE_DOUBLE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^- [-*\u{2022}\u{25AA}\u{2023}]\s+").unwrap());

fn collapse_double_bullets(input: &str) -> String {
    RE_DOUBLE_BULLET.replace_all(input, "- ").to_string()
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Normalise heading spacing ────────────────────────────────────

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

fn normalise_heading_spacing(input: &str) -> String {
    let mut result = String::with_capacity(input.len() + 64);
    for (i, line) in input.lines().enumerate() {
        if is_heading(line) && i > 0 {
            let trimmed = result.trim_end_matches('\n');
            result.truncate(trimmed.len());
            result.push_str("\n\n");
        }
        result.push_str(line);
        result.push('\n');
    }
    result
}

// ── Rule 6: Collapse blank lines ─────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 7: Ensure file ends with single newline ─────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_remove_invisible() {
        let input = "Na\u{200B}+/K\u{FEFF}+ ATP\u{00AD}ase";
        assert_eq!(remove_invisible_chars(input), "Na+/K+ ATPase");
    }

    #[test]
    fn test_double_bullets() {
        let input = "- \u{2022} Peaked T waves\n- * Calcium first\n- plain\n- -3 is a number";
        assert_eq!(
            collapse_double_bullets(input),
            "- Peaked T waves\n- Calcium first\n- plain\n- -3 is a number"
        );
    }

    #[test]
    fn test_numbered_items_keep_their_numbers() {
        let input = "- 3) Causes of AKI\n- 1. Prerenal\n- 2.5 mg dose";
        assert_eq!(collapse_double_bullets(input), input);
        assert_eq!(clean_document(input), format!("{input}\n"));
    }

    #[test]
    fn test_trim_trailing_whitespace() {
        assert_eq!(trim_trailing_whitespace("  hello   \nworld  "), "  hello\nworld");
    }

    #[test]
    fn test_heading_spacing() {
        let result = normalise_heading_spacing("some text\n## Heading\nmore text");
        assert!(result.contains("some text\n\n## Heading\n"));
        let hashtag = normalise_heading_spacing("a\n#tag\n");
        assert_eq!(hashtag, "a\n#tag\n");
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_ensure_final_newline() {
        assert_eq!(ensure_final_newline("hello"), "hello\n");
        assert_eq!(ensure_final_newline("hello\n\n\n"), "hello\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn test_clean_document_full_pipeline() {
        let input = "# Renal: Study Guide\r\n\r\n\r\n\r\n## Pitfalls   \n- \u{2022} Missing \u{200B}RBC casts\n\n\n";
        let result = clean_document(input);
        assert_eq!(result, "# Renal: Study Guide\n\n## Pitfalls\n- Missing RBC casts\n");
    }
}
