//! Recovery of a JSON document from free-form model output.
//!
//! Models wrap JSON in prose, markdown fences, or stop mid-object. The
//! scanner walks every candidate open bracket with an explicit bracket stack
//! and string-literal tracking, and the first span that both balances and
//! parses wins.

use serde::de::IgnoredAny;

const FENCE: &str = "```";

/// Strips one markdown code fence when it wraps the whole (trimmed) text.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed
        .strip_prefix(FENCE)
        .and_then(|rest| rest.strip_suffix(FENCE))
    else {
        return trimmed;
    };
    if inner.contains(FENCE) {
        return trimmed;
    }

    let body = match inner.find('\n') {
        Some(pos) if is_fence_language_tag(&inner[..pos]) => &inner[pos + 1..],
        _ => strip_inline_language_tag(inner),
    };
    body.trim()
}

fn is_fence_language_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn strip_inline_language_tag(inner: &str) -> &str {
    let head = inner.trim_start();
    match head.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => &head[4..],
        _ => inner,
    }
}

/// Returns the first balanced span that parses as JSON.
///
/// Object-rooted candidates are preferred. With `allow_array`, an array is
/// returned when no object parses, or when a valid array strictly encloses
/// the chosen object (a bare `[{..},{..}]` document).
pub fn find_balanced_json(text: &str, allow_array: bool) -> Option<&str> {
    let object = first_valid_span(text, b'{', 0, text.len());

    if !allow_array {
        return object.map(|(start, end)| &text[start..end]);
    }

    let chosen = match object {
        Some((object_start, object_end)) => {
            enclosing_array_span(text, object_start, object_end).unwrap_or((object_start, object_end))
        }
        None => first_valid_span(text, b'[', 0, text.len())?,
    };
    Some(&text[chosen.0..chosen.1])
}

/// Fence-strips and extracts; falls back to the trimmed input when nothing parses.
pub fn preprocess_json_text(text: &str, allow_array: bool) -> &str {
    let unfenced = strip_code_fence(text);
    find_balanced_json(unfenced, allow_array).unwrap_or_else(|| text.trim())
}

fn enclosing_array_span(text: &str, object_start: usize, object_end: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut cursor = 0;
    while let Some((start, end)) = first_valid_span(text, b'[', cursor, object_start) {
        if end >= object_end {
            return Some((start, end));
        }
        cursor = start + 1;
        if cursor >= bytes.len() {
            break;
        }
    }
    None
}

/// Scans candidate starts in `from..until` for the first balanced, parseable span.
fn first_valid_span(text: &str, open: u8, from: usize, until: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let until = until.min(bytes.len());
    (from..until)
        .filter(|index| bytes[*index] == open)
        .find_map(|start| {
            let end = balanced_span_end(bytes, start)?;
            serde_json::from_str::<IgnoredAny>(&text[start..end])
                .ok()
                .map(|_| (start, end))
        })
}

/// Walks from an open bracket to its matching close bracket.
///
/// Only ASCII bytes are inspected, so the returned index is always a char
/// boundary. A mismatched close bracket or running off the end yields `None`.
fn balanced_span_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut expected_closers: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => expected_closers.push(b'}'),
            b'[' => expected_closers.push(b']'),
            b'}' | b']' => {
                if expected_closers.pop() != Some(byte) {
                    return None;
                }
                if expected_closers.is_empty() {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }

    None
}
