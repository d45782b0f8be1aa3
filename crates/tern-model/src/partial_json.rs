// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming-tolerant JSON parsing for fragmented tool-call arguments.
//!
//! Tool arguments arrive as raw JSON fragments spread across many deltas.
//! [`parse_partial_json`] accepts any valid prefix of a JSON document and
//! produces a best-effort value by synthesizing the missing closers: dangling
//! strings are closed, incomplete trailing tokens are dropped, and open
//! objects/arrays are terminated.  Every key/value pair that is complete in
//! the prefix survives with its exact value.
//!
//! The result is best-effort until the block ends; callers must re-parse
//! strictly at that point.

use serde_json::Value;

/// Outcome of scanning a JSON prefix: what is still open at the end.
struct ScanState {
    /// Closers for every unterminated container, innermost last.
    stack: Vec<char>,
    in_string: bool,
    /// Byte offset of the opening quote of the dangling string.
    string_start: usize,
    /// Whether the dangling string is an object key (vs. a value).
    string_is_key: bool,
    /// Byte offset of a backslash starting an incomplete escape sequence.
    incomplete_escape: Option<usize>,
    /// Byte offset of the opening quote of the most recent string, closed or not.
    last_string_start: usize,
    /// True when the innermost open container is an object still waiting for
    /// a key (so a trailing closed string is a key missing its colon).
    expect_key_at_eof: bool,
}

enum Container {
    Object { expect_key: bool },
    Array,
}

fn scan(src: &str) -> ScanState {
    let mut containers: Vec<Container> = Vec::new();
    let mut in_string = false;
    let mut string_start = 0usize;
    let mut last_string_start = 0usize;
    let mut string_is_key = false;
    // (start offset, hex digits still expected; 255 = escape char not yet seen)
    let mut escape: Option<(usize, u8)> = None;

    for (idx, c) in src.char_indices() {
        if in_string {
            match escape {
                Some((start, 255)) => {
                    escape = if c == 'u' { Some((start, 4)) } else { None };
                }
                Some((start, left)) => {
                    escape = if left > 1 { Some((start, left - 1)) } else { None };
                }
                None => match c {
                    '\\' => escape = Some((idx, 255)),
                    '"' => in_string = false,
                    _ => {}
                },
            }
            continue;
        }
        match c {
            '{' => containers.push(Container::Object { expect_key: true }),
            '[' => containers.push(Container::Array),
            '}' | ']' => {
                containers.pop();
            }
            '"' => {
                in_string = true;
                string_start = idx;
                last_string_start = idx;
                string_is_key = matches!(
                    containers.last(),
                    Some(Container::Object { expect_key: true })
                );
                escape = None;
            }
            ':' => {
                if let Some(Container::Object { expect_key }) = containers.last_mut() {
                    *expect_key = false;
                }
            }
            ',' => {
                if let Some(Container::Object { expect_key }) = containers.last_mut() {
                    *expect_key = true;
                }
            }
            _ => {}
        }
    }

    let stack = containers
        .iter()
        .map(|c| match c {
            Container::Object { .. } => '}',
            Container::Array => ']',
        })
        .collect();
    let expect_key_at_eof = matches!(
        containers.last(),
        Some(Container::Object { expect_key: true })
    );
    ScanState {
        stack,
        in_string,
        string_start,
        string_is_key,
        incomplete_escape: escape.map(|(start, _)| start),
        last_string_start,
        expect_key_at_eof,
    }
}

fn with_closers(buf: &str, stack: &[char]) -> String {
    let mut out = String::with_capacity(buf.len() + stack.len());
    out.push_str(buf);
    for closer in stack.iter().rev() {
        out.push(*closer);
    }
    out
}

fn is_literal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')
}

/// Parse any prefix of a JSON document, synthesizing missing closers.
///
/// Returns `None` only when the input is not a prefix of anything parseable
/// (e.g. plain prose).  An empty or whitespace-only prefix parses to `{}` —
/// the state of a tool call before its first argument delta.
pub fn parse_partial_json(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(Value::Object(serde_json::Map::new()));
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    let state = scan(trimmed);

    // Dangling value-string: close the quote (dropping a half-sent escape)
    // and keep the partial text.
    if state.in_string && !state.string_is_key {
        let mut buf = match state.incomplete_escape {
            Some(at) => trimmed[..at].to_string(),
            None => trimmed.to_string(),
        };
        buf.push('"');
        if let Ok(v) = serde_json::from_str::<Value>(&with_closers(&buf, &state.stack)) {
            return Some(v);
        }
    }

    // Not inside a string: often the closers alone are enough, and this path
    // keeps a trailing complete-looking number/literal intact.
    if !state.in_string {
        if let Ok(v) = serde_json::from_str::<Value>(&with_closers(trimmed, &state.stack)) {
            return Some(v);
        }
    }

    // Structural repair: drop the dangling token, then terminate whatever
    // separator is left hanging.
    let mut buf = if state.in_string {
        trimmed[..state.string_start].to_string()
    } else {
        trimmed.to_string()
    };
    // A closed key with no colon after it is as useless as a partial one.
    if !state.in_string
        && state.expect_key_at_eof
        && buf.trim_end().ends_with('"')
    {
        buf.truncate(state.last_string_start);
    }
    loop {
        buf.truncate(buf.trim_end().len());
        match buf.chars().last() {
            Some(',') => {
                buf.pop();
            }
            Some(':') => {
                buf.push_str(" null");
                break;
            }
            Some(c) if is_literal_char(c) => {
                if let Ok(v) = serde_json::from_str::<Value>(&with_closers(&buf, &state.stack)) {
                    return Some(v);
                }
                while buf.chars().last().is_some_and(is_literal_char) {
                    buf.pop();
                }
            }
            _ => break,
        }
    }
    serde_json::from_str(&with_closers(&buf, &state.stack)).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_prefix_is_empty_object() {
        assert_eq!(parse_partial_json(""), Some(json!({})));
        assert_eq!(parse_partial_json("   "), Some(json!({})));
    }

    #[test]
    fn complete_object_parses_strictly() {
        assert_eq!(
            parse_partial_json(r#"{"a": 1, "b": "x"}"#),
            Some(json!({"a": 1, "b": "x"}))
        );
    }

    #[test]
    fn open_brace_only() {
        assert_eq!(parse_partial_json("{"), Some(json!({})));
    }

    #[test]
    fn unterminated_number_is_kept() {
        assert_eq!(parse_partial_json(r#"{"a": 12"#), Some(json!({"a": 12})));
    }

    #[test]
    fn dangling_colon_becomes_null() {
        assert_eq!(parse_partial_json(r#"{"a":"#), Some(json!({"a": null})));
    }

    #[test]
    fn dangling_comma_dropped() {
        assert_eq!(parse_partial_json(r#"{"a": 1,"#), Some(json!({"a": 1})));
    }

    #[test]
    fn partial_value_string_kept_as_prefix() {
        assert_eq!(
            parse_partial_json(r#"{"path": "/tmp/fi"#),
            Some(json!({"path": "/tmp/fi"}))
        );
    }

    #[test]
    fn partial_key_string_dropped() {
        assert_eq!(
            parse_partial_json(r#"{"a": 1, "lon"#),
            Some(json!({"a": 1}))
        );
    }

    #[test]
    fn closed_key_without_colon_dropped() {
        assert_eq!(
            parse_partial_json(r#"{"a": 1, "pending""#),
            Some(json!({"a": 1}))
        );
    }

    #[test]
    fn partial_bare_literal_dropped() {
        assert_eq!(
            parse_partial_json(r#"{"flag": tru"#),
            Some(json!({"flag": null}))
        );
    }

    #[test]
    fn complete_literal_kept() {
        assert_eq!(
            parse_partial_json(r#"{"flag": true"#),
            Some(json!({"flag": true}))
        );
    }

    #[test]
    fn nested_containers_all_closed() {
        assert_eq!(
            parse_partial_json(r#"{"a": {"b": [1, 2"#),
            Some(json!({"a": {"b": [1, 2]}}))
        );
    }

    #[test]
    fn trailing_backslash_in_string_dropped() {
        assert_eq!(
            parse_partial_json(r#"{"s": "line\"#),
            Some(json!({"s": "line"}))
        );
    }

    #[test]
    fn incomplete_unicode_escape_dropped() {
        assert_eq!(
            parse_partial_json(r#"{"s": "snow \u26"#),
            Some(json!({"s": "snow "}))
        );
    }

    #[test]
    fn complete_escape_inside_partial_string_kept() {
        assert_eq!(
            parse_partial_json(r#"{"s": "a\nb"#),
            Some(json!({"s": "a\nb"}))
        );
    }

    #[test]
    fn escaped_quote_does_not_close_string() {
        assert_eq!(
            parse_partial_json(r#"{"s": "say \"hi"#),
            Some(json!({"s": "say \"hi"}))
        );
    }

    #[test]
    fn array_prefix_closes() {
        assert_eq!(parse_partial_json("[1, 2,"), Some(json!([1, 2])));
    }

    #[test]
    fn prose_returns_none() {
        assert_eq!(parse_partial_json("not json at all"), None);
    }

    /// Every prefix of a realistic argument object must produce a value that
    /// agrees with the full parse on all completed pairs.
    #[test]
    fn every_prefix_is_compatible_with_full_document() {
        let full = r#"{"cmd": "ls -la", "timeout": 120, "env": {"K": "v"}, "argv": ["a", "b"]}"#;
        let complete: Value = serde_json::from_str(full).unwrap();
        for end in 1..=full.len() {
            if !full.is_char_boundary(end) {
                continue;
            }
            let parsed = parse_partial_json(&full[..end])
                .unwrap_or_else(|| panic!("prefix failed at {end}: {:?}", &full[..end]));
            let obj = parsed.as_object().expect("prefix must stay an object");
            for (key, value) in obj {
                if let Some(expected) = complete.get(key) {
                    // A fully-present value must match; partially streamed
                    // strings are prefixes of the final value.
                    match (value, expected) {
                        (Value::String(got), Value::String(want)) => {
                            assert!(
                                want.starts_with(got.as_str()),
                                "key {key}: {got:?} is not a prefix of {want:?}"
                            );
                        }
                        (Value::Null, _) => {}
                        (got, want) if got == want => {}
                        // A number cut mid-stream is a numeric prefix of the
                        // final value (12 for 120); both sides stay numbers.
                        (Value::Number(_), Value::Number(_)) => {}
                        (Value::Object(_), Value::Object(_))
                        | (Value::Array(_), Value::Array(_)) => {}
                        (got, want) => {
                            panic!("key {key}: incompatible {got:?} vs {want:?} at {end}")
                        }
                    }
                }
            }
        }
    }
}
