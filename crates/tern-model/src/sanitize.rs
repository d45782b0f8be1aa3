// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-submission sanitization: surrogate escape scrubbing and image
//! filtering for text-only models.
//!
//! Providers reject request bodies whose strings contain unpaired UTF-16
//! surrogate escapes (`\ud800`–`\udfff` without a partner).  Those cannot
//! survive into a Rust `String`, but they do show up in the raw JSON
//! fragments models emit for tool arguments.  [`scrub_lone_surrogates`]
//! rewrites unpaired escapes to the replacement character escape before any
//! strict parse.

use std::borrow::Cow;

use crate::types::{ContentBlock, Message, UserContent};

/// Replace unpaired surrogate escape sequences in a raw JSON buffer with
/// `�`.  Properly paired sequences (high followed by low) pass through
/// untouched.
pub fn scrub_lone_surrogates(raw: &str) -> Cow<'_, str> {
    if !raw.contains("\\u") {
        return Cow::Borrowed(raw);
    }

    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut changed = false;
    let mut i = 0;
    while i < bytes.len() {
        if let Some(code) = surrogate_at(raw, i) {
            let is_high = (0xD800..=0xDBFF).contains(&code);
            if is_high {
                if surrogate_at(raw, i + 6).is_some_and(|low| (0xDC00..=0xDFFF).contains(&low)) {
                    // Valid pair, copy both halves verbatim.
                    out.push_str(&raw[i..i + 12]);
                    i += 12;
                    continue;
                }
            }
            out.push_str("\\uFFFD");
            changed = true;
            i += 6;
            continue;
        }
        let c = raw[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
        // Consume the escaped character together with its backslash so a
        // literal `\\` is never re-read as the start of a `\u` escape.
        if c == '\\' {
            if let Some(next) = raw[i..].chars().next() {
                out.push(next);
                i += next.len_utf8();
            }
        }
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(raw)
    }
}

/// Parse `\uXXXX` at byte offset `i` and return the code unit when it lies in
/// the surrogate range.
fn surrogate_at(raw: &str, i: usize) -> Option<u32> {
    let candidate = raw.get(i..i + 6)?;
    let rest = candidate.strip_prefix("\\u")?;
    let code = u32::from_str_radix(rest, 16).ok()?;
    (0xD800..=0xDFFF).contains(&code).then_some(code)
}

/// Drop image blocks from user messages when the target model is text-only.
///
/// A user message reduced to nothing (image-only, or images plus empty text)
/// is removed entirely.  Assistant and tool-result messages are left alone:
/// their image content originates from tools and is filtered at the
/// tool-result layer instead.
pub fn strip_images_for_text_model(messages: Vec<Message>, supports_images: bool) -> Vec<Message> {
    if supports_images {
        return messages;
    }
    messages
        .into_iter()
        .filter_map(|m| match m {
            Message::User(mut user) => {
                if let UserContent::Blocks(blocks) = user.content {
                    let kept: Vec<ContentBlock> = blocks
                        .into_iter()
                        .filter(|b| !matches!(b, ContentBlock::Image { .. }))
                        .collect();
                    let has_content = kept.iter().any(|b| match b {
                        ContentBlock::Text { text } => !text.trim().is_empty(),
                        _ => true,
                    });
                    if !has_content {
                        return None;
                    }
                    user.content = UserContent::Blocks(kept);
                }
                Some(Message::User(user))
            }
            other => Some(other),
        })
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
