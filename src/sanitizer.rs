//! Size management for captured payloads.
//!
//! Two pure transforms are applied to bodies before they are stored:
//! [`compress`] collapses long opaque base64-like runs (inline images, file
//! uploads, encoded blobs) into a short annotated placeholder, and
//! [`truncate`] caps text to a character budget for the external store
//! projection. The in-memory copy is only ever compressed.

use crate::constants::BASE64_RUN_MIN;
use crate::str_utils::{char_len, prefix_chars};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::borrow::Cow;

lazy_static! {
    static ref BASE64_RUN: Regex = match Regex::new(&format!("[A-Za-z0-9+/=]{{{},}}", BASE64_RUN_MIN)) {
        Ok(re) => re,
        Err(e) => panic!("invalid base64 run pattern: {}", e),
    };
}

/// Replaces every run of at least [`BASE64_RUN_MIN`] base64 alphabet
/// characters with `[base64 #<n>, <len> chars]`, numbering runs from 1.
pub fn compress(text: &str) -> Cow<'_, str> {
    let mut index = 0usize;
    BASE64_RUN.replace_all(text, |caps: &Captures<'_>| {
        index += 1;
        format!("[base64 #{}, {} chars]", index, caps[0].len())
    })
}

fn truncation_marker(original_len: usize) -> String {
    format!("...[truncated, original length: {} chars]", original_len)
}

/// Caps `text` at `max_len` characters.
///
/// Text that already fits is returned untouched. Otherwise the result is a
/// prefix followed by a marker carrying the original length, and the marker
/// counts against `max_len`, so the output never exceeds the budget and
/// truncating it again is a no-op.
pub fn truncate(text: &str, max_len: usize) -> Cow<'_, str> {
    let original_len = char_len(text);
    if original_len <= max_len {
        return Cow::Borrowed(text);
    }

    let marker = truncation_marker(original_len);
    let marker_len = char_len(&marker);
    if marker_len >= max_len {
        return Cow::Borrowed(prefix_chars(text, max_len));
    }

    let mut out = String::with_capacity(max_len + marker.len());
    out.push_str(prefix_chars(text, max_len - marker_len));
    out.push_str(&marker);
    Cow::Owned(out)
}

/// Placeholder recorded instead of a body that is not valid UTF-8.
pub fn binary_placeholder(size: usize) -> String {
    format!("[binary body, size: {} bytes]", size)
}

/// Decodes a captured body as UTF-8 text, substituting the binary
/// placeholder on failure, then collapses base64 runs.
pub fn decode_body(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => compress(text).into_owned(),
        Err(_) => binary_placeholder(bytes.len()),
    }
}
