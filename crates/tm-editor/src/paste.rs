// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bracketed-paste normalization, the large-paste marker registry, and
//! marker expansion on submit.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

const DEFAULT_LINE_THRESHOLD: usize = 10;
const DEFAULT_CHAR_THRESHOLD: usize = 1000;

/// Maps a paste marker id to the original pasted text it stands in for.
#[derive(Debug, Default, Clone)]
pub struct PasteRegistry {
    next_id: u32,
    entries: HashMap<u32, String>,
}

impl PasteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, text: String) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(id, text);
        id
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_id = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Line/char thresholds above which a paste is collapsed into a marker
/// instead of inserted inline.
#[derive(Debug, Clone, Copy)]
pub struct PasteThresholds {
    pub lines: usize,
    pub chars: usize,
}

impl Default for PasteThresholds {
    fn default() -> Self {
        Self { lines: DEFAULT_LINE_THRESHOLD, chars: DEFAULT_CHAR_THRESHOLD }
    }
}

/// Normalize raw pasted text per the bracketed-paste close rules: CRLF/CR
/// collapse to LF, tabs expand to four spaces, non-printable bytes other
/// than LF are stripped.
pub fn normalize_paste(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    for c in unified.chars() {
        if c == '\n' {
            out.push('\n');
        } else if c == '\t' {
            out.push_str("    ");
        } else if c.is_control() {
            // strip
        } else {
            out.push(c);
        }
    }
    out
}

/// `true` if `text` looks like a pasted filesystem path: starts with `/`,
/// `~`, or `.`.
pub fn looks_like_file_path(text: &str) -> bool {
    text.starts_with('/') || text.starts_with('~') || text.starts_with('.')
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether the character immediately before the cursor (if any) is a "word"
/// character, used by the file-path paste heuristic.
pub fn char_before_is_word(before_cursor: Option<char>) -> bool {
    before_cursor.map(is_word_char).unwrap_or(false)
}

/// Outcome of classifying a normalized paste against the configured
/// thresholds.
pub enum PasteInsertion {
    Inline(String),
    Marker { id: u32, token: String },
}

/// Decide how a normalized paste should be inserted: inline, or collapsed
/// behind a marker token recorded in `registry`. Line-count threshold is
/// checked before char-count, matching the marker token's own `+N lines`
/// vs `N chars` wording.
pub fn classify_paste(
    normalized: &str,
    registry: &mut PasteRegistry,
    thresholds: &PasteThresholds,
) -> PasteInsertion {
    let line_count = normalized.matches('\n').count() + 1;
    let char_count = normalized.chars().count();
    if line_count > thresholds.lines || char_count > thresholds.chars {
        let id = registry.store(normalized.to_string());
        let token = if line_count > thresholds.lines {
            format!("[paste #{id} +{line_count} lines]")
        } else {
            format!("[paste #{id} {char_count} chars]")
        };
        PasteInsertion::Marker { id, token }
    } else {
        PasteInsertion::Inline(normalized.to_string())
    }
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[paste #(\d+)(?: (?:\+\d+ lines|\d+ chars))?\]").unwrap())
}

/// Expand every `[paste #N ...]` marker in `text` back to its original
/// content. A marker with no matching registry entry (corruption, or a
/// stale id from a previous buffer) is left verbatim rather than erroring.
pub fn expand_markers(text: &str, registry: &PasteRegistry) -> String {
    marker_regex()
        .replace_all(text, |caps: &regex::Captures| {
            let id: u32 = caps[1].parse().unwrap_or(0);
            registry.get(id).map(str::to_string).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
