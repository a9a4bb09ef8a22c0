// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The text buffer and cursor for a multi-line prompt input: grapheme-aware
//! editing, word navigation, visual-line-aware up/down movement, history
//! browsing, and paste handling.

use unicode_segmentation::UnicodeSegmentation;

use crate::history::History;
use crate::paste::{
    char_before_is_word, classify_paste, expand_markers, looks_like_file_path, normalize_paste,
    PasteInsertion, PasteRegistry, PasteThresholds,
};
use crate::wrap::{build_visual_line_map, locate_cursor, visual_to_logical};

const PUNCTUATION: &str = "(){}[]<>.,;:'\"!?+-=*/\\|&%^$#@~`";

fn grapheme_len_at(line: &str, col: usize) -> usize {
    line[col..].graphemes(true).next().map(str::len).unwrap_or(0)
}

fn grapheme_len_before(line: &str, col: usize) -> usize {
    line[..col].graphemes(true).next_back().map(str::len).unwrap_or(0)
}

fn char_positions(line: &str) -> (Vec<usize>, Vec<char>) {
    let idxs: Vec<usize> = line.char_indices().map(|(i, _)| i).chain(std::iter::once(line.len())).collect();
    let chars: Vec<char> = line.chars().collect();
    (idxs, chars)
}

fn word_left(line: &str, col: usize) -> usize {
    let (idxs, chars) = char_positions(line);
    let pos = idxs.iter().position(|&i| i == col).unwrap_or(chars.len());
    if pos == 0 {
        return 0;
    }
    let mut p = pos;
    while p > 0 && chars[p - 1].is_whitespace() {
        p -= 1;
    }
    if p > 0 {
        let is_punct = PUNCTUATION.contains(chars[p - 1]);
        while p > 0 && !chars[p - 1].is_whitespace() && PUNCTUATION.contains(chars[p - 1]) == is_punct {
            p -= 1;
        }
    }
    idxs[p]
}

fn word_right(line: &str, col: usize) -> usize {
    let (idxs, chars) = char_positions(line);
    let pos = idxs.iter().position(|&i| i == col).unwrap_or(chars.len());
    if pos >= chars.len() {
        return line.len();
    }
    let mut p = pos;
    while p < chars.len() && chars[p].is_whitespace() {
        p += 1;
    }
    if p < chars.len() {
        let is_punct = PUNCTUATION.contains(chars[p]);
        while p < chars.len() && !chars[p].is_whitespace() && PUNCTUATION.contains(chars[p]) == is_punct {
            p += 1;
        }
    }
    idxs[p]
}

fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        vec![String::new()]
    } else {
        text.split('\n').map(str::to_string).collect()
    }
}

/// `{ logical_lines, cursor_line, cursor_col }` plus the paste registry and
/// submission history that travel with it.
///
/// Invariants: `logical_lines` is never empty (an empty buffer is
/// `[""]`); `cursor_line` indexes `logical_lines`; `cursor_col` is a byte
/// offset within `logical_lines[cursor_line]` that always falls on a
/// grapheme boundary.
#[derive(Debug, Clone)]
pub struct EditorState {
    pub logical_lines: Vec<String>,
    pub cursor_line: usize,
    pub cursor_col: usize,
    pub history: History,
    pub paste_registry: PasteRegistry,
    pub disable_submit: bool,
    pub thresholds: PasteThresholds,
}

impl Default for EditorState {
    fn default() -> Self {
        Self {
            logical_lines: vec![String::new()],
            cursor_line: 0,
            cursor_col: 0,
            history: History::new(),
            paste_registry: PasteRegistry::new(),
            disable_submit: false,
            thresholds: PasteThresholds::default(),
        }
    }
}

impl EditorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.logical_lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.logical_lines.len() == 1 && self.logical_lines[0].is_empty()
    }

    /// Replace the whole buffer, exiting history-browse mode. For updating
    /// the buffer *while* browsing history use the internal history
    /// navigation methods instead, which preserve the browse index.
    pub fn set_text(&mut self, text: &str) {
        self.replace_buffer(text);
        self.history.reset_browse();
    }

    fn replace_buffer(&mut self, text: &str) {
        self.logical_lines = split_lines(text);
        self.cursor_line = self.logical_lines.len() - 1;
        self.cursor_col = self.logical_lines[self.cursor_line].len();
    }

    fn char_before_cursor(&self) -> Option<char> {
        self.logical_lines[self.cursor_line][..self.cursor_col].chars().next_back()
    }

    // ── Editing ───────────────────────────────────────────────────────────

    pub fn insert_char(&mut self, c: char) {
        self.history.reset_browse();
        if c == '\n' {
            self.insert_newline();
            return;
        }
        let line = &mut self.logical_lines[self.cursor_line];
        line.insert(self.cursor_col, c);
        self.cursor_col += c.len_utf8();
    }

    fn insert_newline(&mut self) {
        let line = self.logical_lines[self.cursor_line].clone();
        let (before, after) = line.split_at(self.cursor_col);
        let after = after.to_string();
        self.logical_lines[self.cursor_line] = before.to_string();
        self.logical_lines.insert(self.cursor_line + 1, after);
        self.cursor_line += 1;
        self.cursor_col = 0;
    }

    pub fn backspace(&mut self) {
        self.history.reset_browse();
        if self.cursor_col == 0 {
            self.merge_with_previous_line();
            return;
        }
        let line = &mut self.logical_lines[self.cursor_line];
        let del_len = grapheme_len_before(line, self.cursor_col);
        let new_col = self.cursor_col - del_len;
        line.replace_range(new_col..self.cursor_col, "");
        self.cursor_col = new_col;
    }

    pub fn delete_forward(&mut self) {
        self.history.reset_browse();
        let line_len = self.logical_lines[self.cursor_line].len();
        if self.cursor_col >= line_len {
            self.merge_with_next_line();
            return;
        }
        let line = &mut self.logical_lines[self.cursor_line];
        let del_len = grapheme_len_at(line, self.cursor_col);
        line.replace_range(self.cursor_col..self.cursor_col + del_len, "");
    }

    pub fn delete_word_left(&mut self) {
        self.history.reset_browse();
        let line = self.logical_lines[self.cursor_line].clone();
        let new_col = word_left(&line, self.cursor_col);
        if new_col == self.cursor_col && self.cursor_col == 0 {
            self.merge_with_previous_line();
            return;
        }
        self.logical_lines[self.cursor_line].replace_range(new_col..self.cursor_col, "");
        self.cursor_col = new_col;
    }

    fn merge_with_previous_line(&mut self) {
        if self.cursor_line == 0 {
            return;
        }
        let cur = self.logical_lines.remove(self.cursor_line);
        self.cursor_line -= 1;
        let prev_len = self.logical_lines[self.cursor_line].len();
        self.logical_lines[self.cursor_line].push_str(&cur);
        self.cursor_col = prev_len;
    }

    fn merge_with_next_line(&mut self) {
        if self.cursor_line + 1 >= self.logical_lines.len() {
            return;
        }
        let next = self.logical_lines.remove(self.cursor_line + 1);
        self.logical_lines[self.cursor_line].push_str(&next);
    }

    pub fn kill_to_line_start(&mut self) {
        self.history.reset_browse();
        if self.cursor_col == 0 {
            self.merge_with_previous_line();
            return;
        }
        self.logical_lines[self.cursor_line].replace_range(0..self.cursor_col, "");
        self.cursor_col = 0;
    }

    pub fn kill_to_line_end(&mut self) {
        self.history.reset_browse();
        let line_len = self.logical_lines[self.cursor_line].len();
        if self.cursor_col >= line_len {
            self.merge_with_next_line();
            return;
        }
        self.logical_lines[self.cursor_line].truncate(self.cursor_col);
    }

    // ── Navigation ────────────────────────────────────────────────────────

    pub fn move_left(&mut self) {
        if self.cursor_col == 0 {
            if self.cursor_line > 0 {
                self.cursor_line -= 1;
                self.cursor_col = self.logical_lines[self.cursor_line].len();
            }
            return;
        }
        let line = &self.logical_lines[self.cursor_line];
        self.cursor_col -= grapheme_len_before(line, self.cursor_col);
    }

    pub fn move_right(&mut self) {
        let line_len = self.logical_lines[self.cursor_line].len();
        if self.cursor_col >= line_len {
            if self.cursor_line + 1 < self.logical_lines.len() {
                self.cursor_line += 1;
                self.cursor_col = 0;
            }
            return;
        }
        let line = &self.logical_lines[self.cursor_line];
        self.cursor_col += grapheme_len_at(line, self.cursor_col);
    }

    pub fn move_word_left(&mut self) {
        let line = self.logical_lines[self.cursor_line].clone();
        self.cursor_col = word_left(&line, self.cursor_col);
    }

    pub fn move_word_right(&mut self) {
        let line = self.logical_lines[self.cursor_line].clone();
        self.cursor_col = word_right(&line, self.cursor_col);
    }

    pub fn move_line_start(&mut self) {
        self.cursor_col = 0;
    }

    pub fn move_line_end(&mut self) {
        self.cursor_col = self.logical_lines[self.cursor_line].len();
    }

    fn cursor_visual_row(&self, width: usize) -> usize {
        let map = build_visual_line_map(&self.logical_lines, width);
        locate_cursor(&map, &self.logical_lines, self.cursor_line, self.cursor_col).0
    }

    pub fn is_on_first_visual_line(&self, width: usize) -> bool {
        self.cursor_visual_row(width) == 0
    }

    pub fn is_on_last_visual_line(&self, width: usize) -> bool {
        let map = build_visual_line_map(&self.logical_lines, width);
        let row = locate_cursor(&map, &self.logical_lines, self.cursor_line, self.cursor_col).0;
        row + 1 >= map.len()
    }

    /// Move up one visual row, preserving display column. Returns `false`
    /// (and does nothing) if already on the first visual line.
    pub fn move_visual_up(&mut self, width: usize) -> bool {
        let map = build_visual_line_map(&self.logical_lines, width);
        let (row, col) = locate_cursor(&map, &self.logical_lines, self.cursor_line, self.cursor_col);
        if row == 0 {
            return false;
        }
        let (line, byte_col) = visual_to_logical(&map, &self.logical_lines, row - 1, col);
        self.cursor_line = line;
        self.cursor_col = byte_col;
        true
    }

    /// Move down one visual row, preserving display column. Returns `false`
    /// if already on the last visual line.
    pub fn move_visual_down(&mut self, width: usize) -> bool {
        let map = build_visual_line_map(&self.logical_lines, width);
        let (row, col) = locate_cursor(&map, &self.logical_lines, self.cursor_line, self.cursor_col);
        if row + 1 >= map.len() {
            return false;
        }
        let (line, byte_col) = visual_to_logical(&map, &self.logical_lines, row + 1, col);
        self.cursor_line = line;
        self.cursor_col = byte_col;
        true
    }

    // ── History ───────────────────────────────────────────────────────────

    /// `↑` when the buffer is empty or the cursor is on the first visual
    /// line: move back through history. Returns `true` if it moved.
    pub fn history_up(&mut self, width: usize) -> bool {
        if !(self.is_empty() || self.is_on_first_visual_line(width)) {
            return false;
        }
        match self.history.back() {
            Some(text) => {
                let text = text.to_string();
                self.replace_buffer(&text);
                true
            }
            None => false,
        }
    }

    /// `↓` when the cursor is on the last visual line: move forward through
    /// history, or back to the empty live buffer at `index == -1`.
    pub fn history_down(&mut self, width: usize) -> bool {
        if !self.is_on_last_visual_line(width) || !self.history.is_browsing() {
            return false;
        }
        match self.history.forward() {
            Some(text) => {
                let text = text.to_string();
                self.replace_buffer(&text);
            }
            None => self.replace_buffer(""),
        }
        true
    }

    // ── Paste ─────────────────────────────────────────────────────────────

    pub fn apply_paste(&mut self, raw: &str) {
        self.history.reset_browse();
        let normalized = normalize_paste(raw);
        let before = self.char_before_cursor();
        let prefixed = if looks_like_file_path(&normalized) && char_before_is_word(before) {
            format!(" {normalized}")
        } else {
            normalized
        };
        match classify_paste(&prefixed, &mut self.paste_registry, &self.thresholds) {
            PasteInsertion::Inline(text) => self.insert_multiline_at_cursor(&text),
            PasteInsertion::Marker { token, .. } => self.insert_multiline_at_cursor(&token),
        }
    }

    fn insert_multiline_at_cursor(&mut self, text: &str) {
        if !text.contains('\n') {
            let line = &mut self.logical_lines[self.cursor_line];
            line.insert_str(self.cursor_col, text);
            self.cursor_col += text.len();
            return;
        }
        let line = self.logical_lines[self.cursor_line].clone();
        let (before, after) = line.split_at(self.cursor_col);
        let mut parts: Vec<String> = text.split('\n').map(str::to_string).collect();
        let last_idx = parts.len() - 1;
        parts[0] = format!("{before}{}", parts[0]);
        let tail_len = parts[last_idx].len();
        parts[last_idx] = format!("{}{after}", parts[last_idx]);
        self.logical_lines.splice(self.cursor_line..=self.cursor_line, parts);
        self.cursor_line += last_idx;
        self.cursor_col = tail_len;
    }

    // ── Submission ────────────────────────────────────────────────────────

    /// Join the buffer with `\n`, trim, expand paste markers back to their
    /// original text, clear the buffer and paste registry, and push the
    /// result to history. Returns `None` if submission is disabled or the
    /// trimmed buffer is empty. The caller is responsible for actually
    /// dispatching the returned text.
    pub fn submit(&mut self) -> Option<String> {
        if self.disable_submit {
            return None;
        }
        let joined = self.logical_lines.join("\n");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            return None;
        }
        let expanded = expand_markers(trimmed, &self.paste_registry);
        self.history.push(&expanded);
        self.logical_lines = vec![String::new()];
        self.cursor_line = 0;
        self.cursor_col = 0;
        self.paste_registry.clear();
        Some(expanded)
    }
}
