// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Autocomplete trigger detection and list-navigation state.
//!
//! The actual completion source is supplied by the host application via
//! [`AutocompleteProvider`]; this module only decides *when* to ask it and
//! how the list responds to `Tab` / arrow / `Enter` / `Escape` while open.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    SlashCommand,
    FileReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionItem {
    pub label: String,
    pub insert_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutocompleteResult {
    pub prefix: String,
    pub items: Vec<CompletionItem>,
}

/// Supplies completion candidates for an open trigger context.
pub trait AutocompleteProvider {
    fn complete(
        &self,
        lines: &[String],
        cursor_line: usize,
        cursor_col: usize,
        kind: TriggerKind,
    ) -> AutocompleteResult;
}

/// Open/closed list state plus the current selection.
#[derive(Debug, Default)]
pub struct AutocompleteState {
    open: Option<(TriggerKind, AutocompleteResult)>,
    selected: usize,
}

impl AutocompleteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn kind(&self) -> Option<TriggerKind> {
        self.open.as_ref().map(|(k, _)| *k)
    }

    pub fn items(&self) -> &[CompletionItem] {
        self.open.as_ref().map(|(_, r)| r.items.as_slice()).unwrap_or(&[])
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn open_with(&mut self, kind: TriggerKind, result: AutocompleteResult) {
        self.selected = 0;
        self.open = Some((kind, result));
    }

    /// Replace the result list for the currently-open context, clamping the
    /// selection if the list shrank.
    pub fn refresh(&mut self, result: AutocompleteResult) {
        if let Some((_, r)) = &mut self.open {
            *r = result;
            self.selected = self.selected.min(r.items.len().saturating_sub(1));
        }
    }

    pub fn close(&mut self) {
        self.open = None;
        self.selected = 0;
    }

    pub fn select_next(&mut self) {
        if let Some((_, r)) = &self.open {
            if !r.items.is_empty() {
                self.selected = (self.selected + 1) % r.items.len();
            }
        }
    }

    pub fn select_prev(&mut self) {
        if let Some((_, r)) = &self.open {
            if !r.items.is_empty() {
                self.selected = (self.selected + r.items.len() - 1) % r.items.len();
            }
        }
    }

    pub fn selected_item(&self) -> Option<&CompletionItem> {
        self.open.as_ref().and_then(|(_, r)| r.items.get(self.selected))
    }
}

/// Detect whether typing `c` at column `cursor_col` (before insertion) opens
/// a new trigger context. `prev_char` is the character immediately before
/// the cursor on the same line, if any.
pub fn detect_trigger(c: char, cursor_col: usize, prev_char: Option<char>) -> Option<TriggerKind> {
    match c {
        '/' if cursor_col == 0 => Some(TriggerKind::SlashCommand),
        '@' if cursor_col == 0 || prev_char.map(char::is_whitespace).unwrap_or(false) => {
            Some(TriggerKind::FileReference)
        }
        _ => None,
    }
}
