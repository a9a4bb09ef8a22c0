// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ties input decoding, editing, history, and autocomplete together into
//! one [`Editor`] façade that maps each decoded event onto state mutations,
//! the same shape as `sven-tui`'s `app/dispatch.rs` mapping `Action`s onto
//! `App` mutations.

use crate::autocomplete::{detect_trigger, AutocompleteProvider, AutocompleteState, TriggerKind};
use crate::key::{EditorEvent, InputDecoder, Key};
use crate::state::EditorState;

/// What happened in response to one decoded input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorAction {
    None,
    BufferChanged,
    AutocompleteOpened,
    AutocompleteClosed,
    Submitted(String),
}

pub struct Editor {
    pub state: EditorState,
    pub autocomplete: AutocompleteState,
    decoder: InputDecoder,
}

impl Default for Editor {
    fn default() -> Self {
        Self::new()
    }
}

impl Editor {
    pub fn new() -> Self {
        Self { state: EditorState::new(), autocomplete: AutocompleteState::new(), decoder: InputDecoder::new() }
    }

    /// Feed one chunk of raw terminal bytes (one `read()` worth) through
    /// decoding and dispatch, returning the resulting actions in order.
    pub fn feed_bytes(
        &mut self,
        chunk: &[u8],
        width: usize,
        provider: Option<&dyn AutocompleteProvider>,
    ) -> Vec<EditorAction> {
        let events = self.decoder.feed(chunk);
        events.into_iter().map(|ev| self.handle_event(ev, width, provider)).collect()
    }

    /// Call on an input idle timeout to resolve a lone pending `ESC` byte.
    pub fn flush_idle(
        &mut self,
        width: usize,
        provider: Option<&dyn AutocompleteProvider>,
    ) -> Option<EditorAction> {
        self.decoder.flush_pending().map(|ev| self.handle_event(ev, width, provider))
    }

    fn handle_event(
        &mut self,
        event: EditorEvent,
        width: usize,
        provider: Option<&dyn AutocompleteProvider>,
    ) -> EditorAction {
        match event {
            EditorEvent::Paste(raw) => {
                self.state.apply_paste(&raw);
                self.autocomplete.close();
                EditorAction::BufferChanged
            }
            EditorEvent::Key(key) => self.handle_key(key, width, provider),
        }
    }

    fn handle_key(&mut self, key: Key, width: usize, provider: Option<&dyn AutocompleteProvider>) -> EditorAction {
        if self.autocomplete.is_open() {
            match key {
                Key::Up => {
                    self.autocomplete.select_prev();
                    return EditorAction::None;
                }
                Key::Down => {
                    self.autocomplete.select_next();
                    return EditorAction::None;
                }
                Key::Escape => {
                    self.autocomplete.close();
                    return EditorAction::AutocompleteClosed;
                }
                Key::Tab => {
                    self.apply_selected_completion();
                    return EditorAction::BufferChanged;
                }
                Key::Enter => {
                    let was_slash = self.autocomplete.kind() == Some(TriggerKind::SlashCommand);
                    self.apply_selected_completion();
                    if was_slash {
                        if let Some(text) = self.state.submit() {
                            return EditorAction::Submitted(text);
                        }
                    }
                    return EditorAction::BufferChanged;
                }
                _ => {
                    // Other keys fall through to normal editing *and* refresh the list.
                    let action = self.handle_plain_key(key, width, provider);
                    self.refresh_autocomplete(provider);
                    return action;
                }
            }
        }
        self.handle_plain_key(key, width, provider)
    }

    fn apply_selected_completion(&mut self) {
        if let Some(item) = self.autocomplete.selected_item() {
            let insert_text = item.insert_text.clone();
            for c in insert_text.chars() {
                self.state.insert_char(c);
            }
        }
        self.autocomplete.close();
    }

    fn refresh_autocomplete(&mut self, provider: Option<&dyn AutocompleteProvider>) {
        if !self.autocomplete.is_open() {
            return;
        }
        if let (Some(kind), Some(p)) = (self.autocomplete.kind(), provider) {
            let result = p.complete(&self.state.logical_lines, self.state.cursor_line, self.state.cursor_col, kind);
            self.autocomplete.refresh(result);
        }
    }

    fn maybe_trigger_autocomplete(&mut self, c: char, provider: Option<&dyn AutocompleteProvider>) -> bool {
        let prev = if self.state.cursor_col == 0 {
            None
        } else {
            self.state.logical_lines[self.state.cursor_line][..self.state.cursor_col].chars().next_back()
        };
        if let (Some(kind), Some(p)) = (detect_trigger(c, self.state.cursor_col, prev), provider) {
            let result = p.complete(&self.state.logical_lines, self.state.cursor_line, self.state.cursor_col, kind);
            self.autocomplete.open_with(kind, result);
            return true;
        }
        false
    }

    fn handle_plain_key(&mut self, key: Key, width: usize, provider: Option<&dyn AutocompleteProvider>) -> EditorAction {
        match key {
            Key::Char(c) => {
                let triggered = self.maybe_trigger_autocomplete(c, provider);
                self.state.insert_char(c);
                if triggered {
                    EditorAction::AutocompleteOpened
                } else {
                    EditorAction::BufferChanged
                }
            }
            Key::Enter => match self.state.submit() {
                Some(text) => EditorAction::Submitted(text),
                None => {
                    self.state.insert_char('\n');
                    EditorAction::BufferChanged
                }
            },
            Key::ShiftEnter | Key::AltEnter => {
                self.state.insert_char('\n');
                EditorAction::BufferChanged
            }
            Key::Tab => {
                if let Some(p) = provider {
                    let kind = if self.state.cursor_col == 0 {
                        TriggerKind::SlashCommand
                    } else {
                        TriggerKind::FileReference
                    };
                    let result =
                        p.complete(&self.state.logical_lines, self.state.cursor_line, self.state.cursor_col, kind);
                    self.autocomplete.open_with(kind, result);
                    EditorAction::AutocompleteOpened
                } else {
                    EditorAction::None
                }
            }
            Key::ShiftTab => EditorAction::None,
            Key::Up => {
                if self.state.move_visual_up(width) {
                    EditorAction::BufferChanged
                } else if self.state.history_up(width) {
                    EditorAction::BufferChanged
                } else {
                    EditorAction::None
                }
            }
            Key::Down => {
                if self.state.move_visual_down(width) {
                    EditorAction::BufferChanged
                } else if self.state.history_down(width) {
                    EditorAction::BufferChanged
                } else {
                    EditorAction::None
                }
            }
            Key::Left => {
                self.state.move_left();
                EditorAction::BufferChanged
            }
            Key::Right => {
                self.state.move_right();
                EditorAction::BufferChanged
            }
            Key::WordLeft => {
                self.state.move_word_left();
                EditorAction::BufferChanged
            }
            Key::WordRight => {
                self.state.move_word_right();
                EditorAction::BufferChanged
            }
            Key::Home => {
                self.state.move_line_start();
                EditorAction::BufferChanged
            }
            Key::End => {
                self.state.move_line_end();
                EditorAction::BufferChanged
            }
            Key::Backspace => {
                self.state.backspace();
                EditorAction::BufferChanged
            }
            Key::AltBackspace | Key::CtrlW => {
                self.state.delete_word_left();
                EditorAction::BufferChanged
            }
            Key::Delete => {
                self.state.delete_forward();
                EditorAction::BufferChanged
            }
            Key::CtrlA => {
                self.state.move_line_start();
                EditorAction::BufferChanged
            }
            Key::CtrlE => {
                self.state.move_line_end();
                EditorAction::BufferChanged
            }
            Key::CtrlK => {
                self.state.kill_to_line_end();
                EditorAction::BufferChanged
            }
            Key::CtrlU => {
                self.state.kill_to_line_start();
                EditorAction::BufferChanged
            }
            Key::Escape => EditorAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocomplete::CompletionItem;

    struct FixedProvider(Vec<CompletionItem>);

    impl AutocompleteProvider for FixedProvider {
        fn complete(
            &self,
            _lines: &[String],
            _cursor_line: usize,
            _cursor_col: usize,
            _kind: TriggerKind,
        ) -> crate::autocomplete::AutocompleteResult {
            crate::autocomplete::AutocompleteResult { prefix: String::new(), items: self.0.clone() }
        }
    }

    fn item(label: &str) -> CompletionItem {
        CompletionItem { label: label.to_string(), insert_text: label.to_string() }
    }

    #[test]
    fn typing_plain_char_updates_buffer() {
        let mut ed = Editor::new();
        let actions = ed.feed_bytes(b"hi", 80, None);
        assert_eq!(actions, vec![EditorAction::BufferChanged, EditorAction::BufferChanged]);
        assert_eq!(ed.state.text(), "hi");
    }

    #[test]
    fn enter_submits_non_empty_buffer() {
        let mut ed = Editor::new();
        ed.feed_bytes(b"hello", 80, None);
        let actions = ed.feed_bytes(b"\r", 80, None);
        assert_eq!(actions, vec![EditorAction::Submitted("hello".to_string())]);
        assert!(ed.state.is_empty());
    }

    #[test]
    fn slash_at_start_opens_autocomplete_with_provider() {
        let provider = FixedProvider(vec![item("help"), item("quit")]);
        let mut ed = Editor::new();
        let actions = ed.feed_bytes(b"/", 80, Some(&provider));
        assert_eq!(actions, vec![EditorAction::AutocompleteOpened]);
        assert!(ed.autocomplete.is_open());
    }

    #[test]
    fn enter_while_slash_autocomplete_open_applies_then_submits() {
        let provider = FixedProvider(vec![item("help")]);
        let mut ed = Editor::new();
        ed.feed_bytes(b"/", 80, Some(&provider));
        let actions = ed.feed_bytes(b"\r", 80, Some(&provider));
        assert_eq!(actions, vec![EditorAction::Submitted("/help".to_string())]);
    }

    #[test]
    fn escape_closes_autocomplete_without_editing() {
        let provider = FixedProvider(vec![item("help")]);
        let mut ed = Editor::new();
        ed.feed_bytes(b"/", 80, Some(&provider));
        let actions = ed.feed_bytes(&[0x1b], 80, Some(&provider));
        assert_eq!(actions, vec![EditorAction::AutocompleteClosed]);
        assert!(!ed.autocomplete.is_open());
    }

    #[test]
    fn bracketed_paste_inserts_and_closes_autocomplete() {
        let provider = FixedProvider(vec![item("help")]);
        let mut ed = Editor::new();
        ed.feed_bytes(b"/", 80, Some(&provider));
        assert!(ed.autocomplete.is_open());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x1b[200~");
        bytes.extend_from_slice(b"pasted");
        bytes.extend_from_slice(b"\x1b[201~");
        ed.feed_bytes(&bytes, 80, Some(&provider));
        assert!(!ed.autocomplete.is_open());
        assert_eq!(ed.state.text(), "/pasted");
    }
}
