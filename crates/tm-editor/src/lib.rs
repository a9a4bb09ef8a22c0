// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line editor core: the text buffer, cursor, history, and autocomplete
//! state behind the multi-line prompt input, decoupled from any particular
//! terminal or rendering library.

pub mod autocomplete;
pub mod editor;
pub mod history;
pub mod key;
pub mod paste;
pub mod state;
pub mod wrap;

pub use autocomplete::{
    detect_trigger, AutocompleteProvider, AutocompleteResult, AutocompleteState, CompletionItem, TriggerKind,
};
pub use editor::{Editor, EditorAction};
pub use history::History;
pub use key::{EditorEvent, InputDecoder, Key};
pub use paste::{
    char_before_is_word, classify_paste, expand_markers, looks_like_file_path, normalize_paste, PasteInsertion,
    PasteRegistry, PasteThresholds,
};
pub use state::EditorState;
pub use wrap::{build_visual_line_map, locate_cursor, visual_to_logical, VisualLine};
