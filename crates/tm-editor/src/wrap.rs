// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Greedy grapheme-aware soft-wrapping of the logical-line buffer into a
//! [`VisualLine`] map, plus conversions between visual (row, display-column)
//! and logical (line, byte) cursor coordinates.
//!
//! The column-accounting loop mirrors `wrap_content`'s single-string
//! approach, generalized from one newline-delimited string to a `Vec` of
//! logical lines and from `char`s to grapheme clusters so multi-codepoint
//! emoji sequences count as one cursor step.

use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

/// One soft-wrapped segment of a logical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualLine {
    pub logical_line: usize,
    /// Byte offset into the logical line where this segment starts.
    pub start_col: usize,
    /// Byte length of this segment.
    pub length: usize,
}

/// Display width of a grapheme cluster. Complex ZWJ sequences (e.g. family
/// emoji) are clamped to 2 columns rather than summed per-codepoint, since
/// that's how most terminals actually render them.
fn grapheme_width(g: &str) -> usize {
    UnicodeWidthStr::width(g).min(2)
}

fn display_width(s: &str) -> usize {
    s.graphemes(true).map(grapheme_width).sum()
}

/// Build the visual-line map for `logical_lines` at render width `width`.
/// `width == 0` disables soft-wrapping (one segment per logical line).
pub fn build_visual_line_map(logical_lines: &[String], width: usize) -> Vec<VisualLine> {
    let mut out = Vec::new();
    for (li, line) in logical_lines.iter().enumerate() {
        if width == 0 || line.is_empty() {
            out.push(VisualLine { logical_line: li, start_col: 0, length: line.len() });
            continue;
        }
        let mut seg_start = 0usize;
        let mut col = 0usize;
        let mut byte = 0usize;
        for g in line.graphemes(true) {
            let w = grapheme_width(g);
            if col + w > width && byte > seg_start {
                out.push(VisualLine { logical_line: li, start_col: seg_start, length: byte - seg_start });
                seg_start = byte;
                col = 0;
            }
            col += w;
            byte += g.len();
        }
        out.push(VisualLine { logical_line: li, start_col: seg_start, length: byte - seg_start });
    }
    out
}

/// Locate `(cursor_line, cursor_col)` within `map`, returning
/// `(visual_row, visual_col)` where `visual_col` is a display-width offset
/// within that row. A cursor sitting exactly at the end of a full segment
/// belongs to the *next* segment of the same logical line, unless it is the
/// final segment of the whole buffer.
pub fn locate_cursor(
    map: &[VisualLine],
    logical_lines: &[String],
    cursor_line: usize,
    cursor_col: usize,
) -> (usize, usize) {
    let mut last_for_line: Option<usize> = None;
    for (i, vl) in map.iter().enumerate() {
        if vl.logical_line != cursor_line {
            continue;
        }
        last_for_line = Some(i);
        let seg_end = vl.start_col + vl.length;
        let is_last_segment_of_line = !matches!(map.get(i + 1), Some(n) if n.logical_line == cursor_line);
        if cursor_col < seg_end || (cursor_col == seg_end && is_last_segment_of_line) {
            let line = &logical_lines[cursor_line];
            let col = display_width(&line[vl.start_col..cursor_col.min(line.len())]);
            return (i, col);
        }
    }
    match last_for_line {
        Some(i) => {
            let vl = map[i];
            let line = &logical_lines[cursor_line];
            let col = display_width(&line[vl.start_col..]);
            (i, col)
        }
        None => (0, 0),
    }
}

/// Inverse of [`locate_cursor`]: given a visual `(row, col)`, return the
/// corresponding `(logical_line, byte_col)`, clamping `col` to the segment
/// length when the target row is shorter than the requested column.
pub fn visual_to_logical(
    map: &[VisualLine],
    logical_lines: &[String],
    visual_row: usize,
    visual_col: usize,
) -> (usize, usize) {
    let row = visual_row.min(map.len().saturating_sub(1));
    let vl = map[row];
    let line = &logical_lines[vl.logical_line];
    let seg_end = (vl.start_col + vl.length).min(line.len());
    let seg = &line[vl.start_col..seg_end];
    let mut col = 0usize;
    let mut byte = vl.start_col;
    for g in seg.graphemes(true) {
        if col >= visual_col {
            break;
        }
        col += grapheme_width(g);
        byte += g.len();
    }
    (vl.logical_line, byte)
}
