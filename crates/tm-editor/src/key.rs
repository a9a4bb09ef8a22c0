// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Decodes a raw terminal byte stream into abstract [`Key`] / paste
//! [`EditorEvent`]s, independent of any particular terminal emulator.
//!
//! Two input styles are accepted: legacy `ESC [ ... <letter>` / `ESC O
//! <letter>` sequences (with or without a `;<modifier>` parameter), and the
//! Kitty keyboard protocol's `ESC [ <codepoint> ; <modifier> u` form. Both
//! can appear in the same stream; which one a given terminal sends is not
//! something this decoder needs to know in advance.
//!
//! Bracketed paste (`ESC [ 200 ~ ... ESC [ 201 ~`) is accumulated across
//! calls to [`InputDecoder::feed`] since the closing marker can arrive in a
//! later chunk than the one that started the paste.

/// An abstract key press, independent of the terminal encoding that produced
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    ShiftEnter,
    AltEnter,
    Tab,
    ShiftTab,
    Up,
    Down,
    Left,
    Right,
    WordLeft,
    WordRight,
    Home,
    End,
    Backspace,
    AltBackspace,
    Delete,
    CtrlA,
    CtrlE,
    CtrlK,
    CtrlU,
    CtrlW,
    Escape,
}

/// A decoded unit of editor input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    Key(Key),
    Paste(String),
}

const PASTE_START: &[u8] = b"\x1b[200~";
const PASTE_END: &[u8] = b"\x1b[201~";

/// Legacy CSI/SS3 sequences with no parameter, longest-prefix-first so a
/// 4-byte sequence isn't shadowed by a 3-byte one that happens to prefix it.
const LEGACY_PLAIN: &[(&[u8], Key)] = &[
    (b"\x1b[1~", Key::Home),
    (b"\x1b[4~", Key::End),
    (b"\x1b[3~", Key::Delete),
    (b"\x1b[A", Key::Up),
    (b"\x1bOA", Key::Up),
    (b"\x1b[B", Key::Down),
    (b"\x1bOB", Key::Down),
    (b"\x1b[C", Key::Right),
    (b"\x1bOC", Key::Right),
    (b"\x1b[D", Key::Left),
    (b"\x1bOD", Key::Left),
    (b"\x1b[H", Key::Home),
    (b"\x1bOH", Key::Home),
    (b"\x1b[F", Key::End),
    (b"\x1bOF", Key::End),
    (b"\x1b[Z", Key::ShiftTab),
];

/// Legacy CSI sequences with an explicit `;<modifier>` parameter, for
/// Ctrl/Alt + arrow (word navigation).
const LEGACY_MODIFIED: &[(&[u8], Key)] = &[
    (b"\x1b[1;5C", Key::WordRight),
    (b"\x1b[1;3C", Key::WordRight),
    (b"\x1b[1;5D", Key::WordLeft),
    (b"\x1b[1;3D", Key::WordLeft),
];

/// Result of trying to decode the *front* of a byte buffer.
enum Decoded {
    /// Consumed `len` bytes and produced an event.
    Event(usize, EditorEvent),
    /// Consumed `len` bytes and produced nothing (e.g. an unrecognized
    /// escape prefix we chose to swallow).
    Consumed(usize),
    /// Not enough bytes yet to tell; wait for more input.
    Incomplete,
}

fn try_legacy(buf: &[u8]) -> Option<(usize, Key)> {
    for (pat, key) in LEGACY_MODIFIED.iter().chain(LEGACY_PLAIN.iter()) {
        if buf.starts_with(pat) {
            return Some((pat.len(), *key));
        }
    }
    None
}

/// Parse a Kitty-protocol `ESC [ <codepoint> ; <modifier> u` sequence
/// starting at `buf[0]`. Returns `(consumed_len, key)` on success.
fn try_kitty(buf: &[u8]) -> Option<(usize, Key)> {
    if !buf.starts_with(b"\x1b[") {
        return None;
    }
    let rest = &buf[2..];
    let end = rest.iter().position(|&b| b == b'u')?;
    let body = std::str::from_utf8(&rest[..end]).ok()?;
    let mut parts = body.splitn(2, ';');
    let codepoint: u32 = parts.next()?.parse().ok()?;
    let modifier: u32 = parts.next().unwrap_or("1").parse().unwrap_or(1);
    let bits = modifier.saturating_sub(1);
    let shift = bits & 1 != 0;
    let alt = bits & 2 != 0;
    let ctrl = bits & 4 != 0;

    let key = match codepoint {
        13 => {
            if alt {
                Key::AltEnter
            } else if shift {
                Key::ShiftEnter
            } else {
                Key::Enter
            }
        }
        9 => {
            if shift {
                Key::ShiftTab
            } else {
                Key::Tab
            }
        }
        127 | 8 => {
            if alt {
                Key::AltBackspace
            } else {
                Key::Backspace
            }
        }
        27 => Key::Escape,
        _ if ctrl && !alt => match codepoint {
            97 => Key::CtrlA,
            101 => Key::CtrlE,
            107 => Key::CtrlK,
            117 => Key::CtrlU,
            119 => Key::CtrlW,
            _ => Key::Char(kitty_char(codepoint, shift)?),
        },
        _ => Key::Char(kitty_char(codepoint, shift)?),
    };
    Some((2 + end + 1, key))
}

fn kitty_char(codepoint: u32, shift: bool) -> Option<char> {
    let c = char::from_u32(codepoint)?;
    Some(if shift { c.to_uppercase().next().unwrap_or(c) } else { c })
}

/// Stateful decoder: owns any bytes that form part of an incomplete escape
/// sequence or an in-progress bracketed paste across calls to [`feed`].
#[derive(Debug, Default)]
pub struct InputDecoder {
    pending: Vec<u8>,
    in_paste: bool,
}

impl InputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of raw terminal bytes (one `read()` worth) and return
    /// every event it was possible to decode.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<EditorEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            match self.step() {
                Decoded::Event(len, ev) => {
                    self.pending.drain(..len);
                    events.push(ev);
                }
                Decoded::Consumed(len) => {
                    self.pending.drain(..len);
                }
                Decoded::Incomplete => break,
            }
            if self.pending.is_empty() {
                break;
            }
        }
        events
    }

    /// Called on an input idle timeout: resolves a lone pending `ESC` byte
    /// (which cannot otherwise be told apart from the start of a sequence)
    /// into a literal `Escape` key press.
    pub fn flush_pending(&mut self) -> Option<EditorEvent> {
        if self.in_paste {
            return None;
        }
        if self.pending == [0x1b] {
            self.pending.clear();
            Some(EditorEvent::Key(Key::Escape))
        } else if !self.pending.is_empty() {
            self.pending.clear();
            None
        } else {
            None
        }
    }

    fn step(&mut self) -> Decoded {
        let buf = &self.pending;
        if buf.is_empty() {
            return Decoded::Incomplete;
        }

        if self.in_paste {
            return match find_subslice(buf, PASTE_END) {
                Some(pos) => {
                    let text = String::from_utf8_lossy(&buf[..pos]).into_owned();
                    self.in_paste = false;
                    Decoded::Event(pos + PASTE_END.len(), EditorEvent::Paste(text))
                }
                None => Decoded::Incomplete,
            };
        }

        if buf.starts_with(PASTE_START) {
            self.in_paste = true;
            return Decoded::Consumed(PASTE_START.len());
        }

        if buf[0] == 0x1b {
            if buf.len() == 1 {
                return Decoded::Incomplete;
            }
            if let Some((len, key)) = try_legacy(buf) {
                return Decoded::Event(len, EditorEvent::Key(key));
            }
            if buf.starts_with(b"\x1b[") {
                match try_kitty_len(buf) {
                    Some(len) => {
                        let (_, key) = try_kitty(buf).unwrap_or((len, Key::Escape));
                        return Decoded::Event(len, EditorEvent::Key(key));
                    }
                    None => {
                        if buf.len() > 64 {
                            tracing::trace!("dropping unrecognized escape prefix, buffer too long");
                            return Decoded::Consumed(1);
                        }
                        return Decoded::Incomplete;
                    }
                }
            }
            // ESC + printable: Alt+<char>, Alt+Enter, Alt+Backspace.
            if buf.len() >= 2 {
                return match buf[1] {
                    b'\r' | b'\n' => Decoded::Event(2, EditorEvent::Key(Key::Enter)).shift_alt(),
                    0x7f | 0x08 => Decoded::Event(2, EditorEvent::Key(Key::AltBackspace)),
                    _ => Decoded::Event(1, EditorEvent::Key(Key::Escape)),
                };
            }
            return Decoded::Incomplete;
        }

        decode_control_or_utf8(buf)
    }
}

impl Decoded {
    /// `ESC \r` / `ESC \n` decode to `AltEnter`, not plain `Enter` --
    /// small helper so the match arm above stays a one-liner.
    fn shift_alt(self) -> Self {
        match self {
            Decoded::Event(len, EditorEvent::Key(Key::Enter)) => {
                Decoded::Event(len, EditorEvent::Key(Key::AltEnter))
            }
            other => other,
        }
    }
}

fn try_kitty_len(buf: &[u8]) -> Option<usize> {
    let rest = &buf[2..];
    let end = rest.iter().position(|&b| b == b'u')?;
    Some(2 + end + 1)
}

fn decode_control_or_utf8(buf: &[u8]) -> Decoded {
    match buf[0] {
        0x01 => Decoded::Event(1, EditorEvent::Key(Key::CtrlA)),
        0x05 => Decoded::Event(1, EditorEvent::Key(Key::CtrlE)),
        0x0b => Decoded::Event(1, EditorEvent::Key(Key::CtrlK)),
        0x15 => Decoded::Event(1, EditorEvent::Key(Key::CtrlU)),
        0x17 => Decoded::Event(1, EditorEvent::Key(Key::CtrlW)),
        0x09 => Decoded::Event(1, EditorEvent::Key(Key::Tab)),
        0x0d | 0x0a => Decoded::Event(1, EditorEvent::Key(Key::Enter)),
        0x7f | 0x08 => Decoded::Event(1, EditorEvent::Key(Key::Backspace)),
        b if b < 0x20 => Decoded::Consumed(1),
        _ => decode_utf8_char(buf),
    }
}

fn decode_utf8_char(buf: &[u8]) -> Decoded {
    let width = utf8_width(buf[0]);
    if buf.len() < width {
        return Decoded::Incomplete;
    }
    match std::str::from_utf8(&buf[..width]) {
        Ok(s) => match s.chars().next() {
            Some(c) => Decoded::Event(width, EditorEvent::Key(Key::Char(c))),
            None => Decoded::Consumed(width),
        },
        Err(_) => Decoded::Consumed(1),
    }
}

fn utf8_width(lead: u8) -> usize {
    if lead & 0x80 == 0 {
        1
    } else if lead & 0xe0 == 0xc0 {
        2
    } else if lead & 0xf0 == 0xe0 {
        3
    } else if lead & 0xf8 == 0xf0 {
        4
    } else {
        1
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
