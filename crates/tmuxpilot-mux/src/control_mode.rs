// tmux control mode (-C) parser.
//
// Parses output from `tmux -C attach-session`. Control mode outputs lines
// starting with `%` prefix. This module provides:
//
// - `ControlEvent` enum for parsed event types
// - `decode_octal_escaped()` for tmux octal escape sequences
// - `parse_line()` for parsing a single control mode output line

use bytes::Bytes;

/// Parsed event from tmux control mode output.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Terminal output from a pane.
    /// Format: `%output %<pane-id> <octal-escaped-bytes>`
    Output { pane_id: String, data: Bytes },

    /// Extended output from a pane (includes age/latency).
    /// Format: `%extended-output %<pane-id> <age> : <octal-escaped-bytes>`
    ExtendedOutput {
        pane_id: String,
        age: u64,
        data: Bytes,
    },

    /// Window layout changed.
    /// Format: `%layout-change @<window-id> <layout-string>`
    LayoutChange { window_id: String, layout: String },

    /// Session changed.
    /// Format: `%session-changed $<id> <name>`
    SessionChanged { session_id: String, name: String },

    /// Window added.
    /// Format: `%window-add @<id>`
    WindowAdd { window_id: String },

    /// Window closed.
    /// Format: `%window-close @<id>`
    WindowClose { window_id: String },

    /// Pane mode changed.
    /// Format: `%pane-mode-changed %<pane-id>`
    PaneModeChanged { pane_id: String },

    /// Control mode exit.
    /// Format: `%exit [reason]`
    Exit { reason: String },

    /// Unrecognized control mode line (starts with `%` but not a known event).
    Unknown(String),
}

/// Decode tmux octal-escaped byte string into raw bytes.
///
/// Tmux control mode encodes non-printable and non-ASCII bytes using octal
/// escape sequences:
/// - `\NNN` where NNN is exactly 3 octal digits maps to a single byte
/// - `\\` maps to a literal backslash (`\`)
/// - All other characters pass through as their UTF-8 bytes
///
/// Multi-byte UTF-8 characters (CJK, emoji, etc.) appear as consecutive
/// octal escapes for each byte of the UTF-8 encoding.
pub fn decode_octal_escaped(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut out = Vec::with_capacity(len);
    let mut i = 0;

    while i < len {
        if bytes[i] == b'\\' && i + 1 < len {
            if i + 3 < len
                && is_octal_digit(bytes[i + 1])
                && is_octal_digit(bytes[i + 2])
                && is_octal_digit(bytes[i + 3])
            {
                let val = (bytes[i + 1] - b'0') as u16 * 64
                    + (bytes[i + 2] - b'0') as u16 * 8
                    + (bytes[i + 3] - b'0') as u16;
                out.push(val as u8);
                i += 4;
            } else if bytes[i + 1] == b'\\' {
                out.push(b'\\');
                i += 2;
            } else {
                out.push(b'\\');
                i += 1;
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    out
}

/// Parse a single control mode line into a `ControlEvent`.
///
/// Returns `None` if the line does not start with `%` (i.e., it is not a
/// control mode event line — could be a command response or empty line).
pub fn parse_line(line: &str) -> Option<ControlEvent> {
    let line = line.trim_end_matches(['\r', '\n']);

    if !line.starts_with('%') {
        return None;
    }

    let (keyword, rest) = split_first_word(line);

    match keyword {
        "%output" => parse_output(rest),
        "%extended-output" => parse_extended_output(rest),
        "%layout-change" => parse_layout_change(rest),
        "%session-changed" => parse_session_changed(rest),
        "%window-add" => parse_window_add(rest),
        "%window-close" => parse_window_close(rest),
        "%pane-mode-changed" => parse_pane_mode_changed(rest),
        "%exit" => Some(ControlEvent::Exit {
            reason: rest.to_string(),
        }),
        _ => Some(ControlEvent::Unknown(line.to_string())),
    }
}

#[inline]
fn is_octal_digit(b: u8) -> bool {
    b.is_ascii_digit() && b < b'8'
}

fn split_first_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn parse_output(rest: &str) -> Option<ControlEvent> {
    let (pane_id, data_str) = split_first_word(rest);
    if pane_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%output {rest}")));
    }
    let data = decode_octal_escaped(data_str);
    Some(ControlEvent::Output {
        pane_id: pane_id.to_string(),
        data: Bytes::from(data),
    })
}

fn parse_extended_output(rest: &str) -> Option<ControlEvent> {
    let (pane_id, rest) = split_first_word(rest);
    if pane_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%extended-output {rest}")));
    }
    let (age_str, rest) = split_first_word(rest);
    let age: u64 = match age_str.parse() {
        Ok(v) => v,
        Err(_) => {
            return Some(ControlEvent::Unknown(format!(
                "%extended-output {pane_id} {age_str} {rest}"
            )));
        }
    };
    let rest = rest.strip_prefix(": ").or_else(|| rest.strip_prefix(":"))?;
    let data = decode_octal_escaped(rest);
    Some(ControlEvent::ExtendedOutput {
        pane_id: pane_id.to_string(),
        age,
        data: Bytes::from(data),
    })
}

fn parse_layout_change(rest: &str) -> Option<ControlEvent> {
    let (window_id, layout) = split_first_word(rest);
    if window_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%layout-change {rest}")));
    }
    Some(ControlEvent::LayoutChange {
        window_id: window_id.to_string(),
        layout: layout.to_string(),
    })
}

fn parse_session_changed(rest: &str) -> Option<ControlEvent> {
    let (session_id, name) = split_first_word(rest);
    if session_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%session-changed {rest}")));
    }
    Some(ControlEvent::SessionChanged {
        session_id: session_id.to_string(),
        name: name.to_string(),
    })
}

fn parse_window_add(rest: &str) -> Option<ControlEvent> {
    let (window_id, _) = split_first_word(rest);
    if window_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%window-add {rest}")));
    }
    Some(ControlEvent::WindowAdd {
        window_id: window_id.to_string(),
    })
}

fn parse_window_close(rest: &str) -> Option<ControlEvent> {
    let (window_id, _) = split_first_word(rest);
    if window_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%window-close {rest}")));
    }
    Some(ControlEvent::WindowClose {
        window_id: window_id.to_string(),
    })
}

fn parse_pane_mode_changed(rest: &str) -> Option<ControlEvent> {
    let (pane_id, _) = split_first_word(rest);
    if pane_id.is_empty() {
        return Some(ControlEvent::Unknown(format!("%pane-mode-changed {rest}")));
    }
    Some(ControlEvent::PaneModeChanged {
        pane_id: pane_id.to_string(),
    })
}
