//! Cleaning untrusted text before it is cached or shown.
//!
//! Remote content reaches the user while they may be in crisis. Escape
//! sequences, control characters and bidi overrides are stripped so a
//! hostile or broken payload cannot rewrite what is displayed around it.

use std::borrow::Cow;

const ESC: char = '\x1b';
const BEL: char = '\x07';

/// How much structure a field may keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Titles, identifiers: newlines and tabs become single spaces.
    SingleLine,
    /// Bodies: `\n` and `\t` survive, `\r\n` is folded to `\n`.
    MultiLine,
}

/// Strip escape sequences and disallowed control characters.
///
/// Returns `Cow::Borrowed` when the input is already clean.
#[must_use]
pub fn strip_control_sequences(input: &str, shape: FieldShape) -> Cow<'_, str> {
    if !input.chars().any(|c| needs_removal(c, shape)) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ESC => skip_escape(&mut chars),
            '\u{009b}' => skip_csi(&mut chars),
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    out.push(line_break(shape));
                }
            }
            '\n' | '\t' => match shape {
                FieldShape::SingleLine => out.push(' '),
                FieldShape::MultiLine => out.push(c),
            },
            c if is_removed(c) => {}
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Full field cleanup: strip, trim, and cap at `max_chars` characters.
///
/// Truncation always lands on a character boundary.
#[must_use]
pub fn sanitize_field(input: &str, shape: FieldShape, max_chars: usize) -> String {
    let stripped = strip_control_sequences(input, shape);
    let trimmed = stripped.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((cut, _)) => trimmed[..cut].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

fn line_break(shape: FieldShape) -> char {
    match shape {
        FieldShape::SingleLine => ' ',
        FieldShape::MultiLine => '\n',
    }
}

fn needs_removal(c: char, shape: FieldShape) -> bool {
    match c {
        '\n' | '\t' => shape == FieldShape::SingleLine,
        '\r' | ESC | BEL => true,
        c => is_removed(c),
    }
}

fn is_removed(c: char) -> bool {
    c <= '\x1f'
        || c == '\x7f'
        || ('\u{0080}'..='\u{009f}').contains(&c)
        || is_bidi_control(c)
}

// Overrides and isolates can visually reorder surrounding text.
fn is_bidi_control(c: char) -> bool {
    matches!(
        c,
        '\u{202a}'..='\u{202e}' | '\u{2066}'..='\u{2069}' | '\u{200e}' | '\u{200f}'
    )
}

fn skip_escape<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    let Some(&next) = chars.peek() else {
        return;
    };
    match next {
        '[' => {
            chars.next();
            skip_csi(chars);
        }
        ']' | 'P' | '^' | '_' => {
            chars.next();
            skip_string_sequence(chars);
        }
        '(' | ')' | '*' | '+' | '#' | ' ' => {
            chars.next();
            chars.next();
        }
        '7' | '8' | 'c' | 'D' | 'E' | 'H' | 'M' | 'N' | 'O' | 'Z' | '=' | '>' | '<' => {
            chars.next();
        }
        _ => {}
    }
}

// Parameter and intermediate bytes up to the final byte (0x40..=0x7e).
fn skip_csi<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    while let Some(&c) = chars.peek() {
        if ('\x40'..='\x7e').contains(&c) {
            chars.next();
            return;
        }
        if !('\x20'..='\x3f').contains(&c) {
            return;
        }
        chars.next();
    }
}

// OSC/DCS/PM/APC bodies end at BEL or ST (ESC \).
fn skip_string_sequence<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    while let Some(c) = chars.next() {
        if c == BEL {
            return;
        }
        if c == ESC && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}
