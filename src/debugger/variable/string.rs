//! Quoting of strings read from debugee memory.

use std::fmt::Write;

fn escape_char(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        '\0' => out.push_str("\\0"),
        c if c.is_control() => {
            _ = write!(out, "\\u{{{:04x}}}", c as u32);
        }
        c => out.push(c),
    }
}

/// Quote utf-8 bytes, invalid sequences are escaped as `\xNN`.
pub fn quote_utf8(bytes: &[u8], truncated: bool) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');

    let mut rest = bytes;
    while !rest.is_empty() {
        let (valid_len, bad_len) = match std::str::from_utf8(rest) {
            Ok(_) => (rest.len(), 0),
            Err(e) => {
                let valid_len = e.valid_up_to();
                (valid_len, e.error_len().unwrap_or(rest.len() - valid_len))
            }
        };
        let (valid, invalid) = rest.split_at(valid_len);
        std::str::from_utf8(valid)
            .unwrap_or_default()
            .chars()
            .for_each(|c| escape_char(&mut out, c));
        for b in &invalid[..bad_len] {
            _ = write!(out, "\\x{b:02x}");
        }
        rest = &invalid[bad_len..];
    }

    out.push('"');
    if truncated {
        out.push_str("...");
    }
    out
}

/// Quote utf-16 code units, unpaired surrogates are escaped as `\u{NNNN}`.
pub fn quote_utf16(units: &[u16], truncated: bool) -> String {
    let mut out = String::with_capacity(units.len() + 2);
    out.push('"');
    for decoded in char::decode_utf16(units.iter().copied()) {
        match decoded {
            Ok(c) => escape_char(&mut out, c),
            Err(e) => {
                _ = write!(out, "\\u{{{:04x}}}", e.unpaired_surrogate());
            }
        }
    }
    out.push('"');
    if truncated {
        out.push_str("...");
    }
    out
}

/// Quote utf-32 code points, invalid code points are escaped as `\u{NNNN}`.
pub fn quote_utf32(points: &[u32], truncated: bool) -> String {
    let mut out = String::with_capacity(points.len() + 2);
    out.push('"');
    for &point in points {
        match char::from_u32(point) {
            Some(c) => escape_char(&mut out, c),
            None => {
                _ = write!(out, "\\u{{{point:04x}}}");
            }
        }
    }
    out.push('"');
    if truncated {
        out.push_str("...");
    }
    out
}

/// Render a single character in quotes.
pub fn quote_char(c: char) -> String {
    let mut out = String::from("'");
    match c {
        '\'' => out.push_str("\\'"),
        '"' => out.push('"'),
        c => escape_char(&mut out, c),
    }
    out.push('\'');
    out
}
