//! Back-tick multi-line string folding.
//!
//! A snippet may contain back-tick delimited blocks spanning several lines;
//! since Protobuf string literals cannot span lines, those blocks are folded
//! into a single-line, double-quoted Protobuf string literal before the
//! snippet is handed to the proto parser. Only line numbers are adjusted
//! when reporting diagnostics upward from here; column numbers inside a
//! folded line are no longer meaningful and are left alone.

use super::error::ProtodefError;

/// Fold every back-tick delimited block in `src` into a single-line,
/// double-quoted Protobuf string literal.
///
/// Returns [`ProtodefError::UnclosedMultilineString`] pointing at the
/// opening back-tick if a block is never closed.
pub fn fold(src: &str) -> Result<String, ProtodefError> {
    let mut out = String::with_capacity(src.len());
    let mut line = 1usize;
    let mut col = 1usize;

    let mut chars = src.chars().peekable();
    let mut in_string = false; // inside a regular "..." protobuf string literal
    let mut string_escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if string_escaped {
                string_escaped = false;
            } else if c == '\\' {
                string_escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            advance(c, &mut line, &mut col);
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            advance(c, &mut line, &mut col);
            continue;
        }

        if c == '`' {
            let (open_line, open_col) = (line, col);
            advance(c, &mut line, &mut col);

            let mut body = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '`' {
                    closed = true;
                    advance(c, &mut line, &mut col);
                    break;
                }
                body.push(c);
                advance(c, &mut line, &mut col);
            }

            if !closed {
                return Err(ProtodefError::UnclosedMultilineString {
                    line: open_line,
                    col: open_col,
                });
            }

            out.push('"');
            out.push_str(&escape(&body));
            out.push('"');
            continue;
        }

        out.push(c);
        advance(c, &mut line, &mut col);
    }

    Ok(out)
}

fn advance(c: char, line: &mut usize, col: &mut usize) {
    if c == '\n' {
        *line += 1;
        *col = 1;
    } else {
        *col += 1;
    }
}

fn escape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}
