//! Lexical helpers shared by the classifier, rewriter and emitter.
//!
//! Nothing here builds a syntax tree. The central tool is [`mask`], which
//! blanks out comments, string literals and Jinja expressions while keeping
//! every byte offset stable, so regexes can run over the masked text and the
//! resulting ranges can be spliced back into the original.

use std::ops::Range;

#[derive(Clone, Copy, PartialEq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Str,
    /// Inside `{{ }}`, `{% %}` or `{# #}`; holds the closing character
    /// that precedes the final `}`.
    Jinja(char),
}

/// Mask comments, string literals and Jinja expressions.
///
/// The output has the same byte length as the input and keeps newlines.
/// Comments are fully blanked. String literals keep their quotes and Jinja
/// expressions keep their delimiters, so `FROM {{ ref('x') }}` still shows
/// that something other than a bare identifier follows `FROM`.
pub fn mask(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut state = State::Code;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let next = bytes.get(i + 1).copied();
        match state {
            State::Code => match (c, next) {
                ('-', Some(b'-')) => {
                    state = State::LineComment;
                    out.push(' ');
                }
                ('/', Some(b'*')) => {
                    state = State::BlockComment;
                    out.push_str("  ");
                    chars.next();
                }
                ('\'', _) => {
                    state = State::Str;
                    out.push('\'');
                }
                ('{', Some(open @ (b'{' | b'%' | b'#'))) => {
                    state = State::Jinja(if open == b'{' { '}' } else { open as char });
                    out.push('{');
                    out.push(open as char);
                    chars.next();
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    pad(&mut out, c);
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some(b'/') {
                    out.push_str("  ");
                    chars.next();
                    state = State::Code;
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    pad(&mut out, c);
                }
            }
            State::Str => {
                if c == '\'' {
                    if next == Some(b'\'') {
                        out.push_str("  ");
                        chars.next();
                    } else {
                        out.push('\'');
                        state = State::Code;
                    }
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    pad(&mut out, c);
                }
            }
            State::Jinja(close) => {
                if c == close && next == Some(b'}') {
                    out.push(c);
                    out.push('}');
                    chars.next();
                    state = State::Code;
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    pad(&mut out, c);
                }
            }
        }
    }

    out
}

fn pad(out: &mut String, c: char) {
    for _ in 0..c.len_utf8() {
        out.push(' ');
    }
}

/// Split text into statements at top-level `;`.
///
/// Returned ranges index the original text, are trimmed of surrounding
/// whitespace and never empty. The terminating `;` is not included.
pub fn split_statements(text: &str) -> Vec<Range<usize>> {
    let masked = mask(text);
    let mut ranges = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;

    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth = (depth - 1).max(0),
            b';' if depth == 0 => {
                push_trimmed(text, &masked, start..i, &mut ranges);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_trimmed(text, &masked, start..text.len(), &mut ranges);

    ranges
}

fn push_trimmed(text: &str, masked: &str, range: Range<usize>, out: &mut Vec<Range<usize>>) {
    let start = range.start + leading_noise(&masked[range.clone()]);
    let slice = &text[start..range.end];
    let trail = slice.len() - slice.trim_end().len();
    let trimmed = start..range.end - trail;
    // A statement consisting only of comments or templates carries no SQL.
    if trimmed.is_empty() || masked[trimmed.clone()].trim().is_empty() {
        return;
    }
    out.push(trimmed);
}

/// Length of the whitespace, comments and template blocks opening a
/// masked statement.
fn leading_noise(masked: &str) -> usize {
    let mut pos = 0;
    loop {
        pos += masked[pos..].len() - masked[pos..].trim_start().len();
        let rest = &masked[pos..];
        let close = match rest.as_bytes() {
            [b'{', b'{', ..] => "}}",
            [b'{', b'%', ..] => "%}",
            [b'{', b'#', ..] => "#}",
            _ => return pos,
        };
        match rest[2..].find(close) {
            Some(end) => pos += end + 4,
            None => return pos,
        }
    }
}

/// Byte offset of the `)` closing the `(` at `open`, using masked text.
pub fn matching_paren(masked: &str, open: usize) -> Option<usize> {
    let bytes = masked.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parenthesis depth of masked text just before byte `pos`.
pub fn depth_at(masked: &str, pos: usize) -> i32 {
    masked.as_bytes()[..pos].iter().fold(0, |d, &b| match b {
        b'(' => d + 1,
        b')' => d - 1,
        _ => d,
    })
}

/// Split a comma separated argument or column list at top-level commas.
///
/// Each piece is trimmed. An empty input yields no pieces.
pub fn split_top_level(text: &str) -> Vec<&str> {
    top_level_ranges(text).into_iter().map(|r| &text[r]).collect()
}

/// Byte ranges of the trimmed pieces [`split_top_level`] returns.
pub fn top_level_ranges(text: &str) -> Vec<Range<usize>> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let trimmed = |start: usize, end: usize| {
        let piece = &text[start..end];
        let from = start + (piece.len() - piece.trim_start().len());
        from..from + piece.trim().len()
    };
    let masked = mask(text);
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(trimmed(start, i));
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(trimmed(start, text.len()));
    parts
}

/// Whether a byte can be part of a bare SQL identifier.
pub fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Strip `[` `]` quoting from a possibly dotted T-SQL name.
pub fn unbracket(name: &str) -> String {
    name.replace(['[', ']'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_preserves_length() {
        let text = "SELECT 'it''s é' -- note\nFROM t /* x */ WHERE a = {{ var('a') }}";
        let masked = mask(text);
        assert_eq!(masked.len(), text.len());
        assert!(!masked.contains("note"));
        assert!(!masked.contains("var"));
        assert!(masked.contains("FROM t"));
        assert!(masked.contains("{{"));
        assert!(masked.contains("}}"));
    }

    #[test]
    fn test_mask_keeps_newlines_in_comments() {
        let masked = mask("a /* one\ntwo */ b");
        assert_eq!(masked.lines().count(), 2);
    }

    #[test]
    fn test_split_statements() {
        let text = "SET NOCOUNT ON;\n SELECT ';' FROM t;\n\n  INSERT INTO x (a) VALUES (1); ";
        let parts: Vec<&str> = split_statements(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(
            parts,
            vec!["SET NOCOUNT ON", "SELECT ';' FROM t", "INSERT INTO x (a) VALUES (1)"]
        );
    }

    #[test]
    fn test_split_statements_ignores_nested_semicolons() {
        let text = "SELECT (SELECT 1; ) FROM t";
        assert_eq!(split_statements(text).len(), 1);
    }

    #[test]
    fn test_split_statements_starts_at_sql() {
        let text = "-- load\n{{ validate_region(var('region', none)) }}\nMERGE INTO t USING s ON 1 = 1;\n{{ done() }}";
        let parts: Vec<&str> = split_statements(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(parts, vec!["MERGE INTO t USING s ON 1 = 1"]);
    }

    #[test]
    fn test_split_statements_skips_comment_only() {
        let text = "SELECT 1;\n-- trailing note\n";
        assert_eq!(split_statements(text).len(), 1);
    }

    #[test]
    fn test_matching_paren() {
        let text = "f(a, g(b), ')')";
        let masked = mask(text);
        assert_eq!(matching_paren(&masked, 1), Some(text.len() - 1));
        assert_eq!(matching_paren(&masked, 0), None);
    }

    #[test]
    fn test_depth_at() {
        let masked = mask("a (b, ')' (c)) d");
        assert_eq!(depth_at(&masked, 1), 0);
        assert_eq!(depth_at(&masked, 4), 1);
        assert_eq!(depth_at(&masked, 12), 2);
        assert_eq!(depth_at(&masked, masked.len()), 0);
    }

    #[test]
    fn test_split_top_level() {
        assert_eq!(
            split_top_level("day, DATEADD(day, -1, x), 'a,b'"),
            vec!["day", "DATEADD(day, -1, x)", "'a,b'"]
        );
        assert!(split_top_level("  ").is_empty());
        assert_eq!(top_level_ranges(" a ,\n  b(1, 2)"), vec![1..2, 7..14]);
    }

    #[test]
    fn test_unbracket() {
        assert_eq!(unbracket("[dbo].[Orders]"), "dbo.Orders");
    }
}
