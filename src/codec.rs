//! Encoding of list-valued and numeric CSV cells.
//!
//! Lists are written as JSON arrays. Reading also accepts the quoted
//! list literals (`['Web', "UI/UX"]`) found in artifacts written by the
//! older pandas tooling. Empty cells and the `nan`/`None`/`null` markers
//! decode as absent.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CellError {
    #[error("not a list literal: {0:?}")]
    NotAList(String),
    #[error("unterminated string in list literal")]
    Unterminated,
    #[error("unexpected {0:?} in list literal")]
    Unexpected(char),
}

/// True for the markers pandas and Python leave in empty cells.
pub fn is_missing(cell: &str) -> bool {
    let t = cell.trim();
    t.is_empty()
        || t.eq_ignore_ascii_case("nan")
        || t.eq_ignore_ascii_case("none")
        || t.eq_ignore_ascii_case("null")
}

pub fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

pub fn encode_optional_list(items: Option<&[String]>) -> String {
    items.map(encode_list).unwrap_or_default()
}

/// Decode a list cell. `Ok(None)` means the cell is empty.
pub fn decode_list(cell: &str) -> Result<Option<Vec<String>>, CellError> {
    if is_missing(cell) {
        return Ok(None);
    }
    let trimmed = cell.trim();

    if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
        let items = values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect();
        return Ok(Some(items));
    }

    parse_literal(trimmed).map(Some)
}

/// Parse a Python-style list of quoted strings. Bare `None` items are dropped.
fn parse_literal(text: &str) -> Result<Vec<String>, CellError> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| CellError::NotAList(text.to_string()))?;

    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&c) = chars.peek() else { break };

        match c {
            '\'' | '"' => {
                chars.next();
                items.push(read_quoted(&mut chars, c)?);
            }
            'N' => {
                let word: String = chars.by_ref().take(4).collect();
                if word != "None" {
                    return Err(CellError::Unexpected('N'));
                }
            }
            other => return Err(CellError::Unexpected(other)),
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(other) => return Err(CellError::Unexpected(other)),
        }
    }

    Ok(items)
}

fn read_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    quote: char,
) -> Result<String, CellError> {
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(escaped) => out.push(escaped),
                None => return Err(CellError::Unterminated),
            },
            c if c == quote => return Ok(out),
            c => out.push(c),
        }
    }
    Err(CellError::Unterminated)
}

/// Parse an integer cell, accepting the float form (`"12.0"`) pandas writes
/// for integer columns that contain gaps.
pub fn parse_int(cell: &str) -> Option<i64> {
    let t = cell.trim();
    if is_missing(t) {
        return None;
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(n);
    }
    let f = t.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn decodes_json_arrays() {
        assert_eq!(
            decode_list(r#"["Web Development", "UI/UX Design"]"#),
            Ok(list(&["Web Development", "UI/UX Design"]))
        );
        assert_eq!(decode_list("[]"), Ok(Some(vec![])));
    }

    #[test]
    fn decodes_python_literals() {
        assert_eq!(
            decode_list("['Web Development', \"Essay\"]"),
            Ok(list(&["Web Development", "Essay"]))
        );
        assert_eq!(
            decode_list(r"['Children\'s Art', None]"),
            Ok(list(&["Children's Art"]))
        );
        assert_eq!(decode_list("['Trailing',]"), Ok(list(&["Trailing"])));
    }

    #[test]
    fn missing_markers_are_absent() {
        for cell in ["", "  ", "nan", "NaN", "None", "null"] {
            assert_eq!(decode_list(cell), Ok(None), "cell {:?}", cell);
        }
    }

    #[test]
    fn malformed_cells_are_errors() {
        assert!(matches!(decode_list("Web Development"), Err(CellError::NotAList(_))));
        assert_eq!(decode_list("['open"), Err(CellError::NotAList("['open".into())));
        assert_eq!(decode_list("['open]"), Err(CellError::Unterminated));
        assert_eq!(decode_list("[1, 2]"), Ok(Some(vec![])));
        assert_eq!(decode_list("[web]"), Err(CellError::Unexpected('w')));
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let items = vec!["Essay".to_string(), "Say \"hi\"".to_string()];
        let cell = encode_list(&items);
        assert_eq!(decode_list(&cell), Ok(Some(items)));
        assert_eq!(encode_optional_list(None), "");
        assert_eq!(encode_optional_list(Some(&[])), "[]");
    }

    #[test]
    fn parses_int_cells() {
        assert_eq!(parse_int("12"), Some(12));
        assert_eq!(parse_int(" 12.0 "), Some(12));
        assert_eq!(parse_int("12.5"), None);
        assert_eq!(parse_int("nan"), None);
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("abc"), None);
    }
}
