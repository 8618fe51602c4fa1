//! Canonical row encoding for the audit CSV format.
//!
//! The on-disk format is bit-exact so the offline verifier can replay the
//! writer's byte stream: UTF-8, rows terminated by `\n` (no CR), every
//! cell quoted with `"`, embedded quotes doubled, cells separated by `,`,
//! no trailing whitespace.

use std::io::{self, Write};

use domain::event::AuditEvent;
use serde_json::Value;

/// Name of the MAC column, second to last in every secured header.
/// Part of the on-disk format; existing logs depend on the literal name.
pub const HEADER_MAC: &str = "HMAC";
/// Name of the signature column, last in every secured header.
pub const HEADER_SIGNATURE: &str = "SIGNATURE";

/// Canonicalize an event into one cell per schema field, in order.
///
/// Absent and null fields render as empty cells; strings render verbatim;
/// everything else renders as compact JSON. `serde_json` keeps object
/// keys sorted, so nested structures render deterministically.
pub fn canonical_cells(fields: &[String], event: &AuditEvent) -> Vec<String> {
    fields
        .iter()
        .map(|field| render_value(event.field(field)))
        .collect()
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Render one row with the fixed quoting discipline.
pub fn format_row(cells: &[String]) -> String {
    let mut row = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            row.push(',');
        }
        row.push('"');
        for c in cell.chars() {
            if c == '"' {
                row.push('"');
            }
            row.push(c);
        }
        row.push('"');
    }
    row.push('\n');
    row
}

pub fn write_row<W: Write>(w: &mut W, cells: &[String]) -> io::Result<()> {
    w.write_all(format_row(cells).as_bytes())
}

/// Rebuild an event from a row. Empty cells are treated as absent fields;
/// non-empty cells surface as strings (non-string values are not recovered,
/// matching what a text log can represent).
pub fn event_from_cells(fields: &[String], cells: &[String]) -> AuditEvent {
    let mut map = serde_json::Map::new();
    for (field, cell) in fields.iter().zip(cells) {
        if !cell.is_empty() {
            map.insert(field.clone(), Value::String(cell.clone()));
        }
    }
    AuditEvent::from_fields(map)
}

#[derive(Debug, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct CsvParseError {
    pub line: usize,
    pub message: String,
}

/// Parse a whole log by the inverse of the writing rule.
///
/// Strict: every cell must be quoted and every row must end with `\n`,
/// so a log truncated mid-row fails to parse.
pub fn parse_rows(input: &str) -> Result<Vec<Vec<String>>, CsvParseError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        let line = rows.len() + 1;
        rows.push(parse_row(&mut chars, line)?);
    }
    Ok(rows)
}

fn parse_row(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    line: usize,
) -> Result<Vec<String>, CsvParseError> {
    let fail = |message: String| CsvParseError { line, message };
    let mut cells = Vec::new();

    loop {
        match chars.next() {
            Some('"') => {}
            Some(c) => return Err(fail(format!("expected opening quote, found '{c}'"))),
            None => return Err(fail("expected opening quote, found end of file".into())),
        }

        let mut cell = String::new();
        loop {
            match chars.next() {
                Some('"') => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        cell.push('"');
                    } else {
                        break;
                    }
                }
                Some(c) => cell.push(c),
                None => return Err(fail("unterminated quoted cell".into())),
            }
        }
        cells.push(cell);

        match chars.next() {
            Some(',') => {}
            Some('\n') => return Ok(cells),
            Some(c) => return Err(fail(format!("unexpected character '{c}' after cell"))),
            None => return Err(fail("missing row terminator".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn format_row_quotes_every_cell() {
        let row = format_row(&fields(&["_id", "timestamp", "transactionId"]));
        assert_eq!(row, "\"_id\",\"timestamp\",\"transactionId\"\n");
    }

    #[test]
    fn format_row_doubles_embedded_quotes() {
        let row = format_row(&fields(&[r#"say "hi""#]));
        assert_eq!(row, "\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn format_row_renders_empty_cells() {
        let row = format_row(&fields(&["", "", "sig"]));
        assert_eq!(row, "\"\",\"\",\"sig\"\n");
    }

    #[test]
    fn canonical_cells_follow_schema_order() {
        let event = AuditEvent::from_value(json!({
            "transactionId": "A10000",
            "_id": "1",
            "timestamp": "123456",
        }))
        .unwrap();
        let cells = canonical_cells(&fields(&["_id", "timestamp", "transactionId"]), &event);
        assert_eq!(cells, vec!["1", "123456", "A10000"]);
    }

    #[test]
    fn canonical_cells_render_absent_and_null_as_empty() {
        let event = AuditEvent::from_value(json!({"_id": "1", "server": null})).unwrap();
        let cells = canonical_cells(&fields(&["_id", "server", "client"]), &event);
        assert_eq!(cells, vec!["1", "", ""]);
    }

    #[test]
    fn canonical_cells_render_nested_values_as_sorted_json() {
        let event = AuditEvent::from_value(json!({
            "_id": "1",
            "server": {"port": 8080, "ip": "10.0.0.1"},
        }))
        .unwrap();
        let cells = canonical_cells(&fields(&["server"]), &event);
        // serde_json orders object keys, so the rendering is stable.
        assert_eq!(cells, vec![r#"{"ip":"10.0.0.1","port":8080}"#]);
    }

    #[test]
    fn canonical_cells_render_numbers_and_bools_as_json() {
        let event = AuditEvent::from_value(json!({"count": 42, "ok": true})).unwrap();
        let cells = canonical_cells(&fields(&["count", "ok"]), &event);
        assert_eq!(cells, vec!["42", "true"]);
    }

    #[test]
    fn parse_inverts_format() {
        let cells = fields(&["a\"b", "line\nbreak", "comma,inside", ""]);
        let text = format_row(&cells);
        let rows = parse_rows(&text).unwrap();
        assert_eq!(rows, vec![cells]);
    }

    #[test]
    fn parse_handles_multiple_rows() {
        let text = "\"_id\",\"timestamp\"\n\"1\",\"t\"\n\"2\",\"t\"\n";
        let rows = parse_rows(text).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], vec!["2", "t"]);
    }

    #[test]
    fn parse_rejects_unquoted_cell() {
        let err = parse_rows("\"a\",b\n").unwrap_err();
        assert!(err.to_string().contains("opening quote"));
    }

    #[test]
    fn parse_rejects_truncated_row() {
        let err = parse_rows("\"a\",\"b").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn parse_rejects_missing_terminator() {
        let err = parse_rows("\"a\",\"b\"").unwrap_err();
        assert!(err.to_string().contains("terminator"));
    }

    #[test]
    fn parse_of_empty_input_is_empty() {
        assert!(parse_rows("").unwrap().is_empty());
    }

    #[test]
    fn event_from_cells_drops_empty_cells() {
        let schema = fields(&["_id", "timestamp", "transactionId", "server"]);
        let cells = fields(&["1", "t", "tx", ""]);
        let event = event_from_cells(&schema, &cells);
        assert_eq!(event.id(), Some("1"));
        assert_eq!(event.field("server"), None);
    }
}
