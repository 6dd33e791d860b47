//! Spreadsheet grid model and its durable row-major text form.
//!
//! A document is a rectangular [`Matrix`] of scalar [`Cell`]s. Durable storage
//! keeps it as delimited text:
//! ```text
//! 1,2,"a, b"
//! 3,4,""
//! ```
//! Rows are separated by `\n` (`\r\n` is accepted on read), cells by `,`.
//! Cells containing a delimiter or a quote are double-quoted with `""`
//! escaping, so [`to_text`] output always parses back to the same matrix.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Width given to new rows when a document has no rows yet.
pub const DEFAULT_COLUMN_COUNT: usize = 26;

/// A single spreadsheet cell: a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(serde_json::Number),
    Text(String),
}

impl Cell {
    pub fn empty() -> Self {
        Cell::Text(String::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Text(s) if s.is_empty())
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Number(n) => write!(f, "{n}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Number(n.into())
    }
}

/// Row-major grid. Every row has the same length.
pub type Matrix = Vec<Vec<Cell>>;

/// One cell write inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub row: usize,
    pub col: usize,
    pub value: Cell,
}

impl CellUpdate {
    pub fn new(row: usize, col: usize, value: impl Into<Cell>) -> Self {
        Self {
            row,
            col,
            value: value.into(),
        }
    }
}

/// Errors raised while reading durable text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("unterminated quoted cell starting on line {line}")]
    UnterminatedQuote { line: usize },
    #[error("unexpected quote on line {line}")]
    StrayQuote { line: usize },
    #[error("row {row} has {found} cells, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Width of the matrix (length of row 0), or `None` when it has no rows.
pub fn width(matrix: &[Vec<Cell>]) -> Option<usize> {
    matrix.first().map(Vec::len)
}

/// Check the equal-row-length invariant.
pub fn is_rectangular(matrix: &[Vec<Cell>]) -> bool {
    match width(matrix) {
        Some(w) => matrix.iter().all(|row| row.len() == w),
        None => true,
    }
}

/// A row of `width` empty cells.
pub fn blank_row(width: usize) -> Vec<Cell> {
    vec![Cell::empty(); width]
}

/// Parse durable row-major text into a matrix.
///
/// Empty text is a document with zero rows. A trailing newline is ignored.
/// Rows of unequal length are rejected.
pub fn parse_text(text: &str) -> Result<Matrix, GridError> {
    let mut rows: Matrix = Vec::new();
    let mut row: Vec<Cell> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_was_quoted = false;
    let mut at_row_start = true;
    let mut line = 1;
    let mut quote_line = 1;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        at_row_start = false;
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !field_was_quoted => {
                in_quotes = true;
                field_was_quoted = true;
                quote_line = line;
            }
            '"' => return Err(GridError::StrayQuote { line }),
            ',' => {
                row.push(Cell::Text(std::mem::take(&mut field)));
                field_was_quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(Cell::Text(std::mem::take(&mut field)));
                rows.push(std::mem::take(&mut row));
                field_was_quoted = false;
                at_row_start = true;
                line += 1;
            }
            _ if field_was_quoted => return Err(GridError::StrayQuote { line }),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(GridError::UnterminatedQuote { line: quote_line });
    }
    if !at_row_start {
        row.push(Cell::Text(field));
        rows.push(row);
    }

    if let Some(expected) = width(&rows) {
        if let Some((index, bad)) = rows.iter().enumerate().find(|(_, r)| r.len() != expected) {
            return Err(GridError::Ragged {
                row: index,
                expected,
                found: bad.len(),
            });
        }
    }

    Ok(rows)
}

/// Serialize a matrix to durable row-major text.
pub fn to_text(matrix: &[Vec<Cell>]) -> String {
    let mut out = String::new();
    for (i, row) in matrix.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        // A lone empty cell would otherwise be an empty line, which reads
        // back as "no row" at the end of the text.
        if row.len() == 1 && row[0].is_empty() {
            out.push_str("\"\"");
            continue;
        }
        for (j, cell) in row.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            write_field(&mut out, &cell.to_string());
        }
    }
    out
}

fn write_field(out: &mut String, value: &str) {
    if value.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&value.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(value);
    }
}
