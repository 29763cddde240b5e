// Primitives for reading the tabular wire formats.
//
// Every adapter declares its file contracts as static column schemas and
// feeds them through the same loader: header verification, empty-data
// detection, row numbering and per-cell coercion all behave identically
// across formats.

use std::collections::HashMap;

use log::debug;

use crate::errors::{ErrorKind, ErrorLog};

/// How a cell is coerced when it is read.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Coercion {
    Integer,
    Decimal,
    /// A "counted von total" free-text fraction, e.g. `"2 von 11"`.
    Fraction,
    /// wahr/falsch or true/false, case-insensitive, also 1/0.
    Boolean,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub header: &'static str,
    pub required: bool,
    pub kind: Coercion,
}

pub const fn required(header: &'static str, kind: Coercion) -> Column {
    Column {
        header,
        required: true,
        kind,
    }
}

pub const fn optional(header: &'static str, kind: Coercion) -> Column {
    Column {
        header,
        required: false,
        kind,
    }
}

/// A coercion or lookup failure for a single cell.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CellError {
    pub field: String,
    pub kind: ErrorKind,
}

type CellResult<T> = Result<T, CellError>;

/// One CSV file, fully read and header-checked.
pub struct Sheet {
    pub filename: String,
    headers: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<(u64, Vec<String>)>,
}

impl Sheet {
    /// Reads the bytes as CSV and verifies the schema's required headers.
    ///
    /// On a missing header or an empty data section, records one fatal
    /// error and returns `None`; row parsing for this file must not happen.
    pub fn load(
        filename: &str,
        bytes: &[u8],
        schema: &[Column],
        log: &mut ErrorLog,
    ) -> Option<Sheet> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut records = reader.records();
        let header_record = match records.next() {
            Some(Ok(r)) => r,
            Some(Err(e)) => {
                debug!("load: {}: unreadable header: {:?}", filename, e);
                log.fatal(filename, ErrorKind::Unreadable);
                return None;
            }
            None => {
                log.fatal(filename, ErrorKind::EmptyData);
                return None;
            }
        };
        let headers: Vec<String> = header_record.iter().map(|h| h.trim().to_string()).collect();
        let mut index = HashMap::new();
        for (idx, h) in headers.iter().enumerate() {
            index.entry(h.clone()).or_insert(idx);
        }

        let missing: Vec<&str> = schema
            .iter()
            .filter(|c| c.required && !index.contains_key(c.header))
            .map(|c| c.header)
            .collect();
        if !missing.is_empty() {
            log.fatal(
                filename,
                ErrorKind::MissingColumns {
                    columns: missing.join(", "),
                },
            );
            return None;
        }

        let mut rows = Vec::new();
        for (idx, record) in records.enumerate() {
            let lineno = idx as u64 + 2;
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    debug!("load: {}:{}: unreadable row: {:?}", filename, lineno, e);
                    log.fatal(filename, ErrorKind::Unreadable);
                    return None;
                }
            };
            let values: Vec<String> = record.iter().map(|v| v.trim().to_string()).collect();
            if values.iter().all(|v| v.is_empty()) {
                continue;
            }
            rows.push((lineno, values));
        }

        if rows.is_empty() {
            log.fatal(filename, ErrorKind::EmptyData);
            return None;
        }

        debug!(
            "load: {}: {} columns, {} data rows",
            filename,
            headers.len(),
            rows.len()
        );
        Some(Sheet {
            filename: filename.to_string(),
            headers,
            index,
            rows,
        })
    }

    pub fn has_column(&self, header: &str) -> bool {
        self.index.contains_key(header)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |(lineno, values)| Row {
            sheet: self,
            line: *lineno,
            values,
        })
    }
}

/// One data row with typed cell accessors.
///
/// Accessors return a [`CellError`] naming the offending field; the adapter
/// records it and moves on to the next row.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    sheet: &'a Sheet,
    line: u64,
    values: &'a [String],
}

impl<'a> Row<'a> {
    pub fn line(&self) -> u64 {
        self.line
    }

    fn raw(&self, header: &str) -> Option<&'a str> {
        self.sheet
            .index
            .get(header)
            .and_then(|idx| self.values.get(*idx))
            .map(|s| s.as_str())
    }

    /// A cell by position, for the formats whose trailing column is located
    /// positionally when the declared header is absent.
    pub fn by_index(&self, idx: usize) -> Option<&'a str> {
        self.values.get(idx).map(|s| s.as_str())
    }

    pub fn text(&self, header: &str) -> String {
        self.raw(header).unwrap_or("").to_string()
    }

    pub fn opt_text(&self, header: &str) -> Option<String> {
        match self.raw(header) {
            Some(v) if !v.is_empty() => Some(v.to_string()),
            _ => None,
        }
    }

    /// An integer cell; empty cells count as zero. Values that do not fit
    /// the model's count fields are invalid, not truncated.
    pub fn integer(&self, header: &str) -> CellResult<u64> {
        match self.raw(header) {
            None | Some("") => Ok(0),
            Some(v) => parse_integer(v).ok_or_else(|| CellError {
                field: header.to_string(),
                kind: ErrorKind::InvalidInteger {
                    value: v.to_string(),
                },
            }),
        }
    }

    /// An integer cell where emptiness is meaningful.
    pub fn opt_integer(&self, header: &str) -> CellResult<Option<u64>> {
        match self.raw(header) {
            None | Some("") => Ok(None),
            Some(v) => parse_integer(v).map(Some).ok_or_else(|| CellError {
                field: header.to_string(),
                kind: ErrorKind::InvalidInteger {
                    value: v.to_string(),
                },
            }),
        }
    }

    pub fn opt_decimal(&self, header: &str) -> CellResult<Option<f64>> {
        match self.raw(header) {
            None | Some("") => Ok(None),
            Some(v) => v.parse::<f64>().map(Some).map_err(|_| CellError {
                field: header.to_string(),
                kind: ErrorKind::InvalidDecimal {
                    value: v.to_string(),
                },
            }),
        }
    }

    pub fn boolean(&self, header: &str) -> CellResult<bool> {
        match self.raw(header) {
            None | Some("") => Ok(false),
            Some(v) => parse_boolean(v).ok_or_else(|| CellError {
                field: header.to_string(),
                kind: ErrorKind::InvalidBoolean {
                    value: v.to_string(),
                },
            }),
        }
    }

    /// Splits a `"counted von total"` cell into its two integers.
    pub fn fraction(&self, header: &str) -> CellResult<(u64, u64)> {
        let v = self.raw(header).unwrap_or("");
        parse_fraction(v).ok_or_else(|| CellError {
            field: header.to_string(),
            kind: ErrorKind::InvalidFraction {
                value: v.to_string(),
            },
        })
    }
}

fn parse_integer(v: &str) -> Option<u64> {
    // Thousands separators show up in some cantonal exports.
    let cleaned: String = v.chars().filter(|c| *c != '\'' && *c != ' ').collect();
    let parsed = cleaned.parse::<u64>().ok()?;
    // Counts land in u32 model fields; anything beyond that range is
    // rejected here rather than truncated later.
    if parsed > u32::MAX as u64 {
        return None;
    }
    Some(parsed)
}

fn parse_boolean(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "wahr" | "true" | "1" => Some(true),
        "falsch" | "false" | "0" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_fraction(v: &str) -> Option<(u64, u64)> {
    let mut parts = v.split(" von ");
    let counted = parts.next()?.trim().parse::<u64>().ok()?;
    let total = parts.next()?.trim().parse::<u64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((counted, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[Column] = &[
        required("Wahlkreis-Nr", Coercion::Integer),
        required("Stimmen", Coercion::Integer),
        optional("Gewaehlt", Coercion::Boolean),
    ];

    #[test]
    fn loads_and_indexes_rows() {
        let mut log = ErrorLog::new();
        let data = b"Wahlkreis-Nr,Stimmen,Gewaehlt\n1701,533,wahr\n1702,0,falsch\n";
        let sheet = Sheet::load("results.csv", data, SCHEMA, &mut log).unwrap();
        assert!(!log.has_errors());
        let rows: Vec<_> = sheet.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line(), 2);
        assert_eq!(rows[0].integer("Wahlkreis-Nr"), Ok(1701));
        assert_eq!(rows[0].boolean("Gewaehlt"), Ok(true));
        assert_eq!(rows[1].boolean("Gewaehlt"), Ok(false));
    }

    #[test]
    fn missing_required_headers_are_fatal_and_joined() {
        let mut log = ErrorLog::new();
        let data = b"Gewaehlt\nwahr\n";
        let sheet = Sheet::load("results.csv", data, SCHEMA, &mut log);
        assert!(sheet.is_none());
        assert_eq!(log.errors().len(), 1);
        assert_eq!(
            log.errors()[0].kind,
            ErrorKind::MissingColumns {
                columns: "Wahlkreis-Nr, Stimmen".to_string()
            }
        );
        assert!(log.is_fatal("results.csv"));
    }

    #[test]
    fn empty_data_section_is_fatal() {
        let mut log = ErrorLog::new();
        let data = b"Wahlkreis-Nr,Stimmen\n";
        assert!(Sheet::load("results.csv", data, SCHEMA, &mut log).is_none());
        assert_eq!(log.errors()[0].kind, ErrorKind::EmptyData);
    }

    #[test]
    fn blank_rows_are_skipped() {
        let mut log = ErrorLog::new();
        let data = b"Wahlkreis-Nr,Stimmen\n1701,5\n,\n1702,6\n";
        let sheet = Sheet::load("results.csv", data, SCHEMA, &mut log).unwrap();
        assert_eq!(sheet.rows().count(), 2);
    }

    #[test]
    fn integer_coercion() {
        let mut log = ErrorLog::new();
        let data = b"Wahlkreis-Nr,Stimmen\n1701,1'533\n1702,abc\n";
        let sheet = Sheet::load("results.csv", data, SCHEMA, &mut log).unwrap();
        let rows: Vec<_> = sheet.rows().collect();
        assert_eq!(rows[0].integer("Stimmen"), Ok(1533));
        let err = rows[1].integer("Stimmen").unwrap_err();
        assert_eq!(err.field, "Stimmen");
        assert_eq!(
            err.kind,
            ErrorKind::InvalidInteger {
                value: "abc".to_string()
            }
        );
    }

    #[test]
    fn oversized_integers_are_rejected_not_truncated() {
        let mut log = ErrorLog::new();
        let data = b"Wahlkreis-Nr,Stimmen\n1701,4294967295\n1701,4294967296\n";
        let sheet = Sheet::load("results.csv", data, SCHEMA, &mut log).unwrap();
        let rows: Vec<_> = sheet.rows().collect();
        assert_eq!(rows[0].integer("Stimmen"), Ok(u32::MAX as u64));
        assert_eq!(
            rows[1].integer("Stimmen").unwrap_err().kind,
            ErrorKind::InvalidInteger {
                value: "4294967296".to_string()
            }
        );
    }

    #[test]
    fn fraction_coercion() {
        assert_eq!(parse_fraction("2 von 11"), Some((2, 11)));
        assert_eq!(parse_fraction("11 von 11"), Some((11, 11)));
        assert_eq!(parse_fraction("2 von"), None);
        assert_eq!(parse_fraction("2"), None);
        assert_eq!(parse_fraction(""), None);
    }

    #[test]
    fn positional_access_for_trailing_columns() {
        let mut log = ErrorLog::new();
        let data = b"Wahlkreis-Nr,Stimmen,Unbenannt\n1701,5,2 von 11\n";
        let sheet = Sheet::load("results.csv", data, SCHEMA, &mut log).unwrap();
        let row = sheet.rows().next().unwrap();
        assert_eq!(row.by_index(sheet.column_count() - 1), Some("2 von 11"));
    }
}
