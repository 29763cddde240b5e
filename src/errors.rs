//! Structured error records for the import pipeline.
//!
//! Adapters never abort on row-level problems: they record them here and
//! carry on, so a rejected import can report the complete list of findings.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use snafu::Snafu;

/// Cap on recoverable errors per file, to bound memory on pathological
/// input. Once reached, further row errors for that file are replaced by a
/// single [`ErrorKind::TooManyErrors`] fatal record.
pub const MAX_ROW_ERRORS_PER_FILE: usize = 1000;

/// Everything that can go wrong with an uploaded file.
#[derive(Eq, PartialEq, Debug, Clone, Snafu)]
pub enum ErrorKind {
    #[snafu(display("missing columns: {columns}"))]
    MissingColumns { columns: String },

    #[snafu(display("no data found"))]
    EmptyData,

    #[snafu(display("could not read the file"))]
    Unreadable,

    #[snafu(display("year {year} not yet supported"))]
    UnsupportedYear { year: i32 },

    #[snafu(display("invalid integer: {value}"))]
    InvalidInteger { value: String },

    #[snafu(display("invalid decimal: {value}"))]
    InvalidDecimal { value: String },

    #[snafu(display("invalid boolean: {value}"))]
    InvalidBoolean { value: String },

    #[snafu(display("invalid counted/total value: {value}"))]
    InvalidFraction { value: String },

    #[snafu(display("unknown entity: {entity_id}"))]
    UnknownEntity { entity_id: u64 },

    #[snafu(display("unknown reference: {value}"))]
    UnknownReference { value: String },

    #[snafu(display("ambiguous candidate: {family_name} {first_name}"))]
    AmbiguousCandidate {
        family_name: String,
        first_name: String,
    },

    #[snafu(display("value differs from a previous row: {value}"))]
    MismatchedValue { value: String },

    #[snafu(display("cyclic list connection: {connection_id}"))]
    CyclicConnection { connection_id: String },

    #[snafu(display("unknown parent connection: {parent_id}"))]
    UnknownParentConnection { parent_id: String },

    #[snafu(display("duplicate connection: {connection_id}"))]
    DuplicateConnection { connection_id: String },

    #[snafu(display("election type mismatch: expected {expected}, file delivers {actual}"))]
    TypeMismatch { expected: String, actual: String },

    #[snafu(display("too many errors"))]
    TooManyErrors,
}

/// One error record: which file, optionally which line and field, and what
/// went wrong.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct FileError {
    pub filename: String,
    pub line: Option<u64>,
    pub field: Option<String>,
    pub kind: ErrorKind,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filename)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
        }
        if let Some(field) = &self.field {
            write!(f, " [{}]", field)?;
        }
        write!(f, ": {}", self.kind)
    }
}

/// The wire shape of one error record, as reported to API consumers of a
/// rejected import.
#[derive(Serialize, Debug)]
pub struct FileErrorRecord<'a> {
    pub file: &'a str,
    pub line: Option<u64>,
    pub field: Option<&'a str>,
    pub message: String,
}

impl FileError {
    pub fn record(&self) -> FileErrorRecord<'_> {
        FileErrorRecord {
            file: &self.filename,
            line: self.line,
            field: self.field.as_deref(),
            message: self.kind.to_string(),
        }
    }
}

/// Accumulates error records across the files of one import call.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    errors: Vec<FileError>,
    fatal_files: HashSet<String>,
    row_error_counts: HashMap<String, usize>,
}

impl ErrorLog {
    pub fn new() -> ErrorLog {
        ErrorLog::default()
    }

    /// Records a file-level error. The adapter must stop processing this
    /// file; other files of a multi-file format are unaffected.
    pub fn fatal(&mut self, filename: &str, kind: ErrorKind) {
        self.errors.push(FileError {
            filename: filename.to_string(),
            line: None,
            field: None,
            kind,
        });
        self.fatal_files.insert(filename.to_string());
    }

    /// Records a recoverable error for one row. Processing of that row
    /// stops, subsequent rows continue.
    pub fn row_error(
        &mut self,
        filename: &str,
        line: u64,
        field: Option<&str>,
        kind: ErrorKind,
    ) {
        let count = self
            .row_error_counts
            .entry(filename.to_string())
            .or_insert(0);
        *count += 1;
        if *count > MAX_ROW_ERRORS_PER_FILE {
            return;
        }
        if *count == MAX_ROW_ERRORS_PER_FILE {
            self.fatal(filename, ErrorKind::TooManyErrors);
            return;
        }
        self.errors.push(FileError {
            filename: filename.to_string(),
            line: Some(line),
            field: field.map(|f| f.to_string()),
            kind,
        });
    }

    /// Whether a fatal error was recorded for this file.
    pub fn is_fatal(&self, filename: &str) -> bool {
        self.fatal_files.contains(filename)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FileError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<FileError> {
        self.errors
    }
}
