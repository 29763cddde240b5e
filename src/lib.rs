//! Canonical model and multi-format importer for Swiss election results.
//!
//! The crate reconciles the tabular result files produced by the various
//! vote-counting systems (the canonical Internal CSV, the federal SESAM
//! layout and the cantonal WabstiC file sets) into one in-memory model,
//! aggregates it (turnout, progress, list connection totals, percentage
//! breakdowns) and exports it back out as canonical CSV and JSON.
//!
//! Imports are transactional: an upload either validates cleanly and
//! replaces the targeted results in one mutation, or it is rejected with
//! the full list of findings and the model is left untouched.

pub mod aggregate;
pub mod errors;
pub mod export;
pub mod import;
pub mod model;

pub use crate::errors::{ErrorKind, ErrorLog, FileError, FileErrorRecord};
pub use crate::import::{import, FileSet, ImportFlags, ImportFormat, Principal};
pub use crate::model::{Election, ElectionStatus, ElectionType};
