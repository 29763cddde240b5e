// The WabstiC format: a set of linked CSV files rather than one sheet.
// Definitions (candidates, lists, connections) and per-municipality
// results arrive in separate files that reference each other by external
// id, so the adapter validates referential integrity across the whole set
// before anything is assembled.
//
// The set may cover only a subset of municipalities; the orchestrator
// treats such an upload as temporary results for exactly those entities.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Datelike;
use log::debug;

use crate::errors::{ErrorKind, ErrorLog};
use crate::import::tabular::{optional, required, CellError, Coercion, Column, Sheet};
use crate::import::{
    FileSet, MutationBatch, Principal, FILE_CANDIDATES, FILE_CANDIDATE_RESULTS, FILE_CONNECTIONS,
    FILE_ELECTED, FILE_LISTS, FILE_LIST_RESULTS, FILE_RESULTS, FILE_STATISTICS,
};
use crate::model::*;

const RESULTS_COLUMNS: &[Column] = &[
    required("BfsNrGemeinde", Coercion::Integer),
    required("Stimmberechtigte", Coercion::Integer),
    required("StmAbgegeben", Coercion::Integer),
    required("StmLeer", Coercion::Integer),
    required("StmUngueltig", Coercion::Integer),
    optional("StimmenLeer", Coercion::Integer),
    optional("StimmenUngueltig", Coercion::Integer),
];

const STATISTICS_COLUMNS: &[Column] = &[
    required("BfsNrGemeinde", Coercion::Integer),
    required("Stimmberechtigte", Coercion::Integer),
    optional("StmAbgegeben", Coercion::Integer),
    optional("StmLeer", Coercion::Integer),
    optional("StmUngueltig", Coercion::Integer),
];

const CANDIDATES_COLUMNS: &[Column] = &[
    required("KNR", Coercion::Text),
    required("Nachname", Coercion::Text),
    required("Vorname", Coercion::Text),
    optional("Partei", Coercion::Text),
    optional("Liste", Coercion::Text),
];

const CANDIDATE_RESULTS_COLUMNS: &[Column] = &[
    required("BfsNrGemeinde", Coercion::Integer),
    required("KNR", Coercion::Text),
    required("Stimmen", Coercion::Integer),
];

const LISTS_COLUMNS: &[Column] = &[
    required("ListNr", Coercion::Text),
    required("Bezeichnung", Coercion::Text),
    required("Sitze", Coercion::Integer),
];

const LIST_RESULTS_COLUMNS: &[Column] = &[
    required("BfsNrGemeinde", Coercion::Integer),
    required("ListNr", Coercion::Text),
    required("Stimmen", Coercion::Integer),
];

const CONNECTIONS_COLUMNS: &[Column] = &[
    required("ListNr", Coercion::Text),
    required("LV", Coercion::Text),
    optional("LUV", Coercion::Text),
];

const ELECTED_COLUMNS: &[Column] = &[
    required("KNR", Coercion::Text),
    required("Nachname", Coercion::Text),
    required("Vorname", Coercion::Text),
];

#[derive(Default)]
struct EntityFigures {
    eligible_voters: u64,
    received_ballots: u64,
    blank_ballots: u64,
    invalid_ballots: u64,
    blank_votes: u64,
    invalid_votes: u64,
}

pub fn parse(
    election: &Election,
    principal: &Principal,
    files: &FileSet,
    log: &mut ErrorLog,
) -> Option<MutationBatch> {
    let year = election.common().date.year();
    let proporz = election.election_type() == ElectionType::Proporz;

    let results_sheet = load(files, FILE_RESULTS, RESULTS_COLUMNS, true, log);
    let candidates_sheet = load(files, FILE_CANDIDATES, CANDIDATES_COLUMNS, true, log);
    let candidate_results_sheet = load(
        files,
        FILE_CANDIDATE_RESULTS,
        CANDIDATE_RESULTS_COLUMNS,
        true,
        log,
    );
    let statistics_sheet = load(files, FILE_STATISTICS, STATISTICS_COLUMNS, false, log);
    let elected_sheet = load(files, FILE_ELECTED, ELECTED_COLUMNS, false, log);
    let (lists_sheet, list_results_sheet, connections_sheet) = if proporz {
        (
            load(files, FILE_LISTS, LISTS_COLUMNS, true, log),
            load(files, FILE_LIST_RESULTS, LIST_RESULTS_COLUMNS, true, log),
            load(files, FILE_CONNECTIONS, CONNECTIONS_COLUMNS, false, log),
        )
    } else {
        (None, None, None)
    };

    // Municipality figures, from the main file.
    let mut entities: BTreeMap<EntityId, EntityFigures> = BTreeMap::new();
    if let Some(sheet) = &results_sheet {
        for row in sheet.rows() {
            let entity_id = match row.integer("BfsNrGemeinde") {
                Ok(id) => id,
                Err(e) => {
                    log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind);
                    continue;
                }
            };
            if principal.entity(year, entity_id as EntityId).is_none() {
                log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("BfsNrGemeinde"),
                    ErrorKind::UnknownEntity { entity_id },
                );
                continue;
            }
            let figures = (|| -> Result<EntityFigures, CellError> {
                Ok(EntityFigures {
                    eligible_voters: row.integer("Stimmberechtigte")?,
                    received_ballots: row.integer("StmAbgegeben")?,
                    blank_ballots: row.integer("StmLeer")?,
                    invalid_ballots: row.integer("StmUngueltig")?,
                    blank_votes: row.integer("StimmenLeer")?,
                    invalid_votes: row.integer("StimmenUngueltig")?,
                })
            })();
            match figures {
                Ok(f) => {
                    entities.insert(entity_id as EntityId, f);
                }
                Err(e) => log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind),
            }
        }
    }

    // The statistics file refines the figures of municipalities it names.
    if let Some(sheet) = &statistics_sheet {
        for row in sheet.rows() {
            let entity_id = match row.integer("BfsNrGemeinde") {
                Ok(id) => id,
                Err(e) => {
                    log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind);
                    continue;
                }
            };
            let figures = match entities.get_mut(&(entity_id as EntityId)) {
                Some(f) => f,
                None => {
                    log.row_error(
                        &sheet.filename,
                        row.line(),
                        Some("BfsNrGemeinde"),
                        ErrorKind::UnknownReference {
                            value: entity_id.to_string(),
                        },
                    );
                    continue;
                }
            };
            match row.integer("Stimmberechtigte") {
                Ok(v) => figures.eligible_voters = v,
                Err(e) => log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind),
            }
            if let Ok(Some(v)) = row.opt_integer("StmAbgegeben") {
                figures.received_ballots = v;
            }
            if let Ok(Some(v)) = row.opt_integer("StmLeer") {
                figures.blank_ballots = v;
            }
            if let Ok(Some(v)) = row.opt_integer("StmUngueltig") {
                figures.invalid_ballots = v;
            }
        }
    }

    // Candidate definitions.
    let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();
    if let Some(sheet) = &candidates_sheet {
        for row in sheet.rows() {
            let knr = row.text("KNR");
            if knr.is_empty() {
                log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("KNR"),
                    ErrorKind::UnknownReference { value: knr },
                );
                continue;
            }
            candidates.insert(
                knr.clone(),
                Candidate {
                    candidate_id: knr,
                    family_name: row.text("Nachname"),
                    first_name: row.text("Vorname"),
                    elected: false,
                    party: row.opt_text("Partei"),
                    list_id: if proporz { row.opt_text("Liste") } else { None },
                },
            );
        }
    }

    // List definitions and connections (proporz only).
    let mut lists: BTreeMap<String, List> = BTreeMap::new();
    if let Some(sheet) = &lists_sheet {
        for row in sheet.rows() {
            match row.integer("Sitze") {
                Ok(mandates) => {
                    let list_id = row.text("ListNr");
                    lists.insert(
                        list_id.clone(),
                        List {
                            list_id,
                            name: row.text("Bezeichnung"),
                            number_of_mandates: mandates as u32,
                            connection_id: None,
                            panachage: Vec::new(),
                        },
                    );
                }
                Err(e) => log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind),
            }
        }
    }
    let mut connection_pairs: BTreeMap<String, Option<String>> = BTreeMap::new();
    if let Some(sheet) = &connections_sheet {
        for row in sheet.rows() {
            let list_id = row.text("ListNr");
            let list = match lists.get_mut(&list_id) {
                Some(l) => l,
                None => {
                    log.row_error(
                        &sheet.filename,
                        row.line(),
                        Some("ListNr"),
                        ErrorKind::UnknownReference { value: list_id },
                    );
                    continue;
                }
            };
            let lv = row.text("LV");
            if lv.is_empty() {
                continue;
            }
            connection_pairs.entry(lv.clone()).or_insert(None);
            match row.opt_text("LUV") {
                Some(luv) => {
                    connection_pairs
                        .entry(luv.clone())
                        .or_insert_with(|| Some(lv.clone()));
                    list.connection_id = Some(luv);
                }
                None => list.connection_id = Some(lv),
            }
        }
    }

    // Per-municipality votes, with cross-file reference checks.
    let uploaded: BTreeSet<EntityId> = entities.keys().copied().collect();
    let mut candidate_votes: BTreeMap<(EntityId, String), u64> = BTreeMap::new();
    if let Some(sheet) = &candidate_results_sheet {
        for row in sheet.rows() {
            let parsed = (|| -> Result<(u64, String, u64), CellError> {
                Ok((
                    row.integer("BfsNrGemeinde")?,
                    row.text("KNR"),
                    row.integer("Stimmen")?,
                ))
            })();
            let (entity_id, knr, votes) = match parsed {
                Ok(v) => v,
                Err(e) => {
                    log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind);
                    continue;
                }
            };
            if !uploaded.contains(&(entity_id as EntityId)) {
                log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("BfsNrGemeinde"),
                    ErrorKind::UnknownReference {
                        value: entity_id.to_string(),
                    },
                );
                continue;
            }
            if !candidates.contains_key(&knr) {
                log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("KNR"),
                    ErrorKind::UnknownReference { value: knr },
                );
                continue;
            }
            candidate_votes.insert((entity_id as EntityId, knr), votes);
        }
    }
    let mut list_votes: BTreeMap<(EntityId, String), u64> = BTreeMap::new();
    if let Some(sheet) = &list_results_sheet {
        for row in sheet.rows() {
            let parsed = (|| -> Result<(u64, String, u64), CellError> {
                Ok((
                    row.integer("BfsNrGemeinde")?,
                    row.text("ListNr"),
                    row.integer("Stimmen")?,
                ))
            })();
            let (entity_id, list_id, votes) = match parsed {
                Ok(v) => v,
                Err(e) => {
                    log.row_error(&sheet.filename, row.line(), Some(&e.field), e.kind);
                    continue;
                }
            };
            if !uploaded.contains(&(entity_id as EntityId)) {
                log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("BfsNrGemeinde"),
                    ErrorKind::UnknownReference {
                        value: entity_id.to_string(),
                    },
                );
                continue;
            }
            if !lists.contains_key(&list_id) {
                log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("ListNr"),
                    ErrorKind::UnknownReference { value: list_id },
                );
                continue;
            }
            list_votes.insert((entity_id as EntityId, list_id), votes);
        }
    }

    // Elected override, matched by id first and by name only as a fallback.
    if let Some(sheet) = &elected_sheet {
        for row in sheet.rows() {
            let knr = row.text("KNR");
            if let Some(candidate) = candidates.get_mut(&knr) {
                candidate.elected = true;
                continue;
            }
            let family_name = row.text("Nachname");
            let first_name = row.text("Vorname");
            let mut matches = candidates
                .values_mut()
                .filter(|c| c.family_name == family_name && c.first_name == first_name);
            match (matches.next(), matches.next()) {
                (Some(candidate), None) => candidate.elected = true,
                (Some(_), Some(_)) => log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("Nachname"),
                    ErrorKind::AmbiguousCandidate {
                        family_name,
                        first_name,
                    },
                ),
                (None, _) => log.row_error(
                    &sheet.filename,
                    row.line(),
                    Some("KNR"),
                    ErrorKind::UnknownReference { value: knr },
                ),
            }
        }
    }

    let pairs: Vec<(String, Option<String>)> = connection_pairs
        .iter()
        .map(|(id, parent)| (id.clone(), parent.clone()))
        .collect();
    let connections = match ListConnection::build_forest(&pairs) {
        Ok(forest) => forest,
        // LV ids are always inserted as roots, so only a self-referential
        // map can fail here.
        Err(_) => {
            log.fatal(
                FILE_CONNECTIONS,
                ErrorKind::CyclicConnection {
                    connection_id: String::new(),
                },
            );
            return None;
        }
    };

    if log.has_errors() {
        return None;
    }

    let mut results = Vec::new();
    for (entity_id, figures) in entities {
        let info = principal.entity(year, entity_id);
        results.push(ElectionResult {
            entity_id,
            name: info.map(|i| i.name.clone()).unwrap_or_default(),
            district: info.and_then(|i| i.district.clone()),
            counted: true,
            eligible_voters: figures.eligible_voters as u32,
            received_ballots: figures.received_ballots as u32,
            blank_ballots: figures.blank_ballots as u32,
            invalid_ballots: figures.invalid_ballots as u32,
            blank_votes: figures.blank_votes as u32,
            invalid_votes: figures.invalid_votes as u32,
            candidate_results: candidate_votes
                .iter()
                .filter(|((eid, _), _)| *eid == entity_id)
                .map(|((_, cid), votes)| CandidateResult {
                    candidate_id: cid.clone(),
                    votes: *votes as u32,
                })
                .collect(),
            list_results: list_votes
                .iter()
                .filter(|((eid, _), _)| *eid == entity_id)
                .map(|((_, lid), votes)| ListResult {
                    list_id: lid.clone(),
                    votes: *votes as u32,
                })
                .collect(),
        });
    }

    debug!(
        "io_wabsti: {} entities, {} candidates, {} lists",
        results.len(),
        candidates.len(),
        lists.len()
    );
    Some(MutationBatch {
        status: None,
        absolute_majority: None,
        candidates: candidates.into_values().collect(),
        lists: lists.into_values().collect(),
        connections,
        results,
        counted_total: None,
    })
}

// Loads one logical file of the set. A required file that is absent is a
// fatal finding; an optional one is simply skipped.
fn load<'a>(
    files: &FileSet,
    name: &str,
    schema: &'a [Column],
    file_required: bool,
    log: &mut ErrorLog,
) -> Option<Sheet> {
    match files.get(name) {
        Some(bytes) => Sheet::load(name, bytes, schema, log),
        None => {
            if file_required {
                log.fatal(name, ErrorKind::EmptyData);
            }
            None
        }
    }
}
