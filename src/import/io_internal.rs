// The Internal format: one self-describing CSV whose columns are the
// canonical export's own. One row per (entity x candidate), or per
// (entity x list x candidate) for proporz, with election- and entity-level
// columns restated on every row.
//
// Restatements are redundancies, not independent facts: a row that
// disagrees with an earlier row about the same entity or election value is
// a row error.

use std::collections::BTreeMap;

use chrono::Datelike;
use log::debug;

use crate::errors::{ErrorKind, ErrorLog};
use crate::import::tabular::{optional, required, CellError, Coercion, Column, Row, Sheet};
use crate::import::{FileSet, MutationBatch, Principal, FILE_RESULTS};
use crate::model::*;

const COMMON_COLUMNS: &[Column] = &[
    required("election_type", Coercion::Text),
    optional("election_date", Coercion::Text),
    optional("election_absolute_majority", Coercion::Integer),
    optional("election_status", Coercion::Text),
    required("entity_id", Coercion::Integer),
    required("entity_counted", Coercion::Boolean),
    required("entity_eligible_voters", Coercion::Integer),
    required("entity_received_ballots", Coercion::Integer),
    required("entity_blank_ballots", Coercion::Integer),
    required("entity_invalid_ballots", Coercion::Integer),
    required("entity_blank_votes", Coercion::Integer),
    required("entity_invalid_votes", Coercion::Integer),
    required("candidate_family_name", Coercion::Text),
    required("candidate_first_name", Coercion::Text),
    required("candidate_id", Coercion::Text),
    required("candidate_elected", Coercion::Boolean),
    optional("candidate_party", Coercion::Text),
    required("candidate_votes", Coercion::Integer),
];

const PROPORZ_COLUMNS: &[Column] = &[
    required("list_name", Coercion::Text),
    required("list_id", Coercion::Text),
    optional("list_number_of_mandates", Coercion::Integer),
    required("list_votes", Coercion::Integer),
    optional("list_connection", Coercion::Text),
    optional("list_connection_parent", Coercion::Text),
];

const PANACHAGE_PREFIX: &str = "panachage_votes_from_list_";
const PANACHAGE_BLANK: &str = "panachage_votes_from_blank";

// Entity-level figures restated on every row of one entity.
#[derive(Eq, PartialEq, Debug, Clone)]
struct EntityFigures {
    counted: bool,
    eligible_voters: u64,
    received_ballots: u64,
    blank_ballots: u64,
    invalid_ballots: u64,
    blank_votes: u64,
    invalid_votes: u64,
}

#[derive(Default)]
struct Accumulator {
    status: Option<ElectionStatus>,
    absolute_majority: Option<u64>,
    entities: BTreeMap<EntityId, EntityFigures>,
    candidates: BTreeMap<String, Candidate>,
    candidate_votes: BTreeMap<(EntityId, String), u64>,
    lists: BTreeMap<String, List>,
    list_votes: BTreeMap<(EntityId, String), u64>,
    connections: BTreeMap<String, Option<String>>,
    panachage: BTreeMap<(String, PanachageSource), u64>,
}

pub fn parse(
    election: &Election,
    principal: &Principal,
    files: &FileSet,
    log: &mut ErrorLog,
) -> Option<MutationBatch> {
    let bytes = match files.get(FILE_RESULTS) {
        Some(b) => b,
        None => {
            log.fatal(FILE_RESULTS, ErrorKind::EmptyData);
            return None;
        }
    };
    let proporz = election.election_type() == ElectionType::Proporz;
    let mut schema: Vec<Column> = COMMON_COLUMNS.to_vec();
    if proporz {
        schema.extend_from_slice(PROPORZ_COLUMNS);
    }
    let sheet = Sheet::load(FILE_RESULTS, bytes, &schema, log)?;

    let panachage_headers: Vec<(String, PanachageSource)> = sheet
        .headers()
        .iter()
        .filter_map(|h| {
            if h == PANACHAGE_BLANK {
                Some((h.clone(), PanachageSource::Blank))
            } else {
                h.strip_prefix(PANACHAGE_PREFIX)
                    .map(|id| (h.clone(), PanachageSource::List(id.to_string())))
            }
        })
        .collect();

    let year = election.common().date.year();
    let mut acc = Accumulator::default();
    for row in sheet.rows() {
        // The implied election type is a business rule, not a row problem.
        let row_type = row.text("election_type");
        if ElectionType::parse(&row_type) != Some(election.election_type()) {
            log.fatal(
                FILE_RESULTS,
                ErrorKind::TypeMismatch {
                    expected: election.election_type().as_str().to_string(),
                    actual: row_type,
                },
            );
            return None;
        }
        if let Err(e) = parse_row(&row, principal, year, proporz, &panachage_headers, &mut acc) {
            log.row_error(FILE_RESULTS, row.line(), Some(&e.field), e.kind);
        }
        if log.is_fatal(FILE_RESULTS) {
            break;
        }
    }

    let connection_pairs = close_connection_pairs(&acc.connections);
    let connections = match ListConnection::build_forest(&connection_pairs) {
        Ok(forest) => forest,
        Err(ConnectionError::Cycle { connection_id }) => {
            log.fatal(FILE_RESULTS, ErrorKind::CyclicConnection { connection_id });
            return None;
        }
        Err(ConnectionError::UnknownParent { parent_id, .. }) => {
            log.fatal(
                FILE_RESULTS,
                ErrorKind::UnknownParentConnection { parent_id },
            );
            return None;
        }
        Err(ConnectionError::Duplicate { connection_id }) => {
            log.fatal(
                FILE_RESULTS,
                ErrorKind::DuplicateConnection { connection_id },
            );
            return None;
        }
    };

    if log.has_errors() {
        return None;
    }
    Some(assemble(principal, year, acc, connections))
}

fn cell_err(field: &str, kind: ErrorKind) -> CellError {
    CellError {
        field: field.to_string(),
        kind,
    }
}

fn mismatch(field: &str, value: impl ToString) -> CellError {
    cell_err(
        field,
        ErrorKind::MismatchedValue {
            value: value.to_string(),
        },
    )
}

// Records `value` under `key`, or reports the field when a previous row
// said something different.
fn restate<K: Ord, V: PartialEq + ToString>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    field: &str,
) -> Result<(), CellError> {
    match map.get(&key) {
        Some(prev) if *prev != value => Err(mismatch(field, value)),
        Some(_) => Ok(()),
        None => {
            map.insert(key, value);
            Ok(())
        }
    }
}

fn parse_row(
    row: &Row,
    principal: &Principal,
    year: i32,
    proporz: bool,
    panachage_headers: &[(String, PanachageSource)],
    acc: &mut Accumulator,
) -> Result<(), CellError> {
    if let Some(status) = row.opt_text("election_status") {
        let status = ElectionStatus::parse(&status.to_lowercase())
            .ok_or_else(|| mismatch("election_status", &status))?;
        if *acc.status.get_or_insert(status) != status {
            return Err(mismatch("election_status", status.as_str()));
        }
    }
    if let Some(majority) = row.opt_integer("election_absolute_majority")? {
        if *acc.absolute_majority.get_or_insert(majority) != majority {
            return Err(mismatch("election_absolute_majority", majority));
        }
    }

    let entity_id = row.integer("entity_id")?;
    if principal.entity(year, entity_id as EntityId).is_none() {
        return Err(cell_err(
            "entity_id",
            ErrorKind::UnknownEntity { entity_id },
        ));
    }
    let entity_id = entity_id as EntityId;
    let figures = EntityFigures {
        counted: row.boolean("entity_counted")?,
        eligible_voters: row.integer("entity_eligible_voters")?,
        received_ballots: row.integer("entity_received_ballots")?,
        blank_ballots: row.integer("entity_blank_ballots")?,
        invalid_ballots: row.integer("entity_invalid_ballots")?,
        blank_votes: row.integer("entity_blank_votes")?,
        invalid_votes: row.integer("entity_invalid_votes")?,
    };
    match acc.entities.get(&entity_id) {
        Some(prev) if *prev != figures => {
            return Err(mismatch("entity_id", entity_id));
        }
        Some(_) => {}
        None => {
            acc.entities.insert(entity_id, figures);
        }
    }

    let list_id = if proporz { row.opt_text("list_id") } else { None };
    if let Some(list_id) = &list_id {
        let list = List {
            list_id: list_id.clone(),
            name: row.text("list_name"),
            number_of_mandates: row.integer("list_number_of_mandates")? as u32,
            connection_id: row.opt_text("list_connection"),
            panachage: Vec::new(),
        };
        match acc.lists.get(list_id) {
            Some(prev) if *prev != list => return Err(mismatch("list_id", list_id)),
            Some(_) => {}
            None => {
                acc.lists.insert(list_id.clone(), list);
            }
        }
        restate(
            &mut acc.list_votes,
            (entity_id, list_id.clone()),
            row.integer("list_votes")?,
            "list_votes",
        )?;
        if let Some(connection) = row.opt_text("list_connection") {
            let parent = row.opt_text("list_connection_parent");
            match acc.connections.get(&connection) {
                Some(prev) if *prev != parent => {
                    return Err(mismatch(
                        "list_connection_parent",
                        parent.unwrap_or_default(),
                    ));
                }
                Some(_) => {}
                None => {
                    acc.connections.insert(connection, parent);
                }
            }
        }
        for (header, source) in panachage_headers {
            if let Some(votes) = row.opt_integer(header)? {
                restate(
                    &mut acc.panachage,
                    (list_id.clone(), source.clone()),
                    votes,
                    header,
                )?;
            }
        }
    }

    let candidate_id = row.text("candidate_id");
    if candidate_id.is_empty() {
        return Err(cell_err(
            "candidate_id",
            ErrorKind::UnknownReference {
                value: candidate_id,
            },
        ));
    }
    let candidate = Candidate {
        candidate_id: candidate_id.clone(),
        family_name: row.text("candidate_family_name"),
        first_name: row.text("candidate_first_name"),
        elected: row.boolean("candidate_elected")?,
        party: row.opt_text("candidate_party"),
        list_id,
    };
    match acc.candidates.get(&candidate_id) {
        Some(prev) if *prev != candidate => {
            return Err(mismatch("candidate_id", candidate_id));
        }
        Some(_) => {}
        None => {
            acc.candidates.insert(candidate_id.clone(), candidate);
        }
    }
    restate(
        &mut acc.candidate_votes,
        (entity_id, candidate_id),
        row.integer("candidate_votes")?,
        "candidate_votes",
    )?;
    Ok(())
}

// A parent named by the file does not have to appear as a connection of its
// own; such parents are implicit roots.
fn close_connection_pairs(
    connections: &BTreeMap<String, Option<String>>,
) -> Vec<(String, Option<String>)> {
    let mut pairs: Vec<(String, Option<String>)> = connections
        .iter()
        .map(|(id, parent)| (id.clone(), parent.clone()))
        .collect();
    let known: Vec<String> = connections.keys().cloned().collect();
    let mut implicit: Vec<String> = connections
        .values()
        .flatten()
        .filter(|p| !known.contains(p))
        .cloned()
        .collect();
    implicit.sort();
    implicit.dedup();
    for parent in implicit {
        pairs.push((parent, None));
    }
    pairs
}

fn assemble(
    principal: &Principal,
    year: i32,
    acc: Accumulator,
    connections: Vec<ListConnection>,
) -> MutationBatch {
    let mut lists: Vec<List> = acc.lists.into_values().collect();
    for ((target, source), votes) in acc.panachage {
        if let Some(list) = lists.iter_mut().find(|l| l.list_id == target) {
            list.panachage.push(PanachageResult {
                source,
                target,
                votes: votes as u32,
            });
        }
    }

    let mut results = Vec::new();
    for (entity_id, figures) in acc.entities {
        let info = principal.entity(year, entity_id);
        let candidate_results: Vec<CandidateResult> = acc
            .candidate_votes
            .iter()
            .filter(|((eid, _), _)| *eid == entity_id)
            .map(|((_, cid), votes)| CandidateResult {
                candidate_id: cid.clone(),
                votes: *votes as u32,
            })
            .collect();
        let list_results: Vec<ListResult> = acc
            .list_votes
            .iter()
            .filter(|((eid, _), _)| *eid == entity_id)
            .map(|((_, lid), votes)| ListResult {
                list_id: lid.clone(),
                votes: *votes as u32,
            })
            .collect();
        results.push(ElectionResult {
            entity_id,
            name: info.map(|i| i.name.clone()).unwrap_or_default(),
            district: info.and_then(|i| i.district.clone()),
            counted: figures.counted,
            eligible_voters: figures.eligible_voters as u32,
            received_ballots: figures.received_ballots as u32,
            blank_ballots: figures.blank_ballots as u32,
            invalid_ballots: figures.invalid_ballots as u32,
            blank_votes: figures.blank_votes as u32,
            invalid_votes: figures.invalid_votes as u32,
            candidate_results,
            list_results,
        });
    }

    debug!(
        "io_internal: {} entities, {} candidates, {} lists",
        results.len(),
        acc.candidates.len(),
        lists.len()
    );
    MutationBatch {
        status: acc.status,
        absolute_majority: acc.absolute_majority.map(|m| m as u32),
        candidates: acc.candidates.into_values().collect(),
        lists,
        connections,
        results,
        counted_total: None,
    }
}
