// The SESAM format: one federal legacy CSV, one row per candidate per
// municipality. The majorz and proporz variants carry structurally
// different header sets; proporz adds the list and connection columns.
//
// Elections dated before the cutoff year use a pre-digitization layout this
// adapter does not understand and are rejected up front.

use std::collections::BTreeMap;

use chrono::Datelike;
use log::debug;

use crate::errors::{ErrorKind, ErrorLog};
use crate::import::tabular::{
    optional, parse_fraction, required, CellError, Coercion, Column, Row, Sheet,
};
use crate::import::{FileSet, MutationBatch, Principal, FILE_RESULTS};
use crate::model::*;

/// Earliest election year delivered in the layout this adapter reads.
const CUTOFF_YEAR: i32 = 2001;

const MAJORZ_COLUMNS: &[Column] = &[
    required("Anzahl Sitze", Coercion::Integer),
    required("Wahlkreis-Nr", Coercion::Integer),
    required("Stimmberechtigte", Coercion::Integer),
    required("Wahlzettel", Coercion::Integer),
    required("Leere Wahlzettel", Coercion::Integer),
    required("Ungültige Wahlzettel", Coercion::Integer),
    required("Leere Stimmen", Coercion::Integer),
    required("Ungültige Stimmen", Coercion::Integer),
    required("Kandidaten-Nr", Coercion::Text),
    required("Name", Coercion::Text),
    required("Vorname", Coercion::Text),
    required("Gewaehlt", Coercion::Text),
    required("Stimmen", Coercion::Integer),
    optional("Absolutes Mehr", Coercion::Integer),
    optional("Anzahl Gemeinden", Coercion::Fraction),
];

const PROPORZ_COLUMNS: &[Column] = &[
    required("Anzahl Sitze", Coercion::Integer),
    required("Wahlkreis-Nr", Coercion::Integer),
    required("Stimmberechtigte", Coercion::Integer),
    required("Wahlzettel", Coercion::Integer),
    required("Leere Wahlzettel", Coercion::Integer),
    required("Ungültige Wahlzettel", Coercion::Integer),
    required("Leere Stimmen", Coercion::Integer),
    required("Ungültige Stimmen", Coercion::Integer),
    required("Liste-Nr", Coercion::Text),
    required("Liste-Bezeichnung", Coercion::Text),
    required("Liste-Anzahl Sitze", Coercion::Integer),
    optional("HLV-Nr", Coercion::Text),
    optional("ULV-Nr", Coercion::Text),
    required("Listenstimmen", Coercion::Integer),
    required("Kandidaten-Nr", Coercion::Text),
    required("Name", Coercion::Text),
    required("Vorname", Coercion::Text),
    required("Gewaehlt", Coercion::Text),
    required("Stimmen", Coercion::Integer),
    optional("Anzahl Gemeinden", Coercion::Fraction),
];

#[derive(Eq, PartialEq, Debug, Clone)]
struct EntityFigures {
    eligible_voters: u64,
    received_ballots: u64,
    blank_ballots: u64,
    invalid_ballots: u64,
    blank_votes: u64,
    invalid_votes: u64,
}

#[derive(Default)]
struct Accumulator {
    absolute_majority: Option<u64>,
    entities: BTreeMap<EntityId, EntityFigures>,
    candidates: BTreeMap<String, Candidate>,
    candidate_votes: BTreeMap<(EntityId, String), u64>,
    lists: BTreeMap<String, List>,
    list_votes: BTreeMap<(EntityId, String), u64>,
    connections: BTreeMap<String, Option<String>>,
    counted_total: Option<(u64, u64)>,
}

pub fn parse(
    election: &Election,
    principal: &Principal,
    files: &FileSet,
    log: &mut ErrorLog,
) -> Option<MutationBatch> {
    let year = election.common().date.year();
    if year < CUTOFF_YEAR {
        log.fatal(FILE_RESULTS, ErrorKind::UnsupportedYear { year });
        return None;
    }
    let bytes = match files.get(FILE_RESULTS) {
        Some(b) => b,
        None => {
            log.fatal(FILE_RESULTS, ErrorKind::EmptyData);
            return None;
        }
    };
    let proporz = election.election_type() == ElectionType::Proporz;
    let schema = if proporz {
        PROPORZ_COLUMNS
    } else {
        MAJORZ_COLUMNS
    };
    let sheet = Sheet::load(FILE_RESULTS, bytes, schema, log)?;

    let mut acc = Accumulator::default();
    for row in sheet.rows() {
        if let Err(e) = parse_row(&row, &sheet, principal, year, proporz, &mut acc) {
            log.row_error(FILE_RESULTS, row.line(), Some(&e.field), e.kind);
        }
        if log.is_fatal(FILE_RESULTS) {
            break;
        }
    }

    let pairs: Vec<(String, Option<String>)> = acc
        .connections
        .iter()
        .map(|(id, parent)| (id.clone(), parent.clone()))
        .collect();
    let connections = match ListConnection::build_forest(&pairs) {
        Ok(forest) => forest,
        // HLV ids are always inserted as roots, so only a self-referential
        // file can fail here.
        Err(_) => {
            log.fatal(
                FILE_RESULTS,
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

// "Gewaehlt" is a marker cell, not a wahr/falsch boolean.
fn parse_elected(v: &str) -> bool {
    matches!(
        v.to_lowercase().as_str(),
        "gewaehlt" | "gewählt" | "wahr" | "true" | "1"
    )
}

fn parse_row(
    row: &Row,
    sheet: &Sheet,
    principal: &Principal,
    year: i32,
    proporz: bool,
    acc: &mut Accumulator,
) -> Result<(), CellError> {
    if let Some(majority) = row.opt_integer("Absolutes Mehr")? {
        if *acc.absolute_majority.get_or_insert(majority) != majority {
            return Err(mismatch("Absolutes Mehr", majority));
        }
    }
    if acc.counted_total.is_none() {
        acc.counted_total = counted_total(row, sheet)?;
    }

    let entity_id = row.integer("Wahlkreis-Nr")?;
    if principal.entity(year, entity_id as EntityId).is_none() {
        return Err(cell_err(
            "Wahlkreis-Nr",
            ErrorKind::UnknownEntity { entity_id },
        ));
    }
    let entity_id = entity_id as EntityId;
    let figures = EntityFigures {
        eligible_voters: row.integer("Stimmberechtigte")?,
        received_ballots: row.integer("Wahlzettel")?,
        blank_ballots: row.integer("Leere Wahlzettel")?,
        invalid_ballots: row.integer("Ungültige Wahlzettel")?,
        blank_votes: row.integer("Leere Stimmen")?,
        invalid_votes: row.integer("Ungültige Stimmen")?,
    };
    match acc.entities.get(&entity_id) {
        Some(prev) if *prev != figures => {
            return Err(mismatch("Wahlkreis-Nr", entity_id));
        }
        Some(_) => {}
        None => {
            acc.entities.insert(entity_id, figures);
        }
    }

    let list_id = if proporz {
        let list_id = row.text("Liste-Nr");
        if list_id.is_empty() {
            return Err(cell_err(
                "Liste-Nr",
                ErrorKind::UnknownReference { value: list_id },
            ));
        }
        let hlv = row.opt_text("HLV-Nr");
        let ulv = row.opt_text("ULV-Nr");
        if let Some(hlv) = &hlv {
            acc.connections.entry(hlv.clone()).or_insert(None);
            if let Some(ulv) = &ulv {
                acc.connections
                    .entry(ulv.clone())
                    .or_insert_with(|| Some(hlv.clone()));
            }
        }
        let list = List {
            list_id: list_id.clone(),
            name: row.text("Liste-Bezeichnung"),
            number_of_mandates: row.integer("Liste-Anzahl Sitze")? as u32,
            connection_id: ulv.or(hlv),
            panachage: Vec::new(),
        };
        match acc.lists.get(&list_id) {
            Some(prev) if *prev != list => return Err(mismatch("Liste-Nr", &list_id)),
            Some(_) => {}
            None => {
                acc.lists.insert(list_id.clone(), list);
            }
        }
        let votes = row.integer("Listenstimmen")?;
        match acc.list_votes.get(&(entity_id, list_id.clone())) {
            Some(prev) if *prev != votes => return Err(mismatch("Listenstimmen", votes)),
            Some(_) => {}
            None => {
                acc.list_votes.insert((entity_id, list_id.clone()), votes);
            }
        }
        Some(list_id)
    } else {
        None
    };

    let candidate_id = row.text("Kandidaten-Nr");
    if candidate_id.is_empty() {
        return Err(cell_err(
            "Kandidaten-Nr",
            ErrorKind::UnknownReference {
                value: candidate_id,
            },
        ));
    }
    let candidate = Candidate {
        candidate_id: candidate_id.clone(),
        family_name: row.text("Name"),
        first_name: row.text("Vorname"),
        elected: parse_elected(&row.text("Gewaehlt")),
        party: None,
        list_id,
    };
    match acc.candidates.get(&candidate_id) {
        Some(prev) if *prev != candidate => {
            return Err(mismatch("Kandidaten-Nr", candidate_id));
        }
        Some(_) => {}
        None => {
            acc.candidates.insert(candidate_id.clone(), candidate);
        }
    }
    let votes = row.integer("Stimmen")?;
    match acc.candidate_votes.get(&(entity_id, candidate_id.clone())) {
        Some(prev) if *prev != votes => return Err(mismatch("Stimmen", votes)),
        Some(_) => {}
        None => {
            acc.candidate_votes.insert((entity_id, candidate_id), votes);
        }
    }
    Ok(())
}

// The municipalities figure travels as a "counted von total" cell. Some
// sub-variants omit the header and deliver it as the unnamed last column;
// there it is taken opportunistically, since nothing marks the column.
fn counted_total(row: &Row, sheet: &Sheet) -> Result<Option<(u64, u64)>, CellError> {
    if sheet.has_column("Anzahl Gemeinden") {
        return match row.opt_text("Anzahl Gemeinden") {
            Some(_) => row.fraction("Anzahl Gemeinden").map(Some),
            None => Ok(None),
        };
    }
    Ok(row
        .by_index(sheet.column_count() - 1)
        .and_then(parse_fraction))
}

fn assemble(
    principal: &Principal,
    year: i32,
    acc: Accumulator,
    connections: Vec<ListConnection>,
) -> MutationBatch {
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
            // A municipality only appears in the file once it is counted.
            counted: true,
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
        "io_sesam: {} entities, {} candidates, {} lists, counted_total {:?}",
        results.len(),
        acc.candidates.len(),
        acc.lists.len(),
        acc.counted_total
    );
    MutationBatch {
        status: None,
        absolute_majority: acc.absolute_majority.map(|m| m as u32),
        candidates: acc.candidates.into_values().collect(),
        lists: acc.lists.into_values().collect(),
        connections,
        results,
        counted_total: acc.counted_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn principal() -> Principal {
        let mut p = Principal::new("Zug");
        p.add_entity(2015, 1701, "Baar", None);
        p.add_entity(2015, 1702, "Cham", None);
        p
    }

    fn shell(t: ElectionType, year: i32) -> Election {
        Election::new(
            t,
            Title::plain("Wahl"),
            NaiveDate::from_ymd_opt(year, 10, 18).unwrap(),
            Domain::Canton,
            2,
            &HashSet::new(),
        )
    }

    fn files(content: &str) -> FileSet {
        let mut fs = FileSet::new();
        fs.insert(FILE_RESULTS.to_string(), content.as_bytes().to_vec());
        fs
    }

    const MAJORZ_HEADER: &str = "Anzahl Sitze,Wahlkreis-Nr,Stimmberechtigte,Wahlzettel,\
Leere Wahlzettel,Ungültige Wahlzettel,Leere Stimmen,Ungültige Stimmen,\
Kandidaten-Nr,Name,Vorname,Gewaehlt,Stimmen,Absolutes Mehr,Anzahl Gemeinden";

    #[test]
    fn parses_a_majorz_file() {
        let data = format!(
            "{}\n\
             2,1701,14119,7462,77,196,122,0,1,Muster,Peter,Gewaehlt,3240,3621,2 von 11\n\
             2,1701,14119,7462,77,196,122,0,2,Beispiel,Hans,,2389,3621,2 von 11\n\
             2,1702,9926,4863,0,161,50,0,1,Muster,Peter,Gewaehlt,2200,3621,2 von 11\n\
             2,1702,9926,4863,0,161,50,0,2,Beispiel,Hans,,1600,3621,2 von 11\n",
            MAJORZ_HEADER
        );
        let mut log = ErrorLog::new();
        let batch = parse(
            &shell(ElectionType::Majorz, 2015),
            &principal(),
            &files(&data),
            &mut log,
        )
        .unwrap();
        assert!(!log.has_errors());
        assert_eq!(batch.absolute_majority, Some(3621));
        assert_eq!(batch.counted_total, Some((2, 11)));
        assert_eq!(batch.candidates.len(), 2);
        assert!(batch.candidates[0].elected);
        assert!(!batch.candidates[1].elected);
        assert_eq!(batch.results.len(), 2);
        assert!(batch.results.iter().all(|r| r.counted));
        assert_eq!(batch.results[0].candidate_votes("1"), 3240);
    }

    #[test]
    fn missing_wahlkreis_column_is_one_fatal() {
        let header = MAJORZ_HEADER.replace("Wahlkreis-Nr,", "");
        let data = format!(
            "{}\n2,14119,7462,77,196,122,0,1,Muster,Peter,Gewaehlt,3240,3621,2 von 11\n",
            header
        );
        let mut log = ErrorLog::new();
        assert!(parse(
            &shell(ElectionType::Majorz, 2015),
            &principal(),
            &files(&data),
            &mut log
        )
        .is_none());
        assert_eq!(log.errors().len(), 1);
        assert_eq!(
            log.errors()[0].kind.to_string(),
            "missing columns: Wahlkreis-Nr"
        );
        assert_eq!(log.errors()[0].line, None);
    }

    #[test]
    fn years_before_the_cutoff_are_rejected_unread() {
        let mut log = ErrorLog::new();
        // Garbage bytes on purpose; the gate fires before any read.
        let result = parse(
            &shell(ElectionType::Majorz, 1990),
            &principal(),
            &files("not,a,sesam\nfile"),
            &mut log,
        );
        assert!(result.is_none());
        assert_eq!(log.errors().len(), 1);
        assert_eq!(
            log.errors()[0].kind.to_string(),
            "year 1990 not yet supported"
        );
    }

    #[test]
    fn proporz_connections_come_from_hlv_and_ulv() {
        let header = "Anzahl Sitze,Wahlkreis-Nr,Stimmberechtigte,Wahlzettel,\
Leere Wahlzettel,Ungültige Wahlzettel,Leere Stimmen,Ungültige Stimmen,\
Liste-Nr,Liste-Bezeichnung,Liste-Anzahl Sitze,HLV-Nr,ULV-Nr,Listenstimmen,\
Kandidaten-Nr,Name,Vorname,Gewaehlt,Stimmen";
        let data = format!(
            "{}\n\
             2,1701,14119,7462,77,196,0,0,1,Liste 1,1,A,A.1,520,101,Muster,Anna,Gewaehlt,340\n\
             2,1701,14119,7462,77,196,0,0,2,Liste 2,0,A,,130,201,Beispiel,Hans,,90\n",
            header
        );
        let mut log = ErrorLog::new();
        let batch = parse(
            &shell(ElectionType::Proporz, 2015),
            &principal(),
            &files(&data),
            &mut log,
        )
        .unwrap();
        assert!(!log.has_errors());
        assert_eq!(batch.lists.len(), 2);
        assert_eq!(batch.lists[0].connection_id.as_deref(), Some("A.1"));
        assert_eq!(batch.lists[1].connection_id.as_deref(), Some("A"));
        assert_eq!(batch.connections.len(), 1);
        assert_eq!(batch.connections[0].connection_id(), "A");
        assert_eq!(batch.connections[0].subconnections().len(), 1);
        assert_eq!(batch.results[0].list_votes("1"), 520);
    }

    #[test]
    fn trailing_total_column_is_found_positionally() {
        let header = "Anzahl Sitze,Wahlkreis-Nr,Stimmberechtigte,Wahlzettel,\
Leere Wahlzettel,Ungültige Wahlzettel,Leere Stimmen,Ungültige Stimmen,\
Kandidaten-Nr,Name,Vorname,Gewaehlt,Stimmen,Unbenannt";
        let data = format!(
            "{}\n2,1701,14119,7462,77,196,122,0,1,Muster,Peter,Gewaehlt,3240,2 von 11\n",
            header
        );
        let mut log = ErrorLog::new();
        let batch = parse(
            &shell(ElectionType::Majorz, 2015),
            &principal(),
            &files(&data),
            &mut log,
        )
        .unwrap();
        assert_eq!(batch.counted_total, Some((2, 11)));
    }

    #[test]
    fn unknown_entities_are_row_errors() {
        let data = format!(
            "{}\n2,9999,100,50,0,0,0,0,1,Muster,Peter,,10,,\n",
            MAJORZ_HEADER
        );
        let mut log = ErrorLog::new();
        assert!(parse(
            &shell(ElectionType::Majorz, 2015),
            &principal(),
            &files(&data),
            &mut log
        )
        .is_none());
        assert_eq!(
            log.errors()[0].kind,
            ErrorKind::UnknownEntity { entity_id: 9999 }
        );
        assert_eq!(log.errors()[0].line, Some(2));
    }
}
