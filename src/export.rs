//! The canonical exports.
//!
//! The CSV export's columns are exactly the Internal format's import
//! contract: re-importing an export reproduces the same canonical state,
//! and re-exporting that reproduces the same bytes. The JSON export carries
//! the same rows with typed values for the web views.

use serde_json::{json, Map as JsMap, Value as JsValue};

use crate::aggregate;
use crate::model::*;

/// One typed cell of an export row. Empty cells render as the empty string
/// in CSV and as null in JSON, distinct from a present zero.
#[derive(PartialEq, Debug, Clone)]
enum Cell {
    Empty,
    Int(u64),
    Bool(bool),
    Text(String),
}

impl Cell {
    fn csv(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Int(v) => v.to_string(),
            Cell::Bool(true) => "true".to_string(),
            Cell::Bool(false) => "false".to_string(),
            Cell::Text(s) => s.clone(),
        }
    }

    fn json(&self) -> JsValue {
        match self {
            Cell::Empty => JsValue::Null,
            Cell::Int(v) => json!(v),
            Cell::Bool(b) => json!(b),
            Cell::Text(s) => json!(s),
        }
    }
}

// Ids in the wire formats are digit strings most of the time; sort those
// numerically and everything else lexicographically after them.
fn id_sort_key(id: &str) -> (usize, &str) {
    (id.len(), id)
}

/// The ordered headers of the canonical export for this election.
pub fn columns(election: &Election) -> Vec<String> {
    let mut cols: Vec<String> = vec![
        "election_type".to_string(),
        "election_date".to_string(),
        "election_absolute_majority".to_string(),
        "election_status".to_string(),
        "entity_id".to_string(),
        "entity_counted".to_string(),
        "entity_eligible_voters".to_string(),
        "entity_received_ballots".to_string(),
        "entity_blank_ballots".to_string(),
        "entity_invalid_ballots".to_string(),
        "entity_blank_votes".to_string(),
        "entity_invalid_votes".to_string(),
    ];
    if election.election_type() == ElectionType::Proporz {
        cols.extend(
            [
                "list_name",
                "list_id",
                "list_number_of_mandates",
                "list_votes",
                "list_connection",
                "list_connection_parent",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }
    cols.extend(
        [
            "candidate_family_name",
            "candidate_first_name",
            "candidate_id",
            "candidate_elected",
            "candidate_party",
            "candidate_votes",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    if election.election_type() == ElectionType::Proporz {
        for source in panachage_sources(election) {
            cols.push(panachage_column(&source));
        }
    }
    cols
}

fn panachage_column(source: &PanachageSource) -> String {
    match source {
        PanachageSource::Blank => "panachage_votes_from_blank".to_string(),
        PanachageSource::List(id) => format!("panachage_votes_from_list_{}", id),
    }
}

// The known panachage sources in canonical column order: the blank bucket
// first, then the source lists.
fn panachage_sources(election: &Election) -> Vec<PanachageSource> {
    let mut ids: Vec<&str> = election
        .lists()
        .iter()
        .flat_map(|l| l.panachage.iter())
        .filter_map(|p| match &p.source {
            PanachageSource::List(id) => Some(id.as_str()),
            PanachageSource::Blank => None,
        })
        .collect();
    ids.sort_by_key(|id| id_sort_key(id));
    ids.dedup();
    let has_blank = election
        .lists()
        .iter()
        .flat_map(|l| l.panachage.iter())
        .any(|p| p.source == PanachageSource::Blank);
    let mut sources = Vec::new();
    if has_blank {
        sources.push(PanachageSource::Blank);
    }
    sources.extend(ids.into_iter().map(|id| PanachageSource::List(id.to_string())));
    sources
}

// The connection a list sits in and that connection's parent, looked up in
// the owned tree.
fn list_connection_cells(election: &Election, list: &List) -> (Cell, Cell) {
    let connection_id = match &list.connection_id {
        Some(id) => id,
        None => return (Cell::Empty, Cell::Empty),
    };
    fn find<'a>(
        nodes: &'a [ListConnection],
        id: &str,
    ) -> Option<&'a ListConnection> {
        for node in nodes {
            if node.connection_id() == id {
                return Some(node);
            }
            if let Some(found) = find(node.subconnections(), id) {
                return Some(found);
            }
        }
        None
    }
    let parent = match find(election.connections(), connection_id) {
        Some(ListConnection::Sub { parent_id, .. }) => Cell::Text(parent_id.clone()),
        _ => Cell::Empty,
    };
    (Cell::Text(connection_id.clone()), parent)
}

fn rows(election: &Election) -> Vec<Vec<Cell>> {
    let common = election.common();
    let election_type = election.election_type();
    let sources = panachage_sources(election);

    let mut candidates: Vec<&Candidate> = common.candidates.iter().collect();
    candidates.sort_by(|a, b| {
        let la = a.list_id.as_deref().unwrap_or("");
        let lb = b.list_id.as_deref().unwrap_or("");
        id_sort_key(la)
            .cmp(&id_sort_key(lb))
            .then(id_sort_key(&a.candidate_id).cmp(&id_sort_key(&b.candidate_id)))
    });

    let mut results: Vec<&ElectionResult> = common.results.iter().collect();
    results.sort_by_key(|r| r.entity_id);

    let mut out = Vec::new();
    for result in results {
        for candidate in candidates.iter() {
            let mut row = vec![
                Cell::Text(election_type.as_str().to_string()),
                Cell::Text(common.date.format("%Y-%m-%d").to_string()),
                match election.absolute_majority() {
                    Some(m) => Cell::Int(m as u64),
                    None => Cell::Empty,
                },
                Cell::Text(common.status.as_str().to_string()),
                Cell::Int(result.entity_id as u64),
                Cell::Bool(result.counted),
                Cell::Int(result.eligible_voters as u64),
                Cell::Int(result.received_ballots as u64),
                Cell::Int(result.blank_ballots as u64),
                Cell::Int(result.invalid_ballots as u64),
                Cell::Int(result.blank_votes as u64),
                Cell::Int(result.invalid_votes as u64),
            ];
            let list = candidate
                .list_id
                .as_deref()
                .and_then(|id| election.list(id));
            if election_type == ElectionType::Proporz {
                match list {
                    Some(list) => {
                        let (connection, parent) = list_connection_cells(election, list);
                        row.push(Cell::Text(list.name.clone()));
                        row.push(Cell::Text(list.list_id.clone()));
                        row.push(Cell::Int(list.number_of_mandates as u64));
                        row.push(Cell::Int(result.list_votes(&list.list_id) as u64));
                        row.push(connection);
                        row.push(parent);
                    }
                    None => {
                        for _ in 0..6 {
                            row.push(Cell::Empty);
                        }
                    }
                }
            }
            row.push(Cell::Text(candidate.family_name.clone()));
            row.push(Cell::Text(candidate.first_name.clone()));
            row.push(Cell::Text(candidate.candidate_id.clone()));
            row.push(Cell::Bool(candidate.elected));
            row.push(match &candidate.party {
                Some(p) => Cell::Text(p.clone()),
                None => Cell::Empty,
            });
            row.push(Cell::Int(result.candidate_votes(&candidate.candidate_id) as u64));
            if election_type == ElectionType::Proporz {
                for source in sources.iter() {
                    let cell = match list {
                        Some(list) => list
                            .panachage
                            .iter()
                            .find(|p| p.source == *source && p.target == list.list_id)
                            .map(|p| Cell::Int(p.votes as u64))
                            .unwrap_or(Cell::Empty),
                        None => Cell::Empty,
                    };
                    row.push(cell);
                }
            }
            out.push(row);
        }
    }
    out
}

/// Renders the canonical CSV export.
pub fn export_csv(election: &Election) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    // Writing headers and rows of plain strings cannot fail on a Vec sink.
    let _ = writer.write_record(columns(election));
    for row in rows(election) {
        let _ = writer.write_record(row.iter().map(|c| c.csv()));
    }
    let bytes = writer.into_inner().unwrap_or_default();
    String::from_utf8(bytes).unwrap_or_default()
}

/// Renders the same rows as JSON, with typed values.
pub fn export_json(election: &Election) -> JsValue {
    let cols = columns(election);
    let data: Vec<JsValue> = rows(election)
        .iter()
        .map(|row| {
            let mut obj = JsMap::new();
            for (col, cell) in cols.iter().zip(row.iter()) {
                obj.insert(col.clone(), cell.json());
            }
            JsValue::Object(obj)
        })
        .collect();
    json!(data)
}

/// Renders the party results export: one row per (year, party), panachage
/// sources as trailing columns. Cells stay empty (not zero) for parties
/// without a result in that year.
pub fn export_parties_csv(election: &Election) -> String {
    let results = election.party_results();
    let mut party_ids: Vec<&str> = results.iter().map(|p| p.party_id.as_str()).collect();
    party_ids.sort_by_key(|id| id_sort_key(id));
    party_ids.dedup();

    let mut headers: Vec<String> = [
        "year",
        "name",
        "id",
        "color",
        "mandates",
        "votes",
        "total_votes",
        "voters_count",
        "voters_count_percentage",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let has_blank = election
        .party_panachage()
        .iter()
        .any(|p| p.source == PanachageSource::Blank);
    if has_blank {
        headers.push("panachage_votes_from_blank".to_string());
    }
    for id in party_ids.iter() {
        headers.push(format!("panachage_votes_from_{}", id));
    }

    let mut sorted: Vec<&PartyResult> = results.iter().collect();
    sorted.sort_by(|a, b| {
        a.year
            .cmp(&b.year)
            .then(id_sort_key(&a.party_id).cmp(&id_sort_key(&b.party_id)))
    });

    let mut writer = csv::Writer::from_writer(Vec::new());
    let _ = writer.write_record(&headers);
    for party in sorted {
        let mut row: Vec<String> = vec![
            party.year.to_string(),
            party.name.clone(),
            party.party_id.clone(),
            party.color.clone().unwrap_or_default(),
            party.number_of_mandates.to_string(),
            party.votes.to_string(),
            party.total_votes.to_string(),
            party
                .voters_count
                .map(|v| format!("{}", v))
                .unwrap_or_default(),
            party
                .voters_count_percentage
                .map(|v| format!("{}", v))
                .unwrap_or_default(),
        ];
        let panachage_cell = |source: &PanachageSource| -> String {
            election
                .party_panachage()
                .iter()
                .find(|p| p.target == party.party_id && p.source == *source)
                .map(|p| p.votes.to_string())
                .unwrap_or_default()
        };
        if has_blank {
            row.push(panachage_cell(&PanachageSource::Blank));
        }
        for id in party_ids.iter() {
            // A source party that did not exist in this row's year stays an
            // empty cell.
            let existed = results
                .iter()
                .any(|p| p.party_id == *id && p.year == party.year);
            if existed {
                row.push(panachage_cell(&PanachageSource::List(id.to_string())));
            } else {
                row.push(String::new());
            }
        }
        let _ = writer.write_record(&row);
    }
    let bytes = writer.into_inner().unwrap_or_default();
    String::from_utf8(bytes).unwrap_or_default()
}

/// Aggregate figures for consumers that render summaries.
pub fn summary_json(election: &Election) -> JsValue {
    let (counted, total) = aggregate::progress(election);
    json!({
        "completed": aggregate::completed(election),
        "progress": { "counted": counted, "total": total },
        "turnout": aggregate::turnout(election),
        "eligible_voters": aggregate::total_eligible_voters(election),
        "received_ballots": aggregate::total_received_ballots(election),
        "accounted_ballots": aggregate::total_accounted_ballots(election),
        "accounted_votes": aggregate::total_accounted_votes(election),
        "absolute_majority": election.absolute_majority(),
        "date": election.common().date.format("%Y-%m-%d").to_string(),
        "type": election.election_type().as_str(),
        "status": election.common().status.as_str(),
    })
}
