//! The import pipeline.
//!
//! One call runs a single state machine: the declared format selects an
//! adapter, the adapter validates the whole multi-file set into a
//! [`MutationBatch`], and only a clean batch is committed to the election.
//! Any error anywhere rejects the call with the full list of findings and
//! leaves previously committed data untouched.

pub mod io_internal;
pub mod io_sesam;
pub mod io_wabsti;
pub mod tabular;

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Utc};
use log::info;

use crate::errors::{ErrorLog, FileError};
use crate::model::*;

/// The wire formats understood by the pipeline.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum ImportFormat {
    Internal,
    Sesam,
    Wabsti,
}

impl ImportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportFormat::Internal => "internal",
            ImportFormat::Sesam => "sesam",
            ImportFormat::Wabsti => "wabsti",
        }
    }

    pub fn parse(s: &str) -> Option<ImportFormat> {
        match s {
            "internal" => Some(ImportFormat::Internal),
            "sesam" => Some(ImportFormat::Sesam),
            "wabsti" => Some(ImportFormat::Wabsti),
            _ => None,
        }
    }
}

/// Logical names of the uploaded streams. The single-file formats use
/// [`FILE_RESULTS`] only; WabstiC uses the whole set.
pub const FILE_RESULTS: &str = "results";
pub const FILE_STATISTICS: &str = "statistics";
pub const FILE_LISTS: &str = "lists";
pub const FILE_LIST_RESULTS: &str = "list_results";
pub const FILE_CANDIDATES: &str = "candidates";
pub const FILE_CANDIDATE_RESULTS: &str = "candidate_results";
pub const FILE_CONNECTIONS: &str = "connections";
pub const FILE_ELECTED: &str = "elected";

/// Uploaded byte streams, keyed by logical file name.
pub type FileSet = BTreeMap<String, Vec<u8>>;

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct EntityInfo {
    pub name: String,
    pub district: Option<String>,
}

/// The registry of valid entity ids per year, supplied by the caller.
///
/// Entity id resolution always goes through here; an id outside the
/// registry for the election's year is an unknown entity. Register entity 0
/// explicitly if expatriate results are acceptable.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct Principal {
    pub name: String,
    entities: BTreeMap<i32, BTreeMap<EntityId, EntityInfo>>,
}

impl Principal {
    pub fn new(name: &str) -> Principal {
        Principal {
            name: name.to_string(),
            entities: BTreeMap::new(),
        }
    }

    pub fn add_entity(&mut self, year: i32, id: EntityId, name: &str, district: Option<&str>) {
        self.entities.entry(year).or_default().insert(
            id,
            EntityInfo {
                name: name.to_string(),
                district: district.map(|d| d.to_string()),
            },
        );
    }

    pub fn entities(&self, year: i32) -> Option<&BTreeMap<EntityId, EntityInfo>> {
        self.entities.get(&year)
    }

    pub fn entity(&self, year: i32, id: EntityId) -> Option<&EntityInfo> {
        self.entities.get(&year).and_then(|m| m.get(&id))
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ImportFlags {
    /// When set, the upload supersedes everything previously committed and
    /// the election becomes final.
    pub complete: bool,
}

/// A fully validated, not yet applied description of the entities to
/// create or replace. Only the orchestrator materializes it.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct MutationBatch {
    /// Explicit status delivered by the Internal format, if any.
    pub status: Option<ElectionStatus>,
    pub absolute_majority: Option<u32>,
    pub candidates: Vec<Candidate>,
    pub lists: Vec<List>,
    pub connections: Vec<ListConnection>,
    pub results: Vec<ElectionResult>,
    /// The "counted von total" municipalities figure, where the format
    /// delivers one. Informational; the principal stays authoritative for
    /// which entities exist.
    pub counted_total: Option<(u64, u64)>,
}

/// Runs one import call to completion: validate, then commit or reject.
pub fn import(
    election: &mut Election,
    principal: &Principal,
    format: ImportFormat,
    files: &FileSet,
    flags: &ImportFlags,
) -> Result<(), Vec<FileError>> {
    info!(
        "import: election {:?}, format {:?}, {} file(s), complete: {}",
        election.common().id,
        format.as_str(),
        files.len(),
        flags.complete
    );
    let mut log = ErrorLog::new();
    let batch = match format {
        ImportFormat::Internal => io_internal::parse(election, principal, files, &mut log),
        ImportFormat::Sesam => io_sesam::parse(election, principal, files, &mut log),
        ImportFormat::Wabsti => io_wabsti::parse(election, principal, files, &mut log),
    };
    if log.has_errors() {
        info!("import: rejected with {} error(s)", log.errors().len());
        return Err(log.into_errors());
    }
    let batch = match batch {
        Some(b) => b,
        // No batch without an error record would be an adapter bug; reject
        // rather than silently succeed.
        None => return Err(log.into_errors()),
    };
    commit(election, principal, batch, flags);
    Ok(())
}

// Applies the batch. Partial scope by default: only uploaded entity ids are
// replaced. The full replace wipes everything first.
fn commit(
    election: &mut Election,
    principal: &Principal,
    batch: MutationBatch,
    flags: &ImportFlags,
) {
    let year = election.common().date.year();

    if flags.complete {
        election.clear_results();
    } else {
        let uploaded: HashSet<EntityId> = batch.results.iter().map(|r| r.entity_id).collect();
        election
            .common_mut()
            .results
            .retain(|r| !uploaded.contains(&r.entity_id));
    }

    // Candidate and list definitions are upserted by external id, so an
    // incremental upload refreshes them without dropping earlier ones.
    for candidate in batch.candidates {
        let candidates = &mut election.common_mut().candidates;
        match candidates
            .iter_mut()
            .find(|c| c.candidate_id == candidate.candidate_id)
        {
            Some(existing) => *existing = candidate,
            None => candidates.push(candidate),
        }
    }
    if let Election::Proporz(p) = election {
        for list in batch.lists {
            match p.lists.iter_mut().find(|l| l.list_id == list.list_id) {
                Some(existing) => *existing = list,
                None => p.lists.push(list),
            }
        }
        if !batch.connections.is_empty() {
            p.connections = batch.connections;
        }
    }

    for result in batch.results {
        // Uniqueness was enforced by the adapter; a duplicate here would be
        // a bug in the batch itself.
        let _ = election.add_result(result);
    }

    // Every entity of the principal gets a placeholder result, so progress
    // and the percentage breakdowns always cover the full domain.
    if let Some(entities) = principal.entities(year) {
        for (id, info) in entities.iter() {
            if election.common().result_for(*id).is_none() {
                let _ = election.add_result(ElectionResult {
                    entity_id: *id,
                    name: info.name.clone(),
                    district: info.district.clone(),
                    counted: false,
                    eligible_voters: 0,
                    received_ballots: 0,
                    blank_ballots: 0,
                    invalid_ballots: 0,
                    blank_votes: 0,
                    invalid_votes: 0,
                    candidate_results: Vec::new(),
                    list_results: Vec::new(),
                });
            }
        }
    }
    election.common_mut().results.sort_by_key(|r| r.entity_id);

    if let (Election::Majorz(m), Some(majority)) = (&mut *election, batch.absolute_majority) {
        m.absolute_majority = Some(majority);
    }

    let status = if flags.complete {
        ElectionStatus::Final
    } else {
        match batch.status {
            Some(s) if s != ElectionStatus::Unset => s,
            _ => ElectionStatus::Interim,
        }
    };
    let common = election.common_mut();
    common.status = status;
    common.last_result_change = Some(Utc::now().naive_utc());
    info!(
        "import: committed, status {:?}, {} result(s)",
        common.status.as_str(),
        common.results.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate;
    use crate::errors::ErrorKind;
    use crate::export;
    use chrono::NaiveDate;
    use text_diff::print_diff;

    const MUNICIPALITIES: &[(EntityId, &str)] = &[
        (1701, "Baar"),
        (1702, "Cham"),
        (1703, "Hünenberg"),
        (1704, "Menzingen"),
        (1705, "Neuheim"),
        (1706, "Oberägeri"),
        (1707, "Risch"),
        (1708, "Steinhausen"),
        (1709, "Unterägeri"),
        (1710, "Walchwil"),
        (1711, "Zug"),
    ];

    fn principal() -> Principal {
        let mut p = Principal::new("Zug");
        for (id, name) in MUNICIPALITIES {
            p.add_entity(2015, *id, name, None);
        }
        p
    }

    fn shell(t: ElectionType) -> Election {
        Election::new(
            t,
            Title::plain("Wahl"),
            NaiveDate::from_ymd_opt(2015, 10, 18).unwrap(),
            Domain::Canton,
            2,
            &std::collections::HashSet::new(),
        )
    }

    const SESAM_MAJORZ_HEADER: &str = "Anzahl Sitze,Wahlkreis-Nr,Stimmberechtigte,Wahlzettel,\
Leere Wahlzettel,Ungültige Wahlzettel,Leere Stimmen,Ungültige Stimmen,\
Kandidaten-Nr,Name,Vorname,Gewaehlt,Stimmen,Absolutes Mehr,Anzahl Gemeinden";

    // Two fixed candidates, per-entity counts derived from the entity id so
    // every municipality gets distinct but reproducible figures.
    fn sesam_majorz_file(ids: &[EntityId]) -> FileSet {
        let mut data = format!("{}\n", SESAM_MAJORZ_HEADER);
        for id in ids {
            let base = id - 1700;
            for (knr, name, first, elected, votes) in [
                ("1", "Muster", "Peter", "Gewaehlt", base * 300),
                ("2", "Beispiel", "Hans", "", base * 200),
            ] {
                data.push_str(&format!(
                    "2,{},{},{},{},{},{},{},{},{},{},{},{},3621,{} von 11\n",
                    id,
                    base * 1000 + 119,
                    base * 500 + 62,
                    base + 7,
                    base + 19,
                    base + 2,
                    0,
                    knr,
                    name,
                    first,
                    elected,
                    votes,
                    ids.len()
                ));
            }
        }
        let mut fs = FileSet::new();
        fs.insert(FILE_RESULTS.to_string(), data.into_bytes());
        fs
    }

    const SESAM_PROPORZ_HEADER: &str = "Anzahl Sitze,Wahlkreis-Nr,Stimmberechtigte,Wahlzettel,\
Leere Wahlzettel,Ungültige Wahlzettel,Leere Stimmen,Ungültige Stimmen,\
Liste-Nr,Liste-Bezeichnung,Liste-Anzahl Sitze,HLV-Nr,ULV-Nr,Listenstimmen,\
Kandidaten-Nr,Name,Vorname,Gewaehlt,Stimmen";

    fn sesam_proporz_file() -> FileSet {
        let mut data = format!("{}\n", SESAM_PROPORZ_HEADER);
        for (id, l1, l2, c1, c2) in [(1701, 520, 130, 340, 90), (1702, 410, 80, 260, 50)] {
            data.push_str(&format!(
                "2,{id},10000,5000,40,60,0,0,1,Liste 1,1,A,A.1,{l1},101,Muster,Anna,Gewaehlt,{c1}\n"
            ));
            data.push_str(&format!(
                "2,{id},10000,5000,40,60,0,0,2,Liste 2,0,A,,{l2},201,Beispiel,Hans,,{c2}\n"
            ));
        }
        let mut fs = FileSet::new();
        fs.insert(FILE_RESULTS.to_string(), data.into_bytes());
        fs
    }

    fn internal_files(csv: &str) -> FileSet {
        let mut fs = FileSet::new();
        fs.insert(FILE_RESULTS.to_string(), csv.as_bytes().to_vec());
        fs
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn assert_same_export(expected: &str, actual: &str) {
        if expected != actual {
            print_diff(expected, actual, "\n");
            panic!("canonical exports differ");
        }
    }

    #[test]
    fn sesam_majorz_round_trips_through_the_canonical_export() {
        init_logs();
        let principal = principal();
        let mut first = shell(ElectionType::Majorz);
        import(
            &mut first,
            &principal,
            ImportFormat::Sesam,
            &sesam_majorz_file(&[1701, 1702]),
            &ImportFlags::default(),
        )
        .unwrap();
        assert_eq!(aggregate::progress(&first), (2, 11));
        assert_eq!(first.absolute_majority(), Some(3621));
        let exported = export::export_csv(&first);

        let mut second = shell(ElectionType::Majorz);
        import(
            &mut second,
            &principal,
            ImportFormat::Internal,
            &internal_files(&exported),
            &ImportFlags::default(),
        )
        .unwrap();
        assert_same_export(&exported, &export::export_csv(&second));
    }

    #[test]
    fn sesam_proporz_round_trips_through_the_canonical_export() {
        init_logs();
        let principal = principal();
        let mut first = shell(ElectionType::Proporz);
        import(
            &mut first,
            &principal,
            ImportFormat::Sesam,
            &sesam_proporz_file(),
            &ImportFlags::default(),
        )
        .unwrap();
        assert_eq!(first.lists().len(), 2);
        assert_eq!(first.connections().len(), 1);
        let exported = export::export_csv(&first);

        let mut second = shell(ElectionType::Proporz);
        import(
            &mut second,
            &principal,
            ImportFormat::Internal,
            &internal_files(&exported),
            &ImportFlags::default(),
        )
        .unwrap();
        assert_eq!(second.connections().len(), 1);
        assert_eq!(second.connections()[0].subconnections().len(), 1);
        assert_same_export(&exported, &export::export_csv(&second));
    }

    #[test]
    fn reimporting_the_same_file_is_idempotent() {
        let principal = principal();
        let files = sesam_majorz_file(&[1701, 1702, 1703]);
        let mut election = shell(ElectionType::Majorz);
        import(
            &mut election,
            &principal,
            ImportFormat::Sesam,
            &files,
            &ImportFlags::default(),
        )
        .unwrap();
        let before = export::export_csv(&election);
        import(
            &mut election,
            &principal,
            ImportFormat::Sesam,
            &files,
            &ImportFlags::default(),
        )
        .unwrap();
        assert_same_export(&before, &export::export_csv(&election));
        assert_eq!(aggregate::progress(&election), (3, 11));
    }

    #[test]
    fn partial_then_complete_upload() {
        let principal = principal();
        let mut election = shell(ElectionType::Majorz);

        // A first, partial batch carries a candidate that later drops out.
        let mut partial = format!("{}\n", SESAM_MAJORZ_HEADER);
        partial.push_str("2,1701,14119,7462,77,196,122,0,9,Alt,Kurt,,500,3621,1 von 11\n");
        let mut partial_files = FileSet::new();
        partial_files.insert(FILE_RESULTS.to_string(), partial.into_bytes());
        import(
            &mut election,
            &principal,
            ImportFormat::Sesam,
            &partial_files,
            &ImportFlags::default(),
        )
        .unwrap();
        assert_eq!(aggregate::progress(&election), (1, 11));
        assert_eq!(election.common().status, ElectionStatus::Interim);
        assert!(election.common().candidate("9").is_some());

        let all: Vec<EntityId> = MUNICIPALITIES.iter().map(|(id, _)| *id).collect();
        import(
            &mut election,
            &principal,
            ImportFormat::Sesam,
            &sesam_majorz_file(&all),
            &ImportFlags { complete: true },
        )
        .unwrap();
        assert_eq!(aggregate::progress(&election), (11, 11));
        assert!(aggregate::completed(&election));
        assert_eq!(election.common().status, ElectionStatus::Final);
        // The dropped candidate and its votes are gone, not merged.
        assert!(election.common().candidate("9").is_none());
        assert!(election
            .common()
            .results
            .iter()
            .all(|r| r.candidate_votes("9") == 0));
    }

    #[test]
    fn a_rejected_import_leaves_the_model_untouched() {
        let principal = principal();
        let mut election = shell(ElectionType::Majorz);
        import(
            &mut election,
            &principal,
            ImportFormat::Sesam,
            &sesam_majorz_file(&[1701]),
            &ImportFlags::default(),
        )
        .unwrap();
        let before = election.clone();

        // Entity 9999 does not exist; the whole upload must be rejected.
        let mut bad = format!("{}\n", SESAM_MAJORZ_HEADER);
        bad.push_str("2,9999,100,50,0,0,0,0,1,Muster,Peter,,10,,1 von 11\n");
        let mut bad_files = FileSet::new();
        bad_files.insert(FILE_RESULTS.to_string(), bad.into_bytes());
        let errors = import(
            &mut election,
            &principal,
            ImportFormat::Sesam,
            &bad_files,
            &ImportFlags::default(),
        )
        .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::UnknownEntity { entity_id: 9999 });
        assert_eq!(election, before);
    }

    #[test]
    fn wabsti_subset_import_is_temporary() {
        let principal = principal();
        let mut election = shell(ElectionType::Majorz);
        let mut fs = FileSet::new();
        fs.insert(
            FILE_RESULTS.to_string(),
            b"BfsNrGemeinde,Stimmberechtigte,StmAbgegeben,StmLeer,StmUngueltig\n1711,20000,9000,50,80\n"
                .to_vec(),
        );
        fs.insert(
            FILE_CANDIDATES.to_string(),
            b"KNR,Nachname,Vorname\n1,Muster,Peter\n".to_vec(),
        );
        fs.insert(
            FILE_CANDIDATE_RESULTS.to_string(),
            b"BfsNrGemeinde,KNR,Stimmen\n1711,1,4100\n".to_vec(),
        );
        import(
            &mut election,
            &principal,
            ImportFormat::Wabsti,
            &fs,
            &ImportFlags::default(),
        )
        .unwrap();
        assert_eq!(aggregate::progress(&election), (1, 11));
        assert_eq!(election.common().status, ElectionStatus::Interim);
        let zug = election.common().result_for(1711).unwrap();
        assert!(zug.counted);
        assert_eq!(zug.candidate_votes("1"), 4100);
        // The other ten municipalities exist as uncounted placeholders.
        assert_eq!(election.common().results.len(), 11);
        assert!(!election.common().result_for(1701).unwrap().counted);
    }
}
