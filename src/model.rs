//! The canonical representation of an election.
//!
//! Every import format is reconciled into these structures, and every
//! consumer (exports, aggregation) reads only from them. The model holds no
//! I/O: mutation happens in one batch applied by the import orchestrator.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};

/// A political subdivision reporting its own ballot counts.
pub type EntityId = u32;

/// Entity id conventionally reserved for expatriate voters.
pub const EXPATS_ENTITY_ID: EntityId = 0;

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum ElectionType {
    Majorz,
    Proporz,
}

impl ElectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionType::Majorz => "majorz",
            ElectionType::Proporz => "proporz",
        }
    }

    pub fn parse(s: &str) -> Option<ElectionType> {
        match s {
            "majorz" => Some(ElectionType::Majorz),
            "proporz" => Some(ElectionType::Proporz),
            _ => None,
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum Domain {
    Federation,
    Canton,
    District,
    Region,
    Municipality,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Federation => "federation",
            Domain::Canton => "canton",
            Domain::District => "district",
            Domain::Region => "region",
            Domain::Municipality => "municipality",
        }
    }
}

/// Reporting status of an election as a whole.
///
/// `Unset` is the state before any import; the orchestrator sets `Interim`
/// or `Final` depending on the completeness flag of the upload.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum ElectionStatus {
    Unset,
    Unknown,
    Interim,
    Final,
}

impl ElectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionStatus::Unset => "",
            ElectionStatus::Unknown => "unknown",
            ElectionStatus::Interim => "interim",
            ElectionStatus::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<ElectionStatus> {
        match s {
            "" => Some(ElectionStatus::Unset),
            "unknown" => Some(ElectionStatus::Unknown),
            "interim" => Some(ElectionStatus::Interim),
            "final" => Some(ElectionStatus::Final),
            _ => None,
        }
    }
}

/// A title in one or more locales. The first inserted locale acts as the
/// fallback when a requested locale is missing.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct Title {
    translations: BTreeMap<String, String>,
    default_locale: Option<String>,
}

impl Title {
    pub fn plain(text: &str) -> Title {
        let mut t = Title::default();
        t.set("de_CH", text);
        t
    }

    pub fn set(&mut self, locale: &str, text: &str) {
        if self.default_locale.is_none() {
            self.default_locale = Some(locale.to_string());
        }
        self.translations.insert(locale.to_string(), text.to_string());
    }

    pub fn get(&self, locale: &str) -> &str {
        self.translations
            .get(locale)
            .or_else(|| {
                self.default_locale
                    .as_ref()
                    .and_then(|l| self.translations.get(l))
            })
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn default_text(&self) -> &str {
        self.default_locale
            .as_ref()
            .and_then(|l| self.translations.get(l))
            .map(|s| s.as_str())
            .unwrap_or("")
    }
}

/// Turns a title into a stable slug-style identifier.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = true;
    // Lowercase first so 'É' and 'é' fold to the same letter.
    for c in text.chars().flat_map(char::to_lowercase) {
        let c = match c {
            'ä' | 'à' | 'â' => 'a',
            'ö' | 'ô' => 'o',
            'ü' | 'ù' | 'û' => 'u',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' => 'i',
            'ç' => 'c',
            _ => c,
        };
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Picks the first slug derived from the title that is not yet taken,
/// disambiguating with a numeric suffix.
pub fn unused_slug(title: &str, taken: &HashSet<String>) -> String {
    let base = slugify(title);
    if !taken.contains(&base) {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Fields shared by both election variants.
#[derive(PartialEq, Debug, Clone)]
pub struct ElectionCommon {
    pub id: String,
    pub title: Title,
    pub date: NaiveDate,
    pub domain: Domain,
    pub domain_segment: Option<String>,
    pub domain_supersegment: Option<String>,
    pub number_of_mandates: u32,
    pub status: ElectionStatus,
    pub tacit: bool,
    pub last_result_change: Option<NaiveDateTime>,
    pub candidates: Vec<Candidate>,
    pub results: Vec<ElectionResult>,
}

impl ElectionCommon {
    fn new(id: String, title: Title, date: NaiveDate, domain: Domain, mandates: u32) -> Self {
        ElectionCommon {
            id,
            title,
            date,
            domain,
            domain_segment: None,
            domain_supersegment: None,
            number_of_mandates: mandates,
            status: ElectionStatus::Unset,
            tacit: false,
            last_result_change: None,
            candidates: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn result_for(&self, entity_id: EntityId) -> Option<&ElectionResult> {
        self.results.iter().find(|r| r.entity_id == entity_id)
    }

    pub fn candidate(&self, candidate_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.candidate_id == candidate_id)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct MajorzElection {
    pub common: ElectionCommon,
    pub absolute_majority: Option<u32>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct ProporzElection {
    pub common: ElectionCommon,
    pub lists: Vec<List>,
    pub connections: Vec<ListConnection>,
    pub party_results: Vec<PartyResult>,
    pub party_panachage: Vec<PanachageResult>,
}

/// An election is either majoritarian or proportional. Lists, list
/// connections and party results can only exist on the proporz variant.
#[derive(PartialEq, Debug, Clone)]
pub enum Election {
    Majorz(MajorzElection),
    Proporz(ProporzElection),
}

impl Election {
    /// Creates an empty election shell. The id is derived from the title and
    /// disambiguated against the ids already taken in the caller's registry.
    pub fn new(
        election_type: ElectionType,
        title: Title,
        date: NaiveDate,
        domain: Domain,
        number_of_mandates: u32,
        taken_ids: &HashSet<String>,
    ) -> Election {
        let id = unused_slug(title.default_text(), taken_ids);
        let common = ElectionCommon::new(id, title, date, domain, number_of_mandates);
        match election_type {
            ElectionType::Majorz => Election::Majorz(MajorzElection {
                common,
                absolute_majority: None,
            }),
            ElectionType::Proporz => Election::Proporz(ProporzElection {
                common,
                lists: Vec::new(),
                connections: Vec::new(),
                party_results: Vec::new(),
                party_panachage: Vec::new(),
            }),
        }
    }

    pub fn election_type(&self) -> ElectionType {
        match self {
            Election::Majorz(_) => ElectionType::Majorz,
            Election::Proporz(_) => ElectionType::Proporz,
        }
    }

    pub fn common(&self) -> &ElectionCommon {
        match self {
            Election::Majorz(e) => &e.common,
            Election::Proporz(e) => &e.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut ElectionCommon {
        match self {
            Election::Majorz(e) => &mut e.common,
            Election::Proporz(e) => &mut e.common,
        }
    }

    pub fn absolute_majority(&self) -> Option<u32> {
        match self {
            Election::Majorz(e) => e.absolute_majority,
            Election::Proporz(_) => None,
        }
    }

    pub fn lists(&self) -> &[List] {
        match self {
            Election::Majorz(_) => &[],
            Election::Proporz(e) => &e.lists,
        }
    }

    pub fn connections(&self) -> &[ListConnection] {
        match self {
            Election::Majorz(_) => &[],
            Election::Proporz(e) => &e.connections,
        }
    }

    pub fn party_results(&self) -> &[PartyResult] {
        match self {
            Election::Majorz(_) => &[],
            Election::Proporz(e) => &e.party_results,
        }
    }

    pub fn party_panachage(&self) -> &[PanachageResult] {
        match self {
            Election::Majorz(_) => &[],
            Election::Proporz(e) => &e.party_panachage,
        }
    }

    pub fn list(&self, list_id: &str) -> Option<&List> {
        self.lists().iter().find(|l| l.list_id == list_id)
    }

    /// Adds a result, enforcing entity-id uniqueness within the election.
    pub fn add_result(&mut self, result: ElectionResult) -> Result<(), ModelError> {
        let common = self.common_mut();
        if common.result_for(result.entity_id).is_some() {
            return Err(ModelError::DuplicateEntity {
                entity_id: result.entity_id,
            });
        }
        common.results.push(result);
        Ok(())
    }

    /// Deletes every owned child and resets the election to its pre-import
    /// state, in one pass.
    pub fn clear_results(&mut self) {
        match self {
            Election::Majorz(e) => {
                e.common.candidates.clear();
                e.common.results.clear();
                e.common.status = ElectionStatus::Unset;
                e.common.last_result_change = None;
                e.absolute_majority = None;
            }
            Election::Proporz(e) => {
                e.common.candidates.clear();
                e.common.results.clear();
                e.common.status = ElectionStatus::Unset;
                e.common.last_result_change = None;
                e.lists.clear();
                e.connections.clear();
                e.party_results.clear();
                e.party_panachage.clear();
            }
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ModelError {
    DuplicateEntity { entity_id: EntityId },
}

/// A candidate standing in one election, optionally on one list.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Candidate {
    pub candidate_id: String,
    pub family_name: String,
    pub first_name: String,
    pub elected: bool,
    pub party: Option<String>,
    pub list_id: Option<String>,
}

/// Ballot counts of one entity, together with the per-candidate and (for
/// proporz) per-list results it owns.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ElectionResult {
    pub entity_id: EntityId,
    pub name: String,
    pub district: Option<String>,
    pub counted: bool,
    pub eligible_voters: u32,
    pub received_ballots: u32,
    pub blank_ballots: u32,
    pub invalid_ballots: u32,
    pub blank_votes: u32,
    pub invalid_votes: u32,
    pub candidate_results: Vec<CandidateResult>,
    pub list_results: Vec<ListResult>,
}

impl ElectionResult {
    pub fn unaccounted_ballots(&self) -> u32 {
        self.blank_ballots + self.invalid_ballots
    }

    pub fn accounted_ballots(&self) -> u32 {
        self.received_ballots
            .saturating_sub(self.unaccounted_ballots())
    }

    /// The votes that count towards the result. Majorz derives them from the
    /// accounted ballots, proporz from the list votes.
    pub fn accounted_votes(&self, election_type: ElectionType, mandates: u32) -> u64 {
        match election_type {
            ElectionType::Majorz => (self.accounted_ballots() as u64 * mandates as u64)
                .saturating_sub(self.blank_votes as u64)
                .saturating_sub(self.invalid_votes as u64),
            ElectionType::Proporz => {
                self.list_results.iter().map(|lr| lr.votes as u64).sum()
            }
        }
    }

    pub fn turnout(&self) -> f64 {
        if self.eligible_voters == 0 {
            0.0
        } else {
            self.received_ballots as f64 / self.eligible_voters as f64 * 100.0
        }
    }

    pub fn candidate_votes(&self, candidate_id: &str) -> u32 {
        self.candidate_results
            .iter()
            .filter(|cr| cr.candidate_id == candidate_id)
            .map(|cr| cr.votes)
            .sum()
    }

    pub fn list_votes(&self, list_id: &str) -> u32 {
        self.list_results
            .iter()
            .filter(|lr| lr.list_id == list_id)
            .map(|lr| lr.votes)
            .sum()
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CandidateResult {
    pub candidate_id: String,
    pub votes: u32,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ListResult {
    pub list_id: String,
    pub votes: u32,
}

/// A candidate list in a proporz election.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct List {
    pub list_id: String,
    pub name: String,
    pub number_of_mandates: u32,
    /// The immediate connection this list belongs to, which may itself be a
    /// subconnection.
    pub connection_id: Option<String>,
    /// Panachage rows whose target is this list.
    pub panachage: Vec<PanachageResult>,
}

/// A node of the (two-level, in practice) list connection tree.
///
/// Root connections are attached directly to the election; subconnections
/// carry the id of their parent instead. The asymmetry mirrors the wire
/// formats and is kept explicit here rather than hidden in a nullable field.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ListConnection {
    Root {
        connection_id: String,
        subconnections: Vec<ListConnection>,
    },
    Sub {
        connection_id: String,
        parent_id: String,
        subconnections: Vec<ListConnection>,
    },
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ConnectionError {
    UnknownParent { connection_id: String, parent_id: String },
    Cycle { connection_id: String },
    Duplicate { connection_id: String },
}

impl ListConnection {
    pub fn connection_id(&self) -> &str {
        match self {
            ListConnection::Root { connection_id, .. } => connection_id,
            ListConnection::Sub { connection_id, .. } => connection_id,
        }
    }

    pub fn subconnections(&self) -> &[ListConnection] {
        match self {
            ListConnection::Root { subconnections, .. } => subconnections,
            ListConnection::Sub { subconnections, .. } => subconnections,
        }
    }

    /// Resolves flat `(id, parent_id)` wire pairs into the owned tree.
    ///
    /// Rejects duplicate ids, parents that do not exist and parent chains
    /// that loop back on themselves.
    pub fn build_forest(
        pairs: &[(String, Option<String>)],
    ) -> Result<Vec<ListConnection>, ConnectionError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (id, _) in pairs {
            if !seen.insert(id.as_str()) {
                return Err(ConnectionError::Duplicate {
                    connection_id: id.clone(),
                });
            }
        }

        let parent_of: HashMap<&str, Option<&str>> = pairs
            .iter()
            .map(|(id, p)| (id.as_str(), p.as_deref()))
            .collect();

        // Walk each parent chain; a chain longer than the number of nodes
        // must contain a loop.
        for (id, _) in pairs {
            let mut cursor: &str = id.as_str();
            let mut steps = 0usize;
            while let Some(Some(parent)) = parent_of.get(cursor) {
                if !parent_of.contains_key(parent) {
                    return Err(ConnectionError::UnknownParent {
                        connection_id: cursor.to_string(),
                        parent_id: parent.to_string(),
                    });
                }
                cursor = parent;
                steps += 1;
                if steps > pairs.len() {
                    return Err(ConnectionError::Cycle {
                        connection_id: id.clone(),
                    });
                }
            }
        }

        fn children_of(
            parent: &str,
            pairs: &[(String, Option<String>)],
        ) -> Vec<ListConnection> {
            pairs
                .iter()
                .filter(|(_, p)| p.as_deref() == Some(parent))
                .map(|(id, p)| ListConnection::Sub {
                    connection_id: id.clone(),
                    parent_id: p.clone().unwrap_or_default(),
                    subconnections: children_of(id, pairs),
                })
                .collect()
        }

        let forest = pairs
            .iter()
            .filter(|(_, p)| p.is_none())
            .map(|(id, _)| ListConnection::Root {
                connection_id: id.clone(),
                subconnections: children_of(id, pairs),
            })
            .collect();
        Ok(forest)
    }
}

/// Aggregated result of one party in one year, used for historical trends.
#[derive(PartialEq, Debug, Clone)]
pub struct PartyResult {
    pub year: i32,
    pub party_id: String,
    pub name: String,
    pub color: Option<String>,
    pub votes: u64,
    pub total_votes: u64,
    pub number_of_mandates: u32,
    pub voters_count: Option<f64>,
    pub voters_count_percentage: Option<f64>,
}

/// Where panachage votes came from: another list (or party), or the blank
/// list.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Hash)]
pub enum PanachageSource {
    List(String),
    Blank,
}

/// Votes transferred from `source` onto `target`. Only the target side owns
/// the row, so deleting a list cascades one-directionally.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct PanachageResult {
    pub source: PanachageSource,
    pub target: String,
    pub votes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, 10, 18).unwrap()
    }

    #[test]
    fn slugs_are_stable_and_disambiguated() {
        assert_eq!(slugify("Regierungsratswahl 2015"), "regierungsratswahl-2015");
        assert_eq!(slugify("Élection du Conseil d'État"), "election-du-conseil-d-etat");
        // Uppercase accents fold to the same letters as their lowercase forms.
        assert_eq!(slugify("ÜBERPRÜFUNG"), "uberprufung");
        assert_eq!(slugify("Ägerital"), "agerital");

        let mut taken = HashSet::new();
        assert_eq!(unused_slug("Majorz Wahl", &taken), "majorz-wahl");
        taken.insert("majorz-wahl".to_string());
        assert_eq!(unused_slug("Majorz Wahl", &taken), "majorz-wahl-1");
        taken.insert("majorz-wahl-1".to_string());
        assert_eq!(unused_slug("Majorz Wahl", &taken), "majorz-wahl-2");
    }

    #[test]
    fn derived_ballot_figures() {
        let r = ElectionResult {
            entity_id: 1701,
            name: "Baar".to_string(),
            district: None,
            counted: true,
            eligible_voters: 14119,
            received_ballots: 7462,
            blank_ballots: 77,
            invalid_ballots: 196,
            blank_votes: 122,
            invalid_votes: 0,
            candidate_results: vec![],
            list_results: vec![],
        };
        assert_eq!(r.unaccounted_ballots(), 273);
        assert_eq!(r.accounted_ballots(), 7189);
        assert_eq!(r.accounted_votes(ElectionType::Majorz, 2), 7189 * 2 - 122);
        assert!((r.turnout() - 52.851).abs() < 0.01);
    }

    #[test]
    fn accounted_votes_proporz_uses_list_votes() {
        let r = ElectionResult {
            entity_id: 1,
            name: "Entity".to_string(),
            district: None,
            counted: true,
            eligible_voters: 100,
            received_ballots: 50,
            blank_ballots: 0,
            invalid_ballots: 0,
            blank_votes: 0,
            invalid_votes: 0,
            candidate_results: vec![],
            list_results: vec![
                ListResult { list_id: "1".to_string(), votes: 30 },
                ListResult { list_id: "2".to_string(), votes: 12 },
            ],
        };
        assert_eq!(r.accounted_votes(ElectionType::Proporz, 5), 42);
    }

    #[test]
    fn duplicate_entity_rejected() {
        let mut e = Election::new(
            ElectionType::Majorz,
            Title::plain("Wahl"),
            date(2015),
            Domain::Canton,
            2,
            &HashSet::new(),
        );
        let r = ElectionResult {
            entity_id: 1701,
            name: "Baar".to_string(),
            district: None,
            counted: false,
            eligible_voters: 0,
            received_ballots: 0,
            blank_ballots: 0,
            invalid_ballots: 0,
            blank_votes: 0,
            invalid_votes: 0,
            candidate_results: vec![],
            list_results: vec![],
        };
        assert!(e.add_result(r.clone()).is_ok());
        assert_eq!(
            e.add_result(r),
            Err(ModelError::DuplicateEntity { entity_id: 1701 })
        );
    }

    #[test]
    fn connection_forest_resolution() {
        let pairs = vec![
            ("A".to_string(), None),
            ("B".to_string(), None),
            ("B.1".to_string(), Some("B".to_string())),
        ];
        let forest = ListConnection::build_forest(&pairs).unwrap();
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[1].connection_id(), "B");
        assert_eq!(forest[1].subconnections().len(), 1);
        assert_eq!(forest[1].subconnections()[0].connection_id(), "B.1");
    }

    #[test]
    fn connection_cycle_rejected() {
        let pairs = vec![
            ("A".to_string(), Some("B".to_string())),
            ("B".to_string(), Some("A".to_string())),
        ];
        assert_eq!(
            ListConnection::build_forest(&pairs),
            Err(ConnectionError::Cycle {
                connection_id: "A".to_string()
            })
        );
    }

    #[test]
    fn connection_unknown_parent_rejected() {
        let pairs = vec![("A".to_string(), Some("Z".to_string()))];
        assert!(matches!(
            ListConnection::build_forest(&pairs),
            Err(ConnectionError::UnknownParent { .. })
        ));
    }

    #[test]
    fn clear_results_wipes_proporz_children() {
        let mut e = Election::new(
            ElectionType::Proporz,
            Title::plain("Nationalratswahl"),
            date(2015),
            Domain::Federation,
            3,
            &HashSet::new(),
        );
        if let Election::Proporz(p) = &mut e {
            p.common.status = ElectionStatus::Final;
            p.common.candidates.push(Candidate {
                candidate_id: "101".to_string(),
                family_name: "Muster".to_string(),
                first_name: "Anna".to_string(),
                elected: true,
                party: None,
                list_id: Some("1".to_string()),
            });
            p.lists.push(List {
                list_id: "1".to_string(),
                name: "Liste 1".to_string(),
                number_of_mandates: 1,
                connection_id: None,
                panachage: vec![],
            });
            p.connections.push(ListConnection::Root {
                connection_id: "A".to_string(),
                subconnections: vec![],
            });
            p.party_results.push(PartyResult {
                year: 2015,
                party_id: "0".to_string(),
                name: "Partei".to_string(),
                color: None,
                votes: 10,
                total_votes: 100,
                number_of_mandates: 1,
                voters_count: None,
                voters_count_percentage: None,
            });
        }
        e.clear_results();
        assert!(e.common().candidates.is_empty());
        assert!(e.common().results.is_empty());
        assert!(e.lists().is_empty());
        assert!(e.connections().is_empty());
        assert!(e.party_results().is_empty());
        assert_eq!(e.common().status, ElectionStatus::Unset);
        assert_eq!(e.absolute_majority(), None);
    }
}
