//! Derived quantities over the canonical model.
//!
//! Everything here is computed on read from the election state. Nothing is
//! cached at commit time, so the figures are fresh by construction. All
//! functions are total: missing optional data yields zero or empty values,
//! never an error.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use crate::model::*;

/// Counted entities vs. all entities with a result.
pub fn progress(election: &Election) -> (usize, usize) {
    let results = &election.common().results;
    let counted = results.iter().filter(|r| r.counted).count();
    (counted, results.len())
}

/// Whether the election can be presented as complete.
///
/// A `Final` status overrides everything, `Interim` forces incompleteness,
/// and otherwise every entity must have been counted.
pub fn completed(election: &Election) -> bool {
    match election.common().status {
        ElectionStatus::Final => true,
        ElectionStatus::Interim => false,
        ElectionStatus::Unset | ElectionStatus::Unknown => {
            let (counted, total) = progress(election);
            total > 0 && counted == total
        }
    }
}

pub fn total_eligible_voters(election: &Election) -> u64 {
    election
        .common()
        .results
        .iter()
        .map(|r| r.eligible_voters as u64)
        .sum()
}

pub fn total_received_ballots(election: &Election) -> u64 {
    election
        .common()
        .results
        .iter()
        .map(|r| r.received_ballots as u64)
        .sum()
}

pub fn total_accounted_ballots(election: &Election) -> u64 {
    election
        .common()
        .results
        .iter()
        .map(|r| r.accounted_ballots() as u64)
        .sum()
}

pub fn total_accounted_votes(election: &Election) -> u64 {
    let t = election.election_type();
    let mandates = election.common().number_of_mandates;
    election
        .common()
        .results
        .iter()
        .map(|r| r.accounted_votes(t, mandates))
        .sum()
}

/// Aggregate turnout in percent, 0.0 when no eligible voters are known.
pub fn turnout(election: &Election) -> f64 {
    let eligible = total_eligible_voters(election);
    if eligible == 0 {
        0.0
    } else {
        total_received_ballots(election) as f64 / eligible as f64 * 100.0
    }
}

/// What a percentage breakdown is computed for.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Target<'a> {
    Candidate(&'a str),
    List(&'a str),
}

#[derive(PartialEq, Debug, Clone)]
pub struct EntityShare {
    pub counted: bool,
    pub percentage: f64,
}

/// The share of votes per entity for one list or candidate.
///
/// Every entity that has a result for the election appears in the output,
/// even when the target got no votes there; in that case the entity's own
/// counted flag is carried over so a consumer can tell "counted, zero votes"
/// from "not yet counted".
pub fn percentage_by_entity(
    election: &Election,
    target: Target,
) -> BTreeMap<EntityId, EntityShare> {
    let mandates = election.common().number_of_mandates;
    let mut out = BTreeMap::new();
    for r in election.common().results.iter() {
        let (votes, total) = share_of(r, target, election.election_type(), mandates);
        let percentage = if total == 0 {
            0.0
        } else {
            votes as f64 / total as f64 * 100.0
        };
        out.insert(
            r.entity_id,
            EntityShare {
                counted: r.counted,
                percentage,
            },
        );
    }
    out
}

#[derive(PartialEq, Debug, Clone)]
pub struct DistrictShare {
    pub counted: bool,
    /// The entity ids backing this district. Consumers caching per-district
    /// totals must compare this set and recompute when it changed.
    pub entities: Vec<EntityId>,
    pub votes: u64,
    pub total: u64,
    pub percentage: f64,
}

/// Same fill-forward policy as [`percentage_by_entity`], accumulated at
/// district granularity. Entities without a district fall back to their own
/// name, so municipality-level domains degrade to one district per entity.
pub fn percentage_by_district(
    election: &Election,
    target: Target,
) -> BTreeMap<String, DistrictShare> {
    let mandates = election.common().number_of_mandates;
    let mut out: BTreeMap<String, DistrictShare> = BTreeMap::new();
    for r in election.common().results.iter() {
        let district = r.district.clone().unwrap_or_else(|| r.name.clone());
        let (votes, total) = share_of(r, target, election.election_type(), mandates);
        let entry = out.entry(district).or_insert(DistrictShare {
            counted: true,
            entities: Vec::new(),
            votes: 0,
            total: 0,
            percentage: 0.0,
        });
        entry.counted = entry.counted && r.counted;
        entry.entities.push(r.entity_id);
        entry.votes += votes;
        entry.total += total;
    }
    for share in out.values_mut() {
        share.entities.sort_unstable();
        share.percentage = if share.total == 0 {
            0.0
        } else {
            share.votes as f64 / share.total as f64 * 100.0
        };
    }
    out
}

// Votes for the target within one entity, with the denominator that applies
// to the target kind.
fn share_of(
    result: &ElectionResult,
    target: Target,
    election_type: ElectionType,
    mandates: u32,
) -> (u64, u64) {
    match target {
        Target::Candidate(id) => (
            result.candidate_votes(id) as u64,
            match election_type {
                ElectionType::Majorz => result.accounted_ballots() as u64,
                ElectionType::Proporz => result.accounted_votes(election_type, mandates),
            },
        ),
        Target::List(id) => (
            result.list_votes(id) as u64,
            result.accounted_votes(ElectionType::Proporz, mandates),
        ),
    }
}

/// Election-wide votes of one list, summed over all entities.
pub fn list_votes_total(election: &Election, list_id: &str) -> u64 {
    election
        .common()
        .results
        .iter()
        .map(|r| r.list_votes(list_id) as u64)
        .sum()
}

/// Election-wide votes of one candidate, summed over all entities.
pub fn candidate_votes_total(election: &Election, candidate_id: &str) -> u64 {
    election
        .common()
        .results
        .iter()
        .map(|r| r.candidate_votes(candidate_id) as u64)
        .sum()
}

/// Recursive vote total of a connection: the votes of its own lists plus the
/// totals of its subconnections, post-order.
pub fn connection_votes(election: &Election, connection: &ListConnection) -> u64 {
    let mut visited = HashSet::new();
    connection_votes_inner(election, connection, &mut visited)
}

fn connection_votes_inner<'a>(
    election: &Election,
    connection: &'a ListConnection,
    visited: &mut HashSet<&'a str>,
) -> u64 {
    // Import rejects cyclic parentage, but never loop even on a broken tree.
    if !visited.insert(connection.connection_id()) {
        debug!(
            "connection_votes: already visited {:?}, skipping",
            connection.connection_id()
        );
        return 0;
    }
    let own: u64 = election
        .lists()
        .iter()
        .filter(|l| l.connection_id.as_deref() == Some(connection.connection_id()))
        .map(|l| list_votes_total(election, &l.list_id))
        .sum();
    let children: u64 = connection
        .subconnections()
        .iter()
        .map(|c| connection_votes_inner(election, c, visited))
        .sum();
    own + children
}

/// Recursive mandate total of a connection, analogous to
/// [`connection_votes`].
pub fn connection_mandates(election: &Election, connection: &ListConnection) -> u64 {
    let mut visited = HashSet::new();
    connection_mandates_inner(election, connection, &mut visited)
}

fn connection_mandates_inner<'a>(
    election: &Election,
    connection: &'a ListConnection,
    visited: &mut HashSet<&'a str>,
) -> u64 {
    if !visited.insert(connection.connection_id()) {
        return 0;
    }
    let own: u64 = election
        .lists()
        .iter()
        .filter(|l| l.connection_id.as_deref() == Some(connection.connection_id()))
        .map(|l| l.number_of_mandates as u64)
        .sum();
    let children: u64 = connection
        .subconnections()
        .iter()
        .map(|c| connection_mandates_inner(election, c, visited))
        .sum();
    own + children
}

/// The elected candidates, ordered by family name then first name.
pub fn elected_candidates(election: &Election) -> Vec<&Candidate> {
    let mut elected: Vec<&Candidate> = election
        .common()
        .candidates
        .iter()
        .filter(|c| c.elected)
        .collect();
    elected.sort_by(|a, b| {
        (a.family_name.as_str(), a.first_name.as_str())
            .cmp(&(b.family_name.as_str(), b.first_name.as_str()))
    });
    elected
}

/// Candidates with their election-wide vote totals, strongest first.
pub fn candidate_totals(election: &Election) -> Vec<(&Candidate, u64)> {
    let mut totals: Vec<(&Candidate, u64)> = election
        .common()
        .candidates
        .iter()
        .map(|c| (c, candidate_votes_total(election, &c.candidate_id)))
        .collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1));
    totals
}

/// Lists with their election-wide vote totals, strongest first.
pub fn list_totals(election: &Election) -> Vec<(&List, u64)> {
    let mut totals: Vec<(&List, u64)> = election
        .lists()
        .iter()
        .map(|l| (l, list_votes_total(election, &l.list_id)))
        .collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1));
    totals
}

/// Whether any list-level panachage row with actual votes exists.
pub fn has_list_panachage(election: &Election) -> bool {
    election
        .lists()
        .iter()
        .flat_map(|l| l.panachage.iter())
        .any(|p| p.votes > 0)
}

/// Whether any party-level panachage row with actual votes exists.
pub fn has_party_panachage(election: &Election) -> bool {
    election.party_panachage().iter().any(|p| p.votes > 0)
}
