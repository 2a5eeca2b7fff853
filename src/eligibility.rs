//! Candidate eligibility by location containment
//!
//! Decides which candidates a voter or monitor sees for each office. National
//! candidates are always visible. A candidate bound to a unit is visible only
//! when the viewer has selected a unit at the same level and that unit lies
//! within the candidate's binding. Visibility therefore only grows as a
//! viewer narrows from county to subcounty to ward.

use crate::location::{LocationHierarchy, ViewerLocation};
use crate::reference::Roster;
use crate::types::{Candidate, CandidateId, Office, OfficeId, OfficeLevel, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Why a candidate can never appear on any ballot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    /// Bound to a location id missing from the hierarchy
    UnknownLocation(UnitId),
    /// Non-national candidate with no binding at all
    MissingBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub candidate_id: CandidateId,
    pub office_id: OfficeId,
    pub reason: ExclusionReason,
}

/// One office and the candidates visible for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleOffice {
    pub office: Office,
    pub candidates: Vec<Candidate>,
}

/// Result of resolving a ballot for a location
///
/// Offices are ordered national first, then county, constituency and ward;
/// candidates keep roster order. Offices with no visible candidate are left
/// out, so `offices` is exactly the set a voter must fill in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleBallot {
    pub viewer: ViewerLocation,
    pub offices: Vec<EligibleOffice>,
    pub excluded: Vec<Exclusion>,
}

impl EligibleBallot {
    pub fn office_ids(&self) -> Vec<OfficeId> {
        self.offices.iter().map(|entry| entry.office.id).collect()
    }

    pub fn candidates_for(&self, office_id: OfficeId) -> Option<&[Candidate]> {
        self.offices
            .iter()
            .find(|entry| entry.office.id == office_id)
            .map(|entry| entry.candidates.as_slice())
    }

    pub fn is_eligible(&self, office_id: OfficeId, candidate_id: CandidateId) -> bool {
        self.candidates_for(office_id)
            .is_some_and(|candidates| candidates.iter().any(|c| c.id == candidate_id))
    }

    /// Every visible candidate id across offices, in ballot order
    pub fn candidate_ids(&self) -> Vec<CandidateId> {
        self.offices
            .iter()
            .flat_map(|entry| entry.candidates.iter().map(|c| c.id))
            .collect()
    }

    /// Office to ordered candidate ids
    pub fn to_map(&self) -> BTreeMap<OfficeId, Vec<CandidateId>> {
        self.offices
            .iter()
            .map(|entry| {
                (
                    entry.office.id,
                    entry.candidates.iter().map(|c| c.id).collect(),
                )
            })
            .collect()
    }
}

/// Filters the roster for a viewer location
#[derive(Debug, Clone)]
pub struct EligibilityResolver {
    hierarchy: Arc<LocationHierarchy>,
    roster: Arc<Roster>,
    /// Offices in ballot order with their roster-ordered candidates
    layout: Vec<(Office, Vec<Candidate>)>,
    excluded: Vec<Exclusion>,
}

impl EligibilityResolver {
    /// Precompute the ballot layout and report unusable bindings
    pub fn new(hierarchy: Arc<LocationHierarchy>, roster: Arc<Roster>) -> Self {
        let mut offices: Vec<Office> = roster.offices().to_vec();
        // stable: ties keep roster order
        offices.sort_by_key(|office| office.level);

        let mut by_office: HashMap<OfficeId, Vec<Candidate>> = HashMap::new();
        let mut excluded = Vec::new();

        for candidate in roster.candidates() {
            let Ok(office) = roster.office(candidate.office_id) else {
                continue;
            };

            if office.level != OfficeLevel::National {
                let reason = match candidate.bound_location_id {
                    None => Some(ExclusionReason::MissingBinding),
                    Some(bound) if !hierarchy.exists(bound) => {
                        Some(ExclusionReason::UnknownLocation(bound))
                    }
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    tracing::warn!(
                        "⚠️  Candidate {} for office {} excluded from every ballot: {:?}",
                        candidate.id,
                        office.id,
                        reason
                    );
                    excluded.push(Exclusion {
                        candidate_id: candidate.id,
                        office_id: office.id,
                        reason,
                    });
                    continue;
                }
            }

            by_office
                .entry(candidate.office_id)
                .or_default()
                .push(candidate.clone());
        }

        let layout = offices
            .into_iter()
            .map(|office| {
                let candidates = by_office.remove(&office.id).unwrap_or_default();
                (office, candidates)
            })
            .collect();

        Self {
            hierarchy,
            roster,
            layout,
            excluded,
        }
    }

    pub fn hierarchy(&self) -> &Arc<LocationHierarchy> {
        &self.hierarchy
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// Candidates that can never be shown, with the reason
    pub fn exclusions(&self) -> &[Exclusion] {
        &self.excluded
    }

    /// Candidates visible at `viewer`, grouped by office
    pub fn visible_candidates(&self, viewer: &ViewerLocation) -> EligibleBallot {
        let offices = self
            .layout
            .iter()
            .filter_map(|(office, candidates)| {
                let visible: Vec<Candidate> = candidates
                    .iter()
                    .filter(|candidate| self.is_visible(office.level, candidate, viewer))
                    .cloned()
                    .collect();

                (!visible.is_empty()).then(|| EligibleOffice {
                    office: office.clone(),
                    candidates: visible,
                })
            })
            .collect();

        EligibleBallot {
            viewer: *viewer,
            offices,
            excluded: self.excluded.clone(),
        }
    }

    fn is_visible(&self, level: OfficeLevel, candidate: &Candidate, viewer: &ViewerLocation) -> bool {
        if level == OfficeLevel::National {
            return true;
        }
        let (Some(bound), Some(viewer_unit)) = (candidate.bound_location_id, viewer.level_id(level))
        else {
            return false;
        };
        self.hierarchy.contains(bound, viewer_unit).unwrap_or(false)
    }
}
