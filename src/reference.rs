//! Reference data: the administrative tree, offices, candidates and the
//! authoritative voter roll
//!
//! The core only ever reads this data. It arrives through a
//! [`ReferenceSource`], usually a JSON document, and is validated once into
//! a [`ReferenceData`] value shared by every component.

use crate::location::{LocationHierarchy, ViewerLocation};
use crate::types::{AdministrativeUnit, Candidate, CandidateId, Office, OfficeId, UnitId};
use crate::{Error, Result, reference_error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Registered voter count for one unit of the roll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredVoters {
    pub location_id: UnitId,
    pub count: u64,
}

/// Raw reference data as supplied by the configuration collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceCatalog {
    pub units: Vec<AdministrativeUnit>,
    pub offices: Vec<Office>,
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub registered_voters: Vec<RegisteredVoters>,
}

/// Read interface of the reference-data collaborator
#[async_trait::async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn load(&self) -> Result<ReferenceCatalog>;
}

/// Reads the catalog from a JSON file
pub struct JsonReferenceSource {
    path: PathBuf,
}

impl JsonReferenceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl ReferenceSource for JsonReferenceSource {
    async fn load(&self) -> Result<ReferenceCatalog> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let catalog: ReferenceCatalog = serde_json::from_str(&raw)?;
        tracing::debug!("Reference catalog read from {}", self.path.display());
        Ok(catalog)
    }
}

/// Serves an in-memory catalog
pub struct StaticReferenceSource {
    catalog: ReferenceCatalog,
}

impl StaticReferenceSource {
    pub fn new(catalog: ReferenceCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait::async_trait]
impl ReferenceSource for StaticReferenceSource {
    async fn load(&self) -> Result<ReferenceCatalog> {
        Ok(self.catalog.clone())
    }
}

/// Offices and candidates in roster order
///
/// Candidate order is insertion order and is what the ballot shows within an
/// office.
#[derive(Debug, Clone)]
pub struct Roster {
    offices: Vec<Office>,
    office_index: HashMap<OfficeId, usize>,
    candidates: Vec<Candidate>,
    candidate_index: HashMap<CandidateId, usize>,
}

impl Roster {
    pub fn new(offices: Vec<Office>, candidates: Vec<Candidate>) -> Result<Self> {
        let mut office_index = HashMap::with_capacity(offices.len());
        for (position, office) in offices.iter().enumerate() {
            if office_index.insert(office.id, position).is_some() {
                return Err(reference_error!("duplicate office id {}", office.id));
            }
        }

        let mut candidate_index = HashMap::with_capacity(candidates.len());
        for (position, candidate) in candidates.iter().enumerate() {
            if candidate_index.insert(candidate.id, position).is_some() {
                return Err(reference_error!("duplicate candidate id {}", candidate.id));
            }
            let office = office_index
                .get(&candidate.office_id)
                .map(|&i| &offices[i])
                .ok_or_else(|| {
                    reference_error!(
                        "candidate {} stands for unknown office {}",
                        candidate.id,
                        candidate.office_id
                    )
                })?;
            if let Some(level) = candidate.bound_location_level {
                if level != office.level {
                    return Err(reference_error!(
                        "candidate {} is bound at {} level but office {} is {}",
                        candidate.id,
                        level,
                        office.id,
                        office.level
                    ));
                }
            }
        }

        Ok(Self {
            offices,
            office_index,
            candidates,
            candidate_index,
        })
    }

    pub fn offices(&self) -> &[Office] {
        &self.offices
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn office(&self, id: OfficeId) -> Result<&Office> {
        self.office_index
            .get(&id)
            .map(|&i| &self.offices[i])
            .ok_or_else(|| Error::not_found("office", id))
    }

    pub fn candidate(&self, id: CandidateId) -> Result<&Candidate> {
        self.candidate_index
            .get(&id)
            .map(|&i| &self.candidates[i])
            .ok_or_else(|| Error::not_found("candidate", id))
    }

    /// Roster position of a candidate, used for stable ballot ordering
    pub fn position(&self, id: CandidateId) -> Option<usize> {
        self.candidate_index.get(&id).copied()
    }
}

/// Validated reference data shared across the portal
#[derive(Debug, Clone)]
pub struct ReferenceData {
    pub hierarchy: Arc<LocationHierarchy>,
    pub roster: Arc<Roster>,
    registered: HashMap<UnitId, u64>,
}

impl ReferenceData {
    pub fn from_catalog(catalog: ReferenceCatalog) -> Result<Self> {
        let hierarchy = LocationHierarchy::load(catalog.units)?;
        let roster = Roster::new(catalog.offices, catalog.candidates)?;

        let mut registered = HashMap::new();
        for entry in catalog.registered_voters {
            if !hierarchy.exists(entry.location_id) {
                return Err(reference_error!(
                    "voter roll entry for unknown location {}",
                    entry.location_id
                ));
            }
            *registered.entry(entry.location_id).or_insert(0) += entry.count;
        }

        tracing::info!(
            "📋 Reference data ready: {} offices, {} candidates",
            roster.offices().len(),
            roster.candidates().len()
        );

        Ok(Self {
            hierarchy: Arc::new(hierarchy),
            roster: Arc::new(roster),
            registered,
        })
    }

    /// Load and validate from any source
    pub async fn load(source: &dyn ReferenceSource) -> Result<Self> {
        Self::from_catalog(source.load().await?)
    }

    /// Authoritative registered voters inside the filter area
    pub fn registered_voters(&self, filter: &ViewerLocation) -> Result<u64> {
        let Some(area) = filter.most_specific() else {
            return Ok(self.registered.values().sum());
        };

        let mut total = 0;
        for (location, count) in &self.registered {
            if self.hierarchy.contains(area, *location)? {
                total += count;
            }
        }
        Ok(total)
    }
}
