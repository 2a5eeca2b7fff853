//! # Core Types for the Election Portal
//!
//! This module defines the data structures shared by every component: the
//! administrative hierarchy, the office and candidate rosters, voters, the
//! anonymous vote events and the derived tally records.
//!
//! ## Design Principles
//!
//! - **Opaque ids**: locations, offices and candidates are addressed by
//!   integer newtypes, never by names, so no string normalization happens at
//!   query time
//! - **Ballot secrecy**: [`VoteEvent`] carries no voter reference
//! - **Derived tallies**: [`TallyRecord`] can always be rebuilt from the
//!   vote events and the ward captured on each of them
//!
//! ## Usage Examples
//!
//! ```rust
//! use ballot::types::*;
//!
//! let office = Office {
//!     id: OfficeId(1),
//!     title: "President".to_string(),
//!     level: OfficeLevel::National,
//! };
//!
//! let candidate = Candidate {
//!     id: CandidateId(10),
//!     name: "Amina Otieno".to_string(),
//!     party: "Unity".to_string(),
//!     office_id: office.id,
//!     bound_location_id: None,
//!     bound_location_level: None,
//! };
//!
//! assert!(candidate.is_national());
//! assert!(OfficeLevel::National < OfficeLevel::Ward);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of an administrative unit (county, subcounty or ward)
    UnitId
);

numeric_id!(
    /// Identifier of an elected office
    OfficeId
);

numeric_id!(
    /// Identifier of a candidate
    ///
    /// Ordering matters: standings break ties in favour of the smaller id.
    CandidateId
);

/// Identifier of a registered voter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(pub Uuid);

impl VoterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VoterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single anonymous vote event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoteEventId(pub Uuid);

impl VoteEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VoteEventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Level of an administrative unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitLevel {
    County,
    Subcounty,
    Ward,
}

impl UnitLevel {
    /// Level expected for this unit's parent
    pub fn parent_level(self) -> Option<UnitLevel> {
        match self {
            UnitLevel::County => None,
            UnitLevel::Subcounty => Some(UnitLevel::County),
            UnitLevel::Ward => Some(UnitLevel::Subcounty),
        }
    }
}

impl fmt::Display for UnitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitLevel::County => "county",
            UnitLevel::Subcounty => "subcounty",
            UnitLevel::Ward => "ward",
        };
        f.write_str(name)
    }
}

/// Level at which an office is contested
///
/// Variants are declared in ballot order, so the derived `Ord` puts national
/// offices first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfficeLevel {
    National,
    County,
    Constituency,
    Ward,
}

impl OfficeLevel {
    /// Administrative level a candidate for this office is bound to
    ///
    /// Constituencies map onto subcounties. National offices are unbound.
    pub fn unit_level(self) -> Option<UnitLevel> {
        match self {
            OfficeLevel::National => None,
            OfficeLevel::County => Some(UnitLevel::County),
            OfficeLevel::Constituency => Some(UnitLevel::Subcounty),
            OfficeLevel::Ward => Some(UnitLevel::Ward),
        }
    }
}

impl fmt::Display for OfficeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfficeLevel::National => "national",
            OfficeLevel::County => "county",
            OfficeLevel::Constituency => "constituency",
            OfficeLevel::Ward => "ward",
        };
        f.write_str(name)
    }
}

/// A node of the administrative tree
///
/// Counties have no parent, subcounties hang off a county and wards off a
/// subcounty. Names are unique among siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdministrativeUnit {
    pub id: UnitId,
    pub name: String,
    pub level: UnitLevel,
    pub parent_id: Option<UnitId>,
}

/// An elected position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Office {
    pub id: OfficeId,
    pub title: String,
    pub level: OfficeLevel,
}

/// A person standing for an office
///
/// National candidates are unbound and visible everywhere. Every other
/// candidate is bound to the unit they contest and is only visible to viewers
/// located in that unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    pub party: String,
    pub office_id: OfficeId,
    #[serde(default)]
    pub bound_location_id: Option<UnitId>,
    #[serde(default)]
    pub bound_location_level: Option<OfficeLevel>,
}

impl Candidate {
    pub fn is_national(&self) -> bool {
        self.bound_location_id.is_none()
    }
}

/// A registered voter
///
/// Created on the first login attempt. `has_voted` flips from `false` to
/// `true` exactly once, through the submission pipeline, and never back
/// except as the compensation of a failed submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    pub id: VoterId,

    /// National identity number, the natural key used at login
    pub id_number: String,

    pub first_name: String,
    pub last_name: String,

    /// Contact address for the confirmation message
    pub phone: Option<String>,

    /// Ward the voter is registered in
    pub location_id: UnitId,

    pub has_voted: bool,
    pub voted_at: Option<DateTime<Utc>>,
}

impl Voter {
    /// Build a fresh voter who has not voted yet
    pub fn register(
        id_number: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        phone: Option<String>,
        location_id: UnitId,
    ) -> Self {
        Self {
            id: VoterId::new(),
            id_number: id_number.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            phone,
            location_id,
            has_voted: false,
            voted_at: None,
        }
    }
}

/// One anonymous choice for one office
///
/// Deliberately unlinked from the voter. The ward is captured at submission
/// time so tallies can be re-derived by replaying events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub id: VoteEventId,
    pub office_id: OfficeId,
    pub candidate_id: CandidateId,
    pub location_id: UnitId,
    pub created_at: DateTime<Utc>,
}

/// Running count for one candidate in one ward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyRecord {
    pub candidate_id: CandidateId,
    pub location_id: UnitId,
    pub vote_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// A voter's choices, one candidate per office
pub type Selections = BTreeMap<OfficeId, CandidateId>;

/// What happened to the confirmation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Sent,
    Failed,
    Skipped,
}

/// Proof of a completed submission handed back to the voter
///
/// Contains no candidate ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotReceipt {
    pub voter_id: VoterId,
    pub offices_voted: Vec<OfficeId>,
    pub submitted_at: DateTime<Utc>,
    pub notification: NotificationOutcome,

    /// Tally increments queued for reconciliation instead of applied
    pub deferred_tallies: usize,
}
