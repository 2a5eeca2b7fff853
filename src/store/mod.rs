//! Store collaborator interface
//!
//! The portal core never talks to a database directly. Everything it needs
//! from persistent storage goes through [`ElectionStore`]:
//! 1. A conditional update on the voter's has-voted flag
//! 2. An all-or-nothing batch insert of vote events
//! 3. An atomic increment-or-insert on tally rows
//! 4. A change-notification feed

pub mod memory;

pub use memory::InMemoryStore;

use crate::Result;
use crate::types::{
    CandidateId, OfficeId, TallyRecord, UnitId, VoteEvent, VoteEventId, Voter, VoterId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Token held by the submission that set a voter's has-voted flag
///
/// Only the holder may undo the mark, so a compensating rollback can never
/// clear a mark set by a competing submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkClaim(pub Uuid);

impl MarkClaim {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MarkClaim {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the conditional has-voted update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Flag moved from false to true under the given claim
    Marked,
    /// Flag was already true
    AlreadyVoted,
}

/// Row-level change published by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    VoterStatusChanged {
        location_id: UnitId,
        has_voted: bool,
    },
    VoteRecorded {
        office_id: OfficeId,
        candidate_id: CandidateId,
        location_id: UnitId,
    },
    VoteRetracted {
        office_id: OfficeId,
        candidate_id: CandidateId,
        location_id: UnitId,
    },
    TallyUpdated {
        candidate_id: CandidateId,
        location_id: UnitId,
        vote_count: u64,
    },
}

impl ChangeEvent {
    /// Ward the change happened in
    pub fn location_id(&self) -> UnitId {
        match self {
            Self::VoterStatusChanged { location_id, .. }
            | Self::VoteRecorded { location_id, .. }
            | Self::VoteRetracted { location_id, .. }
            | Self::TallyUpdated { location_id, .. } => *location_id,
        }
    }
}

/// Storage primitives required by the portal core
///
/// Implementations must make each method atomic on its own. In particular a
/// failed `insert_vote_events` leaves no event behind, and
/// `increment_tally` never loses an update under concurrency.
#[async_trait::async_trait]
pub trait ElectionStore: Send + Sync {
    async fn get_voter(&self, voter_id: VoterId) -> Result<Option<Voter>>;

    async fn find_voter_by_id_number(&self, id_number: &str) -> Result<Option<Voter>>;

    /// Insert a voter unless the id number is taken; returns the stored row
    async fn insert_voter(&self, voter: Voter) -> Result<Voter>;

    /// Set has_voted from false to true in one conditional update
    ///
    /// `at` is stored as given; callers pass it at the same coarse
    /// resolution as vote event timestamps.
    async fn mark_voted(
        &self,
        voter_id: VoterId,
        claim: MarkClaim,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome>;

    /// Compensation for `mark_voted`; only clears a mark still held by `claim`
    async fn release_vote_mark(&self, voter_id: VoterId, claim: MarkClaim) -> Result<bool>;

    /// Drop the claim once votes are durable, making the mark permanent
    async fn finalize_vote_mark(&self, voter_id: VoterId, claim: MarkClaim) -> Result<bool>;

    /// Insert a batch of events, all or nothing; returns the number written
    async fn insert_vote_events(&self, events: &[VoteEvent]) -> Result<usize>;

    /// Remove events by id; missing ids are ignored
    async fn retract_vote_events(&self, ids: &[VoteEventId]) -> Result<usize>;

    /// Add `delta` to a tally row, creating it at zero first if absent
    async fn increment_tally(
        &self,
        candidate_id: CandidateId,
        location_id: UnitId,
        delta: u64,
    ) -> Result<TallyRecord>;

    /// Consistent copy of every tally row
    async fn tally_snapshot(&self) -> Result<Vec<TallyRecord>>;

    /// Every stored vote event, in an order unrelated to submission order
    async fn vote_events(&self) -> Result<Vec<VoteEvent>>;

    /// Voters who have voted, per ward
    async fn voted_by_location(&self) -> Result<HashMap<UnitId, u64>>;

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;
}
