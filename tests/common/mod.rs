//! Shared fixtures: a two-county catalog and a store that fails on demand

#![allow(dead_code)]

use ballot::{
    ElectionPortal, Result,
    config::PortalConfig,
    eligibility::EligibleBallot,
    notify::{Notifier, RecordingNotifier},
    portal::VoterCredentials,
    reference::{ReferenceCatalog, ReferenceData},
    store::{ChangeEvent, ElectionStore, InMemoryStore, MarkClaim, MarkOutcome},
    store_error,
    types::{
        CandidateId, Selections, TallyRecord, UnitId, VoteEvent, VoteEventId, Voter, VoterId,
    },
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

pub const PRESIDENT: u32 = 1;
pub const GOVERNOR: u32 = 2;
pub const MEMBER_OF_PARLIAMENT: u32 = 3;
pub const WARD_REP: u32 = 4;

pub const MOMBASA: UnitId = UnitId(1);
pub const NYALI: UnitId = UnitId(10);
pub const FRERE_TOWN: UnitId = UnitId(100);
pub const KONGOWEA: UnitId = UnitId(101);
pub const LIKONI: UnitId = UnitId(11);
pub const SHIKA_ADABU: UnitId = UnitId(110);
pub const NAIROBI: UnitId = UnitId(2);
pub const WESTLANDS: UnitId = UnitId(20);
pub const PARKLANDS: UnitId = UnitId(200);

/// National candidates
pub const C1: CandidateId = CandidateId(1);
pub const C2: CandidateId = CandidateId(2);

const CATALOG: &str = r#"{
    "units": [
        {"id": 1, "name": "Mombasa", "level": "county", "parent_id": null},
        {"id": 10, "name": "Nyali", "level": "subcounty", "parent_id": 1},
        {"id": 100, "name": "Frere Town", "level": "ward", "parent_id": 10},
        {"id": 101, "name": "Kongowea", "level": "ward", "parent_id": 10},
        {"id": 11, "name": "Likoni", "level": "subcounty", "parent_id": 1},
        {"id": 110, "name": "Shika Adabu", "level": "ward", "parent_id": 11},
        {"id": 2, "name": "Nairobi", "level": "county", "parent_id": null},
        {"id": 20, "name": "Westlands", "level": "subcounty", "parent_id": 2},
        {"id": 200, "name": "Parklands", "level": "ward", "parent_id": 20}
    ],
    "offices": [
        {"id": 1, "title": "President", "level": "national"},
        {"id": 2, "title": "Governor", "level": "county"},
        {"id": 3, "title": "Member of Parliament", "level": "constituency"},
        {"id": 4, "title": "Member of County Assembly", "level": "ward"}
    ],
    "candidates": [
        {"id": 1, "name": "Amina Yusuf", "party": "PDA", "office_id": 1},
        {"id": 2, "name": "Brian Otieno", "party": "UFP", "office_id": 1},
        {"id": 3, "name": "Hassan Omar", "party": "PDA", "office_id": 2,
         "bound_location_id": 1, "bound_location_level": "county"},
        {"id": 4, "name": "Grace Wanjiru", "party": "UFP", "office_id": 2,
         "bound_location_id": 2, "bound_location_level": "county"},
        {"id": 5, "name": "Said Bakari", "party": "PDA", "office_id": 3,
         "bound_location_id": 10, "bound_location_level": "constituency"},
        {"id": 6, "name": "Tim Kamau", "party": "UFP", "office_id": 3,
         "bound_location_id": 20, "bound_location_level": "constituency"},
        {"id": 7, "name": "Mwanaisha Ali", "party": "PDA", "office_id": 3,
         "bound_location_id": 11, "bound_location_level": "constituency"},
        {"id": 8, "name": "Fatuma Said", "party": "PDA", "office_id": 4,
         "bound_location_id": 100, "bound_location_level": "ward"},
        {"id": 9, "name": "Juma Mwinyi", "party": "UFP", "office_id": 4,
         "bound_location_id": 101, "bound_location_level": "ward"},
        {"id": 10, "name": "Peter Njoroge", "party": "UFP", "office_id": 4,
         "bound_location_id": 200, "bound_location_level": "ward"},
        {"id": 11, "name": "Rehema Juma", "party": "PDA", "office_id": 4,
         "bound_location_id": 110, "bound_location_level": "ward"}
    ],
    "registered_voters": [
        {"location_id": 100, "count": 100},
        {"location_id": 101, "count": 80},
        {"location_id": 110, "count": 50},
        {"location_id": 200, "count": 120}
    ]
}"#;

pub fn catalog() -> ReferenceCatalog {
    serde_json::from_str(CATALOG).expect("fixture catalog parses")
}

pub fn reference() -> ReferenceData {
    ReferenceData::from_catalog(catalog()).expect("fixture catalog is valid")
}

pub fn portal_with(store: Arc<dyn ElectionStore>, notifier: Arc<dyn Notifier>) -> ElectionPortal {
    ElectionPortal::new(&PortalConfig::for_testing(), reference(), store, notifier)
        .expect("portal assembles")
}

pub fn portal() -> (ElectionPortal, Arc<InMemoryStore>, Arc<RecordingNotifier>) {
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let portal = portal_with(store.clone(), notifier.clone());
    (portal, store, notifier)
}

pub fn credentials(id_number: &str, ward: UnitId) -> VoterCredentials {
    VoterCredentials {
        id_number: id_number.to_string(),
        first_name: "Test".to_string(),
        last_name: "Voter".to_string(),
        phone: Some(format!("+2547{id_number:0>8}")),
        location_id: ward,
    }
}

/// First listed candidate for every office on the ballot
pub fn first_choices(ballot: &EligibleBallot) -> Selections {
    ballot
        .offices
        .iter()
        .map(|office| (office.office.id, office.candidates[0].id))
        .collect()
}

/// Register a voter and cast a ballot picking the first candidate everywhere
pub async fn cast_default(portal: &ElectionPortal, id_number: &str, ward: UnitId) -> Result<Selections> {
    let login = portal.login(credentials(id_number, ward)).await?;
    let ballot = portal.ballot(&login.token).await?;
    let selections = first_choices(&ballot);
    portal.cast(&login.token, selections.clone()).await?;
    Ok(selections)
}

/// In-memory store with switchable failures
#[derive(Default)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    /// Every vote batch insert fails outright
    pub fail_vote_batch: AtomicBool,
    /// Vote batches write all but one event
    pub short_vote_batch: AtomicBool,
    /// Vote batches are written but the call reports a failure
    pub fail_after_vote_batch: AtomicBool,
    /// Every vote event retraction fails
    pub fail_retraction: AtomicBool,
    /// Reading the vote log fails
    pub fail_vote_log_read: AtomicBool,
    /// Number of upcoming tally increments that fail
    pub tally_failures: AtomicU32,
    /// Delay applied to the has-voted update
    pub mark_delay_ms: AtomicU32,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ElectionStore for FaultyStore {
    async fn get_voter(&self, voter_id: VoterId) -> Result<Option<Voter>> {
        self.inner.get_voter(voter_id).await
    }

    async fn find_voter_by_id_number(&self, id_number: &str) -> Result<Option<Voter>> {
        self.inner.find_voter_by_id_number(id_number).await
    }

    async fn insert_voter(&self, voter: Voter) -> Result<Voter> {
        self.inner.insert_voter(voter).await
    }

    async fn mark_voted(
        &self,
        voter_id: VoterId,
        claim: MarkClaim,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome> {
        let delay = self.mark_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.inner.mark_voted(voter_id, claim, at).await
    }

    async fn release_vote_mark(&self, voter_id: VoterId, claim: MarkClaim) -> Result<bool> {
        self.inner.release_vote_mark(voter_id, claim).await
    }

    async fn finalize_vote_mark(&self, voter_id: VoterId, claim: MarkClaim) -> Result<bool> {
        self.inner.finalize_vote_mark(voter_id, claim).await
    }

    async fn insert_vote_events(&self, events: &[VoteEvent]) -> Result<usize> {
        if self.fail_vote_batch.load(Ordering::SeqCst) {
            return Err(store_error!("vote log unavailable"));
        }
        if self.short_vote_batch.load(Ordering::SeqCst) && !events.is_empty() {
            return self.inner.insert_vote_events(&events[1..]).await;
        }
        let written = self.inner.insert_vote_events(events).await?;
        if self.fail_after_vote_batch.load(Ordering::SeqCst) {
            return Err(store_error!("connection reset"));
        }
        Ok(written)
    }

    async fn retract_vote_events(&self, ids: &[VoteEventId]) -> Result<usize> {
        if self.fail_retraction.load(Ordering::SeqCst) {
            return Err(store_error!("vote log unavailable"));
        }
        self.inner.retract_vote_events(ids).await
    }

    async fn increment_tally(
        &self,
        candidate_id: CandidateId,
        location_id: UnitId,
        delta: u64,
    ) -> Result<TallyRecord> {
        let remaining = self.tally_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .tally_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(store_error!("tally row locked"));
        }
        self.inner.increment_tally(candidate_id, location_id, delta).await
    }

    async fn tally_snapshot(&self) -> Result<Vec<TallyRecord>> {
        self.inner.tally_snapshot().await
    }

    async fn vote_events(&self) -> Result<Vec<VoteEvent>> {
        if self.fail_vote_log_read.load(Ordering::SeqCst) {
            return Err(store_error!("vote log unavailable"));
        }
        self.inner.vote_events().await
    }

    async fn voted_by_location(&self) -> Result<HashMap<UnitId, u64>> {
        self.inner.voted_by_location().await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe_changes()
    }
}
