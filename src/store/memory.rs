//! In-process implementation of [`ElectionStore`]
//!
//! Each table sits behind its own `RwLock`, so every trait method is a single
//! critical section and atomic with respect to the others. Poisoned locks
//! surface as `StoreUnavailable`.
//!
//! The vote log is keyed by the random event id, so neither storage order
//! nor read order follows the order ballots were cast in.

use super::{ChangeEvent, ElectionStore, MarkClaim, MarkOutcome};
use crate::types::{CandidateId, TallyRecord, UnitId, VoteEvent, VoteEventId, Voter, VoterId};
use crate::{Result, store_error};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Default buffer for the change feed
const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct VoterRow {
    voter: Voter,
    claim: Option<MarkClaim>,
}

#[derive(Default)]
struct VoterTable {
    rows: HashMap<VoterId, VoterRow>,
    by_id_number: HashMap<String, VoterId>,
}


/// Thread-safe in-memory election store
pub struct InMemoryStore {
    voters: RwLock<VoterTable>,
    votes: RwLock<BTreeMap<VoteEventId, VoteEvent>>,
    tallies: RwLock<HashMap<(CandidateId, UnitId), TallyRecord>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_change_capacity(CHANGE_FEED_CAPACITY)
    }

    pub fn with_change_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            voters: RwLock::new(VoterTable::default()),
            votes: RwLock::new(BTreeMap::new()),
            tallies: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(event);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ElectionStore for InMemoryStore {
    async fn get_voter(&self, voter_id: VoterId) -> Result<Option<Voter>> {
        let voters = self
            .voters
            .read()
            .map_err(|_| store_error!("Voter table read error"))?;
        Ok(voters.rows.get(&voter_id).map(|row| row.voter.clone()))
    }

    async fn find_voter_by_id_number(&self, id_number: &str) -> Result<Option<Voter>> {
        let voters = self
            .voters
            .read()
            .map_err(|_| store_error!("Voter table read error"))?;
        Ok(voters
            .by_id_number
            .get(id_number)
            .and_then(|id| voters.rows.get(id))
            .map(|row| row.voter.clone()))
    }

    async fn insert_voter(&self, voter: Voter) -> Result<Voter> {
        let mut voters = self
            .voters
            .write()
            .map_err(|_| store_error!("Voter table write error"))?;

        if let Some(existing) = voters
            .by_id_number
            .get(&voter.id_number)
            .and_then(|id| voters.rows.get(id))
        {
            return Ok(existing.voter.clone());
        }

        voters.by_id_number.insert(voter.id_number.clone(), voter.id);
        voters.rows.insert(
            voter.id,
            VoterRow {
                voter: voter.clone(),
                claim: None,
            },
        );
        Ok(voter)
    }

    async fn mark_voted(
        &self,
        voter_id: VoterId,
        claim: MarkClaim,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome> {
        let location_id = {
            let mut voters = self
                .voters
                .write()
                .map_err(|_| store_error!("Voter table write error"))?;
            let row = voters
                .rows
                .get_mut(&voter_id)
                .ok_or_else(|| crate::Error::not_found("voter", voter_id))?;

            if row.voter.has_voted {
                return Ok(MarkOutcome::AlreadyVoted);
            }
            row.voter.has_voted = true;
            row.voter.voted_at = Some(at);
            row.claim = Some(claim);
            row.voter.location_id
        };

        self.publish(ChangeEvent::VoterStatusChanged {
            location_id,
            has_voted: true,
        });
        Ok(MarkOutcome::Marked)
    }

    async fn release_vote_mark(&self, voter_id: VoterId, claim: MarkClaim) -> Result<bool> {
        let location_id = {
            let mut voters = self
                .voters
                .write()
                .map_err(|_| store_error!("Voter table write error"))?;
            let Some(row) = voters.rows.get_mut(&voter_id) else {
                return Ok(false);
            };
            if row.claim != Some(claim) {
                return Ok(false);
            }
            row.voter.has_voted = false;
            row.voter.voted_at = None;
            row.claim = None;
            row.voter.location_id
        };

        self.publish(ChangeEvent::VoterStatusChanged {
            location_id,
            has_voted: false,
        });
        Ok(true)
    }

    async fn finalize_vote_mark(&self, voter_id: VoterId, claim: MarkClaim) -> Result<bool> {
        let mut voters = self
            .voters
            .write()
            .map_err(|_| store_error!("Voter table write error"))?;
        match voters.rows.get_mut(&voter_id) {
            Some(row) if row.claim == Some(claim) => {
                row.claim = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_vote_events(&self, events: &[VoteEvent]) -> Result<usize> {
        {
            let mut log = self
                .votes
                .write()
                .map_err(|_| store_error!("Vote log write error"))?;

            let mut batch_ids = HashSet::with_capacity(events.len());
            for event in events {
                if log.contains_key(&event.id) || !batch_ids.insert(event.id) {
                    return Err(store_error!("duplicate vote event id {}", event.id.0));
                }
            }

            log.extend(events.iter().map(|event| (event.id, event.clone())));
        }

        for event in events {
            self.publish(ChangeEvent::VoteRecorded {
                office_id: event.office_id,
                candidate_id: event.candidate_id,
                location_id: event.location_id,
            });
        }
        Ok(events.len())
    }

    async fn retract_vote_events(&self, ids: &[VoteEventId]) -> Result<usize> {
        let removed: Vec<VoteEvent> = {
            let mut log = self
                .votes
                .write()
                .map_err(|_| store_error!("Vote log write error"))?;

            ids.iter().filter_map(|id| log.remove(id)).collect()
        };

        for event in &removed {
            self.publish(ChangeEvent::VoteRetracted {
                office_id: event.office_id,
                candidate_id: event.candidate_id,
                location_id: event.location_id,
            });
        }
        Ok(removed.len())
    }

    async fn increment_tally(
        &self,
        candidate_id: CandidateId,
        location_id: UnitId,
        delta: u64,
    ) -> Result<TallyRecord> {
        let record = {
            let mut tallies = self
                .tallies
                .write()
                .map_err(|_| store_error!("Tally table write error"))?;
            let now = Utc::now();
            let record = tallies
                .entry((candidate_id, location_id))
                .or_insert_with(|| TallyRecord {
                    candidate_id,
                    location_id,
                    vote_count: 0,
                    last_updated: now,
                });
            record.vote_count += delta;
            record.last_updated = now;
            record.clone()
        };

        self.publish(ChangeEvent::TallyUpdated {
            candidate_id,
            location_id,
            vote_count: record.vote_count,
        });
        Ok(record)
    }

    async fn tally_snapshot(&self) -> Result<Vec<TallyRecord>> {
        let tallies = self
            .tallies
            .read()
            .map_err(|_| store_error!("Tally table read error"))?;
        Ok(tallies.values().cloned().collect())
    }

    async fn vote_events(&self) -> Result<Vec<VoteEvent>> {
        let log = self
            .votes
            .read()
            .map_err(|_| store_error!("Vote log read error"))?;
        Ok(log.values().cloned().collect())
    }

    async fn voted_by_location(&self) -> Result<HashMap<UnitId, u64>> {
        let voters = self
            .voters
            .read()
            .map_err(|_| store_error!("Voter table read error"))?;
        let mut counts = HashMap::new();
        for row in voters.rows.values().filter(|row| row.voter.has_voted) {
            *counts.entry(row.voter.location_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OfficeId;
    use std::sync::Arc;

    fn voter() -> Voter {
        Voter::register("A12345", "Jane", "Wanjiru", None, UnitId(100))
    }

    fn event(candidate: u32) -> VoteEvent {
        VoteEvent {
            id: VoteEventId::new(),
            office_id: OfficeId(1),
            candidate_id: CandidateId(candidate),
            location_id: UnitId(100),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_voter_is_idempotent_on_id_number() {
        let store = InMemoryStore::new();
        let first = store.insert_voter(voter()).await.unwrap();
        let second = store.insert_voter(voter()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(store.find_voter_by_id_number("A12345").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_voted_is_conditional() {
        let store = InMemoryStore::new();
        let voter = store.insert_voter(voter()).await.unwrap();
        let claim = MarkClaim::new();

        assert_eq!(
            store.mark_voted(voter.id, claim, Utc::now()).await.unwrap(),
            MarkOutcome::Marked
        );
        assert_eq!(
            store.mark_voted(voter.id, MarkClaim::new(), Utc::now()).await.unwrap(),
            MarkOutcome::AlreadyVoted
        );

        // a foreign claim cannot undo the mark
        assert!(!store.release_vote_mark(voter.id, MarkClaim::new()).await.unwrap());
        assert!(store.release_vote_mark(voter.id, claim).await.unwrap());
        assert!(!store.get_voter(voter.id).await.unwrap().unwrap().has_voted);
    }

    #[tokio::test]
    async fn test_finalized_mark_cannot_be_released() {
        let store = InMemoryStore::new();
        let voter = store.insert_voter(voter()).await.unwrap();
        let claim = MarkClaim::new();
        store.mark_voted(voter.id, claim, Utc::now()).await.unwrap();

        assert!(store.finalize_vote_mark(voter.id, claim).await.unwrap());
        assert!(!store.release_vote_mark(voter.id, claim).await.unwrap());
        assert!(store.get_voter(voter.id).await.unwrap().unwrap().has_voted);
    }

    #[tokio::test]
    async fn test_batch_insert_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let first = event(1);
        store.insert_vote_events(&[first.clone()]).await.unwrap();

        let batch = vec![event(2), first.clone()];
        assert!(store.insert_vote_events(&batch).await.is_err());
        assert_eq!(store.vote_events().await.unwrap().len(), 1);

        let removed = store.retract_vote_events(&[first.id, VoteEventId::new()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.vote_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vote_log_order_ignores_insertion_order() {
        let store = InMemoryStore::new();
        let with_id = |n: u128, candidate: u32| VoteEvent {
            id: VoteEventId(uuid::Uuid::from_u128(n)),
            ..event(candidate)
        };

        // Two ballots cast one after the other, ids descending
        store.insert_vote_events(&[with_id(40, 1), with_id(30, 2)]).await.unwrap();
        store.insert_vote_events(&[with_id(20, 3), with_id(10, 4)]).await.unwrap();

        let read: Vec<u32> = store
            .vote_events()
            .await
            .unwrap()
            .iter()
            .map(|event| event.candidate_id.0)
            .collect();
        assert_eq!(read, vec![4, 3, 2, 1]);

        store.retract_vote_events(&[VoteEventId(uuid::Uuid::from_u128(30))]).await.unwrap();
        assert_eq!(store.vote_events().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_tally(CandidateId(1), UnitId(100), 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.tally_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].vote_count, 50);
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let store = InMemoryStore::new();
        let mut changes = store.subscribe_changes();
        store.increment_tally(CandidateId(3), UnitId(100), 2).await.unwrap();

        match changes.recv().await.unwrap() {
            ChangeEvent::TallyUpdated { vote_count, .. } => assert_eq!(vote_count, 2),
            other => panic!("unexpected change {other:?}"),
        }
    }
}
