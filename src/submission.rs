//! Ballot submission pipeline
//!
//! Each submission runs as an ordered saga:
//! 1. Mark the voter as having voted (conditional update, the only guard
//!    against double voting)
//! 2. Record one anonymous vote event per office as a single batch
//! 3. Increment the per-ward tallies
//! 4. Send a best-effort confirmation
//!
//! Phases 1 and 2 form one logical transaction: if the batch fails, the
//! events are retracted and the voter's mark is released. A mark is only
//! released once the retraction is confirmed; otherwise the ballot is kept
//! and its tallies go to the reconciler. From phase 3 on the
//! ballot stands no matter what; failed tally updates are parked with the
//! reconciler and notification failures only show up on the receipt.
//!
//! The saga runs on its own task, so once the voter is marked, dropping the
//! caller's future cannot abandon it half-way.

use crate::eligibility::{EligibilityResolver, EligibleBallot};
use crate::notify::{BALLOT_CONFIRMATION, Notifier, mask_contact};
use crate::reconcile::{PendingIncrement, TallyReconciler};
use crate::store::{ElectionStore, MarkClaim, MarkOutcome};
use crate::tally::{TallyAggregator, with_timeout};
use crate::types::{
    BallotReceipt, NotificationOutcome, OfficeId, Selections, VoteEvent, VoteEventId, Voter,
    VoterId,
};
use crate::{Error, Result, store_error};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Attempts at undoing phase 1 before giving up loudly
const COMPENSATION_ATTEMPTS: u32 = 3;

/// Progress of a single submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionState {
    Eligible,
    VoterMarked,
    VotesRecorded,
    TalliesUpdated,
    NotifiedOrSkipped,
    Complete,
    /// Refused before any state changed
    Rejected,
    /// Phase 2 failed and phase 1 was undone
    RolledBack,
}

impl SubmissionState {
    pub fn can_advance_to(self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Eligible, VoterMarked)
                | (Eligible, Rejected)
                | (VoterMarked, VotesRecorded)
                | (VoterMarked, RolledBack)
                | (VotesRecorded, TalliesUpdated)
                | (TalliesUpdated, NotifiedOrSkipped)
                | (NotifiedOrSkipped, Complete)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubmissionState::Complete | SubmissionState::Rejected | SubmissionState::RolledBack
        )
    }
}

/// State tracker for one voter's submission
#[derive(Debug)]
struct Saga {
    voter_id: VoterId,
    state: SubmissionState,
}

impl Saga {
    fn new(voter_id: VoterId) -> Self {
        Self {
            voter_id,
            state: SubmissionState::Eligible,
        }
    }

    fn advance(&mut self, next: SubmissionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::internal(format!(
                "illegal submission transition {:?} -> {:?}",
                self.state, next
            )));
        }
        tracing::debug!(
            "Submission for voter {}: {:?} -> {:?}",
            self.voter_id,
            self.state,
            next
        );
        self.state = next;
        Ok(())
    }

    fn reject(&mut self, error: Error) -> Error {
        if let Err(e) = self.advance(SubmissionState::Rejected) {
            tracing::error!("{}", e);
        }
        error
    }
}

/// Accepts ballots exactly once per voter
pub struct BallotSubmissionPipeline {
    store: Arc<dyn ElectionStore>,
    resolver: Arc<EligibilityResolver>,
    aggregator: Arc<TallyAggregator>,
    reconciler: Arc<TallyReconciler>,
    notifier: Arc<dyn Notifier>,
    store_timeout: Duration,
}

impl BallotSubmissionPipeline {
    pub fn new(
        store: Arc<dyn ElectionStore>,
        resolver: Arc<EligibilityResolver>,
        aggregator: Arc<TallyAggregator>,
        reconciler: Arc<TallyReconciler>,
        notifier: Arc<dyn Notifier>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            aggregator,
            reconciler,
            notifier,
            store_timeout,
        }
    }

    /// The ballot a voter must fill in, computed from their registered ward
    pub fn ballot_for(&self, voter: &Voter) -> Result<EligibleBallot> {
        let hierarchy = self.resolver.hierarchy();
        hierarchy.resolve_path(voter.location_id)?;
        let viewer = hierarchy.viewer_for(voter.location_id)?;
        Ok(self.resolver.visible_candidates(&viewer))
    }

    /// Check selections against a server-side ballot
    ///
    /// Selections must name exactly the ballot's offices, each with a
    /// candidate visible for that office.
    pub fn validate(ballot: &EligibleBallot, selections: &Selections) -> Result<()> {
        let offices = ballot.office_ids();
        let missing: Vec<_> = offices
            .iter()
            .copied()
            .filter(|office| !selections.contains_key(office))
            .collect();
        let unexpected: Vec<_> = selections
            .keys()
            .copied()
            .filter(|office| !offices.contains(office))
            .collect();

        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(Error::IncompleteBallot {
                missing,
                unexpected,
            });
        }

        for (&office_id, &candidate_id) in selections {
            if !ballot.is_eligible(office_id, candidate_id) {
                return Err(Error::IneligibleCandidate {
                    office_id,
                    candidate_id,
                });
            }
        }
        Ok(())
    }

    /// Submit a ballot
    ///
    /// Returns `AlreadyVoted` for every attempt after the first successful
    /// one, including concurrent duplicates, without touching any state.
    pub async fn submit(
        self: &Arc<Self>,
        voter_id: VoterId,
        selections: Selections,
    ) -> Result<BallotReceipt> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(voter_id, selections).await })
            .await
            .map_err(|e| Error::internal(format!("submission task failed: {e}")))?
    }

    async fn run(&self, voter_id: VoterId, selections: Selections) -> Result<BallotReceipt> {
        let mut saga = Saga::new(voter_id);

        let voter = match with_timeout(self.store_timeout, self.store.get_voter(voter_id)).await {
            Ok(Some(voter)) => voter,
            Ok(None) => return Err(saga.reject(Error::not_found("voter", voter_id))),
            Err(e) => return Err(saga.reject(e)),
        };
        if voter.has_voted {
            return Err(saga.reject(Error::AlreadyVoted { voter_id }));
        }

        // Eligibility is always recomputed here; the client's view is advisory
        let ballot = match self.ballot_for(&voter) {
            Ok(ballot) => ballot,
            Err(e) => return Err(saga.reject(e)),
        };
        if let Err(e) = Self::validate(&ballot, &selections) {
            tracing::info!("Ballot from voter {} rejected: {}", voter_id, e);
            return Err(saga.reject(e));
        }

        // Phase 1. The stored timestamp is as coarse as the vote events so
        // the two cannot be joined on submission time.
        let claim = MarkClaim::new();
        let submitted_at = Utc::now();
        match with_timeout(
            self.store_timeout,
            self.store.mark_voted(voter_id, claim, coarsen(submitted_at)),
        )
        .await
        {
            Ok(MarkOutcome::Marked) => saga.advance(SubmissionState::VoterMarked)?,
            Ok(MarkOutcome::AlreadyVoted) => {
                tracing::debug!("Voter {} lost the has-voted race", voter_id);
                return Err(saga.reject(Error::AlreadyVoted { voter_id }));
            }
            Err(e) => {
                // A timed-out update may still have landed; the claim makes
                // releasing it safe either way.
                self.release_mark(voter_id, claim).await;
                return Err(saga.reject(e));
            }
        }

        // Phase 2
        let recorded_at = coarsen(Utc::now());
        let events: Vec<VoteEvent> = selections
            .iter()
            .map(|(&office_id, &candidate_id)| VoteEvent {
                id: VoteEventId::new(),
                office_id,
                candidate_id,
                location_id: voter.location_id,
                created_at: recorded_at,
            })
            .collect();

        let outcome =
            with_timeout(self.store_timeout, self.store.insert_vote_events(&events)).await;
        let failure = match outcome {
            Ok(written) if written == events.len() => None,
            Ok(written) => Some(store_error!(
                "vote batch wrote {} of {} events",
                written,
                events.len()
            )),
            Err(e) => Some(e),
        };

        // Set when the batch failed but its events could not be retracted
        let mut stranded = None;
        if let Some(cause) = failure {
            tracing::warn!(
                "Recording votes for voter {} failed, rolling back: {}",
                voter_id,
                cause
            );
            if self.retract(&events).await {
                self.release_mark(voter_id, claim).await;
                saga.advance(SubmissionState::RolledBack)?;
                return Err(cause);
            }

            match self.stored_subset(&events).await {
                // Nothing reached the vote log, so there is nothing to retract
                Some(stored) if stored.is_empty() => {
                    self.release_mark(voter_id, claim).await;
                    saga.advance(SubmissionState::RolledBack)?;
                    return Err(cause);
                }
                // Some of the events may be stored, so the mark has to stay
                stored => {
                    tracing::error!(
                        "Vote events for voter {} could not be retracted, keeping the ballot",
                        voter_id
                    );
                    stranded = Some(stored);
                }
            }
        }

        match with_timeout(
            self.store_timeout,
            self.store.finalize_vote_mark(voter_id, claim),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Vote mark for voter {} was no longer claimed", voter_id),
            Err(e) => tracing::warn!("Could not finalize vote mark for voter {}: {}", voter_id, e),
        }
        saga.advance(SubmissionState::VotesRecorded)?;

        // Phase 3
        let mut deferred = 0;
        let mut offices_voted: Vec<OfficeId> = selections.keys().copied().collect();
        match stranded {
            None => {
                for event in &events {
                    if let Err(e) = self
                        .aggregator
                        .increment(event.candidate_id, event.location_id, 1)
                        .await
                    {
                        // Never log the candidate next to the voter
                        tracing::warn!("Tally update deferred for office {}: {}", event.office_id, e);
                        self.park(event);
                        deferred += 1;
                    }
                }
            }
            // The batch outcome is unknown, so nothing is counted inline
            Some(Some(stored)) => {
                for event in &stored {
                    self.park(event);
                }
                deferred = stored.len();
                offices_voted = stored.iter().map(|event| event.office_id).collect();
                offices_voted.sort();
            }
            Some(None) => {
                self.reconciler.request_replay();
                deferred = events.len();
            }
        }
        saga.advance(SubmissionState::TalliesUpdated)?;

        // Phase 4
        let notification = self.notify(&voter, offices_voted.len(), submitted_at).await;
        saga.advance(SubmissionState::NotifiedOrSkipped)?;
        saga.advance(SubmissionState::Complete)?;

        tracing::info!(
            "🗳️ Ballot accepted: voter={}, offices={}, deferred_tallies={}, notification={:?}",
            voter_id,
            offices_voted.len(),
            deferred,
            notification
        );

        Ok(BallotReceipt {
            voter_id,
            offices_voted,
            submitted_at,
            notification,
            deferred_tallies: deferred,
        })
    }

    /// Remove the batch's events, returning whether that is confirmed
    ///
    /// Only a confirmed retraction allows the voter's mark to be released.
    async fn retract(&self, events: &[VoteEvent]) -> bool {
        let ids: Vec<VoteEventId> = events.iter().map(|event| event.id).collect();
        for attempt in 1..=COMPENSATION_ATTEMPTS {
            match with_timeout(self.store_timeout, self.store.retract_vote_events(&ids)).await {
                Ok(removed) => {
                    if removed > 0 {
                        tracing::info!("Retracted {} partially written vote events", removed);
                    }
                    return true;
                }
                Err(e) if attempt == COMPENSATION_ATTEMPTS => {
                    tracing::error!("Retracting vote events failed: {}", e);
                }
                Err(_) => {}
            }
        }
        false
    }

    /// Which of the batch's events actually reached the store
    ///
    /// `None` when the vote log cannot be read either.
    async fn stored_subset(&self, events: &[VoteEvent]) -> Option<Vec<VoteEvent>> {
        match with_timeout(self.store_timeout, self.store.vote_events()).await {
            Ok(stored) => {
                let ids: HashSet<VoteEventId> = events.iter().map(|event| event.id).collect();
                Some(stored.into_iter().filter(|event| ids.contains(&event.id)).collect())
            }
            Err(e) => {
                tracing::error!("Vote log unreadable, tallies need a full replay: {}", e);
                None
            }
        }
    }

    fn park(&self, event: &VoteEvent) {
        let parked = self.reconciler.defer(PendingIncrement {
            candidate_id: event.candidate_id,
            location_id: event.location_id,
            delta: 1,
        });
        if let Err(e) = parked {
            tracing::error!("Could not queue tally for reconciliation: {}", e);
            self.reconciler.request_replay();
        }
    }

    async fn release_mark(&self, voter_id: VoterId, claim: MarkClaim) {
        for attempt in 1..=COMPENSATION_ATTEMPTS {
            match with_timeout(
                self.store_timeout,
                self.store.release_vote_mark(voter_id, claim),
            )
            .await
            {
                Ok(released) => {
                    if released {
                        tracing::info!("🔓 Vote mark released for voter {}", voter_id);
                    }
                    return;
                }
                Err(e) if attempt == COMPENSATION_ATTEMPTS => {
                    tracing::error!(
                        "Releasing vote mark for voter {} failed, manual repair needed: {}",
                        voter_id,
                        e
                    );
                }
                Err(_) => {}
            }
        }
    }

    async fn notify(
        &self,
        voter: &Voter,
        offices: usize,
        submitted_at: DateTime<Utc>,
    ) -> NotificationOutcome {
        let Some(contact) = voter.phone.as_deref().filter(|phone| !phone.is_empty()) else {
            return NotificationOutcome::Skipped;
        };

        let mut variables = BTreeMap::new();
        variables.insert("first_name".to_string(), voter.first_name.clone());
        variables.insert("offices".to_string(), offices.to_string());
        variables.insert("submitted_at".to_string(), submitted_at.to_rfc3339());

        match self
            .notifier
            .send(contact, BALLOT_CONFIRMATION, &variables)
            .await
        {
            Ok(status) if status.is_accepted() => NotificationOutcome::Sent,
            Ok(status) => {
                tracing::warn!(
                    "Confirmation to {} not accepted: {:?}",
                    mask_contact(contact),
                    status
                );
                NotificationOutcome::Failed
            }
            Err(e) => {
                tracing::warn!("Confirmation to {} failed: {}", mask_contact(contact), e);
                NotificationOutcome::Failed
            }
        }
    }
}

/// Drop seconds so vote events cannot be matched to a voter's exact voting
/// time
fn coarsen(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}
