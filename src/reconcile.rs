//! Deferred tally reconciliation
//!
//! A ballot is final once its vote events are stored. When the tally update
//! that follows cannot be applied, the increment is parked here and applied
//! later. Tallies can also be checked against a replay of the vote events,
//! which carry the ward captured at submission time.

use crate::store::ElectionStore;
use crate::tally::TallyAggregator;
use crate::types::{CandidateId, UnitId};
use crate::{Result, store_error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Tally increment waiting to be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIncrement {
    pub candidate_id: CandidateId,
    pub location_id: UnitId,
    pub delta: u64,
}

/// A tally row that disagrees with the vote events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyDiscrepancy {
    pub candidate_id: CandidateId,
    pub location_id: UnitId,
    pub expected: u64,
    pub recorded: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub events_replayed: usize,
    pub discrepancies: Vec<TallyDiscrepancy>,
    pub repaired: usize,
    pub pending: usize,
    /// A ballot's tallies are only recoverable through `repair`
    pub replay_requested: bool,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

pub struct TallyReconciler {
    store: Arc<dyn ElectionStore>,
    aggregator: Arc<TallyAggregator>,
    pending: Mutex<Vec<PendingIncrement>>,
    replay_requested: AtomicBool,
}

impl TallyReconciler {
    pub fn new(store: Arc<dyn ElectionStore>, aggregator: Arc<TallyAggregator>) -> Self {
        Self {
            store,
            aggregator,
            pending: Mutex::new(Vec::new()),
            replay_requested: AtomicBool::new(false),
        }
    }

    /// Park an increment that could not be applied
    pub fn defer(&self, increment: PendingIncrement) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| store_error!("Reconciliation queue lock error"))?;
        pending.push(increment);
        Ok(())
    }

    /// Flag that some stored votes have no increments queued
    ///
    /// Used when a ballot's events could not be read back; only a full
    /// replay through [`repair`](Self::repair) can count them.
    pub fn request_replay(&self) {
        self.replay_requested.store(true, Ordering::SeqCst);
    }

    pub fn replay_requested(&self) -> bool {
        self.replay_requested.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Retry every parked increment; failures stay queued
    ///
    /// Returns the number applied. Safe to run while ballots are being cast.
    pub async fn drain(&self) -> Result<usize> {
        let batch = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| store_error!("Reconciliation queue lock error"))?;
            std::mem::take(&mut *pending)
        };

        let mut applied = 0;
        let mut failed = Vec::new();
        for increment in batch {
            match self
                .aggregator
                .increment(increment.candidate_id, increment.location_id, increment.delta)
                .await
            {
                Ok(_) => applied += 1,
                Err(e) => {
                    tracing::warn!(
                        "Deferred tally for candidate {} still failing: {}",
                        increment.candidate_id,
                        e
                    );
                    failed.push(increment);
                }
            }
        }

        if !failed.is_empty() {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| store_error!("Reconciliation queue lock error"))?;
            pending.extend(failed);
        }

        tracing::info!(
            "🔁 Tally reconciliation drained: applied={}, pending={}",
            applied,
            self.pending_count()
        );
        Ok(applied)
    }

    /// Compare tally rows against a replay of all vote events
    pub async fn verify(&self) -> Result<ReconciliationReport> {
        let events = self.store.vote_events().await?;
        let snapshot = self.store.tally_snapshot().await?;

        let mut expected: HashMap<(CandidateId, UnitId), u64> = HashMap::new();
        for event in &events {
            *expected
                .entry((event.candidate_id, event.location_id))
                .or_insert(0) += 1;
        }

        let recorded: HashMap<(CandidateId, UnitId), u64> = snapshot
            .into_iter()
            .map(|record| ((record.candidate_id, record.location_id), record.vote_count))
            .collect();

        let mut keys: Vec<_> = expected.keys().chain(recorded.keys()).copied().collect();
        keys.sort();
        keys.dedup();

        let discrepancies = keys
            .into_iter()
            .filter_map(|key| {
                let expected = expected.get(&key).copied().unwrap_or(0);
                let recorded = recorded.get(&key).copied().unwrap_or(0);
                (expected != recorded).then_some(TallyDiscrepancy {
                    candidate_id: key.0,
                    location_id: key.1,
                    expected,
                    recorded,
                })
            })
            .collect();

        Ok(ReconciliationReport {
            events_replayed: events.len(),
            discrepancies,
            repaired: 0,
            pending: self.pending_count(),
            replay_requested: self.replay_requested(),
        })
    }

    /// Bring under-counted rows up to the replayed totals
    ///
    /// The replay already accounts for parked increments, so the queue is
    /// cleared. Must only run while no ballot is mid-submission, otherwise a
    /// ballot between its vote and tally phases is counted twice. Over-counted
    /// rows are reported but left alone since tallies only ever increase.
    pub async fn repair(&self) -> Result<ReconciliationReport> {
        let mut report = self.verify().await?;

        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| store_error!("Reconciliation queue lock error"))?;
            pending.clear();
        }
        self.replay_requested.store(false, Ordering::SeqCst);

        for discrepancy in &report.discrepancies {
            if discrepancy.expected > discrepancy.recorded {
                self.aggregator
                    .increment(
                        discrepancy.candidate_id,
                        discrepancy.location_id,
                        discrepancy.expected - discrepancy.recorded,
                    )
                    .await?;
                report.repaired += 1;
            } else {
                tracing::error!(
                    "Tally for candidate {} in {} exceeds recorded votes: {} > {}",
                    discrepancy.candidate_id,
                    discrepancy.location_id,
                    discrepancy.recorded,
                    discrepancy.expected
                );
            }
        }

        report.pending = 0;
        report.replay_requested = false;
        Ok(report)
    }
}
