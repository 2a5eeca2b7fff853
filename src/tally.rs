//! Vote tally aggregation
//!
//! Tallies are stored per (candidate, ward). Queries take a partial location
//! and sum every row whose ward lies inside it, so the same rows serve the
//! national view and every drill-down. `increment` is the only mutator.

use crate::config::SubmissionConfig;
use crate::location::{LocationHierarchy, ViewerLocation};
use crate::store::ElectionStore;
use crate::types::{CandidateId, TallyRecord, UnitId};
use crate::{Error, Result, store_error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Pause between tally retries, multiplied by the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Reads and increments tallies through the store
pub struct TallyAggregator {
    store: Arc<dyn ElectionStore>,
    hierarchy: Arc<LocationHierarchy>,
    retry_limit: u32,
    store_timeout: Duration,
}

impl TallyAggregator {
    pub fn new(
        store: Arc<dyn ElectionStore>,
        hierarchy: Arc<LocationHierarchy>,
        config: &SubmissionConfig,
    ) -> Self {
        Self {
            store,
            hierarchy,
            retry_limit: config.tally_retry_limit.max(1),
            store_timeout: config.store_timeout(),
        }
    }

    /// Add `delta` votes for a candidate in a ward
    ///
    /// Transient store failures and timeouts are retried up to the configured
    /// limit, after which `TallyContention` is returned.
    pub async fn increment(
        &self,
        candidate_id: CandidateId,
        location_id: UnitId,
        delta: u64,
    ) -> Result<TallyRecord> {
        for attempt in 1..=self.retry_limit {
            let outcome = with_timeout(
                self.store_timeout,
                self.store.increment_tally(candidate_id, location_id, delta),
            )
            .await;

            match outcome {
                Ok(record) => return Ok(record),
                Err(Error::StoreUnavailable { message }) => {
                    tracing::debug!(
                        "Tally increment attempt {}/{} for candidate {} failed: {}",
                        attempt,
                        self.retry_limit,
                        candidate_id,
                        message
                    );
                }
                Err(Error::AtomicUpdateConflict { .. }) => {
                    tracing::debug!(
                        "Tally increment attempt {}/{} for candidate {} conflicted",
                        attempt,
                        self.retry_limit,
                        candidate_id
                    );
                }
                Err(other) => return Err(other),
            }

            if attempt < self.retry_limit {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Err(Error::TallyContention {
            candidate_id,
            attempts: self.retry_limit,
        })
    }

    /// Votes per candidate inside the filter area
    ///
    /// With `candidate_ids` given, every requested candidate appears in the
    /// result, at zero if it has no votes yet. Without it, only candidates
    /// with at least one matching row appear.
    pub async fn query(
        &self,
        candidate_ids: Option<&[CandidateId]>,
        filter: &ViewerLocation,
    ) -> Result<BTreeMap<CandidateId, u64>> {
        let snapshot = with_timeout(self.store_timeout, self.store.tally_snapshot()).await?;
        let wanted: Option<HashSet<CandidateId>> =
            candidate_ids.map(|ids| ids.iter().copied().collect());
        let area = filter.most_specific();

        let mut counts: BTreeMap<CandidateId, u64> = BTreeMap::new();
        if let Some(ids) = candidate_ids {
            counts.extend(ids.iter().map(|id| (*id, 0)));
        }

        for record in snapshot {
            if wanted
                .as_ref()
                .is_some_and(|wanted| !wanted.contains(&record.candidate_id))
            {
                continue;
            }
            if let Some(area) = area {
                if !self.hierarchy.contains(area, record.location_id).unwrap_or(false) {
                    continue;
                }
            }
            *counts.entry(record.candidate_id).or_insert(0) += record.vote_count;
        }

        Ok(counts)
    }
}

/// Bound a store call by `limit`, mapping expiry to `StoreUnavailable`
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| store_error!("store call timed out after {}ms", limit.as_millis()))?
}

/// One candidate's share of an office
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub candidate_id: CandidateId,
    pub votes: u64,
    pub percentage: f64,
}

/// Ranked result for a single office
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficeStandings {
    pub entries: Vec<Standing>,
    pub total: u64,
    pub leader: Option<CandidateId>,
}

/// Percentages and leader for one office's tallies
///
/// Entries keep input order. The leader has the most votes, ties going to
/// the smallest candidate id. Percentages are 0 when no votes were cast.
pub fn compute_standings(counts: &[(CandidateId, u64)]) -> OfficeStandings {
    let total: u64 = counts.iter().map(|(_, votes)| votes).sum();

    let entries = counts
        .iter()
        .map(|&(candidate_id, votes)| Standing {
            candidate_id,
            votes,
            percentage: if total == 0 {
                0.0
            } else {
                votes as f64 / total as f64 * 100.0
            },
        })
        .collect();

    let leader = counts
        .iter()
        .fold(None::<(CandidateId, u64)>, |best, &(id, votes)| match best {
            Some((best_id, best_votes))
                if best_votes > votes || (best_votes == votes && best_id < id) =>
            {
                best
            }
            _ => Some((id, votes)),
        })
        .map(|(id, _)| id);

    OfficeStandings {
        entries,
        total,
        leader,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{AdministrativeUnit, UnitLevel};

    fn hierarchy() -> Arc<LocationHierarchy> {
        let unit = |id: u32, name: &str, level, parent: Option<u32>| AdministrativeUnit {
            id: UnitId(id),
            name: name.to_string(),
            level,
            parent_id: parent.map(UnitId),
        };
        Arc::new(
            LocationHierarchy::load(vec![
                unit(1, "Mombasa", UnitLevel::County, None),
                unit(2, "Nairobi", UnitLevel::County, None),
                unit(10, "Nyali", UnitLevel::Subcounty, Some(1)),
                unit(20, "Westlands", UnitLevel::Subcounty, Some(2)),
                unit(100, "Frere Town", UnitLevel::Ward, Some(10)),
                unit(200, "Parklands", UnitLevel::Ward, Some(20)),
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_query_sums_by_containment() {
        let hierarchy = hierarchy();
        let store: Arc<dyn ElectionStore> = Arc::new(InMemoryStore::new());
        let aggregator =
            TallyAggregator::new(store, hierarchy.clone(), &SubmissionConfig::default());

        aggregator.increment(CandidateId(1), UnitId(100), 1).await.unwrap();
        aggregator.increment(CandidateId(1), UnitId(200), 1).await.unwrap();
        aggregator.increment(CandidateId(2), UnitId(200), 3).await.unwrap();

        let all = aggregator.query(None, &ViewerLocation::national()).await.unwrap();
        assert_eq!(all[&CandidateId(1)], 2);
        assert_eq!(all[&CandidateId(2)], 3);

        let nairobi = hierarchy.viewer(Some(UnitId(2)), None, None).unwrap();
        let filtered = aggregator
            .query(Some(&[CandidateId(1), CandidateId(9)]), &nairobi)
            .await
            .unwrap();
        assert_eq!(filtered[&CandidateId(1)], 1);
        assert_eq!(filtered[&CandidateId(9)], 0);
        assert!(!filtered.contains_key(&CandidateId(2)));
    }

    #[test]
    fn test_standings_leader_and_percentages() {
        let standings = compute_standings(&[
            (CandidateId(3), 30),
            (CandidateId(1), 10),
            (CandidateId(2), 60),
        ]);
        assert_eq!(standings.total, 100);
        assert_eq!(standings.leader, Some(CandidateId(2)));
        assert!((standings.entries[0].percentage - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_standings_ties_go_to_earliest_id() {
        let standings = compute_standings(&[(CandidateId(5), 4), (CandidateId(2), 4)]);
        assert_eq!(standings.leader, Some(CandidateId(2)));
    }

    #[test]
    fn test_standings_with_no_votes() {
        let standings = compute_standings(&[(CandidateId(4), 0), (CandidateId(2), 0)]);
        assert_eq!(standings.total, 0);
        assert!(standings.entries.iter().all(|s| s.percentage == 0.0));
        assert_eq!(standings.leader, Some(CandidateId(2)));

        assert_eq!(compute_standings(&[]).leader, None);
    }
}
