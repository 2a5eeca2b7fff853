//! Monitor query surface and result export
//!
//! A monitor picks a location filter (none, county, subcounty or ward) and
//! gets per-office standings for every candidate visible at that filter,
//! plus turnout for the area. Views are always recomputed from the tally
//! aggregator; feed events only say when to recompute.

use crate::eligibility::EligibilityResolver;
use crate::feed::{FeedSubscription, FeedUpdate};
use crate::location::ViewerLocation;
use crate::reference::ReferenceData;
use crate::store::ElectionStore;
use crate::tally::{TallyAggregator, compute_standings, with_timeout};
use crate::Result;
use crate::types::{CandidateId, Office, OfficeId, UnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateStanding {
    pub candidate_id: CandidateId,
    pub name: String,
    pub party: String,
    pub votes: u64,
    pub percentage: f64,
    pub is_leader: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficeView {
    pub office: Office,
    pub standings: Vec<CandidateStanding>,
    pub total_votes: u64,
    pub leader: Option<CandidateId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnoutSummary {
    /// Voters in the area whose ballot was accepted
    pub voted: u64,
    /// Registered voters in the area, from the authoritative roll
    pub registered: u64,
    pub turnout_pct: f64,
}

impl TurnoutSummary {
    fn new(voted: u64, registered: u64) -> Self {
        let turnout_pct = if registered == 0 {
            0.0
        } else {
            voted as f64 / registered as f64 * 100.0
        };
        Self {
            voted,
            registered,
            turnout_pct,
        }
    }
}

/// Everything a dashboard shows for one filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorView {
    pub filter: ViewerLocation,
    /// Human readable filter, e.g. "Mombasa / Nyali"
    pub location_label: String,
    pub offices: Vec<OfficeView>,
    pub turnout: TurnoutSummary,
    pub generated_at: DateTime<Utc>,
}

impl MonitorView {
    pub fn office(&self, office_id: OfficeId) -> Option<&OfficeView> {
        self.offices.iter().find(|view| view.office.id == office_id)
    }

    pub fn votes_for(&self, candidate_id: CandidateId) -> Option<u64> {
        self.offices
            .iter()
            .flat_map(|view| view.standings.iter())
            .find(|standing| standing.candidate_id == candidate_id)
            .map(|standing| standing.votes)
    }
}

pub struct MonitorService {
    reference: Arc<ReferenceData>,
    resolver: Arc<EligibilityResolver>,
    aggregator: Arc<TallyAggregator>,
    store: Arc<dyn ElectionStore>,
    store_timeout: Duration,
}

impl MonitorService {
    pub fn new(
        reference: Arc<ReferenceData>,
        resolver: Arc<EligibilityResolver>,
        aggregator: Arc<TallyAggregator>,
        store: Arc<dyn ElectionStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            reference,
            resolver,
            aggregator,
            store,
            store_timeout,
        }
    }

    /// Current standings and turnout inside the filter area
    pub async fn view(&self, filter: &ViewerLocation) -> Result<MonitorView> {
        let ballot = self.resolver.visible_candidates(filter);

        // One snapshot for all offices so they agree with each other
        let counts = self
            .aggregator
            .query(Some(&ballot.candidate_ids()), filter)
            .await?;

        let offices = ballot
            .offices
            .into_iter()
            .map(|eligible| {
                let office_counts: Vec<(CandidateId, u64)> = eligible
                    .candidates
                    .iter()
                    .map(|c| (c.id, counts.get(&c.id).copied().unwrap_or(0)))
                    .collect();
                let computed = compute_standings(&office_counts);

                let standings = eligible
                    .candidates
                    .iter()
                    .zip(&computed.entries)
                    .map(|(candidate, standing)| CandidateStanding {
                        candidate_id: candidate.id,
                        name: candidate.name.clone(),
                        party: candidate.party.clone(),
                        votes: standing.votes,
                        percentage: standing.percentage,
                        is_leader: computed.leader == Some(candidate.id),
                    })
                    .collect();

                OfficeView {
                    office: eligible.office,
                    standings,
                    total_votes: computed.total,
                    leader: computed.leader,
                }
            })
            .collect();

        let turnout = self.turnout(filter).await?;

        Ok(MonitorView {
            filter: *filter,
            location_label: self.label(filter)?,
            offices,
            turnout,
            generated_at: Utc::now(),
        })
    }

    pub async fn turnout(&self, filter: &ViewerLocation) -> Result<TurnoutSummary> {
        let by_location = with_timeout(self.store_timeout, self.store.voted_by_location()).await?;
        let hierarchy = &self.reference.hierarchy;

        let voted = match filter.most_specific() {
            None => by_location.values().sum(),
            Some(area) => {
                let mut voted = 0;
                for (location, count) in &by_location {
                    if hierarchy.contains(area, *location).unwrap_or(false) {
                        voted += count;
                    }
                }
                voted
            }
        };

        Ok(TurnoutSummary::new(
            voted,
            self.reference.registered_voters(filter)?,
        ))
    }

    fn label(&self, filter: &ViewerLocation) -> Result<String> {
        let ids = [filter.county(), filter.subcounty(), filter.ward()];
        let mut names = Vec::new();
        for id in ids.into_iter().flatten() {
            names.push(self.reference.hierarchy.get(id)?.name.clone());
        }
        if names.is_empty() {
            return Ok("All locations".to_string());
        }
        Ok(names.join(" / "))
    }

    /// Whether a change in `location_id` can affect a view at `filter`
    fn in_scope(&self, filter: &ViewerLocation, location_id: UnitId) -> bool {
        match filter.most_specific() {
            None => true,
            // Unknown wards force a refresh rather than being dropped
            Some(area) => self
                .reference
                .hierarchy
                .contains(area, location_id)
                .unwrap_or(true),
        }
    }
}

/// A dashboard that follows the feed
///
/// Each call to [`MonitorSession::next_view`] waits for a relevant feed
/// update and returns a freshly queried view. The first call returns at once.
pub struct MonitorSession {
    service: Arc<MonitorService>,
    filter: ViewerLocation,
    subscription: FeedSubscription,
    stale: bool,
    last: Option<MonitorView>,
}

impl MonitorSession {
    pub fn new(
        service: Arc<MonitorService>,
        filter: ViewerLocation,
        subscription: FeedSubscription,
    ) -> Self {
        Self {
            service,
            filter,
            subscription,
            stale: true,
            last: None,
        }
    }

    pub fn filter(&self) -> &ViewerLocation {
        &self.filter
    }

    pub fn last_view(&self) -> Option<&MonitorView> {
        self.last.as_ref()
    }

    pub fn subscription(&mut self) -> &mut FeedSubscription {
        &mut self.subscription
    }

    /// Change the filter; the next view is recomputed immediately
    pub fn set_filter(&mut self, filter: ViewerLocation) {
        self.filter = filter;
        self.stale = true;
    }

    /// Drill down into a child of the current filter
    pub fn narrow(&mut self, child: UnitId) -> Result<()> {
        let narrowed = self
            .service
            .reference
            .hierarchy
            .narrow(&self.filter, child)?;
        self.set_filter(narrowed);
        Ok(())
    }

    pub async fn next_view(&mut self) -> Result<MonitorView> {
        loop {
            if self.stale {
                break;
            }
            match self.subscription.recv().await {
                FeedUpdate::Invalidate(event) => {
                    if self
                        .service
                        .in_scope(&self.filter, event.change.location_id())
                    {
                        break;
                    }
                }
                FeedUpdate::Resync => break,
                FeedUpdate::Disconnected => {
                    tracing::debug!("Monitor feed disconnected, reconnecting");
                    self.subscription.connect()?;
                }
            }
        }

        let view = self.service.view(&self.filter).await?;
        self.stale = false;
        self.last = Some(view.clone());
        Ok(view)
    }
}

/// One row of the tabular export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    pub position: String,
    pub candidate: String,
    pub party: String,
    pub votes: u64,
    pub location: String,
}

/// Flatten a view to one row per candidate
pub fn export_rows(view: &MonitorView) -> Vec<ExportRow> {
    view.offices
        .iter()
        .flat_map(|office| {
            office.standings.iter().map(|standing| ExportRow {
                position: office.office.title.clone(),
                candidate: standing.name.clone(),
                party: standing.party.clone(),
                votes: standing.votes,
                location: view.location_label.clone(),
            })
        })
        .collect()
}
