//! Election portal facade
//!
//! Wires reference data, the store, the notifier, the tally feed and
//! sessions into the operations a front end calls. Every voter and monitor
//! request is authenticated by a session token.

use crate::config::PortalConfig;
use crate::eligibility::{EligibilityResolver, EligibleBallot};
use crate::feed::{FeedTopic, RealtimeTallyFeed};
use crate::location::ViewerLocation;
use crate::monitor::{MonitorService, MonitorSession, MonitorView};
use crate::notify::{LogNotifier, Notifier};
use crate::reconcile::{ReconciliationReport, TallyReconciler};
use crate::reference::{JsonReferenceSource, ReferenceData};
use crate::session::{Principal, Session, SessionService, SessionToken, VoterStage};
use crate::store::{ElectionStore, InMemoryStore};
use crate::submission::BallotSubmissionPipeline;
use crate::tally::{TallyAggregator, with_timeout};
use crate::types::{BallotReceipt, Selections, UnitId, Voter, VoterId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Details a voter supplies at login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCredentials {
    pub id_number: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    /// Ward the voter registers in on first login
    pub location_id: UnitId,
}

#[derive(Debug, Clone)]
pub struct VoterLogin {
    pub token: SessionToken,
    pub voter: Voter,
}

pub struct ElectionPortal {
    reference: Arc<ReferenceData>,
    store: Arc<dyn ElectionStore>,
    resolver: Arc<EligibilityResolver>,
    reconciler: Arc<TallyReconciler>,
    pipeline: Arc<BallotSubmissionPipeline>,
    monitor: Arc<MonitorService>,
    feed: Arc<RealtimeTallyFeed>,
    sessions: SessionService,
    store_timeout: Duration,
    _relay: JoinHandle<()>,
}

impl ElectionPortal {
    /// Assemble a portal; must be called inside a tokio runtime
    pub fn new(
        config: &PortalConfig,
        reference: ReferenceData,
        store: Arc<dyn ElectionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let reference = Arc::new(reference);
        let store_timeout = config.submission.store_timeout();

        let resolver = Arc::new(EligibilityResolver::new(
            reference.hierarchy.clone(),
            reference.roster.clone(),
        ));
        let aggregator = Arc::new(TallyAggregator::new(
            store.clone(),
            reference.hierarchy.clone(),
            &config.submission,
        ));
        let reconciler = Arc::new(TallyReconciler::new(store.clone(), aggregator.clone()));
        let pipeline = Arc::new(BallotSubmissionPipeline::new(
            store.clone(),
            resolver.clone(),
            aggregator.clone(),
            reconciler.clone(),
            notifier,
            store_timeout,
        ));
        let monitor = Arc::new(MonitorService::new(
            reference.clone(),
            resolver.clone(),
            aggregator,
            store.clone(),
            store_timeout,
        ));

        let feed = Arc::new(RealtimeTallyFeed::new(&config.feed));
        let relay = feed.attach(store.as_ref());

        tracing::info!(
            "🗳️ Election portal ready: {} locations, {} candidates",
            reference.hierarchy.len(),
            reference.roster.candidates().len()
        );

        Ok(Self {
            reference,
            store,
            resolver,
            reconciler,
            pipeline,
            monitor,
            feed,
            sessions: SessionService::new(&config.session)?,
            store_timeout,
            _relay: relay,
        })
    }

    /// Portal backed by the in-memory store and the logging notifier
    ///
    /// Reference data is read from `reference_path`, which must be set.
    pub async fn from_config(config: &PortalConfig) -> Result<Self> {
        let path = config
            .reference_path
            .clone()
            .ok_or_else(|| Error::validation("PORTAL_REFERENCE_PATH must be set"))?;
        let reference = ReferenceData::load(&JsonReferenceSource::new(path)).await?;
        Self::new(
            config,
            reference,
            Arc::new(InMemoryStore::new()),
            Arc::new(LogNotifier),
        )
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    pub fn resolver(&self) -> &EligibilityResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn ElectionStore> {
        &self.store
    }

    pub fn feed(&self) -> &Arc<RealtimeTallyFeed> {
        &self.feed
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    /// Log a voter in, registering them on first login
    ///
    /// Voters who have already voted cannot open a session.
    pub async fn login(&self, credentials: VoterCredentials) -> Result<VoterLogin> {
        if credentials.id_number.trim().is_empty() {
            return Err(Error::validation("id_number"));
        }

        let existing = with_timeout(
            self.store_timeout,
            self.store.find_voter_by_id_number(&credentials.id_number),
        )
        .await?;

        let voter = match existing {
            Some(voter) => voter,
            None => {
                // Voters register in a ward, never a county or subcounty
                self.reference.hierarchy.resolve_path(credentials.location_id)?;
                let voter = Voter::register(
                    credentials.id_number,
                    credentials.first_name,
                    credentials.last_name,
                    credentials.phone,
                    credentials.location_id,
                );
                let voter =
                    with_timeout(self.store_timeout, self.store.insert_voter(voter)).await?;
                tracing::info!("New voter {} registered", voter.id);
                voter
            }
        };

        if voter.has_voted {
            return Err(Error::AlreadyVoted { voter_id: voter.id });
        }

        let selection = self.reference.hierarchy.viewer_for(voter.location_id)?;
        let token = self.sessions.issue(
            Principal::Voter {
                voter_id: voter.id,
                stage: VoterStage::SelectingBallot,
            },
            selection,
        )?;

        Ok(VoterLogin { token, voter })
    }

    fn voter_session(&self, token: &SessionToken) -> Result<VoterId> {
        let session = self.sessions.resolve(token)?;
        match session.principal {
            Principal::Voter {
                voter_id,
                stage: VoterStage::SelectingBallot,
            } => Ok(voter_id),
            Principal::Voter { voter_id, .. } => Err(Error::AlreadyVoted { voter_id }),
            Principal::Monitor => Err(Error::session("not a voter session")),
        }
    }

    fn monitor_session(&self, token: &SessionToken) -> Result<Session> {
        let session = self.sessions.resolve(token)?;
        match session.principal {
            Principal::Monitor => Ok(session),
            Principal::Voter { .. } => Err(Error::session("not a monitor session")),
        }
    }

    /// The ballot for the voter behind `token`
    pub async fn ballot(&self, token: &SessionToken) -> Result<EligibleBallot> {
        let voter_id = self.voter_session(token)?;
        let voter = with_timeout(self.store_timeout, self.store.get_voter(voter_id))
            .await?
            .ok_or_else(|| Error::not_found("voter", voter_id))?;
        self.pipeline.ballot_for(&voter)
    }

    /// Submit the voter's selections and close their session
    pub async fn cast(&self, token: &SessionToken, selections: Selections) -> Result<BallotReceipt> {
        let voter_id = self.voter_session(token)?;

        // Once the pipeline has answered, the session outcome cannot change it
        match self.pipeline.submit(voter_id, selections).await {
            Ok(receipt) => {
                self.end_voter_session(token);
                Ok(receipt)
            }
            Err(e @ Error::AlreadyVoted { .. }) => {
                self.end_voter_session(token);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn end_voter_session(&self, token: &SessionToken) {
        if let Err(e) = self.sessions.end(token) {
            tracing::warn!("Could not end voter session after submission: {}", e);
        }
    }

    /// Start a monitor session at the national level
    pub fn open_monitor(&self) -> Result<SessionToken> {
        self.sessions
            .issue(Principal::Monitor, ViewerLocation::national())
    }

    /// Drill a monitor session down one level
    pub fn narrow_monitor(&self, token: &SessionToken, child: UnitId) -> Result<ViewerLocation> {
        let session = self.monitor_session(token)?;
        let narrowed = self.reference.hierarchy.narrow(&session.selection, child)?;
        self.sessions.update_selection(token, narrowed)?;
        Ok(narrowed)
    }

    /// Replace a monitor session's filter outright, e.g. to widen it
    pub fn select_monitor(
        &self,
        token: &SessionToken,
        county: Option<UnitId>,
        subcounty: Option<UnitId>,
        ward: Option<UnitId>,
    ) -> Result<ViewerLocation> {
        self.monitor_session(token)?;
        let selection = self.reference.hierarchy.viewer(county, subcounty, ward)?;
        self.sessions.update_selection(token, selection)?;
        Ok(selection)
    }

    pub async fn monitor_view(&self, token: &SessionToken) -> Result<MonitorView> {
        let session = self.monitor_session(token)?;
        self.monitor.view(&session.selection).await
    }

    /// Live view following the feed from the session's current filter
    pub fn watch(&self, token: &SessionToken) -> Result<MonitorSession> {
        let session = self.monitor_session(token)?;
        Ok(MonitorSession::new(
            self.monitor.clone(),
            session.selection,
            self.feed.subscribe(&FeedTopic::all()),
        ))
    }

    /// Apply deferred tally increments, then check tallies against votes
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let applied = self.reconciler.drain().await?;
        let report = self.reconciler.verify().await?;
        if !report.is_consistent() {
            tracing::warn!(
                "Tallies disagree with vote events in {} rows after applying {} deferred increments",
                report.discrepancies.len(),
                applied
            );
        }
        Ok(report)
    }

    /// Rebuild under-counted tallies from vote events
    ///
    /// Only run while no ballots are being cast.
    pub async fn repair_tallies(&self) -> Result<ReconciliationReport> {
        self.reconciler.repair().await
    }
}
