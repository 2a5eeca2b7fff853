//! Realtime tally feed for monitor dashboards
//!
//! Store changes are relayed to every subscriber through a bounded broadcast
//! channel. Events are invalidation hints only: a subscriber reacts by
//! re-querying the tally aggregator, so a duplicated event costs one extra
//! query and a missed one is covered by the resync that follows any gap.

use crate::config::FeedConfig;
use crate::store::{ChangeEvent, ElectionStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTopic {
    /// Vote events and voter status
    Votes,
    /// Tally rows
    Tallies,
}

impl FeedTopic {
    pub fn all() -> [FeedTopic; 2] {
        [FeedTopic::Votes, FeedTopic::Tallies]
    }
}

/// A change relayed to monitors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub sequence: u64,
    pub topic: FeedTopic,
    pub change: ChangeEvent,
}

#[derive(Debug, Clone)]
enum FeedMessage {
    Event(FeedEvent),
    /// Relay fell behind the store; everyone must re-query
    Resync,
}

/// What a subscriber should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    /// Something in scope changed; re-query
    Invalidate(FeedEvent),
    /// Events may have been missed; run a full re-query
    Resync,
    /// The subscription is down; reconnect before reading again
    Disconnected,
}

/// Connection lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Disconnected,
}

/// Publish/subscribe hub for tally changes
pub struct RealtimeTallyFeed {
    sender: broadcast::Sender<FeedMessage>,
    sequence: AtomicU64,
}

impl RealtimeTallyFeed {
    pub fn new(config: &FeedConfig) -> Self {
        let (sender, _) = broadcast::channel(config.capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish a store change, returning its sequence number
    pub fn publish(&self, change: ChangeEvent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let topic = match change {
            ChangeEvent::TallyUpdated { .. } => FeedTopic::Tallies,
            ChangeEvent::VoterStatusChanged { .. }
            | ChangeEvent::VoteRecorded { .. }
            | ChangeEvent::VoteRetracted { .. } => FeedTopic::Votes,
        };
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(FeedMessage::Event(FeedEvent {
            sequence,
            topic,
            change,
        }));
        sequence
    }

    /// Tell every subscriber to run a full re-query
    pub fn request_resync(&self) {
        let _ = self.sender.send(FeedMessage::Resync);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Relay the store's change notifications into this feed
    ///
    /// The relay stops when the store's channel closes or the feed is
    /// dropped.
    pub fn attach(self: &Arc<Self>, store: &dyn ElectionStore) -> JoinHandle<()> {
        let mut changes = store.subscribe_changes();
        let feed = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let message = changes.recv().await;
                let Some(feed) = feed.upgrade() else {
                    break;
                };
                match message {
                    Ok(change) => {
                        feed.publish(change);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Feed relay lagged by {} changes, forcing resync", skipped);
                        feed.request_resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Feed relay stopped");
        })
    }

    /// Open a subscription to the given topics
    ///
    /// The first update delivered is always `Resync`, prompting the initial
    /// full query.
    pub fn subscribe(self: &Arc<Self>, topics: &[FeedTopic]) -> FeedSubscription {
        let mut subscription = FeedSubscription {
            feed: Arc::downgrade(self),
            receiver: None,
            topics: topics.iter().copied().collect(),
            state: ConnectionState::Disconnected,
            needs_resync: false,
        };
        // Upgrading cannot fail while `self` is borrowed
        let _ = subscription.connect();
        subscription
    }
}

/// One monitor's view of the feed
pub struct FeedSubscription {
    feed: Weak<RealtimeTallyFeed>,
    receiver: Option<broadcast::Receiver<FeedMessage>>,
    topics: HashSet<FeedTopic>,
    state: ConnectionState,
    needs_resync: bool,
}

impl FeedSubscription {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// (Re)join the feed; the next update is a `Resync`
    pub fn connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let Some(feed) = self.feed.upgrade() else {
            self.state = ConnectionState::Disconnected;
            return Err(Error::store_unavailable("tally feed is closed"));
        };
        self.receiver = Some(feed.sender.subscribe());
        self.state = ConnectionState::Subscribed;
        self.needs_resync = true;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.receiver = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Wait for the next update in scope
    pub async fn recv(&mut self) -> FeedUpdate {
        if self.state != ConnectionState::Subscribed {
            return FeedUpdate::Disconnected;
        }
        if self.needs_resync {
            self.needs_resync = false;
            return FeedUpdate::Resync;
        }

        loop {
            let Some(receiver) = self.receiver.as_mut() else {
                self.disconnect();
                return FeedUpdate::Disconnected;
            };
            let message = receiver.recv().await;
            match message {
                Ok(FeedMessage::Event(event)) if self.topics.contains(&event.topic) => {
                    return FeedUpdate::Invalidate(event);
                }
                Ok(FeedMessage::Event(_)) => continue,
                Ok(FeedMessage::Resync) => return FeedUpdate::Resync,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Subscriber lagged by {} events", skipped);
                    return FeedUpdate::Resync;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.disconnect();
                    return FeedUpdate::Disconnected;
                }
            }
        }
    }
}
