//! Notification collaborator
//!
//! Delivery is best effort: the submission pipeline records the outcome on
//! the receipt and never fails a ballot because a message did not go out.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Template sent after a ballot is accepted
pub const BALLOT_CONFIRMATION: &str = "ballot_confirmation";

/// What the delivery channel reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Delivered,
    Queued,
    Rejected { reason: String },
}

impl DeliveryStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Delivered | Self::Queued)
    }
}

/// Outbound message channel (SMS gateway or similar)
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        contact_address: &str,
        template_key: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryStatus>;
}

/// Writes notifications to the log instead of sending them
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        contact_address: &str,
        template_key: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryStatus> {
        tracing::info!(
            "📨 Notification {} to {} ({} variables)",
            template_key,
            mask_contact(contact_address),
            variables.len()
        );
        Ok(DeliveryStatus::Queued)
    }
}

/// A message captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub contact_address: String,
    pub template_key: String,
    pub variables: BTreeMap<String, String>,
}

/// Keeps every message in memory, optionally failing each send
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose channel is down
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        contact_address: &str,
        template_key: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryStatus> {
        if self.fail {
            return Err(Error::notification("gateway unreachable"));
        }
        self.sent
            .lock()
            .map_err(|_| Error::internal("Notification log lock error"))?
            .push(SentNotification {
                contact_address: contact_address.to_string(),
                template_key: template_key.to_string(),
                variables: variables.clone(),
            });
        Ok(DeliveryStatus::Delivered)
    }
}

/// Keep only the last three characters of a contact address for logs
pub fn mask_contact(contact: &str) -> String {
    let visible: String = contact
        .chars()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{visible}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        let mut variables = BTreeMap::new();
        variables.insert("name".to_string(), "Jane".to_string());

        let status = notifier
            .send("+254700000001", BALLOT_CONFIRMATION, &variables)
            .await
            .unwrap();
        assert!(status.is_accepted());
        assert_eq!(notifier.sent().len(), 1);

        let failing = RecordingNotifier::failing();
        assert!(failing.send("+254700000001", BALLOT_CONFIRMATION, &variables).await.is_err());
    }

    #[test]
    fn test_log_notifier_queues() {
        let status = tokio_test::block_on(LogNotifier.send(
            "+254700000001",
            BALLOT_CONFIRMATION,
            &BTreeMap::new(),
        ))
        .unwrap();
        assert_eq!(status, DeliveryStatus::Queued);
    }

    #[test]
    fn test_mask_contact() {
        assert_eq!(mask_contact("+254700000123"), "***123");
        assert_eq!(mask_contact("12"), "***12");
    }
}
