//! Subscription transport seam and delivery acknowledgement.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubscriptionError;
use crate::listener::payload::PubsubMessage;

/// A message pulled from the subscription, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
}

/// Pull-style subscription transport (Cloud Pub/Sub in production).
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subscription name for logging.
    fn name(&self) -> &str;

    /// Pull up to `max_messages`. An empty batch is normal.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError>;

    /// Acknowledge deliveries; they will not be redelivered.
    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError>;

    /// Request prompt redelivery.
    async fn reject(&self, ack_ids: &[String]) -> Result<(), SubscriptionError>;

    /// Push the redelivery deadline of unsettled deliveries `deadline` into the future.
    async fn extend(&self, ack_ids: &[String], deadline: Duration) -> Result<(), SubscriptionError>;
}

/// Ack ids whose deliveries are still unsettled.
#[derive(Debug, Default)]
pub struct LeaseSet {
    ids: Mutex<HashSet<String>>,
}

impl LeaseSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, ack_id: &str) {
        self.lock().insert(ack_id.to_string());
    }

    pub fn remove(&self, ack_id: &str) {
        self.lock().remove(ack_id);
    }

    /// Current ids, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Obligation to settle one delivery. Consumed by [`ack`](Self::ack) or
/// [`nack`](Self::nack).
///
/// A leased token keeps its ack id in a [`LeaseSet`] until it is settled or
/// dropped. A token dropped without settling leaves the delivery to expire
/// and be redelivered by the subscription.
#[must_use = "a delivery must be acked or nacked"]
pub struct AckToken {
    ack_id: String,
    subscription: Arc<dyn Subscription>,
    leases: Option<Arc<LeaseSet>>,
}

impl AckToken {
    pub fn new(subscription: Arc<dyn Subscription>, ack_id: impl Into<String>) -> Self {
        Self {
            ack_id: ack_id.into(),
            subscription,
            leases: None,
        }
    }

    /// Token whose ack id stays in `leases` while it is unsettled.
    pub fn leased(
        subscription: Arc<dyn Subscription>,
        ack_id: impl Into<String>,
        leases: Arc<LeaseSet>,
    ) -> Self {
        let ack_id = ack_id.into();
        leases.insert(&ack_id);
        Self {
            ack_id,
            subscription,
            leases: Some(leases),
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub async fn ack(self) -> Result<(), SubscriptionError> {
        self.release();
        self.subscription
            .acknowledge(std::slice::from_ref(&self.ack_id))
            .await
    }

    pub async fn nack(self) -> Result<(), SubscriptionError> {
        self.release();
        self.subscription
            .reject(std::slice::from_ref(&self.ack_id))
            .await
    }

    fn release(&self) {
        if let Some(leases) = &self.leases {
            leases.remove(&self.ack_id);
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckToken")
            .field("ack_id", &self.ack_id)
            .field("subscription", &self.subscription.name())
            .finish()
    }
}
