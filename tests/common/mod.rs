//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use mail_triage::error::{BackendError, MailStoreError, NotifyError, SubscriptionError};
use mail_triage::listener::{PubsubMessage, ReceivedMessage, Subscription};
use mail_triage::pipeline::types::{
    AnalyzedEmail, Classification, ClassifierBackend, EmailMessage, HistoryRecord, MailStore,
    NotificationSink,
};

/// Upper bound for anything a test awaits.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn email(id: &str, subject: &str, body: &str) -> EmailMessage {
    EmailMessage {
        id: id.into(),
        thread_id: format!("thread-{id}"),
        subject: Some(subject.into()),
        sender: Some("alerts@example.com".into()),
        body_plain: Some(body.into()),
        body_html: None,
        received_at: Utc::now(),
        snippet: Some(body.chars().take(40).collect()),
    }
}

// ── Mail store ──────────────────────────────────────────────────────

/// Mailbox keyed by history cursor.
#[derive(Default)]
pub struct MemoryStore {
    pub history: HashMap<String, Vec<HistoryRecord>>,
    pub messages: HashMap<String, EmailMessage>,
    pub history_down: bool,
    pub labelled: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// One history record per cursor, adding `emails`.
    pub fn with_cursor(mut self, history_id: &str, emails: Vec<EmailMessage>) -> Self {
        self.history.insert(
            history_id.into(),
            vec![HistoryRecord {
                id: history_id.into(),
                messages_added: emails.iter().map(|e| e.id.clone()).collect(),
            }],
        );
        self.messages
            .extend(emails.into_iter().map(|e| (e.id.clone(), e)));
        self
    }

    pub fn labelled(&self) -> Vec<String> {
        self.labelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn fetch_message(&self, id: &str) -> Result<EmailMessage, MailStoreError> {
        self.messages
            .get(id)
            .cloned()
            .ok_or_else(|| MailStoreError::NotFound { id: id.into() })
    }

    async fn apply_urgent_label(&self, id: &str) -> Result<bool, MailStoreError> {
        self.labelled.lock().unwrap().push(id.to_string());
        Ok(true)
    }

    async fn get_history(&self, history_id: &str) -> Result<Vec<HistoryRecord>, MailStoreError> {
        if self.history_down {
            return Err(MailStoreError::Transport("500 Internal Server Error".into()));
        }
        Ok(self.history.get(history_id).cloned().unwrap_or_default())
    }

    async fn register_push(&self) -> Result<bool, MailStoreError> {
        Ok(true)
    }

    async fn unregister_push(&self) -> Result<bool, MailStoreError> {
        Ok(true)
    }
}

// ── Notification sink ───────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<AnalyzedEmail>>,
}

impl RecordingSink {
    pub fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.email.id.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_urgent(&self, email: &AnalyzedEmail) -> Result<bool, NotifyError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(true)
    }
}

// ── ML backend ──────────────────────────────────────────────────────

/// Always answers the same label and summary.
pub struct FixedBackend {
    pub label: &'static str,
    pub score: f64,
    pub summary: &'static str,
}

#[async_trait]
impl ClassifierBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn classify(&self, _text: &str) -> Result<Classification, BackendError> {
        Ok(Classification {
            label: self.label.into(),
            score: self.score,
        })
    }

    async fn summarize(&self, _: &str, _: usize, _: usize) -> Result<String, BackendError> {
        Ok(self.summary.into())
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// Hands out scripted batches, then empty pulls.
#[derive(Default)]
pub struct ScriptedSubscription {
    batches: Mutex<VecDeque<Vec<ReceivedMessage>>>,
    pub acked: Mutex<Vec<String>>,
    pub rejected: Mutex<Vec<String>>,
    pub extended: Mutex<Vec<String>>,
}

impl ScriptedSubscription {
    pub fn with_batch(self, batch: Vec<ReceivedMessage>) -> Self {
        self.batches.lock().unwrap().push_back(batch);
        self
    }

    pub fn settled(&self) -> usize {
        self.acked.lock().unwrap().len() + self.rejected.lock().unwrap().len()
    }
}

/// Delivery carrying a Gmail notification for `history_id`.
pub fn delivery(ack_id: &str, history_id: &str) -> ReceivedMessage {
    let payload = format!(r#"{{"emailAddress":"me@example.com","historyId":"{history_id}"}}"#);
    ReceivedMessage {
        ack_id: ack_id.into(),
        message: PubsubMessage::with_payload(payload.as_bytes()),
    }
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    fn name(&self) -> &str {
        "projects/test/subscriptions/gmail"
    }

    async fn pull(&self, _max: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        self.acked.lock().unwrap().extend_from_slice(ack_ids);
        Ok(())
    }

    async fn reject(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        self.rejected.lock().unwrap().extend_from_slice(ack_ids);
        Ok(())
    }

    async fn extend(&self, ack_ids: &[String], _deadline: Duration) -> Result<(), SubscriptionError> {
        self.extended.lock().unwrap().extend_from_slice(ack_ids);
        Ok(())
    }
}
