//! Shared types for the triage pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, MailStoreError, NotifyError, TriageError};

// ── Email ───────────────────────────────────────────────────────────

/// A message fetched from the mail store.
///
/// Owned by whoever fetched it; the pipeline never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    pub thread_id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub snippet: Option<String>,
}

/// An email merged with its triage outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedEmail {
    #[serde(flatten)]
    pub email: EmailMessage,
    pub is_urgent: bool,
    pub summary: String,
}

impl AnalyzedEmail {
    pub fn new(email: &EmailMessage, is_urgent: bool, summary: String) -> Self {
        Self {
            email: email.clone(),
            is_urgent,
            summary,
        }
    }
}

// ── Urgency ─────────────────────────────────────────────────────────

/// Raw output of a classification backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

/// How the ML signal took part in an urgency decision.
#[derive(Debug, Clone, PartialEq)]
pub enum MlSignal {
    /// Backend answered; its verdict was fused with the heuristic.
    Used {
        label: String,
        score: f64,
        urgent: bool,
    },
    /// No backend configured, or the input was empty.
    Absent,
    /// Backend failed or its circuit is open; heuristic used alone.
    Degraded,
}

/// Fused urgency verdict for one piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct UrgencyDecision {
    pub is_urgent: bool,
    /// 0..1, `None` only for empty input.
    pub confidence: Option<f64>,
    pub ml_signal: MlSignal,
}

impl UrgencyDecision {
    /// Decision for empty input: not urgent, no confidence.
    pub fn empty() -> Self {
        Self {
            is_urgent: false,
            confidence: None,
            ml_signal: MlSignal::Absent,
        }
    }
}

// ── Notifications & history ─────────────────────────────────────────

/// Decoded mailbox change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub email_address: String,
    pub history_id: String,
}

/// One history record as reported by the mail store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: String,
    /// Ids of messages added in this record, in store order.
    pub messages_added: Vec<String>,
}

/// Distinct message ids added since a cursor, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryDelta {
    ids: Vec<String>,
}

impl HistoryDelta {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<String> for HistoryDelta {
    /// Keeps the first occurrence of each id.
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut seen = std::collections::HashSet::new();
        let ids = iter
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Self { ids }
    }
}

impl IntoIterator for HistoryDelta {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

// ── Batch outcome ───────────────────────────────────────────────────

/// Outcome of triaging one notification.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub history_id: String,
    /// Ids in the resolved delta.
    pub resolved: usize,
    /// Messages that reached the end of the pipeline.
    pub processed: usize,
    /// Of the processed messages, how many were urgent.
    pub urgent: usize,
    /// Messages that failed, with the reason.
    pub failed: Vec<(String, TriageError)>,
}

impl BatchReport {
    pub fn new(history_id: &str) -> Self {
        Self {
            history_id: history_id.to_string(),
            ..Default::default()
        }
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Mail store (Gmail) operations the pipeline depends on.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Fetch a single message.
    async fn fetch_message(&self, id: &str) -> Result<EmailMessage, MailStoreError>;

    /// Add the urgent label. Must be safe to repeat.
    async fn apply_urgent_label(&self, id: &str) -> Result<bool, MailStoreError>;

    /// Message-added history since `history_id`. Empty when nothing changed.
    async fn get_history(&self, history_id: &str) -> Result<Vec<HistoryRecord>, MailStoreError>;

    /// Start push notifications for the mailbox.
    async fn register_push(&self) -> Result<bool, MailStoreError>;

    /// Stop push notifications for the mailbox.
    async fn unregister_push(&self) -> Result<bool, MailStoreError>;
}

/// Where urgent-mail alerts go (Slack).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver an alert. Duplicates are tolerated.
    async fn send_urgent(&self, email: &AnalyzedEmail) -> Result<bool, NotifyError>;
}

/// Pluggable ML backend for classification and summarization.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    async fn classify(&self, text: &str) -> Result<Classification, BackendError>;

    async fn summarize(
        &self,
        text: &str,
        max_len: usize,
        min_len: usize,
    ) -> Result<String, BackendError>;
}

/// Receives history cursors from the notification listener.
///
/// May be invoked concurrently with itself.
#[async_trait]
pub trait HistoryHandler: Send + Sync {
    async fn on_history(&self, history_id: &str) -> Result<(), TriageError>;
}
