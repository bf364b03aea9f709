//! Triage dispatcher: turns one history cursor into labelled, notified mail.
//!
//! Flow per message id:
//! 1. Fetch from the mail store
//! 2. Classify urgency (ML + heuristics)
//! 3. Urgent: summarize, apply the urgent label, notify
//!    Not urgent: use the snippet as summary, nothing else
//!
//! Messages are processed sequentially. A failure on one message is logged
//! and recorded in the [`BatchReport`]; it never aborts the batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::TriageError;
use crate::pipeline::classifier::{UrgencyClassifier, build_urgency_input};
use crate::pipeline::history::HistoryResolver;
use crate::pipeline::summarizer::{Summarizer, build_summary_input};
use crate::pipeline::types::{
    AnalyzedEmail, BatchReport, EmailMessage, HistoryHandler, MailStore, NotificationSink,
};
use crate::pipeline::{bounded, truncate_chars};

/// Summary used for non-urgent mail without a snippet.
pub const NO_SUMMARY: &str = "No summary available.";

/// Characters of the snippet kept as the summary of non-urgent mail.
const SNIPPET_SUMMARY_CHARS: usize = 150;

pub struct TriageDispatcher {
    store: Arc<dyn MailStore>,
    sink: Arc<dyn NotificationSink>,
    resolver: HistoryResolver,
    classifier: UrgencyClassifier,
    summarizer: Summarizer,
    call_timeout: Option<Duration>,
}

impl TriageDispatcher {
    pub fn new(
        store: Arc<dyn MailStore>,
        sink: Arc<dyn NotificationSink>,
        classifier: UrgencyClassifier,
        summarizer: Summarizer,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            resolver: HistoryResolver::new(store.clone(), call_timeout),
            store,
            sink,
            classifier,
            summarizer,
            call_timeout,
        }
    }

    pub fn classifier(&self) -> &UrgencyClassifier {
        &self.classifier
    }

    /// Triage every message added since `history_id`.
    ///
    /// Only a failed history lookup is an `Err`; per-message failures end up
    /// in [`BatchReport::failed`].
    pub async fn on_history(&self, history_id: &str) -> Result<BatchReport, TriageError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("notification", %request_id, history_id);

        async {
            let delta = self.resolver.resolve(history_id).await?;
            let mut report = BatchReport::new(history_id);
            report.resolved = delta.len();

            if delta.is_empty() {
                info!("No new messages for cursor");
                return Ok(report);
            }

            info!(count = delta.len(), "Processing message batch");
            for id in delta {
                match self.process_message(&id).await {
                    Ok(analyzed) => {
                        report.processed += 1;
                        if analyzed.is_urgent {
                            report.urgent += 1;
                        }
                    }
                    Err(e) => {
                        if e.is_not_found() {
                            warn!(id = %id, "Message disappeared before it could be fetched");
                        } else {
                            error!(id = %id, error = %e, "Failed to triage message");
                        }
                        report.failed.push((id, e));
                    }
                }
            }

            info!(
                processed = report.processed,
                urgent = report.urgent,
                failed = report.failed.len(),
                total = report.resolved,
                "Batch processing complete"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Run one message through fetch, classify, summarize, label and notify.
    pub async fn process_message(&self, id: &str) -> Result<AnalyzedEmail, TriageError> {
        let email = bounded(self.call_timeout, self.store.fetch_message(id))
            .await
            .map_err(|timeout| TriageError::Timeout {
                operation: "fetch",
                timeout,
            })?
            .map_err(TriageError::Fetch)?;

        debug!(id = %email.id, subject = ?email.subject, "Fetched message");

        let input = build_urgency_input(&email, self.classifier.max_input_chars());
        let decision = self.classifier.classify(&input).await;

        info!(
            id = %email.id,
            is_urgent = decision.is_urgent,
            confidence = ?decision.confidence,
            "Classified message"
        );

        if !decision.is_urgent {
            let summary = snippet_summary(&email);
            return Ok(AnalyzedEmail::new(&email, false, summary));
        }

        let text = build_summary_input(&email, self.summarizer.input_chars());
        let summary = self.summarizer.summarize(&text, true).await;
        let analyzed = AnalyzedEmail::new(&email, true, summary);

        // Notify even when labelling failed; report the first failure.
        let labelled = self.apply_label(&email.id).await;
        let notified = self.notify(&analyzed).await;

        if let Err(e) = &labelled {
            warn!(id = %email.id, error = %e, "Urgent label not applied");
        }
        labelled?;
        notified?;

        info!(id = %email.id, "Urgent message labelled and notified");
        Ok(analyzed)
    }

    async fn apply_label(&self, id: &str) -> Result<(), TriageError> {
        let applied = bounded(self.call_timeout, self.store.apply_urgent_label(id))
            .await
            .map_err(|timeout| TriageError::Timeout {
                operation: "apply label",
                timeout,
            })?
            .map_err(TriageError::Label)?;
        if applied {
            Ok(())
        } else {
            Err(TriageError::LabelRejected)
        }
    }

    async fn notify(&self, email: &AnalyzedEmail) -> Result<(), TriageError> {
        let sent = bounded(self.call_timeout, self.sink.send_urgent(email))
            .await
            .map_err(|timeout| TriageError::Timeout {
                operation: "notify",
                timeout,
            })?
            .map_err(TriageError::Notify)?;
        if sent {
            Ok(())
        } else {
            Err(TriageError::NotifyRejected)
        }
    }
}

#[async_trait]
impl HistoryHandler for TriageDispatcher {
    async fn on_history(&self, history_id: &str) -> Result<(), TriageError> {
        TriageDispatcher::on_history(self, history_id)
            .await
            .map(|_| ())
    }
}

/// Summary for non-urgent mail: the start of the snippet, as Gmail sent it.
/// Only a missing snippet gets the placeholder.
fn snippet_summary(email: &EmailMessage) -> String {
    match email.snippet.as_deref() {
        Some(snippet) => truncate_chars(snippet, SNIPPET_SUMMARY_CHARS).to_string(),
        None => NO_SUMMARY.to_string(),
    }
}
