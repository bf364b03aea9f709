//! Summaries for urgent mail.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::BackendError;
use crate::pipeline::types::{ClassifierBackend, EmailMessage};
use crate::pipeline::{bounded, truncate_chars};

/// Returned when no summary can be produced at all.
pub const SUMMARY_UNAVAILABLE: &str = "Summary not available.";

/// Target summary length passed to the backend.
pub const SUMMARY_MAX_LENGTH: usize = 150;
pub const SUMMARY_MIN_LENGTH: usize = 30;

/// Texts with fewer words than this are returned as-is unless forced.
const SHORT_TEXT_WORDS: usize = 20;

/// Length of the raw-text fallback when the backend fails.
const FALLBACK_CHARS: usize = 1000;

/// Subjects used as summary input are capped at this many characters.
const SUBJECT_INPUT_CHARS: usize = 1024;

/// Pick the text to summarize: the plain-text body, or the subject when the
/// body is empty.
pub fn build_summary_input(email: &EmailMessage, body_chars: usize) -> String {
    let body = email.body_plain.as_deref().unwrap_or("").trim();
    if !body.is_empty() {
        return truncate_chars(body, body_chars).to_string();
    }
    let subject = email.subject.as_deref().unwrap_or("").trim();
    truncate_chars(subject, SUBJECT_INPUT_CHARS).to_string()
}

fn fallback(text: &str) -> String {
    let truncated = truncate_chars(text, FALLBACK_CHARS);
    if truncated.len() < text.len() {
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

pub struct Summarizer {
    backend: Option<Arc<dyn ClassifierBackend>>,
    call_timeout: Option<Duration>,
    input_chars: usize,
}

impl Summarizer {
    pub fn new(
        backend: Option<Arc<dyn ClassifierBackend>>,
        input_chars: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            call_timeout,
            input_chars,
        }
    }

    /// Summarizer without a backend; always yields the placeholder.
    pub fn disabled() -> Self {
        Self::new(None, 4096, None)
    }

    /// Character cap applied to email bodies by [`build_summary_input`].
    pub fn input_chars(&self) -> usize {
        self.input_chars
    }

    /// Summarize `text`. With `force = false`, short texts skip the backend.
    pub async fn summarize(&self, text: &str, force: bool) -> String {
        let Some(backend) = &self.backend else {
            return SUMMARY_UNAVAILABLE.to_string();
        };
        if text.is_empty() {
            return SUMMARY_UNAVAILABLE.to_string();
        }

        let words = text.split_whitespace().count();
        if !force && words < SHORT_TEXT_WORDS {
            debug!(words, "Text too short to summarize, returning as-is");
            return text.to_string();
        }

        let result = match bounded(
            self.call_timeout,
            backend.summarize(text, SUMMARY_MAX_LENGTH, SUMMARY_MIN_LENGTH),
        )
        .await
        {
            Ok(result) => result,
            Err(limit) => Err(BackendError::Timeout(limit)),
        };

        match result {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => {
                warn!(backend = backend.name(), "Backend returned an empty summary, using raw text");
                fallback(text)
            }
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "Summarization failed, using raw text");
                fallback(text)
            }
        }
    }
}
