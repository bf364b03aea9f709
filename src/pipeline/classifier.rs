//! Hybrid urgency classifier.
//!
//! Two signals are combined for every non-empty input:
//! 1. An optional ML verdict from a [`ClassifierBackend`], guarded by a
//!    [`CircuitBreaker`] so a flaky model never stalls triage.
//! 2. A deterministic keyword/punctuation heuristic that always runs.
//!
//! The fusion never lets the ML verdict downgrade a heuristic hit: any text
//! containing an urgency keyword is urgent whatever the model says.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::error::BackendError;
use crate::pipeline::breaker::{BreakerState, CircuitBreaker};
use crate::pipeline::types::{ClassifierBackend, EmailMessage, MlSignal, UrgencyDecision};
use crate::pipeline::{bounded, truncate_chars};

/// Labels that always mean "not urgent".
const NEGATIVE_MARKERS: &[&str] = &[
    "not_urgent",
    "non_urgent",
    "noturgent",
    "nonurgent",
    "low",
    "normal",
];

/// Labels that always mean "urgent".
const POSITIVE_MARKERS: &[&str] = &["urgent", "high", "critical", "important"];

/// Keywords counted by the heuristic (case-insensitive substring match).
pub const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "important",
    "high priority",
    "action required",
    "critical",
    "deadline",
    "response needed",
    "reply needed",
    "time-sensitive",
];

const KEYWORD_WEIGHT: f64 = 0.2;
const EXCLAMATION_WEIGHT: f64 = 0.1;
const MAX_EXCLAMATIONS: usize = 3;
const HEURISTIC_URGENT_THRESHOLD: f64 = 0.5;

/// Build the classifier input for an email: `"Subject: ..\n\nBody: .."`,
/// trimmed and capped at `max_chars` characters.
///
/// Returns an empty string when the email has neither subject nor body.
pub fn build_urgency_input(email: &EmailMessage, max_chars: usize) -> String {
    let subject = email.subject.as_deref().unwrap_or("").trim();
    let body = email.body_plain.as_deref().unwrap_or("").trim();
    if subject.is_empty() && body.is_empty() {
        return String::new();
    }

    let combined = format!("Subject: {subject}\n\nBody: {body}");
    truncate_chars(combined.trim(), max_chars).to_string()
}

/// Map a backend label to an urgency verdict.
pub fn interpret_label(label: &str) -> bool {
    let label = label.to_lowercase();
    let trimmed = label.trim();

    if NEGATIVE_MARKERS.contains(&label.as_str()) {
        return false;
    }
    if POSITIVE_MARKERS.contains(&label.as_str()) || POSITIVE_MARKERS.contains(&trimmed) {
        return true;
    }
    label.contains("urgent") && !NEGATIVE_MARKERS.iter().any(|m| label.contains(m))
}

/// Result of the keyword heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicScore {
    pub keyword_hits: usize,
    pub exclamations: usize,
    pub score: f64,
    pub urgent: bool,
}

/// Score text by urgency keywords and exclamation marks.
pub fn heuristic(text: &str) -> HeuristicScore {
    let lowered = text.to_lowercase();
    let keyword_hits = URGENT_KEYWORDS
        .iter()
        .filter(|kw| lowered.contains(*kw))
        .count();
    let exclamations = lowered.matches('!').count().min(MAX_EXCLAMATIONS);

    let score = (keyword_hits as f64 * KEYWORD_WEIGHT + exclamations as f64 * EXCLAMATION_WEIGHT)
        .min(1.0);

    HeuristicScore {
        keyword_hits,
        exclamations,
        score,
        urgent: keyword_hits > 0 || score >= HEURISTIC_URGENT_THRESHOLD,
    }
}

/// Fuse the heuristic with an optional ML verdict `(urgent, score)`.
pub fn fuse(heuristic: &HeuristicScore, ml: Option<(bool, f64)>) -> (bool, f64) {
    match ml {
        None => (heuristic.urgent, heuristic.score),
        Some((ml_urgent, ml_score)) => (
            ml_urgent || heuristic.urgent,
            ml_score.max(heuristic.score),
        ),
    }
}

/// Scores outside 0..1 (or NaN) are clamped so the confidence stays a probability.
fn sanitize_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Hybrid ML + heuristic urgency classifier.
pub struct UrgencyClassifier {
    backend: Option<Arc<dyn ClassifierBackend>>,
    breaker: CircuitBreaker,
    call_timeout: Option<Duration>,
    max_input_chars: usize,
}

impl UrgencyClassifier {
    /// Create a classifier. `backend = None` means heuristics only.
    pub fn new(
        backend: Option<Arc<dyn ClassifierBackend>>,
        config: &ClassifierConfig,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(
                "urgency-classifier",
                config.failure_threshold,
                config.breaker_cooldown,
            ),
            call_timeout,
            max_input_chars: config.max_input_chars,
        }
    }

    /// Heuristics-only classifier.
    pub fn heuristic_only(config: &ClassifierConfig) -> Self {
        Self::new(None, config, None)
    }

    pub fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Classify text for urgency.
    pub async fn classify(&self, text: &str) -> UrgencyDecision {
        let text = truncate_chars(text.trim(), self.max_input_chars);
        if text.is_empty() {
            debug!("Empty text for urgency analysis, returning not urgent");
            return UrgencyDecision::empty();
        }

        let ml_signal = self.ml_signal(text).await;
        let heuristic = heuristic(text);

        let ml = match &ml_signal {
            MlSignal::Used { urgent, score, .. } => Some((*urgent, *score)),
            MlSignal::Absent | MlSignal::Degraded => None,
        };
        let (is_urgent, confidence) = fuse(&heuristic, ml);

        debug!(
            keyword_hits = heuristic.keyword_hits,
            exclamations = heuristic.exclamations,
            heuristic_score = heuristic.score,
            ml = ?ml_signal,
            is_urgent,
            confidence,
            "Urgency decision"
        );

        UrgencyDecision {
            is_urgent,
            confidence: Some(confidence),
            ml_signal,
        }
    }

    async fn ml_signal(&self, text: &str) -> MlSignal {
        let Some(backend) = &self.backend else {
            return MlSignal::Absent;
        };
        if !self.breaker.try_acquire() {
            debug!("Classifier circuit open, skipping ML signal");
            return MlSignal::Degraded;
        }

        let result = match bounded(self.call_timeout, backend.classify(text)).await {
            Ok(result) => result,
            Err(limit) => Err(BackendError::Timeout(limit)),
        };

        match result {
            Ok(classification) => {
                self.breaker.record_success();
                let score = sanitize_score(classification.score);
                MlSignal::Used {
                    urgent: interpret_label(&classification.label),
                    label: classification.label,
                    score,
                }
            }
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "ML urgency analysis failed, using heuristics");
                self.breaker.record_failure();
                MlSignal::Degraded
            }
        }
    }
}
