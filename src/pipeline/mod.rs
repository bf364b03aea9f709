//! Email triage pipeline.
//!
//! Every mailbox change notification flows through:
//! 1. `HistoryResolver::resolve()`: cursor to distinct message ids
//! 2. `UrgencyClassifier::classify()`: ML verdict fused with heuristics
//! 3. `Summarizer::summarize()`: urgent mail only
//! 4. `TriageDispatcher`: label + notify, one message at a time
//!
//! A label is never removed and an urgent verdict is never downgraded by ML.

pub mod breaker;
pub mod classifier;
pub mod dispatcher;
pub mod history;
pub mod summarizer;
pub mod types;

use std::future::Future;
use std::time::Duration;

/// Await `fut`, giving up after `limit`. `None` waits forever.
///
/// The error carries the limit that was hit.
pub(crate) async fn bounded<F: Future>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        None => Ok(fut.await),
    }
}

/// Longest prefix of `text` with at most `max_chars` characters.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
