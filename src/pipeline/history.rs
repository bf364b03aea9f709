//! Expands a history cursor into the distinct message ids added since it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::TriageError;
use crate::pipeline::bounded;
use crate::pipeline::types::{HistoryDelta, MailStore};

pub struct HistoryResolver {
    store: Arc<dyn MailStore>,
    call_timeout: Option<Duration>,
}

impl HistoryResolver {
    pub fn new(store: Arc<dyn MailStore>, call_timeout: Option<Duration>) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Message ids added since `history_id`, deduplicated across records.
    ///
    /// An empty history is not an error.
    pub async fn resolve(&self, history_id: &str) -> Result<HistoryDelta, TriageError> {
        let records = bounded(self.call_timeout, self.store.get_history(history_id))
            .await
            .map_err(|timeout| TriageError::Timeout {
                operation: "history lookup",
                timeout,
            })?
            .map_err(|source| TriageError::History {
                history_id: history_id.to_string(),
                source,
            })?;

        if records.is_empty() {
            debug!(history_id, "No history records since cursor");
            return Ok(HistoryDelta::default());
        }

        let record_count = records.len();
        let delta: HistoryDelta = records
            .into_iter()
            .flat_map(|record| record.messages_added)
            .collect();

        info!(
            history_id,
            records = record_count,
            messages = delta.len(),
            "Resolved history"
        );
        Ok(delta)
    }
}
