//! Hugging Face Inference API backend.
//!
//! Classification: `POST {base}/models/{model}` with `{"inputs": text}`,
//! answering `[{label, score}, ..]` or `[[{label, score}, ..]]`.
//! Summarization: same endpoint shape, answering `[{summary_text}]`.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::BackendError;
use crate::pipeline::types::{Classification, ClassifierBackend};

const BACKEND_NAME: &str = "huggingface";

pub struct HuggingFaceBackend {
    client: reqwest::Client,
    api_base: String,
    api_token: Option<SecretString>,
    urgency_model: Option<String>,
    summarization_model: Option<String>,
}

impl HuggingFaceBackend {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            urgency_model: config.urgency_model.clone(),
            summarization_model: config.summarization_model.clone(),
        }
    }

    async fn infer<T: serde::de::DeserializeOwned>(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<T, BackendError> {
        let mut request = self
            .client
            .post(format!("{}/models/{model}", self.api_base))
            .json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await.map_err(|e| BackendError::Transport {
            backend: BACKEND_NAME.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth {
                    backend: BACKEND_NAME.to_string(),
                },
                _ => BackendError::Transport {
                    backend: BACKEND_NAME.to_string(),
                    reason: format!("{model} returned {status}: {text}"),
                },
            });
        }

        resp.json().await.map_err(|e| invalid(e.to_string()))
    }
}

fn invalid(reason: impl Into<String>) -> BackendError {
    BackendError::InvalidResponse {
        backend: BACKEND_NAME.to_string(),
        reason: reason.into(),
    }
}

/// Classification output comes flat or nested one level, depending on the task.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassificationOutput {
    Flat(Vec<Classification>),
    Nested(Vec<Vec<Classification>>),
}

impl ClassificationOutput {
    /// Highest-scoring label.
    fn top(self) -> Option<Classification> {
        let labels = match self {
            Self::Flat(labels) => labels,
            Self::Nested(batches) => batches.into_iter().next().unwrap_or_default(),
        };
        labels
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

#[derive(Debug, Deserialize)]
struct SummaryOutput {
    summary_text: String,
}

#[async_trait]
impl ClassifierBackend for HuggingFaceBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn classify(&self, text: &str) -> Result<Classification, BackendError> {
        let model = self
            .urgency_model
            .as_deref()
            .ok_or_else(|| BackendError::NotConfigured("urgency classification".into()))?;

        let output: ClassificationOutput = self
            .infer(
                model,
                json!({ "inputs": text, "options": { "wait_for_model": true } }),
            )
            .await?;
        let top = output.top().ok_or_else(|| invalid("empty classification result"))?;
        debug!(model, label = %top.label, score = top.score, "Urgency model answered");
        Ok(top)
    }

    async fn summarize(
        &self,
        text: &str,
        max_len: usize,
        min_len: usize,
    ) -> Result<String, BackendError> {
        let model = self
            .summarization_model
            .as_deref()
            .ok_or_else(|| BackendError::NotConfigured("summarization".into()))?;

        let output: Vec<SummaryOutput> = self
            .infer(
                model,
                json!({
                    "inputs": text,
                    "parameters": {
                        "max_length": max_len,
                        "min_length": min_len,
                        "do_sample": false,
                    },
                    "options": { "wait_for_model": true },
                }),
            )
            .await?;
        output
            .into_iter()
            .next()
            .map(|s| s.summary_text)
            .ok_or_else(|| invalid("empty summarization result"))
    }
}
