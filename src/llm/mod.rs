//! ML backends for urgency classification and summarization.
//!
//! Supports:
//! - **Hugging Face Inference API** (`HuggingFaceBackend`)
//!
//! Components take an `Option<Arc<dyn ClassifierBackend>>`; `None` means
//! the component runs without ML (heuristics only, or no summaries).

pub mod huggingface;

pub use huggingface::HuggingFaceBackend;

use std::sync::Arc;

use tracing::info;

use crate::config::ClassifierConfig;
use crate::pipeline::types::ClassifierBackend;

/// Backends for the classifier and the summarizer, `None` where the
/// corresponding model is disabled.
pub struct Backends {
    pub urgency: Option<Arc<dyn ClassifierBackend>>,
    pub summarization: Option<Arc<dyn ClassifierBackend>>,
}

/// Create the ML backends from configuration.
pub fn create_backends(config: &ClassifierConfig) -> Backends {
    if config.urgency_model.is_none() && config.summarization_model.is_none() {
        info!("No ML models configured, using heuristics only");
        return Backends {
            urgency: None,
            summarization: None,
        };
    }

    let backend: Arc<dyn ClassifierBackend> = Arc::new(HuggingFaceBackend::new(config));
    match &config.urgency_model {
        Some(model) => info!("Using Hugging Face urgency model {model}"),
        None => info!("Urgency model disabled, using heuristics only"),
    }
    match &config.summarization_model {
        Some(model) => info!("Using Hugging Face summarization model {model}"),
        None => info!("Summarization model disabled"),
    }

    Backends {
        urgency: config.urgency_model.as_ref().map(|_| backend.clone()),
        summarization: config.summarization_model.as_ref().map(|_| backend),
    }
}
