//! Error types for mail-triage.

use std::time::Duration;

/// Errors that stop the service binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mail store error: {0}")]
    MailStore(#[from] MailStoreError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the mail store (Gmail) collaborator.
#[derive(Debug, thiserror::Error)]
pub enum MailStoreError {
    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Mail store request failed: {0}")]
    Transport(String),

    #[error("Mail store authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response from mail store: {0}")]
    InvalidResponse(String),
}

/// Errors from the notification sink (Slack) collaborator.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Transport(String),

    #[error("Notification sink authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response from notification sink: {0}")]
    InvalidResponse(String),
}

/// Errors from the classification/summarization backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {backend} request failed: {reason}")]
    Transport { backend: String, reason: String },

    #[error("Authentication failed for backend {backend}")]
    Auth { backend: String },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("No model configured for {0}")]
    NotConfigured(String),
}

/// Errors from the push-notification subscription transport.
///
/// Any of these ends the listening loop.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Subscription {subscription} transport failed: {reason}")]
    Transport {
        subscription: String,
        reason: String,
    },

    #[error("Authentication failed for subscription {subscription}")]
    Auth { subscription: String },

    #[error("Invalid response from subscription {subscription}: {reason}")]
    InvalidResponse {
        subscription: String,
        reason: String,
    },
}

/// Malformed push payloads. These are never retried.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Push envelope is missing the 'message' field")]
    MissingMessage,

    #[error("Push message is missing the 'data' field")]
    MissingData,

    #[error("Message data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Message data is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Message data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Notification is missing required field '{0}'")]
    MissingField(&'static str),
}

/// Errors raised while triaging one notification or one message.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("History lookup for {history_id} failed: {source}")]
    History {
        history_id: String,
        source: MailStoreError,
    },

    #[error("Fetch failed: {0}")]
    Fetch(MailStoreError),

    #[error("Applying urgent label failed: {0}")]
    Label(MailStoreError),

    #[error("Mail store refused the urgent label")]
    LabelRejected,

    #[error("Sending notification failed: {0}")]
    Notify(NotifyError),

    #[error("Notification sink did not deliver the notification")]
    NotifyRejected,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl TriageError {
    /// True when the message no longer exists in the mail store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fetch(MailStoreError::NotFound { .. }))
    }
}
