//! Pub/Sub push payloads carrying Gmail mailbox notifications.
//!
//! The message `data` is base64 of `{"emailAddress": "...", "historyId": ...}`.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::pipeline::types::NotificationEvent;

/// Body of a Pub/Sub push request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushEnvelope {
    #[serde(default)]
    pub message: Option<PubsubMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// A Pub/Sub message, as found in push envelopes and pull responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub attributes: Option<HashMap<String, String>>,
    #[serde(default)]
    pub publish_time: Option<String>,
}

impl PubsubMessage {
    /// Message whose data is the base64 of `payload`.
    pub fn with_payload(payload: &[u8]) -> Self {
        Self {
            data: Some(STANDARD.encode(payload)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailNotification {
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    history_id: Option<HistoryId>,
}

/// Gmail sends `historyId` as a number; some relays stringify it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryId {
    Text(String),
    Number(u64),
}

impl HistoryId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => n.to_string(),
        }
    }
}

/// Decode a push envelope into a notification event.
pub fn decode_envelope(envelope: &PushEnvelope) -> Result<NotificationEvent, PayloadError> {
    let message = envelope
        .message
        .as_ref()
        .ok_or(PayloadError::MissingMessage)?;
    decode_message(message)
}

/// Decode a single Pub/Sub message into a notification event.
pub fn decode_message(message: &PubsubMessage) -> Result<NotificationEvent, PayloadError> {
    let data = message
        .data
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(PayloadError::MissingData)?;
    decode_data(data)
}

/// Decode base64 message data into a notification event.
pub fn decode_data(data: &str) -> Result<NotificationEvent, PayloadError> {
    let bytes = match STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(e) => URL_SAFE.decode(data).map_err(|_| e)?,
    };
    let text = String::from_utf8(bytes)?;
    let notification: GmailNotification = serde_json::from_str(&text)?;

    let email_address = notification
        .email_address
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(PayloadError::MissingField("emailAddress"))?;
    let history_id = notification
        .history_id
        .map(HistoryId::into_string)
        .filter(|s| !s.is_empty())
        .ok_or(PayloadError::MissingField("historyId"))?;

    Ok(NotificationEvent {
        email_address,
        history_id,
    })
}
