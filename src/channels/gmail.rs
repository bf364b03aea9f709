//! Gmail REST client implementing [`MailStore`].
//!
//! Uses a bearer access token; obtaining and refreshing it is left to the
//! deployment (service account sidecar, gcloud, ...).

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{GmailConfig, PubSubConfig};
use crate::error::MailStoreError;
use crate::pipeline::types::{EmailMessage, HistoryRecord, MailStore};

pub struct GmailClient {
    client: reqwest::Client,
    api_base: String,
    user_id: String,
    access_token: SecretString,
    urgent_label: String,
    topic_name: String,
    urgent_label_id: OnceCell<String>,
}

impl GmailClient {
    pub fn new(gmail: &GmailConfig, pubsub: &PubSubConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: gmail.api_base.trim_end_matches('/').to_string(),
            user_id: gmail.user_id.clone(),
            access_token: gmail.access_token.clone(),
            urgent_label: gmail.urgent_label.clone(),
            topic_name: pubsub.topic_name(),
            urgent_label_id: OnceCell::new(),
        }
    }

    fn user_url(&self, path: &str) -> String {
        format!("{}/users/{}/{path}", self.api_base, self.user_id)
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, MailStoreError> {
        self.client
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| MailStoreError::Transport(e.to_string()))
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, MailStoreError> {
        self.client
            .post(url)
            .bearer_auth(self.access_token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| MailStoreError::Transport(e.to_string()))
    }

    /// Urgent label id, looked up by name once and created if missing.
    async fn urgent_label_id(&self) -> Result<&str, MailStoreError> {
        self.urgent_label_id
            .get_or_try_init(|| self.resolve_label(&self.urgent_label))
            .await
            .map(String::as_str)
    }

    async fn resolve_label(&self, name: &str) -> Result<String, MailStoreError> {
        let resp = self.get(&self.user_url("labels"), &[]).await?;
        let list: LabelList = json_body(check(resp, None).await?).await?;

        if let Some(label) = list.labels.into_iter().find(|l| l.name == name) {
            info!(label = name, id = %label.id, "Found urgent label");
            return Ok(label.id);
        }

        let body = json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let resp = self.post(&self.user_url("labels"), &body).await?;
        let created: Label = json_body(check(resp, None).await?).await?;
        info!(label = name, id = %created.id, "Created urgent label");
        Ok(created.id)
    }
}

#[async_trait]
impl MailStore for GmailClient {
    async fn fetch_message(&self, id: &str) -> Result<EmailMessage, MailStoreError> {
        let url = self.user_url(&format!("messages/{id}"));
        let resp = self.get(&url, &[("format", "full")]).await?;
        let message: GmailMessage = json_body(check(resp, Some(id)).await?).await?;
        Ok(parse_message(message, id))
    }

    async fn apply_urgent_label(&self, id: &str) -> Result<bool, MailStoreError> {
        let label_id = self.urgent_label_id().await?;
        let url = self.user_url(&format!("messages/{id}/modify"));
        let body = json!({ "addLabelIds": [label_id], "removeLabelIds": [] });
        check(self.post(&url, &body).await?, Some(id)).await?;
        info!(id, "Applied urgent label");
        Ok(true)
    }

    async fn get_history(&self, history_id: &str) -> Result<Vec<HistoryRecord>, MailStoreError> {
        let url = self.user_url("history");
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", history_id),
                ("historyTypes", "messageAdded"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let resp = self.get(&url, &query).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                // Cursor older than the mailbox keeps; nothing can be replayed
                warn!(history_id, "History cursor expired, skipping notification");
                return Ok(Vec::new());
            }
            let page: HistoryPage = json_body(check(resp, None).await?).await?;

            records.extend(page.history.into_iter().map(|h| HistoryRecord {
                id: h.id,
                messages_added: h
                    .messages_added
                    .into_iter()
                    .map(|added| added.message.id)
                    .collect(),
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(history_id, records = records.len(), "Fetched history");
        Ok(records)
    }

    async fn register_push(&self) -> Result<bool, MailStoreError> {
        let body = json!({ "labelIds": ["INBOX"], "topicName": self.topic_name });
        let resp = check(self.post(&self.user_url("watch"), &body).await?, None).await?;
        let watch: WatchResponse = json_body(resp).await?;

        let expires = watch
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        info!(
            topic = %self.topic_name,
            history_id = ?watch.history_id,
            expires = ?expires,
            "Gmail watch registered"
        );
        Ok(true)
    }

    async fn unregister_push(&self) -> Result<bool, MailStoreError> {
        check(self.post(&self.user_url("stop"), &json!({})).await?, None).await?;
        info!("Gmail watch stopped");
        Ok(true)
    }
}

/// Map HTTP failures onto [`MailStoreError`].
async fn check(
    resp: reqwest::Response,
    message_id: Option<&str>,
) -> Result<reqwest::Response, MailStoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match (status, message_id) {
        (StatusCode::NOT_FOUND, Some(id)) => MailStoreError::NotFound { id: id.to_string() },
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            MailStoreError::Auth(format!("{status}: {body}"))
        }
        _ => MailStoreError::Transport(format!("{status}: {body}")),
    })
}

async fn json_body<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, MailStoreError> {
    resp.json()
        .await
        .map_err(|e| MailStoreError::InvalidResponse(e.to_string()))
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    #[serde(default)]
    history: Vec<GmailHistory>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    #[serde(default)]
    history_id: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

// ── Message parsing ─────────────────────────────────────────────────

fn parse_message(message: GmailMessage, requested_id: &str) -> EmailMessage {
    let header = |name: &str| {
        message
            .payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };
    let subject = header("Subject");
    let sender = header("From");
    let received_at = header("Date")
        .and_then(|d| parse_date(&d))
        .or_else(|| {
            message
                .internal_date
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        })
        .unwrap_or_else(Utc::now);

    let mut body_plain = find_part(&message.payload, "text/plain");
    let body_html = find_part(&message.payload, "text/html");
    if body_plain.is_none() && body_html.is_none() {
        body_plain = message.payload.body.data.as_deref().and_then(decode_body);
    }

    let id = message.id.unwrap_or_else(|| requested_id.to_string());
    EmailMessage {
        thread_id: message.thread_id.unwrap_or_default(),
        id,
        subject,
        sender,
        body_plain,
        body_html,
        received_at,
        snippet: message.snippet,
    }
}

/// First part (depth-first) with the given MIME type and a decodable body.
fn find_part(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(mime_type)
        && let Some(text) = part.body.data.as_deref().and_then(decode_body)
    {
        return Some(text);
    }
    part.parts.iter().find_map(|p| find_part(p, mime_type))
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// RFC 2822 date, tolerating a trailing zone comment like `(UTC)`.
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.split(" (").next().unwrap_or(value).trim();
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
