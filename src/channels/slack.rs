//! Slack notifier: posts urgent-mail alerts via `chat.postMessage`.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::SlackConfig;
use crate::error::NotifyError;
use crate::pipeline::types::{AnalyzedEmail, NotificationSink};

pub struct SlackNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: SecretString,
    channel_id: String,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> Self {
        if !config.bot_token.expose_secret().starts_with("xoxb-") {
            warn!("Slack bot token might be invalid, expected it to start with 'xoxb-'");
        }
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Alert text for an urgent email.
pub fn format_alert(email: &AnalyzedEmail) -> String {
    let message = &email.email;
    let link_id = if message.thread_id.is_empty() {
        &message.id
    } else {
        &message.thread_id
    };
    format!(
        ":rotating_light: *Urgent Email Received* :rotating_light:\n\n\
         *From*: {}\n\
         *Subject*: {}\n\
         *Summary*: {}\n\n\
         <https://mail.google.com/mail/u/0/#inbox/{link_id}|View Email> (ID: {})",
        message.sender.as_deref().unwrap_or("N/A"),
        message.subject.as_deref().unwrap_or("N/A"),
        email.summary,
        message.id,
    )
}

#[async_trait]
impl NotificationSink for SlackNotifier {
    async fn send_urgent(&self, email: &AnalyzedEmail) -> Result<bool, NotifyError> {
        if self.channel_id.is_empty() {
            error!("Slack channel id is not configured, cannot send notification");
            return Ok(false);
        }

        let body = serde_json::json!({
            "channel": self.channel_id,
            "text": format_alert(email),
        });

        let resp = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    NotifyError::Auth(format!("{status}: {text}"))
                }
                _ => NotifyError::Transport(format!("{status}: {text}")),
            });
        }

        let reply: PostMessageResponse = resp
            .json()
            .await
            .map_err(|e| NotifyError::InvalidResponse(e.to_string()))?;

        if reply.ok {
            info!(id = %email.email.id, channel = %self.channel_id, "Sent urgent email notification");
            Ok(true)
        } else {
            error!(
                id = %email.email.id,
                slack_error = reply.error.as_deref().unwrap_or("unknown"),
                "Slack rejected notification"
            );
            Ok(false)
        }
    }
}
