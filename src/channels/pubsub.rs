//! Cloud Pub/Sub pull subscription over the REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::PubSubConfig;
use crate::error::SubscriptionError;
use crate::listener::{ReceivedMessage, Subscription};

pub struct PubSubSubscription {
    client: reqwest::Client,
    api_base: String,
    path: String,
    access_token: SecretString,
}

impl PubSubSubscription {
    pub fn new(config: &PubSubConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            path: config.subscription_path(),
            access_token: config.access_token.clone(),
        }
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, SubscriptionError> {
        let resp = self
            .client
            .post(format!("{}/{}:{method}", self.api_base, self.path))
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| SubscriptionError::Transport {
                subscription: self.path.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SubscriptionError::Auth {
                subscription: self.path.clone(),
            },
            _ => SubscriptionError::Transport {
                subscription: self.path.clone(),
                reason: format!("{method} returned {status}: {text}"),
            },
        })
    }

    async fn modify_deadline(&self, ack_ids: &[String], seconds: u64) -> Result<(), SubscriptionError> {
        self.call(
            "modifyAckDeadline",
            json!({ "ackIds": ack_ids, "ackDeadlineSeconds": seconds }),
        )
        .await
        .map(|_| ())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[async_trait]
impl Subscription for PubSubSubscription {
    fn name(&self) -> &str {
        &self.path
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        let resp = self.call("pull", json!({ "maxMessages": max_messages })).await?;
        let pulled: PullResponse =
            resp.json()
                .await
                .map_err(|e| SubscriptionError::InvalidResponse {
                    subscription: self.path.clone(),
                    reason: e.to_string(),
                })?;
        Ok(pulled.received_messages)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.call("acknowledge", json!({ "ackIds": ack_ids })).await?;
        debug!(count = ack_ids.len(), "Acknowledged deliveries");
        Ok(())
    }

    async fn reject(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        // A zero deadline makes the messages immediately available again
        self.modify_deadline(ack_ids, 0).await?;
        debug!(count = ack_ids.len(), "Rejected deliveries");
        Ok(())
    }

    async fn extend(&self, ack_ids: &[String], deadline: Duration) -> Result<(), SubscriptionError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.modify_deadline(ack_ids, deadline.as_secs().max(1)).await?;
        debug!(count = ack_ids.len(), deadline_secs = deadline.as_secs(), "Extended delivery leases");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::post;
    use axum::Json;
    use serde_json::Value;

    use super::*;
    use crate::listener::decode_message;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    async fn handle(
        State(calls): State<Calls>,
        Path(action): Path<String>,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, HttpStatus> {
        calls.lock().unwrap().push((action.clone(), body));
        if action.starts_with("denied") {
            return Err(HttpStatus::FORBIDDEN);
        }
        if action.ends_with(":pull") {
            return Ok(Json(json!({
                "receivedMessages": [{
                    "ackId": "ack-1",
                    "message": {
                        "data": "eyJlbWFpbEFkZHJlc3MiOiJtZUBleGFtcGxlLmNvbSIsImhpc3RvcnlJZCI6IjQyIn0=",
                        "messageId": "m-1",
                        "publishTime": "2024-06-05T10:30:00Z"
                    }
                }]
            })));
        }
        Ok(Json(json!({})))
    }

    async fn serve(subscription_id: &str) -> (PubSubSubscription, Calls) {
        let calls: Calls = Arc::default();
        let app = Router::new()
            .route("/projects/proj/subscriptions/{action}", post(handle))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let config = PubSubConfig {
            project_id: "proj".into(),
            topic_id: "gmail".into(),
            subscription_id: subscription_id.into(),
            access_token: SecretString::from("token"),
            api_base: format!("http://{addr}"),
            max_messages: 5,
            poll_interval: Duration::from_millis(10),
        };
        (PubSubSubscription::new(&config), calls)
    }

    #[tokio::test]
    async fn pull_decodes_received_messages() {
        let (sub, calls) = serve("gmail-sub").await;
        let messages = sub.pull(5).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ack_id, "ack-1");
        let event = decode_message(&messages[0].message).unwrap();
        assert_eq!(event.history_id, "42");

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, "gmail-sub:pull");
        assert_eq!(calls[0].1["maxMessages"], 5);
    }

    #[tokio::test]
    async fn ack_and_reject() {
        let (sub, calls) = serve("gmail-sub").await;
        sub.acknowledge(&["a".into(), "b".into()]).await.unwrap();
        sub.reject(&["c".into()]).await.unwrap();
        sub.acknowledge(&[]).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "gmail-sub:acknowledge");
        assert_eq!(calls[0].1["ackIds"], json!(["a", "b"]));
        assert_eq!(calls[1].0, "gmail-sub:modifyAckDeadline");
        assert_eq!(calls[1].1["ackDeadlineSeconds"], 0);
    }

    #[tokio::test]
    async fn extend_sets_positive_deadline() {
        let (sub, calls) = serve("gmail-sub").await;
        sub.extend(&["a".into(), "b".into()], Duration::from_secs(60))
            .await
            .unwrap();
        sub.extend(&[], Duration::from_secs(60)).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "gmail-sub:modifyAckDeadline");
        assert_eq!(calls[0].1["ackIds"], json!(["a", "b"]));
        assert_eq!(calls[0].1["ackDeadlineSeconds"], 60);
    }

    #[tokio::test]
    async fn forbidden_is_auth_error() {
        let (sub, _) = serve("denied-sub").await;
        assert!(matches!(
            sub.pull(1).await.unwrap_err(),
            SubscriptionError::Auth { .. }
        ));
    }
}
