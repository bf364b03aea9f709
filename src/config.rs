//! Configuration types.
//!
//! Everything is read once at startup by [`TriageConfig::from_env`] and handed
//! to component constructors. Nothing reads the environment after that.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Hugging Face model used for urgency classification.
pub const DEFAULT_URGENCY_MODEL: &str = "finityai/email-urgency-classifier";

/// Default Hugging Face model used for summarization.
pub const DEFAULT_SUMMARIZATION_MODEL: &str = "facebook/bart-large-cnn";

/// Default per-call timeout for external backends.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Gmail (mail store) settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub user_id: String,
    pub access_token: SecretString,
    /// Name of the label applied to urgent messages.
    pub urgent_label: String,
    pub api_base: String,
}

/// Cloud Pub/Sub settings (watch topic + pull subscription).
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub project_id: String,
    pub topic_id: String,
    pub subscription_id: String,
    pub access_token: SecretString,
    pub api_base: String,
    /// Upper bound on messages returned by one pull.
    pub max_messages: usize,
    /// Pause between pulls that returned nothing.
    pub poll_interval: Duration,
}

impl PubSubConfig {
    /// Fully-qualified topic name used for the Gmail watch.
    pub fn topic_name(&self) -> String {
        format!("projects/{}/topics/{}", self.project_id, self.topic_id)
    }

    /// Fully-qualified subscription path.
    pub fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project_id, self.subscription_id
        )
    }
}

/// Slack (notification sink) settings.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    pub channel_id: String,
    pub api_base: String,
}

/// Classifier backend and urgency classifier settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_token: Option<SecretString>,
    pub api_base: String,
    /// `None` disables the ML urgency signal (heuristics only).
    pub urgency_model: Option<String>,
    /// `None` disables summarization.
    pub summarization_model: Option<String>,
    /// Character cap on the text sent for urgency classification.
    pub max_input_chars: usize,
    /// Character cap on the body sent for summarization.
    pub summary_input_chars: usize,
    /// Consecutive backend failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub breaker_cooldown: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_base: "https://api-inference.huggingface.co".to_string(),
            urgency_model: Some(DEFAULT_URGENCY_MODEL.to_string()),
            summarization_model: Some(DEFAULT_SUMMARIZATION_MODEL.to_string()),
            max_input_chars: 1024,
            summary_input_chars: 4096,
            failure_threshold: 1,
            breaker_cooldown: Duration::from_secs(300),
        }
    }
}

/// Notification listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Capacity of the decoded-delivery channel.
    pub channel_capacity: usize,
    /// Maximum handler invocations running at once.
    pub max_in_flight: usize,
    /// Deadline requested each time an unsettled delivery's lease is extended.
    pub ack_deadline: Duration,
    /// How often unsettled leases are extended. Must be shorter than `ack_deadline`.
    pub lease_refresh: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            max_in_flight: 4,
            ack_deadline: Duration::from_secs(60),
            lease_refresh: Duration::from_secs(5),
        }
    }
}

/// Optional HTTP push endpoint.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub gmail: GmailConfig,
    pub pubsub: PubSubConfig,
    pub slack: SlackConfig,
    pub classifier: ClassifierConfig,
    pub listener: ListenerConfig,
    pub webhook: WebhookConfig,
    /// Timeout applied to every external call. `None` means unbounded.
    pub call_timeout: Option<Duration>,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl TriageConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let gmail_token = env.required("GMAIL_ACCESS_TOKEN")?;
        let gmail = GmailConfig {
            user_id: env.or("GMAIL_USER_ID", "me"),
            access_token: SecretString::from(gmail_token.clone()),
            urgent_label: env.or("GMAIL_LABEL_URGENT", "URGENT_AI"),
            api_base: env.or("GMAIL_API_BASE", "https://gmail.googleapis.com/gmail/v1"),
        };

        // The Pub/Sub token falls back to the Gmail token (same service account).
        let pubsub = PubSubConfig {
            project_id: env.required("GOOGLE_CLOUD_PROJECT_ID")?,
            topic_id: env.required("GOOGLE_PUBSUB_TOPIC_ID")?,
            subscription_id: env.required("GOOGLE_PUBSUB_SUBSCRIPTION_ID")?,
            access_token: SecretString::from(
                env.optional("PUBSUB_ACCESS_TOKEN").unwrap_or(gmail_token),
            ),
            api_base: env.or("PUBSUB_API_BASE", "https://pubsub.googleapis.com/v1"),
            max_messages: env.parse("PUBSUB_MAX_MESSAGES", 10)?,
            poll_interval: Duration::from_millis(env.parse("PUBSUB_POLL_INTERVAL_MS", 1000)?),
        };

        let slack = SlackConfig {
            bot_token: SecretString::from(env.required("SLACK_BOT_TOKEN")?),
            channel_id: env.required("SLACK_CHANNEL_ID")?,
            api_base: env.or("SLACK_API_BASE", "https://slack.com/api"),
        };

        let defaults = ClassifierConfig::default();
        let classifier = ClassifierConfig {
            api_token: env.optional("HF_API_TOKEN").map(SecretString::from),
            api_base: env.or("HF_API_BASE", &defaults.api_base),
            urgency_model: env.model("URGENCY_MODEL", DEFAULT_URGENCY_MODEL),
            summarization_model: env.model("SUMMARIZATION_MODEL", DEFAULT_SUMMARIZATION_MODEL),
            max_input_chars: env.parse("CLASSIFIER_MAX_INPUT_CHARS", defaults.max_input_chars)?,
            summary_input_chars: env
                .parse("SUMMARY_MAX_INPUT_CHARS", defaults.summary_input_chars)?,
            failure_threshold: env
                .parse("CLASSIFIER_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            breaker_cooldown: Duration::from_secs(env.parse(
                "CLASSIFIER_BREAKER_COOLDOWN_SECS",
                defaults.breaker_cooldown.as_secs(),
            )?),
        };

        let listener_defaults = ListenerConfig::default();
        let listener = ListenerConfig {
            channel_capacity: env
                .parse("LISTENER_CHANNEL_CAPACITY", listener_defaults.channel_capacity)?,
            max_in_flight: env.parse("LISTENER_MAX_IN_FLIGHT", listener_defaults.max_in_flight)?,
            ack_deadline: Duration::from_secs(env.parse(
                "LISTENER_ACK_DEADLINE_SECS",
                listener_defaults.ack_deadline.as_secs(),
            )?),
            lease_refresh: Duration::from_secs(env.parse(
                "LISTENER_LEASE_REFRESH_SECS",
                listener_defaults.lease_refresh.as_secs(),
            )?),
        };

        let webhook = WebhookConfig {
            enabled: env.parse("TRIAGE_WEBHOOK_ENABLED", false)?,
            port: env.parse("TRIAGE_WEBHOOK_PORT", 8080)?,
        };

        let call_timeout = match env.parse("TRIAGE_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let config = Self {
            gmail,
            pubsub,
            slack,
            classifier,
            listener,
            webhook,
            call_timeout,
            log_dir: env.optional("TRIAGE_LOG_DIR").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("PUBSUB_MAX_MESSAGES", self.pubsub.max_messages),
            ("LISTENER_CHANNEL_CAPACITY", self.listener.channel_capacity),
            ("LISTENER_MAX_IN_FLIGHT", self.listener.max_in_flight),
            ("CLASSIFIER_MAX_INPUT_CHARS", self.classifier.max_input_chars),
            ("SUMMARY_MAX_INPUT_CHARS", self.classifier.summary_input_chars),
            (
                "CLASSIFIER_FAILURE_THRESHOLD",
                self.classifier.failure_threshold as usize,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        // Pub/Sub accepts ack deadlines of 10 to 600 seconds
        let deadline = self.listener.ack_deadline.as_secs();
        if !(10..=600).contains(&deadline) {
            return Err(ConfigError::InvalidValue {
                key: "LISTENER_ACK_DEADLINE_SECS".to_string(),
                message: format!("{deadline} is outside 10..=600"),
            });
        }
        if self.listener.lease_refresh.is_zero()
            || self.listener.lease_refresh >= self.listener.ack_deadline
        {
            return Err(ConfigError::InvalidValue {
                key: "LISTENER_LEASE_REFRESH_SECS".to_string(),
                message: "must be greater than zero and below the ack deadline".to_string(),
            });
        }
        Ok(())
    }
}

/// Small helper around the lookup function.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    /// Model names: unset → default, explicit `none` → disabled.
    fn model(&self, key: &str, default: &str) -> Option<String> {
        match (self.lookup)(key) {
            None => Some(default.to_string()),
            Some(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v.trim().to_string()),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        }
    }
}
