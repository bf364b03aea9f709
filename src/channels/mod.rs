//! External service adapters: Gmail, Cloud Pub/Sub and Slack.

pub mod gmail;
pub mod pubsub;
pub mod slack;

pub use gmail::GmailClient;
pub use pubsub::PubSubSubscription;
pub use slack::SlackNotifier;
