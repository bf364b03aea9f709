//! Mail Triage: labels urgent Gmail messages and alerts Slack.

pub mod channels;
pub mod config;
pub mod error;
pub mod listener;
pub mod llm;
pub mod pipeline;
pub mod webhook;
