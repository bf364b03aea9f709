use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_triage::channels::{GmailClient, PubSubSubscription, SlackNotifier};
use mail_triage::config::TriageConfig;
use mail_triage::error::Error;
use mail_triage::listener::NotificationListener;
use mail_triage::llm::create_backends;
use mail_triage::pipeline::classifier::UrgencyClassifier;
use mail_triage::pipeline::dispatcher::TriageDispatcher;
use mail_triage::pipeline::summarizer::Summarizer;
use mail_triage::pipeline::types::{HistoryHandler, MailStore};
use mail_triage::webhook::{WebhookState, webhook_routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = TriageConfig::from_env().map_err(Error::from).unwrap_or_else(|e| {
        eprintln!("{e}");
        eprintln!("  Required: GMAIL_ACCESS_TOKEN, GOOGLE_CLOUD_PROJECT_ID, GOOGLE_PUBSUB_TOPIC_ID,");
        eprintln!("            GOOGLE_PUBSUB_SUBSCRIPTION_ID, SLACK_BOT_TOKEN, SLACK_CHANNEL_ID");
        std::process::exit(1);
    });

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}", config.gmail.user_id);
    eprintln!("   Subscription: {}", config.pubsub.subscription_path());
    eprintln!("   Urgent label: {}", config.gmail.urgent_label);
    if config.webhook.enabled {
        eprintln!("   Push endpoint: http://0.0.0.0:{}/webhook/pubsub", config.webhook.port);
    }

    // ── Collaborators ───────────────────────────────────────────────
    let store = Arc::new(GmailClient::new(&config.gmail, &config.pubsub));
    let sink = Arc::new(SlackNotifier::new(&config.slack));
    let backends = create_backends(&config.classifier);

    // ── Pipeline ────────────────────────────────────────────────────
    let classifier =
        UrgencyClassifier::new(backends.urgency, &config.classifier, config.call_timeout);
    let summarizer = Summarizer::new(
        backends.summarization,
        config.classifier.summary_input_chars,
        config.call_timeout,
    );
    let dispatcher = Arc::new(TriageDispatcher::new(
        store.clone(),
        sink,
        classifier,
        summarizer,
        config.call_timeout,
    ));

    store.register_push().await.map_err(|e| {
        error!(error = %e, "Failed to register Gmail watch");
        Error::from(e)
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Optional push endpoint ──────────────────────────────────────
    let webhook = if config.webhook.enabled {
        let app = webhook_routes(WebhookState {
            dispatcher: dispatcher.clone(),
        });
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.webhook.port))
            .await
            .map_err(|e| {
                error!(port = config.webhook.port, error = %e, "Failed to bind push endpoint");
                Error::from(e)
            })?;
        let mut shutdown = shutdown_rx.clone();
        info!(port = config.webhook.port, "Push endpoint listening");
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
        }))
    } else {
        None
    };

    // ── Listener ────────────────────────────────────────────────────
    let subscription = Arc::new(PubSubSubscription::new(&config.pubsub));
    let listener = NotificationListener::new(subscription, config.listener.clone())
        .with_pull(config.pubsub.max_messages, config.pubsub.poll_interval);
    let handler: Arc<dyn HistoryHandler> = dispatcher.clone();

    let listening = listener.start_listening(handler, shutdown_rx);
    tokio::pin!(listening);

    let result = tokio::select! {
        result = &mut listening => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
            }
            info!("Shutdown requested, draining in-flight notifications");
            let _ = shutdown_tx.send(true);
            listening.await
        }
    };

    // Make sure the push endpoint stops too when the listener failed
    let _ = shutdown_tx.send(true);
    if let Some(handle) = webhook {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Push endpoint stopped with an error"),
            Err(e) => warn!(error = %e, "Push endpoint task failed"),
        }
    }

    if let Err(e) = store.unregister_push().await {
        warn!(error = %e, "Failed to stop Gmail watch");
    }

    match result {
        Ok(stats) => {
            info!(
                received = stats.received,
                acked = stats.acked,
                nacked = stats.nacked,
                dropped = stats.dropped,
                "Mail triage stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Subscription failed, exiting");
            Err(Error::from(e).into())
        }
    }
}

/// Console logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
