//! Notification listener: pulls mailbox change notifications and hands
//! their history cursors to a [`HistoryHandler`].
//!
//! Two halves joined by a bounded channel of `(NotificationEvent, AckToken)`:
//! 1. Pull loop: pulls batches, decodes payloads, acks malformed ones
//! 2. Dispatch loop: runs up to `max_in_flight` handler calls at once,
//!    acking on success and nacking on failure
//!
//! The pull loop never asks for more messages than the channel has room for.
//! Every delivery that is queued or in flight holds a lease, and a third
//! loop extends all held leases every `lease_refresh` so slow handlers do
//! not see their deliveries expire and come back.
//!
//! On shutdown the pull loop stops, queued deliveries that never started
//! are nacked, and in-flight handler calls run to completion.

pub mod payload;
pub mod subscription;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::error::SubscriptionError;
use crate::pipeline::types::{HistoryHandler, NotificationEvent};

pub use payload::{PubsubMessage, PushEnvelope, decode_envelope, decode_message};
pub use subscription::{AckToken, LeaseSet, ReceivedMessage, Subscription};

type Delivery = (NotificationEvent, AckToken);

/// Delivery counts for one listening run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Messages pulled from the subscription.
    pub received: u64,
    /// Deliveries acked after the handler succeeded.
    pub acked: u64,
    /// Deliveries nacked (handler failure or shutdown).
    pub nacked: u64,
    /// Malformed deliveries, acked and dropped.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct NotificationListener {
    subscription: Arc<dyn Subscription>,
    config: ListenerConfig,
    max_messages: usize,
    poll_interval: Duration,
}

impl NotificationListener {
    pub fn new(subscription: Arc<dyn Subscription>, config: ListenerConfig) -> Self {
        Self {
            subscription,
            config,
            max_messages: 10,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Pull batch size and the pause after an empty pull.
    pub fn with_pull(mut self, max_messages: usize, poll_interval: Duration) -> Self {
        self.max_messages = max_messages.max(1);
        self.poll_interval = poll_interval;
        self
    }

    /// Listen until `shutdown` flips to `true` (or its sender is dropped),
    /// or until a pull fails.
    ///
    /// Returns after every handler call has finished. A pull failure is
    /// returned as `Err` once the same drain has completed.
    pub async fn start_listening(
        &self,
        handler: Arc<dyn HistoryHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ListenerStats, SubscriptionError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        // Dropped by the pull loop when it exits, which stops the dispatch loop.
        let (stop_tx, stop_rx) = watch::channel(());
        // Dropped once the dispatch loop has drained, which stops lease renewal.
        let (done_tx, done_rx) = watch::channel(());
        let leases = Arc::new(LeaseSet::default());
        let counters = Arc::new(Counters::default());

        info!(
            subscription = self.subscription.name(),
            max_in_flight = self.config.max_in_flight,
            "Listening for mailbox notifications"
        );

        let pull = async {
            let result = self.pull_loop(tx, shutdown, &leases, &counters).await;
            drop(stop_tx);
            result
        };
        let dispatch = async {
            self.dispatch_loop(rx, handler, stop_rx, &counters).await;
            drop(done_tx);
        };
        let renew = self.lease_loop(&leases, done_rx);
        let (result, (), ()) = tokio::join!(pull, dispatch, renew);

        let stats = counters.snapshot();
        info!(
            received = stats.received,
            acked = stats.acked,
            nacked = stats.nacked,
            dropped = stats.dropped,
            "Listener stopped"
        );
        result.map(|()| stats)
    }

    async fn pull_loop(
        &self,
        tx: mpsc::Sender<Delivery>,
        mut shutdown: watch::Receiver<bool>,
        leases: &Arc<LeaseSet>,
        counters: &Counters,
    ) -> Result<(), SubscriptionError> {
        'pull: loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            // Wait for room in the channel, then pull no more than fits
            let room = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => {
                        drop(permit);
                        tx.capacity()
                    }
                    Err(_) => break Ok(()),
                },
            };
            let max_messages = self.max_messages.min(room.max(1));

            let pulled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                pulled = self.subscription.pull(max_messages) => pulled,
            };

            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => {
                    error!(subscription = self.subscription.name(), error = %e, "Subscription pull failed");
                    break Err(e);
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break Ok(());
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            counters
                .received
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            debug!(count = messages.len(), max_messages, "Pulled notifications");

            // Lease the whole batch before any of it waits on the channel
            let leased: Vec<_> = messages
                .into_iter()
                .map(|received| {
                    let token =
                        AckToken::leased(self.subscription.clone(), received.ack_id, leases.clone());
                    (received.message, token)
                })
                .collect();

            let mut pending = leased.into_iter();
            while let Some((message, token)) = pending.next() {
                let event = match payload::decode_message(&message) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            ack_id = token.ack_id(),
                            message_id = ?message.message_id,
                            error = %e,
                            "Dropping malformed notification"
                        );
                        settle_dropped(token, counters).await;
                        continue;
                    }
                };

                debug!(
                    email_address = %event.email_address,
                    history_id = %event.history_id,
                    "Received mailbox notification"
                );

                let permit = tokio::select! {
                    biased;
                    // Any change, or a dropped sender, means stop
                    _ = shutdown.changed() => None,
                    permit = tx.reserve() => permit.ok(),
                };

                match permit {
                    Some(permit) => permit.send((event, token)),
                    None => {
                        settle_nack(token, counters).await;
                        for (_, rest) in pending {
                            settle_nack(rest, counters).await;
                        }
                        break 'pull Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch_loop(
        &self,
        mut rx: mpsc::Receiver<Delivery>,
        handler: Arc<dyn HistoryHandler>,
        mut stop: watch::Receiver<()>,
        counters: &Arc<Counters>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.changed() => break,
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(done);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = stop.changed() => break,
                delivery = rx.recv() => delivery,
            };
            let Some((event, token)) = delivery else {
                break;
            };

            let handler = handler.clone();
            let counters = counters.clone();
            tasks.spawn(async move {
                let _permit = permit;
                handle_delivery(handler.as_ref(), event, token, &counters).await;
            });
        }

        rx.close();
        let mut abandoned = 0usize;
        while let Some((_, token)) = rx.recv().await {
            settle_nack(token, counters).await;
            abandoned += 1;
        }
        if abandoned > 0 {
            info!(count = abandoned, "Nacked queued notifications on shutdown");
        }

        if !tasks.is_empty() {
            info!(count = tasks.len(), "Waiting for in-flight notifications");
        }
        while let Some(done) = tasks.join_next().await {
            log_join(done);
        }
    }

    /// Extend every held lease each `lease_refresh` until `done` closes.
    async fn lease_loop(&self, leases: &LeaseSet, mut done: watch::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(self.config.lease_refresh.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; fresh deliveries already have a full deadline
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = done.changed() => break,
                _ = ticker.tick() => {}
            }

            let ack_ids = leases.snapshot();
            if ack_ids.is_empty() {
                continue;
            }
            match self
                .subscription
                .extend(&ack_ids, self.config.ack_deadline)
                .await
            {
                Ok(()) => debug!(count = ack_ids.len(), "Extended notification leases"),
                Err(e) => warn!(
                    count = ack_ids.len(),
                    error = %e,
                    "Failed to extend notification leases"
                ),
            }
        }
    }
}

async fn handle_delivery(
    handler: &dyn HistoryHandler,
    event: NotificationEvent,
    token: AckToken,
    counters: &Counters,
) {
    match handler.on_history(&event.history_id).await {
        Ok(()) => {
            debug!(history_id = %event.history_id, "Notification handled");
            settle_ack(token, counters).await;
        }
        Err(e) => {
            error!(
                history_id = %event.history_id,
                error = %e,
                "Notification handler failed, requesting redelivery"
            );
            settle_nack(token, counters).await;
        }
    }
}

async fn settle_ack(token: AckToken, counters: &Counters) {
    let ack_id = token.ack_id().to_string();
    match token.ack().await {
        Ok(()) => {
            counters.acked.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => warn!(ack_id, error = %e, "Failed to ack notification"),
    }
}

async fn settle_nack(token: AckToken, counters: &Counters) {
    let ack_id = token.ack_id().to_string();
    match token.nack().await {
        Ok(()) => {
            counters.nacked.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => warn!(ack_id, error = %e, "Failed to nack notification"),
    }
}

async fn settle_dropped(token: AckToken, counters: &Counters) {
    let ack_id = token.ack_id().to_string();
    match token.ack().await {
        Ok(()) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => warn!(ack_id, error = %e, "Failed to ack malformed notification"),
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Notification handler task panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;
    use crate::error::{MailStoreError, TriageError};

    const GUARD: Duration = Duration::from_secs(5);

    // ── Mock subscription ───────────────────────────────────────────

    /// Serves scripted batches, then either idles or fails.
    #[derive(Default)]
    struct MockSubscription {
        batches: Mutex<VecDeque<Vec<ReceivedMessage>>>,
        fail_when_empty: bool,
        pulls: Mutex<Vec<usize>>,
        acked: Mutex<Vec<String>>,
        rejected: Mutex<Vec<String>>,
        extended: Mutex<Vec<(Vec<String>, Duration)>>,
    }

    impl MockSubscription {
        fn with_batches(batches: Vec<Vec<ReceivedMessage>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                ..Default::default()
            }
        }

        fn acked(&self) -> Vec<String> {
            self.acked.lock().unwrap().clone()
        }

        fn rejected(&self) -> Vec<String> {
            self.rejected.lock().unwrap().clone()
        }

        fn pulls(&self) -> Vec<usize> {
            self.pulls.lock().unwrap().clone()
        }

        fn extended(&self) -> Vec<(Vec<String>, Duration)> {
            self.extended.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Subscription for MockSubscription {
        fn name(&self) -> &str {
            "mock-sub"
        }

        async fn pull(&self, max: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
            self.pulls.lock().unwrap().push(max);
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => Ok(batch),
                None if self.fail_when_empty => Err(SubscriptionError::Transport {
                    subscription: "mock-sub".into(),
                    reason: "stream reset".into(),
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
            self.acked.lock().unwrap().extend_from_slice(ack_ids);
            Ok(())
        }

        async fn reject(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
            self.rejected.lock().unwrap().extend_from_slice(ack_ids);
            Ok(())
        }

        async fn extend(&self, ack_ids: &[String], deadline: Duration) -> Result<(), SubscriptionError> {
            self.extended
                .lock()
                .unwrap()
                .push((ack_ids.to_vec(), deadline));
            Ok(())
        }
    }

    fn notification(ack_id: &str, history_id: &str) -> ReceivedMessage {
        let json = format!(r#"{{"emailAddress":"me@example.com","historyId":"{history_id}"}}"#);
        ReceivedMessage {
            ack_id: ack_id.into(),
            message: PubsubMessage::with_payload(json.as_bytes()),
        }
    }

    fn garbage(ack_id: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: ack_id.into(),
            message: PubsubMessage::with_payload(b"not json"),
        }
    }

    // ── Mock handlers ───────────────────────────────────────────────

    /// Records cursors; fails for the ones listed.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        fail_on: Vec<String>,
    }

    #[async_trait]
    impl HistoryHandler for RecordingHandler {
        async fn on_history(&self, history_id: &str) -> Result<(), TriageError> {
            self.seen.lock().unwrap().push(history_id.to_string());
            if self.fail_on.iter().any(|f| f == history_id) {
                return Err(TriageError::History {
                    history_id: history_id.into(),
                    source: MailStoreError::Transport("gmail unavailable".into()),
                });
            }
            Ok(())
        }
    }

    /// Blocks every call until released, reporting when a call starts.
    struct GatedHandler {
        started: Notify,
        release: Notify,
        calls: AtomicU64,
    }

    #[async_trait]
    impl HistoryHandler for GatedHandler {
        async fn on_history(&self, _history_id: &str) -> Result<(), TriageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    /// Takes a fixed time per call.
    #[derive(Default)]
    struct SlowHandler {
        delay: Duration,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HistoryHandler for SlowHandler {
        async fn on_history(&self, history_id: &str) -> Result<(), TriageError> {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push(history_id.to_string());
            Ok(())
        }
    }

    fn listener(sub: Arc<MockSubscription>, max_in_flight: usize) -> NotificationListener {
        NotificationListener::new(
            sub,
            ListenerConfig {
                channel_capacity: 8,
                max_in_flight,
                ..Default::default()
            },
        )
        .with_pull(10, Duration::from_millis(5))
    }

    // ── Tests ───────────────────────────────────────────────────────

    /// Wait until the subscription has settled `count` deliveries.
    async fn settled(sub: &MockSubscription, count: usize) {
        timeout(GUARD, async {
            while sub.acked().len() + sub.rejected().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deliveries never settled");
    }

    #[tokio::test]
    async fn acks_success_nacks_failure_drops_malformed() {
        let sub = Arc::new(MockSubscription::with_batches(vec![
            vec![notification("a1", "100"), garbage("a2")],
            vec![notification("a3", "200")],
        ]));
        let handler = Arc::new(RecordingHandler {
            fail_on: vec!["200".into()],
            ..Default::default()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let l = listener(sub.clone(), 2);
        let h = handler.clone();
        let run = tokio::spawn(async move { l.start_listening(h, shutdown_rx).await });

        settled(&sub, 3).await;
        shutdown_tx.send(true).unwrap();
        let stats = timeout(GUARD, run).await.unwrap().unwrap().unwrap();

        let mut acked = sub.acked();
        acked.sort();
        assert_eq!(acked, ["a1", "a2"]);
        assert_eq!(sub.rejected(), ["a3"]);

        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, ["100", "200"]);

        assert_eq!(
            stats,
            ListenerStats {
                received: 3,
                acked: 1,
                nacked: 1,
                dropped: 1,
            }
        );
    }

    #[tokio::test]
    async fn pull_error_is_fatal() {
        let sub = Arc::new(MockSubscription {
            fail_when_empty: true,
            ..Default::default()
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = timeout(
            GUARD,
            listener(sub, 1).start_listening(Arc::new(RecordingHandler::default()), shutdown_rx),
        )
        .await
        .expect("listener hung");
        assert!(matches!(result, Err(SubscriptionError::Transport { .. })));
    }

    #[tokio::test]
    async fn pull_error_still_settles_earlier_deliveries() {
        let sub = Arc::new(MockSubscription {
            fail_when_empty: true,
            ..MockSubscription::with_batches(vec![vec![notification("a1", "1"), garbage("a2")]])
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = timeout(
            GUARD,
            listener(sub.clone(), 1)
                .start_listening(Arc::new(RecordingHandler::default()), shutdown_rx),
        )
        .await
        .expect("listener hung");
        assert!(result.is_err());

        // a1 was either handled (acked) or still queued when the pull failed (nacked)
        assert!(sub.acked().contains(&"a2".to_string()));
        let a1_settled = sub.acked().contains(&"a1".to_string())
            || sub.rejected().contains(&"a1".to_string());
        assert!(a1_settled);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_and_nacks_queued() {
        let sub = Arc::new(MockSubscription::with_batches(vec![vec![
            notification("a1", "1"),
            notification("a2", "2"),
            notification("a3", "3"),
        ]]));
        let handler = Arc::new(GatedHandler {
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let l = listener(sub.clone(), 1);
        let h = handler.clone();
        let run = tokio::spawn(async move { l.start_listening(h, shutdown_rx).await });

        // First delivery is in flight, the other two wait in the channel
        timeout(GUARD, handler.started.notified())
            .await
            .expect("handler never started");
        shutdown_tx.send(true).unwrap();

        // Queued deliveries are nacked while the in-flight one still runs
        settled(&sub, 2).await;
        assert!(!run.is_finished());
        assert!(sub.acked().is_empty());

        handler.release.notify_one();
        let stats = timeout(GUARD, run).await.unwrap().unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sub.acked(), ["a1"]);
        let mut rejected = sub.rejected();
        rejected.sort();
        assert_eq!(rejected, ["a2", "a3"]);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.nacked, 2);
    }

    #[tokio::test]
    async fn concurrent_handlers_bounded_by_max_in_flight() {
        let sub = Arc::new(MockSubscription::with_batches(vec![vec![
            notification("a1", "1"),
            notification("a2", "2"),
            notification("a3", "3"),
        ]]));
        let handler = Arc::new(GatedHandler {
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let l = listener(sub.clone(), 2);
        let h = handler.clone();
        let run = tokio::spawn(async move { l.start_listening(h, shutdown_rx).await });

        timeout(GUARD, async {
            while handler.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("two handlers never started");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        shutdown_tx.send(true).unwrap();
        settled(&sub, 1).await;
        assert_eq!(sub.rejected(), ["a3"]);
        handler.release.notify_waiters();
        let stats = timeout(GUARD, run).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.nacked, 1);
    }

    #[tokio::test]
    async fn slow_handler_keeps_queued_and_in_flight_leases_alive() {
        let sub = Arc::new(MockSubscription::with_batches(vec![vec![
            notification("a1", "1"),
            notification("a2", "2"),
            notification("a3", "3"),
        ]]));
        let handler = Arc::new(SlowHandler {
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let l = NotificationListener::new(
            sub.clone(),
            ListenerConfig {
                channel_capacity: 8,
                max_in_flight: 1,
                ack_deadline: Duration::from_secs(60),
                lease_refresh: Duration::from_millis(20),
            },
        )
        .with_pull(10, Duration::from_millis(5));
        let h = handler.clone();
        let run = tokio::spawn(async move { l.start_listening(h, shutdown_rx).await });

        settled(&sub, 3).await;
        shutdown_tx.send(true).unwrap();
        let stats = timeout(GUARD, run).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.acked, 3);
        assert_eq!(sub.acked(), ["a1", "a2", "a3"]);

        let extended = sub.extended();
        assert!(extended.len() >= 3, "only {} extensions", extended.len());
        assert!(extended.iter().all(|(_, d)| *d == Duration::from_secs(60)));
        // a1 in flight while a2 and a3 wait in the channel
        let all = vec!["a1".to_string(), "a2".into(), "a3".into()];
        assert!(extended.iter().any(|(ids, _)| *ids == all));
        // a3 alone once the others were acked
        assert!(extended.iter().any(|(ids, _)| *ids == ["a3"]));

        // Renewal stops with the listener
        let count = extended.len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sub.extended().len(), count);
    }

    #[tokio::test]
    async fn pulls_no_more_than_channel_room() {
        let sub = Arc::new(MockSubscription::with_batches(vec![
            vec![notification("a1", "1"), notification("a2", "2")],
            vec![notification("a3", "3")],
        ]));
        let handler = Arc::new(GatedHandler {
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let l = NotificationListener::new(
            sub.clone(),
            ListenerConfig {
                channel_capacity: 2,
                max_in_flight: 1,
                ..Default::default()
            },
        )
        .with_pull(10, Duration::from_millis(5));
        let h = handler.clone();
        let run = tokio::spawn(async move { l.start_listening(h, shutdown_rx).await });

        timeout(GUARD, handler.started.notified())
            .await
            .expect("handler never started");
        timeout(GUARD, async {
            while sub.pulls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second pull never happened");

        // a1 in flight, a2 and a3 fill the channel: no further pulls
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sub.pulls(), [2, 1]);

        shutdown_tx.send(true).unwrap();
        settled(&sub, 2).await;
        handler.release.notify_one();
        let stats = timeout(GUARD, run).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.nacked, 2);
    }

    #[tokio::test]
    async fn already_shut_down_returns_immediately() {
        let sub = Arc::new(MockSubscription::with_batches(vec![vec![notification("a1", "1")]]));
        let (_tx, rx) = watch::channel(true);
        let stats = timeout(
            GUARD,
            listener(sub.clone(), 1).start_listening(Arc::new(RecordingHandler::default()), rx),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stats, ListenerStats::default());
        assert!(sub.acked().is_empty());
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_listener() {
        let sub = Arc::new(MockSubscription::default());
        let (tx, rx) = watch::channel(false);
        let l = listener(sub, 1);
        let run = tokio::spawn(async move {
            l.start_listening(Arc::new(RecordingHandler::default()), rx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
        assert!(timeout(GUARD, run).await.unwrap().unwrap().is_ok());
    }
}
