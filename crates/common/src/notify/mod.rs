//! At-least-once notification delivery
//!
//! The notifications table is the queue. Terminal lifecycle transitions
//! insert pending rows; dispatch cycles claim a batch (status flip to
//! `in_flight` with an attempt bump), push each row through its channel
//! transport, and record the outcome. Failed rows stay deliverable until
//! they exhaust the attempt budget, then rest as `failed` for inspection.

mod transport;

pub use transport::{EmailRelayTransport, SlackTransport, Transport, WebhookTransport};

use crate::config::NotificationConfig;
use crate::db::models::{Channel, NotificationStatus};
use crate::errors::Result;
use crate::store::{DeliveryOutcome, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parse configured outcome channel names, dropping unknown ones
pub fn outcome_channels(config: &NotificationConfig) -> Vec<Channel> {
    config
        .outcome_channels
        .iter()
        .filter_map(|name| {
            let parsed = Channel::parse(name);
            if parsed.is_none() {
                warn!(channel = %name, "Unknown outcome channel in config, ignoring");
            }
            parsed
        })
        .collect()
}

/// Counters from one dispatch cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Claims and delivers queued notifications
pub struct Dispatcher {
    store: Arc<dyn Store>,
    transports: HashMap<Channel, Arc<dyn Transport>>,
    batch_size: u64,
    max_attempts: i32,
    /// How long an in_flight claim may be held before another cycle takes
    /// it over (covers cycles that died between claim and outcome)
    in_flight_timeout: chrono::Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, batch_size: u64, max_attempts: i32) -> Self {
        Self {
            store,
            transports: HashMap::new(),
            batch_size,
            max_attempts,
            in_flight_timeout: chrono::Duration::seconds(300),
        }
    }

    /// Build a dispatcher with the HTTP transports named in the config
    pub fn from_config(store: Arc<dyn Store>, config: &NotificationConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.transport_timeout_secs);
        let mut dispatcher = Self::new(store, config.batch_size, config.max_attempts)
            .with_in_flight_timeout(chrono::Duration::seconds(
                config.in_flight_timeout_secs as i64,
            ));

        for name in &config.outcome_channels {
            match Channel::parse(name) {
                Some(Channel::Email) => match config.email_relay_url {
                    Some(ref url) => {
                        dispatcher = dispatcher.with_transport(Arc::new(
                            EmailRelayTransport::new(url.clone(), timeout)?,
                        ));
                    }
                    None => {
                        warn!("Email channel configured without email_relay_url, skipping");
                    }
                },
                Some(Channel::Webhook) => {
                    dispatcher =
                        dispatcher.with_transport(Arc::new(WebhookTransport::new(timeout)?));
                }
                Some(Channel::Slack) => {
                    dispatcher = dispatcher.with_transport(Arc::new(SlackTransport::new(timeout)?));
                }
                None => {
                    warn!(channel = %name, "Unknown notification channel in config, skipping");
                }
            }
        }

        Ok(dispatcher)
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.channel(), transport);
        self
    }

    pub fn with_in_flight_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.in_flight_timeout = timeout;
        self
    }

    /// Run one dispatch cycle: claim, deliver, record.
    ///
    /// A transport failure marks the row `failed` and moves on; it never
    /// aborts the cycle or surfaces to the caller.
    pub async fn dispatch_pending(&self) -> Result<DispatchStats> {
        let stuck_before = Utc::now() - self.in_flight_timeout;
        let claimed = self
            .store
            .claim_deliverable(self.batch_size, self.max_attempts, stuck_before)
            .await?;

        let mut stats = DispatchStats {
            claimed: claimed.len(),
            ..Default::default()
        };

        for notification in claimed {
            let channel = notification.delivery_channel();

            let outcome = match self.transports.get(&channel) {
                Some(transport) => match transport.deliver(&notification).await {
                    Ok(()) => DeliveryOutcome::Sent,
                    Err(e) => DeliveryOutcome::Failed {
                        error: e.to_string(),
                    },
                },
                None => DeliveryOutcome::Failed {
                    error: format!("no transport configured for channel '{}'", channel.as_str()),
                },
            };

            match &outcome {
                DeliveryOutcome::Sent => {
                    stats.sent += 1;
                    metrics::counter!("riskvet_notifications_sent_total").increment(1);
                    debug!(
                        notification_id = %notification.id,
                        channel = %channel.as_str(),
                        "Notification delivered"
                    );
                }
                DeliveryOutcome::Failed { error } => {
                    stats.failed += 1;
                    metrics::counter!("riskvet_notifications_failed_total").increment(1);
                    warn!(
                        notification_id = %notification.id,
                        channel = %channel.as_str(),
                        attempt = notification.attempt_count,
                        error = %error,
                        "Notification delivery failed"
                    );
                }
            }

            self.store.finish_delivery(notification.id, outcome).await?;
        }

        if stats.claimed > 0 {
            info!(
                claimed = stats.claimed,
                sent = stats.sent,
                failed = stats.failed,
                "Dispatch cycle finished"
            );
        }

        Ok(stats)
    }
}

/// Whether a row has settled (sent, or failed past its attempt budget)
pub fn is_settled(status: NotificationStatus, attempt_count: i32, max_attempts: i32) -> bool {
    match status {
        NotificationStatus::Sent => true,
        NotificationStatus::Failed => attempt_count >= max_attempts,
        NotificationStatus::Pending | NotificationStatus::InFlight => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Notification, TenantTier, UserRole};
    use crate::errors::AppError;
    use crate::store::{MemStore, NewNotification};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Succeeds after a configurable number of failures
    struct FlakyTransport {
        channel: Channel,
        failures_remaining: AtomicUsize,
        deliveries: AtomicUsize,
    }

    impl FlakyTransport {
        fn new(channel: Channel, failures: usize) -> Self {
            Self {
                channel,
                failures_remaining: AtomicUsize::new(failures),
                deliveries: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn deliver(&self, _notification: &Notification) -> crate::errors::Result<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);

            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::TransportFailure {
                    channel: self.channel.as_str().to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    async fn enqueue(store: &MemStore, dedupe: Option<&str>) -> Notification {
        store
            .enqueue_notification(NewNotification {
                user_id: Uuid::new_v4(),
                evaluation_id: Some(Uuid::new_v4()),
                channel: Channel::Email,
                recipient: "ops@example.com".to_string(),
                subject: "Evaluation completed".to_string(),
                body: "done".to_string(),
                dedupe_key: dedupe.map(str::to_string),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_delivery_marks_sent() {
        let store = Arc::new(MemStore::new());
        let row = enqueue(&store, None).await;

        let transport = Arc::new(FlakyTransport::new(Channel::Email, 0));
        let dispatcher =
            Dispatcher::new(store.clone(), 10, 3).with_transport(transport.clone());

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(
            stats,
            DispatchStats {
                claimed: 1,
                sent: 1,
                failed: 0
            }
        );

        let rows = store
            .list_notifications_for_evaluation(row.evaluation_id.unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0].notification_status(), NotificationStatus::Sent);
        assert!(rows[0].sent_at.is_some());
        assert_eq!(rows[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_failure_is_retried_until_budget_exhausted() {
        let store = Arc::new(MemStore::new());

        let tenant = store
            .create_tenant("acme".to_string(), TenantTier::Standard, 10, 100)
            .await
            .unwrap();
        let user = store
            .create_user(
                tenant.id,
                "ops@example.com".to_string(),
                "Ops".to_string(),
                UserRole::Admin,
            )
            .await
            .unwrap();

        let row = store
            .enqueue_notification(NewNotification {
                user_id: user.id,
                evaluation_id: Some(Uuid::new_v4()),
                channel: Channel::Email,
                recipient: "ops@example.com".to_string(),
                subject: "Evaluation completed".to_string(),
                body: "done".to_string(),
                dedupe_key: None,
            })
            .await
            .unwrap();

        // Always fails
        let transport = Arc::new(FlakyTransport::new(Channel::Email, usize::MAX));
        let dispatcher =
            Dispatcher::new(store.clone(), 10, 3).with_transport(transport.clone());

        for expected_attempt in 1..=3 {
            let stats = dispatcher.dispatch_pending().await.unwrap();
            assert_eq!(stats.failed, 1, "attempt {}", expected_attempt);
        }

        // Budget spent: nothing left to claim
        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.claimed, 0);

        let rows = store
            .list_notifications_for_evaluation(row.evaluation_id.unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0].notification_status(), NotificationStatus::Failed);
        assert_eq!(rows[0].attempt_count, 3);
        assert!(rows[0].last_error.is_some());

        let dead = store.list_permanently_failed(tenant.id, 3).await.unwrap();
        assert_eq!(dead.len(), 1);

        // Other tenants never see it
        let other = store
            .list_permanently_failed(Uuid::new_v4(), 3)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let store = Arc::new(MemStore::new());
        let row = enqueue(&store, None).await;

        // Fails once, then delivers
        let transport = Arc::new(FlakyTransport::new(Channel::Email, 1));
        let dispatcher =
            Dispatcher::new(store.clone(), 10, 3).with_transport(transport.clone());

        let first = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(first.failed, 1);

        let second = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(second.sent, 1);

        let rows = store
            .list_notifications_for_evaluation(row.evaluation_id.unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0].notification_status(), NotificationStatus::Sent);
        assert_eq!(rows[0].attempt_count, 2);
        assert_eq!(transport.deliveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stuck_in_flight_claim_is_taken_over() {
        let store = Arc::new(MemStore::new());
        let row = enqueue(&store, None).await;

        // A cycle claims the row, then dies before reporting an outcome
        let claimed = store
            .claim_deliverable(10, 3, Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Within the hold window the claim is respected
        let held = store
            .claim_deliverable(10, 3, Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(held.is_empty());

        // Past the window another cycle takes the row over and delivers it
        let transport = Arc::new(FlakyTransport::new(Channel::Email, 0));
        let dispatcher = Dispatcher::new(store.clone(), 10, 3)
            .with_transport(transport)
            .with_in_flight_timeout(chrono::Duration::zero());
        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.sent, 1);

        let rows = store
            .list_notifications_for_evaluation(row.evaluation_id.unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0].notification_status(), NotificationStatus::Sent);
        assert_eq!(rows[0].attempt_count, 2);
        assert!(rows[0].claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_transport_fails_the_row() {
        let store = Arc::new(MemStore::new());
        let row = enqueue(&store, None).await;

        // No transports registered at all
        let dispatcher = Dispatcher::new(store.clone(), 10, 1);
        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.failed, 1);

        let rows = store
            .list_notifications_for_evaluation(row.evaluation_id.unwrap())
            .await
            .unwrap();
        assert!(rows[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("no transport configured"));
    }

    #[tokio::test]
    async fn test_dedupe_key_makes_enqueue_idempotent() {
        let store = Arc::new(MemStore::new());
        let first = enqueue(&store, Some("eval-1:completed:email:ops@example.com")).await;
        let replay = enqueue(&store, Some("eval-1:completed:email:ops@example.com")).await;
        assert_eq!(first.id, replay.id);
    }

    #[tokio::test]
    async fn test_batch_limit_respected() {
        let store = Arc::new(MemStore::new());
        for _ in 0..5 {
            enqueue(&store, None).await;
        }

        let transport = Arc::new(FlakyTransport::new(Channel::Email, 0));
        let dispatcher = Dispatcher::new(store.clone(), 2, 3).with_transport(transport);

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.claimed, 2);
    }

    #[test]
    fn test_settled() {
        assert!(is_settled(NotificationStatus::Sent, 1, 3));
        assert!(is_settled(NotificationStatus::Failed, 3, 3));
        assert!(!is_settled(NotificationStatus::Failed, 2, 3));
        assert!(!is_settled(NotificationStatus::Pending, 0, 3));
        assert!(!is_settled(NotificationStatus::InFlight, 1, 3));
    }
}
