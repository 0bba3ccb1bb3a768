//! Webhook delivery engine
//!
//! Domain events become one `pending` delivery per matching subscription.
//! The worker posts due deliveries, walks failures down the retry ladder and
//! parks them as `fail` once it is exhausted. Operators replay single rows or
//! bulk-replay failed ones.

use crate::config::WebhookConfig;
use crate::metrics::{
    WEBHOOK_ATTEMPTS_TOTAL, WEBHOOK_ATTEMPT_DURATION, WEBHOOK_ENQUEUED_TOTAL, WEBHOOK_REPLAYS_TOTAL,
};
use crate::schedule::RetrySchedule;
use crate::signing::{sign, SIGNATURE_HEADER};
use crate::store::WebhookStore;
use crate::transport::{HttpTransport, NotificationTransport};
use crate::types::{DeliveryQuery, DeliveryStatus, ReplayFilter, Subscription, WebhookDelivery};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ledger_core::pagination::{paginate, Page, PageResult};
use ledger_core::storage::Storage;
use ledger_core::{DomainEvent, EventSink, TenantId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

/// Webhook delivery engine
#[derive(Clone)]
pub struct WebhookEngine {
    store: WebhookStore,
    transport: Arc<dyn NotificationTransport>,
    schedule: RetrySchedule,
    config: WebhookConfig,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for WebhookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookEngine")
            .field("schedule", &self.schedule)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WebhookEngine {
    /// Create engine with an explicit transport
    pub fn new(storage: Storage, transport: Arc<dyn NotificationTransport>, config: WebhookConfig) -> Self {
        Self {
            store: WebhookStore::new(storage),
            transport,
            schedule: RetrySchedule::from_secs(&config.retry_ladder_secs),
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Create engine posting over HTTP
    pub fn with_http(storage: Storage, config: WebhookConfig) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::new(storage, Arc::new(transport), config))
    }

    /// Register a subscription
    pub fn subscribe(
        &self,
        tenant_id: TenantId,
        url: impl Into<String>,
        secret: impl Into<String>,
        events: Vec<String>,
    ) -> Result<Subscription> {
        let url = url.into();
        let secret = secret.into();

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(Error::InvalidSubscription(format!("unsupported url: {}", url)));
        }
        if secret.is_empty() {
            return Err(Error::InvalidSubscription("secret cannot be empty".to_string()));
        }
        if events.is_empty() || events.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::InvalidSubscription("event patterns cannot be empty".to_string()));
        }

        let subscription = Subscription {
            subscription_id: Uuid::now_v7(),
            tenant_id,
            url,
            secret,
            events,
            active: true,
            created_at: Utc::now(),
        };
        self.store.put_subscription(&subscription)?;

        tracing::info!(
            tenant = %tenant_id,
            subscription = %subscription.subscription_id,
            events = ?subscription.events,
            "Webhook subscription registered"
        );
        Ok(subscription)
    }

    /// Enable or disable a subscription
    pub fn set_active(&self, tenant_id: TenantId, subscription_id: Uuid, active: bool) -> Result<Subscription> {
        let mut subscription = self
            .store
            .get_subscription(tenant_id, subscription_id)?
            .ok_or(Error::SubscriptionNotFound(subscription_id))?;
        subscription.active = active;
        self.store.put_subscription(&subscription)?;
        Ok(subscription)
    }

    /// Subscriptions of a tenant
    pub fn subscriptions(&self, tenant_id: TenantId) -> Result<Vec<Subscription>> {
        self.store.tenant_subscriptions(tenant_id)
    }

    /// Fan a domain event out into pending deliveries
    pub fn enqueue(&self, event: &DomainEvent) -> Result<Vec<WebhookDelivery>> {
        let subscriptions: Vec<Subscription> = self
            .store
            .tenant_subscriptions(event.tenant_id)?
            .into_iter()
            .filter(|s| s.matches(&event.topic))
            .collect();

        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let payload = serde_json::to_string(&serde_json::json!({
            "id": event.event_id,
            "event": event.topic,
            "tenant_id": event.tenant_id,
            "occurred_at": event.occurred_at,
            "data": event.payload,
        }))?;

        let now = Utc::now();
        let deliveries: Vec<WebhookDelivery> = subscriptions
            .iter()
            .map(|s| WebhookDelivery {
                delivery_id: Uuid::now_v7(),
                subscription_id: s.subscription_id,
                tenant_id: event.tenant_id,
                event: event.topic.clone(),
                event_id: event.event_id,
                payload: payload.clone(),
                status: DeliveryStatus::Pending,
                attempt_count: 0,
                last_attempt_at: None,
                next_attempt_at: Some(now),
                last_response_status: None,
                last_error: None,
                created_at: now,
            })
            .collect();

        self.store.insert_deliveries(&deliveries)?;
        WEBHOOK_ENQUEUED_TOTAL
            .with_label_values(&[event.topic.as_str()])
            .inc_by(deliveries.len() as u64);
        tracing::debug!(
            event = %event.topic,
            tenant = %event.tenant_id,
            count = deliveries.len(),
            "Webhook deliveries enqueued"
        );

        self.wake.notify_one();
        Ok(deliveries)
    }

    /// Attempt one delivery if it is due. Returns the row after the attempt
    /// (or unchanged if it was not due).
    pub async fn attempt(&self, delivery_id: Uuid) -> Result<WebhookDelivery> {
        self.attempt_at(delivery_id, Utc::now()).await
    }

    /// [`attempt`](Self::attempt) with an explicit clock
    pub async fn attempt_at(&self, delivery_id: Uuid, now: DateTime<Utc>) -> Result<WebhookDelivery> {
        let (delivery, claimed) = self
            .store
            .update_delivery(delivery_id, |d| {
                if d.is_due(now) {
                    d.next_attempt_at = None;
                    true
                } else {
                    false
                }
            })?
            .ok_or(Error::DeliveryNotFound(delivery_id))?;

        if !claimed {
            return Ok(delivery);
        }

        let subscription = self
            .store
            .get_subscription(delivery.tenant_id, delivery.subscription_id)?
            .filter(|s| s.active);

        let outcome = match &subscription {
            Some(subscription) => self.post(subscription, &delivery, now).await,
            None => Err(Error::SubscriptionNotFound(delivery.subscription_id)),
        };

        self.record_outcome(delivery, subscription.is_none(), outcome, now)
    }

    async fn post(
        &self,
        subscription: &Subscription,
        delivery: &WebhookDelivery,
        now: DateTime<Utc>,
    ) -> Result<u16> {
        let body = delivery.payload.as_bytes();
        let headers = vec![
            (SIGNATURE_HEADER.to_string(), sign(&subscription.secret, body, now)),
            ("X-Webhook-Event".to_string(), delivery.event.clone()),
            ("X-Webhook-Delivery".to_string(), delivery.delivery_id.to_string()),
        ];

        let started = Instant::now();
        let result = self.transport.post(&subscription.url, &headers, body).await;
        WEBHOOK_ATTEMPT_DURATION.observe(started.elapsed().as_secs_f64());
        result
    }

    fn record_outcome(
        &self,
        claimed: WebhookDelivery,
        subscription_gone: bool,
        outcome: Result<u16>,
        now: DateTime<Utc>,
    ) -> Result<WebhookDelivery> {
        let schedule = &self.schedule;
        let delivery_id = claimed.delivery_id;

        let (delivery, applied) = self
            .store
            .update_delivery(delivery_id, |d| {
                // A replay during the attempt owns the row now
                if d.status != DeliveryStatus::Pending || d.next_attempt_at.is_some() {
                    return false;
                }

                d.attempt_count += 1;
                d.last_attempt_at = Some(now);

                let error = match &outcome {
                    Ok(status) if (200..300).contains(status) => {
                        d.status = DeliveryStatus::Ok;
                        d.last_response_status = Some(*status);
                        d.last_error = None;
                        return true;
                    }
                    Ok(status) => {
                        d.last_response_status = Some(*status);
                        format!("receiver answered {}", status)
                    }
                    Err(e) => e.to_string(),
                };
                d.last_error = Some(error);

                match schedule.next_delay(d.attempt_count) {
                    Some(delay) if !subscription_gone => {
                        d.next_attempt_at = Some(now + delay);
                    }
                    _ => {
                        d.status = DeliveryStatus::Fail;
                    }
                }
                true
            })?
            .ok_or(Error::DeliveryNotFound(delivery_id))?;

        if applied {
            let label = match delivery.status {
                DeliveryStatus::Ok => "ok",
                DeliveryStatus::Pending => "retry",
                DeliveryStatus::Fail => "fail",
            };
            WEBHOOK_ATTEMPTS_TOTAL.with_label_values(&[label]).inc();

            match delivery.status {
                DeliveryStatus::Ok => tracing::debug!(
                    delivery = %delivery_id,
                    attempts = delivery.attempt_count,
                    "Webhook delivered"
                ),
                DeliveryStatus::Pending => tracing::info!(
                    delivery = %delivery_id,
                    attempts = delivery.attempt_count,
                    next_attempt_at = ?delivery.next_attempt_at,
                    error = ?delivery.last_error,
                    "Webhook attempt failed, retry scheduled"
                ),
                DeliveryStatus::Fail => tracing::warn!(
                    delivery = %delivery_id,
                    attempts = delivery.attempt_count,
                    error = ?delivery.last_error,
                    "Webhook delivery failed permanently"
                ),
            }
        }

        Ok(delivery)
    }

    /// Attempt every delivery due at `now`, bounded by the configured
    /// concurrency. Returns the number attempted.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due(now, self.config.batch_size.max(1))?;

        let attempted = due.len();
        let results: Vec<Result<WebhookDelivery>> = stream::iter(due)
            .map(|id| self.attempt_at(id, now))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            if let Err(e) = result {
                tracing::error!(error = %e, "Webhook attempt could not be recorded");
            }
        }

        Ok(attempted)
    }

    /// Reset one delivery to `pending` at step 0 of the ladder
    pub fn replay(&self, delivery_id: Uuid) -> Result<WebhookDelivery> {
        let now = Utc::now();
        let (delivery, changed) = self
            .store
            .update_delivery(delivery_id, |d| {
                // In flight: the running attempt settles it
                if d.status == DeliveryStatus::Pending && d.next_attempt_at.is_none() {
                    return false;
                }
                reset_for_replay(d, now);
                true
            })?
            .ok_or(Error::DeliveryNotFound(delivery_id))?;

        if changed {
            WEBHOOK_REPLAYS_TOTAL.with_label_values(&["single"]).inc();
            tracing::info!(delivery = %delivery_id, "Webhook delivery replayed");
            self.wake.notify_one();
        }
        Ok(delivery)
    }

    /// Re-enqueue every `fail` delivery matching `filter`. Rows in any other
    /// status are left alone, so repeated calls are safe.
    pub fn bulk_replay(&self, filter: &ReplayFilter) -> Result<usize> {
        let now = Utc::now();
        let candidates: Vec<Uuid> = self
            .store
            .deliveries()?
            .into_iter()
            .filter(|d| d.status == DeliveryStatus::Fail && filter.matches(d))
            .map(|d| d.delivery_id)
            .collect();

        let mut replayed = 0;
        for delivery_id in candidates {
            let result = self.store.update_delivery(delivery_id, |d| {
                if d.status != DeliveryStatus::Fail {
                    return false;
                }
                reset_for_replay(d, now);
                true
            });
            match result {
                Ok(Some((_, true))) => replayed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(delivery = %delivery_id, error = %e, "Bulk replay skipped delivery")
                }
            }
        }

        WEBHOOK_REPLAYS_TOTAL
            .with_label_values(&["bulk"])
            .inc_by(replayed as u64);
        tracing::info!(replayed, filter = ?filter, "Webhook bulk replay");
        if replayed > 0 {
            self.wake.notify_one();
        }
        Ok(replayed)
    }

    /// Get a delivery
    pub fn get(&self, delivery_id: Uuid) -> Result<Option<WebhookDelivery>> {
        self.store.get_delivery(delivery_id)
    }

    /// Deliveries matching `query`, newest first
    pub fn list(&self, query: &DeliveryQuery, page: &Page) -> Result<PageResult<WebhookDelivery>> {
        let rows = self
            .store
            .deliveries()?
            .into_iter()
            .filter(|d| query.matches(d))
            .collect();
        Ok(paginate(rows, page, |d| d.delivery_id)?)
    }

    /// Make deliveries orphaned by a crash mid-attempt due again. Walks
    /// every row; run once at startup.
    pub fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<usize> {
        let stalled: Vec<Uuid> = self
            .store
            .deliveries()?
            .into_iter()
            .filter(|d| d.status == DeliveryStatus::Pending && d.next_attempt_at.is_none())
            .map(|d| d.delivery_id)
            .collect();

        let mut recovered = 0;
        for delivery_id in stalled {
            if let Some((_, true)) = self.store.update_delivery(delivery_id, |d| {
                if d.status == DeliveryStatus::Pending && d.next_attempt_at.is_none() {
                    d.next_attempt_at = Some(now);
                    true
                } else {
                    false
                }
            })? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Poll for due deliveries until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.recover_in_flight(Utc::now()) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(count = n, "Recovered in-flight webhook deliveries"),
            Err(e) => tracing::error!(error = %e, "Failed to recover in-flight webhook deliveries"),
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        tracing::info!("Webhook worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            if let Err(e) = self.run_due(Utc::now()).await {
                tracing::error!(error = %e, "Webhook poll failed");
            }
        }

        tracing::info!("Webhook worker stopped");
    }
}

fn reset_for_replay(delivery: &mut WebhookDelivery, now: DateTime<Utc>) {
    delivery.status = DeliveryStatus::Pending;
    delivery.attempt_count = 0;
    delivery.next_attempt_at = Some(now);
    delivery.last_error = None;
}

impl EventSink for WebhookEngine {
    fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.enqueue(&event) {
            tracing::error!(
                event = %event.topic,
                tenant = %event.tenant_id,
                error = %e,
                "Failed to enqueue webhook deliveries"
            );
        }
    }
}
