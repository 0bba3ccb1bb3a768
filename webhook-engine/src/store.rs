//! Durable subscription and delivery rows

use crate::types::{DeliveryStatus, Subscription, WebhookDelivery};
use crate::Result;
use chrono::{DateTime, Utc};
use ledger_core::storage::{
    due_key, Storage, WriteBatch, CF_WEBHOOK_DELIVERIES, CF_WEBHOOK_QUEUE, CF_WEBHOOK_SUBSCRIPTIONS,
};
use ledger_core::TenantId;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Webhook rows over shared storage.
///
/// Subscriptions are keyed `tenant || subscription_id`, deliveries by their
/// UUIDv7 so a full scan is creation order. Pending deliveries with a due
/// time also sit in `webhook_queue` under `due_at || delivery_id`, written
/// in the same batch as the row. Status changes go through
/// [`WebhookStore::update_delivery`], which reads and writes under one lock.
#[derive(Clone)]
pub struct WebhookStore {
    storage: Storage,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for WebhookStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookStore").finish_non_exhaustive()
    }
}

fn subscription_key(tenant_id: TenantId, subscription_id: Uuid) -> Vec<u8> {
    let mut key = tenant_id.as_bytes().to_vec();
    key.extend_from_slice(subscription_id.as_bytes());
    key
}

fn queue_key(delivery: &WebhookDelivery) -> Option<Vec<u8>> {
    match (delivery.status, delivery.next_attempt_at) {
        (DeliveryStatus::Pending, Some(at)) => Some(due_key(at, delivery.delivery_id)),
        _ => None,
    }
}

fn stage_delivery(
    batch: &mut WriteBatch,
    before: Option<&WebhookDelivery>,
    after: &WebhookDelivery,
) -> Result<()> {
    let old_slot = before.and_then(queue_key);
    let new_slot = queue_key(after);
    if old_slot != new_slot {
        if let Some(key) = old_slot {
            batch.delete(CF_WEBHOOK_QUEUE, key);
        }
        if let Some(key) = new_slot {
            batch.put(CF_WEBHOOK_QUEUE, key, Vec::new());
        }
    }
    batch.put_value(CF_WEBHOOK_DELIVERIES, after.delivery_id.as_bytes().to_vec(), after)?;
    Ok(())
}

impl WebhookStore {
    /// Create store
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Insert or replace a subscription
    pub fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_value(
            CF_WEBHOOK_SUBSCRIPTIONS,
            subscription_key(subscription.tenant_id, subscription.subscription_id),
            subscription,
        )?;
        self.storage.write(batch)?;
        Ok(())
    }

    /// Get a subscription
    pub fn get_subscription(&self, tenant_id: TenantId, subscription_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self
            .storage
            .get_value(CF_WEBHOOK_SUBSCRIPTIONS, &subscription_key(tenant_id, subscription_id))?)
    }

    /// All subscriptions of a tenant
    pub fn tenant_subscriptions(&self, tenant_id: TenantId) -> Result<Vec<Subscription>> {
        Ok(self
            .storage
            .scan_values(CF_WEBHOOK_SUBSCRIPTIONS, tenant_id.as_bytes())?)
    }

    /// Insert new deliveries in one batch
    pub fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<()> {
        let mut batch = WriteBatch::new();
        for delivery in deliveries {
            stage_delivery(&mut batch, None, delivery)?;
        }
        self.storage.write(batch)?;
        Ok(())
    }

    /// Get a delivery
    pub fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<WebhookDelivery>> {
        Ok(self
            .storage
            .get_value(CF_WEBHOOK_DELIVERIES, delivery_id.as_bytes())?)
    }

    /// All deliveries, oldest first
    pub fn deliveries(&self) -> Result<Vec<WebhookDelivery>> {
        Ok(self.storage.scan_values(CF_WEBHOOK_DELIVERIES, &[])?)
    }

    /// Up to `limit` pending deliveries due at `now`, earliest first
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        Ok(self.storage.due_ids(CF_WEBHOOK_QUEUE, now, limit)?)
    }

    /// Read-modify-write one delivery.
    ///
    /// `apply` returns `false` to leave the row untouched (guard failed).
    /// Returns the row as stored afterwards and whether it changed.
    pub fn update_delivery<F>(&self, delivery_id: Uuid, apply: F) -> Result<Option<(WebhookDelivery, bool)>>
    where
        F: FnOnce(&mut WebhookDelivery) -> bool,
    {
        let _guard = self.lock.lock();

        let Some(current) = self.get_delivery(delivery_id)? else {
            return Ok(None);
        };
        let mut delivery = current.clone();
        if !apply(&mut delivery) {
            return Ok(Some((current, false)));
        }

        let mut batch = WriteBatch::new();
        stage_delivery(&mut batch, Some(&current), &delivery)?;
        self.storage.write(batch)?;
        Ok(Some((delivery, true)))
    }
}
