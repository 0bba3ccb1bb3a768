//! Payment initiation
//!
//! Reserving pool credits for a package purchase is a tenant-facing
//! mutation, so it runs through the idempotency guard like document
//! creation: a retried purchase replays the first reservation instead of
//! failing with `ReservationExists`.

use crate::engine::DocumentEngine;
use crate::types::PurchaseRequest;
use crate::{Error, Result};
use idempotency::{fingerprint, Executed, IdempotencyKey, Scope};
use ledger_core::{PoolReservation, TenantId};
use std::time::Duration;

/// Idempotency scope of payment initiation
pub const ENDPOINT_PURCHASE: &str = "payments.initiate";

impl DocumentEngine {
    /// Hold pool credits for `tenant_id`'s purchase, exactly once per key.
    ///
    /// The hold is captured or cancelled by the payment callback through the
    /// ledger; an unsettled hold expires with the reservation sweep.
    pub async fn initiate_purchase(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        request: PurchaseRequest,
    ) -> Result<Executed<PoolReservation>> {
        let body = serde_json::to_vec(&request)?;
        let fingerprint = fingerprint("POST", "/payments", &body);
        let scope = Scope::new(tenant_id, ENDPOINT_PURCHASE);

        self.guard
            .execute(&scope, key, &fingerprint, || async move {
                self.reserve_for_purchase(tenant_id, request).await
            })
            .await
    }

    async fn reserve_for_purchase(&self, tenant_id: TenantId, request: PurchaseRequest) -> Result<PoolReservation> {
        if request.payment_ref.trim().is_empty() {
            return Err(Error::Validation("payment reference cannot be empty".to_string()));
        }

        let reservation = self
            .ledger
            .reserve_pool_credits(
                tenant_id,
                request.payment_ref,
                request.credits,
                request.ttl_secs.map(Duration::from_secs),
            )
            .await?;

        tracing::info!(
            tenant = %tenant_id,
            payment_ref = %reservation.payment_ref,
            credits = reservation.credits,
            expires_at = %reservation.expires_at,
            "Purchase initiated"
        );
        Ok(reservation)
    }
}
