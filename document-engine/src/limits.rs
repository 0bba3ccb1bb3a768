//! Per-tenant document limits

use crate::{Error, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use ledger_core::{LimitAction, TenantId, WalletSettings};

/// Documents already created by a tenant in the current periods
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentCounts {
    /// Since UTC midnight
    pub today: u32,
    /// Since the first of the UTC month
    pub this_month: u32,
}

/// Start of the UTC day containing `now`
pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Start of the UTC month containing `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Limit checker
#[derive(Debug, Clone)]
pub struct LimitChecker {
    settings: WalletSettings,
}

impl LimitChecker {
    /// Create new limit checker from the charged wallet's settings
    pub fn new(settings: WalletSettings) -> Self {
        Self { settings }
    }

    /// Check whether one more document fits.
    ///
    /// With `limit_action = continue` a reached limit is logged and the
    /// document is accepted.
    pub fn check(&self, tenant_id: TenantId, counts: DocumentCounts) -> Result<()> {
        let reached = self
            .reached("daily", self.settings.doc_limit_daily, counts.today)
            .or_else(|| self.reached("monthly", self.settings.doc_limit_monthly, counts.this_month));

        let Some((period, limit)) = reached else {
            return Ok(());
        };

        match self.settings.limit_action {
            LimitAction::Block => Err(Error::DocumentLimitExceeded {
                tenant_id,
                period,
                limit,
            }),
            LimitAction::Continue => {
                tracing::warn!(
                    tenant = %tenant_id,
                    period,
                    limit,
                    "Document limit reached, accepting under continue policy"
                );
                Ok(())
            }
        }
    }

    fn reached(&self, period: &'static str, limit: Option<u32>, count: u32) -> Option<(&'static str, u32)> {
        limit.filter(|limit| count >= *limit).map(|limit| (period, limit))
    }
}
