//! Expiration sweep.
//!
//! Deposit entries past their window are refunded and expired. The entry is
//! expired even when the refund fails; the failure is recorded on the entry
//! as `refund_status = failed` and retried by the next sweep.

use crate::db;
use crate::engine::Engine;
use crate::error::Result;
use crate::model::{AnalyticsEvent, EntryStatus, RefundStatus, WaitlistEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_deposits: usize,
    pub refunded: usize,
    pub refund_failures: usize,
    pub expired_free: usize,
    pub refund_retries: usize,
    pub refund_retries_succeeded: usize,
}

impl Engine {
    #[instrument(skip_all, fields(now = %now))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        // Failures from earlier runs first, so this run's failures wait a cycle.
        let (retried, succeeded) = self.retry_failed_refunds(now).await?;
        report.refund_retries = retried;
        report.refund_retries_succeeded = succeeded;

        for entry in db::select_expired_deposits(&self.pool, now).await? {
            let refund = self.refund_expired_deposit_at(entry.id, now).await;
            let expired =
                db::transition_terminal(&self.pool, entry.id, EntryStatus::Expired, now).await?;
            if expired {
                report.expired_deposits += 1;
            } else {
                warn!(entry_id = entry.id, "entry left the active set during sweep");
            }
            match refund {
                Ok(_) => report.refunded += 1,
                Err(err) => {
                    report.refund_failures += 1;
                    db::set_refund_status(&self.pool, entry.id, RefundStatus::Failed, now).await?;
                    error!(
                        entry_id = entry.id,
                        order_ref = entry.deposit_order_ref.as_deref().unwrap_or_default(),
                        amount_cents = entry.deposit_amount_cents,
                        %err,
                        "automatic deposit refund failed"
                    );
                    self.record(
                        AnalyticsEvent::for_entry("refund_failed", &entry)
                            .with_attribute("error", err.to_string().into()),
                    )
                    .await;
                }
            }
            if expired {
                self.record_expired(&entry).await;
            }
        }

        if self.policy.expire_free_entries {
            for entry in db::select_lapsed_free(&self.pool, now).await? {
                if db::transition_terminal(&self.pool, entry.id, EntryStatus::Expired, now).await? {
                    report.expired_free += 1;
                    self.record_expired(&entry).await;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired_deposits = report.expired_deposits,
                refunded = report.refunded,
                refund_failures = report.refund_failures,
                expired_free = report.expired_free,
                refund_retries = report.refund_retries,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Re-attempt refunds recorded as failed. Returns (attempted, succeeded).
    #[instrument(skip_all)]
    pub async fn retry_failed_refunds(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let pending = db::select_failed_refunds(&self.pool).await?;
        let mut succeeded = 0;
        for entry in &pending {
            match self.refund_expired_deposit_at(entry.id, now).await {
                Ok(_) => {
                    succeeded += 1;
                    info!(entry_id = entry.id, "refund retry succeeded");
                }
                Err(err) => {
                    error!(
                        entry_id = entry.id,
                        order_ref = entry.deposit_order_ref.as_deref().unwrap_or_default(),
                        %err,
                        "refund retry failed"
                    );
                }
            }
        }
        Ok((pending.len(), succeeded))
    }

    async fn record_expired(&self, entry: &WaitlistEntry) {
        self.record(AnalyticsEvent::for_entry("entry_expired", entry))
            .await;
    }
}
