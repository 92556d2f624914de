//! Deposit workflow: request, payment reconciliation, and refunds.
//!
//! An entry moves `free -> deposit_pending -> deposit` on payment and back to
//! `free` when the order is refunded or cancelled. Promotion and demotion are
//! absolute assignments, so replayed payment events converge on the same row.

use crate::collab::{self, DepositOrderRequest, RefundOutcome};
use crate::db::{self, NewJob};
use crate::engine::Engine;
use crate::error::{Result, WaitlistError};
use crate::messages;
use crate::model::{
    AnalyticsEvent, EntryKind, JobType, OrderStatus, RefundStatus, FREE_PRIORITY, MAX_PRIORITY,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// `price × percentage / 100`, rounded half up, never below one cent.
pub fn deposit_amount_cents(price_cents: i64, percentage: u32) -> i64 {
    let raw = (price_cents.max(0) * i64::from(percentage) + 50) / 100;
    raw.max(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositCheckout {
    pub entry_id: i64,
    pub order_ref: String,
    pub checkout_url: String,
    pub amount_cents: i64,
    pub percentage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// No entry references the order.
    UnknownOrder,
    Promoted {
        /// False when the confirmation had already been recorded.
        newly_confirmed: bool,
    },
    Demoted,
    /// Paid status for an entry that is no longer active, or whose deposit
    /// was already reversed.
    Skipped,
    /// Status that neither promotes nor demotes.
    Unchanged,
}

impl Engine {
    /// Create a deposit order for an active entry. Priority stays unchanged
    /// until the payment is confirmed.
    #[instrument(skip_all, fields(entry_id = entry_id))]
    pub async fn request_deposit(&self, entry_id: i64) -> Result<DepositCheckout> {
        let now = Utc::now();
        let entry = db::get_entry(&self.pool, entry_id).await?;
        if !entry.is_active() {
            return Err(WaitlistError::InvalidState(format!(
                "entry {entry_id} is {}",
                entry.status.as_str()
            )));
        }
        if entry.kind == EntryKind::Deposit {
            return Err(WaitlistError::InvalidState(format!(
                "entry {entry_id} already holds a confirmed deposit"
            )));
        }
        if entry.kind == EntryKind::DepositPending {
            // The outstanding order stays the one webhooks resolve against
            // unless it can no longer be paid.
            if let Some(outstanding) = entry.deposit_order_ref.as_deref() {
                let status = collab::call(
                    "payment",
                    self.policy.collaborator_timeout,
                    self.payments.order_status(outstanding),
                )
                .await?;
                if !is_abandoned(&status) {
                    return Err(WaitlistError::InvalidState(format!(
                        "entry {entry_id} already has deposit order {outstanding} outstanding"
                    )));
                }
                info!(entry_id, order_ref = outstanding, ?status, "replacing abandoned deposit order");
            }
        }
        if !self.settings.deposit_enabled(entry.product_id).await? {
            return Err(WaitlistError::ValidationFailed(format!(
                "deposits are disabled for product {}",
                entry.product_id
            )));
        }
        let percentage = self.settings.deposit_percentage(entry.product_id).await?;
        let subject = self.lookup_subject(entry.product_id, entry.variation_id).await?;
        let amount_cents = deposit_amount_cents(subject.price_cents, percentage);

        let request = DepositOrderRequest {
            entry_id,
            buyer_email: entry.email.clone(),
            buyer_account_id: entry.account_id,
            product_id: entry.product_id,
            variation_id: entry.variation_id,
            amount_cents,
            percentage,
            description: format!("{percentage}% Waitlist Deposit: {}", subject.display_name),
        };
        let order = collab::call(
            "payment",
            self.policy.collaborator_timeout,
            self.payments.create_deposit_order(&request),
        )
        .await?;

        let mut tx = self.pool.begin().await?;
        db::update_kind_and_priority(
            &mut *tx,
            entry_id,
            EntryKind::DepositPending,
            FREE_PRIORITY,
            Some(amount_cents),
            Some(&order.order_ref),
            now,
        )
        .await?;
        db::clear_deposit_confirmation(&mut *tx, entry_id).await?;
        tx.commit().await?;

        info!(entry_id, order_ref = %order.order_ref, amount_cents, "deposit requested");
        self.record(
            AnalyticsEvent::for_entry("deposit_requested", &entry)
                .with_attribute("amount_cents", amount_cents.into())
                .with_attribute("order_ref", order.order_ref.clone().into()),
        )
        .await;

        Ok(DepositCheckout {
            entry_id,
            order_ref: order.order_ref,
            checkout_url: order.checkout_url,
            amount_cents,
            percentage,
        })
    }

    /// Reconcile a payment status event. Safe to call any number of times
    /// with the same arguments.
    #[instrument(skip_all, fields(order_ref = %order_ref, status = ?status))]
    pub async fn on_payment_status_changed(
        &self,
        order_ref: &str,
        status: &OrderStatus,
    ) -> Result<PaymentOutcome> {
        let now = Utc::now();
        let Some(entry) = db::find_entry_by_order_ref(&self.pool, order_ref).await? else {
            debug!("order is not a waitlist deposit");
            return Ok(PaymentOutcome::UnknownOrder);
        };

        if status.is_paid() {
            if !entry.is_active() {
                warn!(entry_id = entry.id, entry_status = entry.status.as_str(), "payment for inactive entry ignored");
                return Ok(PaymentOutcome::Skipped);
            }
            if !entry.kind.holds_deposit() {
                warn!(entry_id = entry.id, "paid status for a reversed deposit ignored");
                return Ok(PaymentOutcome::Skipped);
            }
            let product_name = self.product_name(&entry).await;

            let mut tx = self.pool.begin().await?;
            db::update_kind_and_priority(
                &mut *tx,
                entry.id,
                EntryKind::Deposit,
                MAX_PRIORITY,
                None,
                None,
                now,
            )
            .await?;
            let newly_confirmed = db::claim_deposit_confirmation(&mut *tx, entry.id, now).await?;
            let mut job_id = None;
            if newly_confirmed {
                let promoted = db::get_entry(&mut *tx, entry.id).await?;
                let rendered =
                    messages::deposit_confirmed(&self.policy.site_name, &product_name, &promoted);
                let id = self
                    .queue
                    .enqueue_tx(
                        &mut *tx,
                        &NewJob {
                            job_type: JobType::DepositConfirmed,
                            entry_id: Some(entry.id),
                            recipient: &promoted.email,
                            subject: &rendered.subject,
                            body: &rendered.body,
                            scheduled_at: now,
                        },
                        now,
                    )
                    .await?;
                job_id = Some(id);
            }
            tx.commit().await?;

            if let Some(id) = job_id {
                info!(entry_id = entry.id, "deposit confirmed; entry promoted");
                self.queue.after_commit(id, now).await;
                self.record(
                    AnalyticsEvent::for_entry("deposit_paid", &entry)
                        .with_attribute("order_ref", order_ref.into()),
                )
                .await;
            } else {
                debug!(entry_id = entry.id, "deposit confirmation replayed");
            }
            return Ok(PaymentOutcome::Promoted { newly_confirmed });
        }

        if status.is_reversed() {
            db::update_kind_and_priority(
                &self.pool,
                entry.id,
                EntryKind::Free,
                FREE_PRIORITY,
                Some(0),
                None,
                now,
            )
            .await?;
            info!(entry_id = entry.id, "deposit reversed; entry demoted");
            return Ok(PaymentOutcome::Demoted);
        }

        debug!(entry_id = entry.id, "status does not affect priority");
        Ok(PaymentOutcome::Unchanged)
    }

    /// Poll the payment system for an order's status and reconcile it.
    pub async fn sync_payment_status(&self, order_ref: &str) -> Result<PaymentOutcome> {
        let status = collab::call(
            "payment",
            self.policy.collaborator_timeout,
            self.payments.order_status(order_ref),
        )
        .await?;
        self.on_payment_status_changed(order_ref, &status).await
    }

    pub async fn refund_expired_deposit(&self, entry_id: i64) -> Result<RefundOutcome> {
        self.refund_expired_deposit_at(entry_id, Utc::now()).await
    }

    /// Return a deposit whose waitlist window lapsed. On a payment failure
    /// the ledger is left as it was and the error is returned.
    #[instrument(skip_all, fields(entry_id = entry_id))]
    pub async fn refund_expired_deposit_at(
        &self,
        entry_id: i64,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome> {
        let entry = db::get_entry(&self.pool, entry_id).await?;
        let order_ref = match (&entry.kind, &entry.deposit_order_ref) {
            (EntryKind::Deposit, Some(order_ref)) => order_ref.clone(),
            _ => {
                return Err(WaitlistError::InvalidState(format!(
                    "entry {entry_id} has no confirmed deposit to refund"
                )))
            }
        };
        let timeout = self.policy.collaborator_timeout;

        let status = collab::call("payment", timeout, self.payments.order_status(&order_ref)).await?;
        let outcome = if status == OrderStatus::Refunded {
            RefundOutcome::AlreadyRefunded
        } else {
            collab::call(
                "payment",
                timeout,
                self.payments.refund_order(
                    &order_ref,
                    entry.deposit_amount_cents,
                    &self.policy.refund_reason,
                ),
            )
            .await?
        };

        if outcome == RefundOutcome::AlreadyRefunded {
            db::set_refund_status(&self.pool, entry_id, RefundStatus::Refunded, now).await?;
            info!(entry_id, order_ref = %order_ref, "deposit was already refunded");
            return Ok(outcome);
        }

        let product_name = self.product_name(&entry).await;
        let rendered = messages::deposit_refunded(&self.policy.site_name, &product_name, &entry);
        let mut tx = self.pool.begin().await?;
        db::set_refund_status(&mut *tx, entry_id, RefundStatus::Refunded, now).await?;
        let job_id = self
            .queue
            .enqueue_tx(
                &mut *tx,
                &NewJob {
                    job_type: JobType::DepositRefunded,
                    entry_id: Some(entry_id),
                    recipient: &entry.email,
                    subject: &rendered.subject,
                    body: &rendered.body,
                    scheduled_at: now,
                },
                now,
            )
            .await?;
        tx.commit().await?;

        info!(entry_id, order_ref = %order_ref, amount_cents = entry.deposit_amount_cents, "deposit refunded");
        self.queue.after_commit(job_id, now).await;
        self.record(
            AnalyticsEvent::for_entry("deposit_refunded", &entry)
                .with_attribute("order_ref", order_ref.into()),
        )
        .await;
        Ok(outcome)
    }
}

/// Orders that can no longer take a payment.
fn is_abandoned(status: &OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Failed | OrderStatus::Cancelled | OrderStatus::Refunded
    )
}
