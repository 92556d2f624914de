//! Contracts for the systems the engine talks to but does not own.
//!
//! Implementations return `anyhow::Result`; the engine wraps every call in
//! [`call`] so a slow collaborator becomes an ordinary failure.

use crate::error::WaitlistError;
use crate::model::{AnalyticsEvent, OrderStatus, Subject};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Storefront catalog and customer directory.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// `None` when the product (or variation) does not exist.
    async fn get_subject(&self, product_id: i64, variation_id: Option<i64>)
        -> Result<Option<Subject>>;

    /// Account id registered for `email`, if any.
    async fn find_account(&self, _email: &str) -> Result<Option<i64>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositOrderRequest {
    pub entry_id: i64,
    pub buyer_email: String,
    pub buyer_account_id: Option<i64>,
    pub product_id: i64,
    pub variation_id: Option<i64>,
    pub amount_cents: i64,
    pub percentage: u32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositOrder {
    pub order_ref: String,
    pub checkout_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    AlreadyRefunded,
}

/// Order system: creates deposit orders and refunds them.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_deposit_order(&self, request: &DepositOrderRequest) -> Result<DepositOrder>;

    async fn order_status(&self, order_ref: &str) -> Result<OrderStatus>;

    async fn refund_order(
        &self,
        order_ref: &str,
        amount_cents: i64,
        reason: &str,
    ) -> Result<RefundOutcome>;
}

/// Outbound email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, recipient: &str, subject: &str, html_body: &str) -> Result<()>;
}

/// Append-only analytics log. Failures never affect the caller.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_event(&self, event: &AnalyticsEvent) -> Result<()>;
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalytics;

#[async_trait]
impl AnalyticsSink for NoopAnalytics {
    async fn record_event(&self, _event: &AnalyticsEvent) -> Result<()> {
        Ok(())
    }
}

/// Run a collaborator call under `timeout`, mapping errors and timeouts to
/// `CollaboratorUnavailable`.
pub async fn call<T, F>(
    collaborator: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, WaitlistError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(WaitlistError::unavailable(collaborator, err)),
        Err(_) => Err(WaitlistError::unavailable(
            collaborator,
            anyhow::anyhow!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Fire-and-forget analytics write. Failures are logged and dropped.
pub async fn record_event(sink: &dyn AnalyticsSink, timeout: Duration, event: AnalyticsEvent) {
    if let Err(err) = call("analytics", timeout, sink.record_event(&event)).await {
        tracing::warn!(event_type = %event.event_type, entry_id = ?event.entry_id, %err, "analytics event dropped");
    }
}
