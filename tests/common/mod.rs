#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use restock_waitlist::collab::{
    Catalog, DepositOrder, DepositOrderRequest, Mailer, PaymentGateway, RefundOutcome,
};
use restock_waitlist::analytics::SqliteAnalytics;
use restock_waitlist::model::{OrderStatus, Subject};
use restock_waitlist::waitlist::{JoinRequest, Joined};
use restock_waitlist::{Collaborators, Engine, EnginePolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
pub struct FakeCatalog {
    subjects: Arc<Mutex<HashMap<(i64, Option<i64>), Subject>>>,
    accounts: Arc<Mutex<HashMap<String, i64>>>,
    failing: Arc<Mutex<bool>>,
}

impl FakeCatalog {
    pub async fn put(&self, product_id: i64, variation_id: Option<i64>, price_cents: i64, in_stock: bool) {
        self.subjects.lock().await.insert(
            (product_id, variation_id),
            Subject {
                price_cents,
                in_stock,
                display_name: format!("Product {product_id}"),
                purchase_url: format!("https://shop.example/p/{product_id}"),
            },
        );
    }

    pub async fn add_account(&self, email: &str, id: i64) {
        self.accounts.lock().await.insert(email.to_string(), id);
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn get_subject(&self, product_id: i64, variation_id: Option<i64>) -> Result<Option<Subject>> {
        if *self.failing.lock().await {
            return Err(anyhow!("catalog offline"));
        }
        Ok(self.subjects.lock().await.get(&(product_id, variation_id)).cloned())
    }

    async fn find_account(&self, email: &str) -> Result<Option<i64>> {
        Ok(self.accounts.lock().await.get(email).copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundCall {
    pub order_ref: String,
    pub amount_cents: i64,
    pub reason: String,
}

#[derive(Clone, Default)]
pub struct FakePayments {
    next_order: Arc<Mutex<i64>>,
    orders: Arc<Mutex<Vec<DepositOrderRequest>>>,
    statuses: Arc<Mutex<HashMap<String, OrderStatus>>>,
    refund_script: Arc<Mutex<VecDeque<Result<RefundOutcome>>>>,
    refunds: Arc<Mutex<Vec<RefundCall>>>,
    fail_create: Arc<Mutex<bool>>,
    notify_on_refund: Arc<Mutex<Option<(sqlx::SqlitePool, i64)>>>,
}

impl FakePayments {
    pub async fn orders(&self) -> Vec<DepositOrderRequest> {
        self.orders.lock().await.clone()
    }

    pub async fn refunds(&self) -> Vec<RefundCall> {
        self.refunds.lock().await.clone()
    }

    pub async fn set_status(&self, order_ref: &str, status: OrderStatus) {
        self.statuses.lock().await.insert(order_ref.to_string(), status);
    }

    pub async fn script_refunds(&self, responses: Vec<Result<RefundOutcome>>) {
        self.refund_script.lock().await.extend(responses);
    }

    pub async fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock().await = fail;
    }

    /// Mark `entry_id` notified while the next refund is in flight, as a
    /// concurrent stock fan-out would.
    pub async fn notify_during_refund(&self, pool: sqlx::SqlitePool, entry_id: i64) {
        *self.notify_on_refund.lock().await = Some((pool, entry_id));
    }
}

#[async_trait]
impl PaymentGateway for FakePayments {
    async fn create_deposit_order(&self, request: &DepositOrderRequest) -> Result<DepositOrder> {
        if *self.fail_create.lock().await {
            return Err(anyhow!("gateway declined"));
        }
        self.orders.lock().await.push(request.clone());
        let mut next = self.next_order.lock().await;
        *next += 1;
        let order_ref = format!("order-{}", *next);
        self.statuses
            .lock()
            .await
            .insert(order_ref.clone(), OrderStatus::Pending);
        Ok(DepositOrder {
            checkout_url: format!("https://shop.example/checkout/{order_ref}"),
            order_ref,
        })
    }

    async fn order_status(&self, order_ref: &str) -> Result<OrderStatus> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(order_ref)
            .cloned()
            .unwrap_or(OrderStatus::Pending))
    }

    async fn refund_order(&self, order_ref: &str, amount_cents: i64, reason: &str) -> Result<RefundOutcome> {
        self.refunds.lock().await.push(RefundCall {
            order_ref: order_ref.to_string(),
            amount_cents,
            reason: reason.to_string(),
        });
        if let Some((pool, entry_id)) = self.notify_on_refund.lock().await.take() {
            sqlx::query("UPDATE waitlist_entries SET status = 'notified' WHERE id = ?")
                .bind(entry_id)
                .execute(&pool)
                .await?;
        }
        let next = self
            .refund_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(RefundOutcome::Refunded));
        if next.is_ok() {
            self.set_status(order_ref, OrderStatus::Refunded).await;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Default)]
pub struct RecordingMailer {
    script: Arc<Mutex<VecDeque<Result<()>>>>,
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl RecordingMailer {
    pub async fn fail_next(&self, times: usize) {
        let mut script = self.script.lock().await;
        for _ in 0..times {
            script.push_back(Err(anyhow!("550 mailbox unavailable")));
        }
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, recipient: &str, subject: &str, html_body: &str) -> Result<()> {
        let next = self.script.lock().await.pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.sent.lock().await.push(SentMail {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                body: html_body.to_string(),
            });
        }
        next
    }
}

pub struct Harness {
    pub engine: Engine,
    pub pool: sqlx::SqlitePool,
    pub catalog: FakeCatalog,
    pub payments: FakePayments,
    pub mailer: RecordingMailer,
    pub analytics: SqliteAnalytics,
}

/// Queue delivery deferred to explicit drains so job states are predictable.
pub fn deferred_policy() -> EnginePolicy {
    let mut policy = EnginePolicy {
        site_name: "Test Shop".into(),
        collaborator_timeout: Duration::from_secs(2),
        ..EnginePolicy::default()
    };
    policy.queue.deliver_on_enqueue = false;
    policy
}

pub async fn harness() -> Harness {
    harness_with(setup_pool().await, deferred_policy()).await
}

pub async fn harness_with(pool: sqlx::SqlitePool, policy: EnginePolicy) -> Harness {
    let catalog = FakeCatalog::default();
    let payments = FakePayments::default();
    let mailer = RecordingMailer::default();
    let analytics = SqliteAnalytics::new(pool.clone());
    let engine = Engine::new(
        pool.clone(),
        Collaborators {
            catalog: Arc::new(catalog.clone()),
            payments: Arc::new(payments.clone()),
            mailer: Arc::new(mailer.clone()),
            analytics: Arc::new(analytics.clone()),
        },
        policy,
    );
    Harness {
        engine,
        pool,
        catalog,
        payments,
        mailer,
        analytics,
    }
}

pub fn join_request(product_id: i64, email: &str) -> JoinRequest {
    JoinRequest {
        product_id,
        email: email.to_string(),
        ..JoinRequest::default()
    }
}

impl Harness {
    pub async fn join(&self, product_id: i64, email: &str) -> Joined {
        self.engine
            .join(join_request(product_id, email))
            .await
            .unwrap()
    }

    pub async fn jobs_of_type(&self, job_type: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM notification_jobs WHERE job_type = ?")
            .bind(job_type)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    pub async fn backdate_expiry(&self, entry_id: i64, at: DateTime<Utc>) {
        sqlx::query("UPDATE waitlist_entries SET expires_at = ? WHERE id = ?")
            .bind(at)
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    /// Request a deposit and confirm its payment.
    pub async fn confirm_deposit(&self, entry_id: i64) -> String {
        let checkout = self.engine.request_deposit(entry_id).await.unwrap();
        self.payments
            .set_status(&checkout.order_ref, OrderStatus::Completed)
            .await;
        self.engine
            .on_payment_status_changed(&checkout.order_ref, &OrderStatus::Completed)
            .await
            .unwrap();
        checkout.order_ref
    }
}
