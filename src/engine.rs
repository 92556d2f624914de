//! Shared state for the waitlist workflows.
//!
//! The workflows themselves live in `waitlist`, `deposit`, `dispatch` and
//! `sweeper` as `impl Engine` blocks.

use crate::analytics::SqliteAnalytics;
use crate::collab::{self, AnalyticsSink, Catalog, Mailer, PaymentGateway};
use crate::config::{Config, Transport};
use crate::db::Pool;
use crate::error::{Result, WaitlistError};
use crate::mailer::{HttpMailer, SmtpMailer};
use crate::model::{AnalyticsEvent, Subject, WaitlistEntry};
use crate::outbox::{NotificationQueue, QueuePolicy};
use crate::settings::Settings;
use crate::storefront::StorefrontClient;
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Adapters for the systems the engine depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn Catalog>,
    pub payments: Arc<dyn PaymentGateway>,
    pub mailer: Arc<dyn Mailer>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

#[derive(Debug, Clone)]
pub struct EnginePolicy {
    pub site_name: String,
    /// Applied to every catalog, payment, transport and analytics call.
    pub collaborator_timeout: Duration,
    pub queue: QueuePolicy,
    /// Entries marked notified per listing during a stock fan-out.
    pub dispatch_chunk_size: i64,
    pub expire_free_entries: bool,
    pub refund_reason: String,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            site_name: "Our Store".to_string(),
            collaborator_timeout: Duration::from_secs(10),
            queue: QueuePolicy::default(),
            dispatch_chunk_size: 100,
            expire_free_entries: true,
            refund_reason: "Waitlist expired - automatic refund".to_string(),
        }
    }
}

pub struct Engine {
    pub(crate) pool: Pool,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) payments: Arc<dyn PaymentGateway>,
    pub(crate) analytics: Arc<dyn AnalyticsSink>,
    pub(crate) settings: Settings,
    pub(crate) queue: NotificationQueue,
    pub(crate) policy: EnginePolicy,
}

impl Engine {
    pub fn new(pool: Pool, collaborators: Collaborators, policy: EnginePolicy) -> Self {
        let queue = NotificationQueue::new(
            pool.clone(),
            collaborators.mailer,
            collaborators.analytics.clone(),
            policy.queue.clone(),
            policy.collaborator_timeout,
        );
        Self {
            settings: Settings::new(pool.clone()),
            pool,
            catalog: collaborators.catalog,
            payments: collaborators.payments,
            analytics: collaborators.analytics,
            queue,
            policy,
        }
    }

    /// Wire the storefront, configured mail transport and SQLite analytics.
    pub fn from_config(pool: Pool, cfg: &Config) -> anyhow::Result<Self> {
        let timeout = cfg.collaborator_timeout();
        let storefront = Arc::new(StorefrontClient::new(
            &cfg.storefront.base_url,
            cfg.storefront.token.clone(),
            timeout,
        )?);
        let mailer: Arc<dyn Mailer> = match cfg.mailer.transport {
            Transport::Smtp => {
                let smtp = cfg.mailer.smtp.as_ref().context("mailer.smtp missing")?;
                Arc::new(SmtpMailer::new(
                    smtp.host.clone(),
                    smtp.port,
                    smtp.username.clone(),
                    smtp.password.clone(),
                    cfg.mailer.from.clone(),
                ))
            }
            Transport::Http => {
                let http = cfg.mailer.http.as_ref().context("mailer.http missing")?;
                Arc::new(HttpMailer::new(
                    &http.endpoint,
                    http.token.clone(),
                    cfg.mailer.from.clone(),
                    timeout,
                )?)
            }
        };
        let collaborators = Collaborators {
            catalog: storefront.clone(),
            payments: storefront,
            mailer,
            analytics: Arc::new(SqliteAnalytics::new(pool.clone())),
        };
        Ok(Self::new(pool, collaborators, cfg.engine_policy()))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    /// Notification job counts keyed by status.
    pub async fn queue_stats(&self) -> Result<BTreeMap<String, i64>> {
        self.queue.stats().await
    }

    /// Catalog lookup; a missing product or variation is `NotFound`.
    pub(crate) async fn lookup_subject(
        &self,
        product_id: i64,
        variation_id: Option<i64>,
    ) -> Result<Subject> {
        let found = collab::call(
            "catalog",
            self.policy.collaborator_timeout,
            self.catalog.get_subject(product_id, variation_id),
        )
        .await?;
        found.ok_or_else(|| match variation_id {
            Some(v) => WaitlistError::NotFound(format!("product {product_id} variation {v}")),
            None => WaitlistError::NotFound(format!("product {product_id}")),
        })
    }

    /// Display name for messages about `entry`, falling back to the id.
    pub(crate) async fn product_name(&self, entry: &WaitlistEntry) -> String {
        match self.lookup_subject(entry.product_id, entry.variation_id).await {
            Ok(subject) => subject.display_name,
            Err(err) => {
                warn!(entry_id = entry.id, %err, "catalog lookup failed; using fallback name");
                fallback_product_name(entry.product_id)
            }
        }
    }

    pub(crate) async fn record(&self, event: AnalyticsEvent) {
        collab::record_event(
            self.analytics.as_ref(),
            self.policy.collaborator_timeout,
            event,
        )
        .await;
    }
}

pub(crate) fn fallback_product_name(product_id: i64) -> String {
    format!("product #{product_id}")
}

/// Variation `0` is the storefront's "no variation".
pub(crate) fn normalize_variation(variation_id: Option<i64>) -> Option<i64> {
    variation_id.filter(|v| *v != 0)
}
