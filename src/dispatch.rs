//! Back-in-stock fan-out.

use crate::db::{self, NewJob};
use crate::engine::{fallback_product_name, normalize_variation, Engine};
use crate::error::Result;
use crate::messages;
use crate::model::{EntryStatus, JobType};
use crate::settings::SettingKey;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub notified: usize,
    pub job_ids: Vec<i64>,
}

impl Engine {
    pub async fn on_stock_became_available(
        &self,
        product_id: i64,
        variation_id: Option<i64>,
    ) -> Result<DispatchReport> {
        self.on_stock_became_available_at(product_id, variation_id, Utc::now())
            .await
    }

    /// Queue a `product_available` message for every active entry, in rank
    /// order, marking each entry notified in the same transaction as its job.
    /// Re-running after a partial failure only reaches entries still active.
    #[instrument(skip_all, fields(product_id = product_id, variation_id = ?variation_id))]
    pub async fn on_stock_became_available_at(
        &self,
        product_id: i64,
        variation_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport> {
        let variation_id = normalize_variation(variation_id);
        let chunk_size = self.policy.dispatch_chunk_size.max(1);
        let mut report = DispatchReport::default();

        let mut chunk = db::list_active(&self.pool, product_id, variation_id, Some(chunk_size)).await?;
        if chunk.is_empty() {
            debug!("no active entries");
            return Ok(report);
        }

        // A catalog outage must not hold back the fan-out; the message then
        // names the product by id and carries no purchase link.
        let (display_name, purchase_url) = match self.lookup_subject(product_id, variation_id).await {
            Ok(subject) => (subject.display_name, subject.purchase_url),
            Err(err) => {
                warn!(%err, "catalog lookup failed; notifying without product details");
                (fallback_product_name(product_id), String::new())
            }
        };
        let subject_template = self
            .settings
            .template(SettingKey::EmailProductAvailableSubject, product_id)
            .await?;

        while !chunk.is_empty() {
            let mut chunk_jobs = Vec::with_capacity(chunk.len());
            for entry in &chunk {
                let rendered = messages::product_available(
                    &subject_template,
                    &self.policy.site_name,
                    &display_name,
                    &purchase_url,
                    entry,
                );
                let mut tx = self.pool.begin().await?;
                if !db::transition_terminal(&mut *tx, entry.id, EntryStatus::Notified, now).await? {
                    debug!(entry_id = entry.id, "entry left the active set; skipped");
                    continue;
                }
                let job_id = self
                    .queue
                    .enqueue_tx(
                        &mut *tx,
                        &NewJob {
                            job_type: JobType::ProductAvailable,
                            entry_id: Some(entry.id),
                            recipient: &entry.email,
                            subject: &rendered.subject,
                            body: &rendered.body,
                            scheduled_at: now,
                        },
                        now,
                    )
                    .await?;
                tx.commit().await?;
                chunk_jobs.push(job_id);
            }

            for job_id in &chunk_jobs {
                self.queue.after_commit(*job_id, now).await;
            }
            let progressed = !chunk_jobs.is_empty();
            report.notified += chunk_jobs.len();
            report.job_ids.extend(chunk_jobs);
            if !progressed {
                break;
            }
            chunk = db::list_active(&self.pool, product_id, variation_id, Some(chunk_size)).await?;
        }

        info!(notified = report.notified, "back-in-stock notifications queued");
        Ok(report)
    }
}
