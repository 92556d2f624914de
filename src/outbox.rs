//! Durable notification queue.
//!
//! Jobs move `pending -> processing -> {sent | pending (retry) | failed}`.
//! A job is claimed with a conditional update before the transport is
//! called, so two drains never send the same job concurrently.

use crate::collab::{self, AnalyticsSink, Mailer};
use crate::db::{self, NewJob, Pool};
use crate::error::{Result, WaitlistError};
use crate::model::{AnalyticsEvent, JobStatus, DEFAULT_MAX_RETRIES};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Attempts before a job is parked as `failed`.
    pub max_retries: i64,
    pub retry_backoff_secs: i64,
    /// Double the delay on each retry instead of using a fixed one.
    pub exponential: bool,
    /// Upper bound for exponential delays; `0` disables the cap.
    pub max_backoff_secs: i64,
    /// Jobs left in `processing` longer than this are returned to `pending`.
    pub claim_lease_secs: i64,
    pub batch_size: i64,
    /// Try one delivery right after a job is committed.
    pub deliver_on_enqueue: bool,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_secs: 3600,
            exponential: false,
            max_backoff_secs: 6 * 3600,
            claim_lease_secs: 15 * 60,
            batch_size: 50,
            deliver_on_enqueue: true,
        }
    }
}

impl QueuePolicy {
    /// Delay before the next attempt, given the retry count after the failure.
    pub fn backoff(&self, retry_count: i64) -> chrono::Duration {
        let base = self.retry_backoff_secs.max(0);
        if !self.exponential {
            return chrono::Duration::seconds(base);
        }
        let shift = (retry_count - 1).clamp(0, 20) as u32;
        let secs = base.saturating_mul(1_i64 << shift);
        let secs = if self.max_backoff_secs <= 0 {
            secs
        } else {
            secs.min(self.max_backoff_secs)
        };
        chrono::Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The job had already been sent; nothing was done.
    AlreadySent,
    Retrying { retry_count: i64, next_attempt_at: DateTime<Utc> },
    Failed { retry_count: i64 },
    /// Not claimable: failed, or held by another worker.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub released: u64,
    pub attempted: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DrainReport {
    fn tally(&mut self, outcome: Delivery) {
        self.attempted += 1;
        match outcome {
            Delivery::Sent => self.sent += 1,
            Delivery::Retrying { .. } => self.retried += 1,
            Delivery::Failed { .. } => self.failed += 1,
            Delivery::AlreadySent | Delivery::Skipped => self.skipped += 1,
        }
    }
}

pub struct NotificationQueue {
    pool: Pool,
    mailer: Arc<dyn Mailer>,
    analytics: Arc<dyn AnalyticsSink>,
    policy: QueuePolicy,
    timeout: Duration,
}

impl NotificationQueue {
    pub fn new(
        pool: Pool,
        mailer: Arc<dyn Mailer>,
        analytics: Arc<dyn AnalyticsSink>,
        policy: QueuePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            mailer,
            analytics,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Insert a job and, when configured, attempt it immediately.
    #[instrument(skip_all, fields(job_type = job.job_type.as_str()))]
    pub async fn enqueue(&self, job: &NewJob<'_>, now: DateTime<Utc>) -> Result<i64> {
        let id = db::insert_job(&self.pool, job, now).await?;
        self.after_commit(id, now).await;
        Ok(id)
    }

    /// Insert a job inside the caller's transaction. Call
    /// [`NotificationQueue::after_commit`] once the transaction commits.
    pub async fn enqueue_tx(
        &self,
        conn: &mut SqliteConnection,
        job: &NewJob<'_>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        db::insert_job(&mut *conn, job, now).await
    }

    /// Immediate delivery attempt for a freshly committed job. The job stays
    /// queued for the next drain if anything goes wrong here.
    pub async fn after_commit(&self, job_id: i64, now: DateTime<Utc>) {
        if !self.policy.deliver_on_enqueue {
            return;
        }
        if let Err(err) = self.attempt_delivery(job_id, now).await {
            warn!(job_id, %err, "immediate delivery attempt errored; left for drain");
        }
    }

    /// Deliver one job, recording success, a rescheduled retry, or terminal failure.
    #[instrument(skip_all, fields(job_id = job_id))]
    pub async fn attempt_delivery(&self, job_id: i64, now: DateTime<Utc>) -> Result<Delivery> {
        let job = db::find_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| WaitlistError::NotFound(format!("notification job {job_id}")))?;
        match job.status {
            JobStatus::Sent => return Ok(Delivery::AlreadySent),
            JobStatus::Failed | JobStatus::Processing => return Ok(Delivery::Skipped),
            JobStatus::Pending => {}
        }
        if !db::claim_job(&self.pool, job_id, now).await? {
            debug!(job_id, "job claimed elsewhere");
            return Ok(Delivery::Skipped);
        }

        let sent = collab::call(
            "transport",
            self.timeout,
            self.mailer.send_email(&job.recipient, &job.subject, &job.body),
        )
        .await;

        match sent {
            Ok(()) => {
                db::mark_job_sent(&self.pool, job_id, now).await?;
                info!(job_id, job_type = job.job_type.as_str(), "notification sent");
                let event = AnalyticsEvent {
                    event_type: "notification_sent".to_string(),
                    entry_id: job.entry_id,
                    product_id: None,
                    variation_id: None,
                    email: Some(job.recipient.clone()),
                    attributes: serde_json::json!({
                        "job_id": job_id,
                        "job_type": job.job_type.as_str(),
                        "entry_id": job.entry_id,
                    }),
                };
                collab::record_event(self.analytics.as_ref(), self.timeout, event).await;
                Ok(Delivery::Sent)
            }
            Err(err) => {
                let retry_count = job.retry_count + 1;
                let message = err.to_string();
                if retry_count >= self.policy.max_retries {
                    db::fail_job(&self.pool, job_id, retry_count, &message).await?;
                    error!(job_id, retry_count, error = %message, "notification failed permanently");
                    Ok(Delivery::Failed { retry_count })
                } else {
                    let next_attempt_at = now + self.policy.backoff(retry_count);
                    db::reschedule_job(&self.pool, job_id, retry_count, next_attempt_at, &message)
                        .await?;
                    warn!(job_id, retry_count, %next_attempt_at, error = %message, "notification failed; backoff");
                    Ok(Delivery::Retrying {
                        retry_count,
                        next_attempt_at,
                    })
                }
            }
        }
    }

    /// One pass over due jobs using the configured batch size.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        self.drain_batch(now, self.policy.batch_size).await
    }

    #[instrument(skip_all, fields(batch_size = batch_size))]
    pub async fn drain_batch(&self, now: DateTime<Utc>, batch_size: i64) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let lease = chrono::Duration::seconds(self.policy.claim_lease_secs.max(0));
        report.released = db::release_stale_claims(&self.pool, now - lease).await?;
        if report.released > 0 {
            warn!(released = report.released, "released stale notification claims");
        }

        for job_id in db::due_job_ids(&self.pool, now, batch_size.max(1)).await? {
            let outcome = self.attempt_delivery(job_id, now).await?;
            report.tally(outcome);
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                "drain pass finished"
            );
        }
        Ok(report)
    }

    /// Job counts keyed by status.
    pub async fn stats(&self) -> Result<BTreeMap<String, i64>> {
        db::count_jobs_by_status(&self.pool).await
    }
}
