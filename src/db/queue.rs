use super::model::{JobRow, NewJob};
use super::repo::Pool;
use crate::error::Result;
use crate::model::NotificationJob;
use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;
use std::collections::BTreeMap;
use tracing::instrument;

const JOB_COLUMNS: &str = "id, job_type, entry_id, recipient, subject, body, status, scheduled_at, \
     claimed_at, sent_at, retry_count, error_message, created_at";

#[instrument(skip_all, fields(job_type = job.job_type.as_str(), entry_id = ?job.entry_id))]
pub async fn insert_job(
    exec: impl SqliteExecutor<'_>,
    job: &NewJob<'_>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO notification_jobs \
         (job_type, entry_id, recipient, subject, body, status, scheduled_at, retry_count, created_at) \
         VALUES (?, ?, ?, ?, ?, 'pending', ?, 0, ?) RETURNING id",
    )
    .bind(job.job_type.as_str())
    .bind(job.entry_id)
    .bind(job.recipient)
    .bind(job.subject)
    .bind(job.body)
    .bind(job.scheduled_at)
    .bind(now)
    .fetch_one(exec)
    .await?;
    Ok(id)
}

pub async fn find_job(exec: impl SqliteExecutor<'_>, id: i64) -> Result<Option<NotificationJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM notification_jobs WHERE id = ?");
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.map(NotificationJob::try_from).transpose()
}

pub async fn list_jobs_for_entry(
    exec: impl SqliteExecutor<'_>,
    entry_id: i64,
) -> Result<Vec<NotificationJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM notification_jobs WHERE entry_id = ? ORDER BY id ASC");
    let rows = sqlx::query_as::<_, JobRow>(&sql)
        .bind(entry_id)
        .fetch_all(exec)
        .await?;
    rows.into_iter().map(NotificationJob::try_from).collect()
}

/// Ids of pending jobs eligible at `now`, oldest schedule first.
#[instrument(skip_all)]
pub async fn due_job_ids(
    exec: impl SqliteExecutor<'_>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM notification_jobs \
         WHERE status = 'pending' AND julianday(scheduled_at) <= julianday(?) \
         ORDER BY julianday(scheduled_at) ASC, id ASC LIMIT ?",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(exec)
    .await?;
    Ok(ids)
}

/// `pending -> processing`. Returns false if another worker holds the job or
/// it is no longer pending.
pub async fn claim_job(exec: impl SqliteExecutor<'_>, id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notification_jobs SET status = 'processing', claimed_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_job_sent(exec: impl SqliteExecutor<'_>, id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE notification_jobs SET status = 'sent', sent_at = ?, error_message = NULL \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(now)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn reschedule_job(
    exec: impl SqliteExecutor<'_>,
    id: i64,
    retry_count: i64,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE notification_jobs SET status = 'pending', retry_count = ?, scheduled_at = ?, \
         claimed_at = NULL, error_message = ? WHERE id = ? AND status = 'processing'",
    )
    .bind(retry_count)
    .bind(next_attempt_at)
    .bind(error)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn fail_job(
    exec: impl SqliteExecutor<'_>,
    id: i64,
    retry_count: i64,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE notification_jobs SET status = 'failed', retry_count = ?, claimed_at = NULL, \
         error_message = ? WHERE id = ? AND status = 'processing'",
    )
    .bind(retry_count)
    .bind(error)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(())
}

/// Return jobs stuck in `processing` (worker died mid-send) to `pending`.
#[instrument(skip_all)]
pub async fn release_stale_claims(
    exec: impl SqliteExecutor<'_>,
    claimed_before: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE notification_jobs SET status = 'pending', claimed_at = NULL \
         WHERE status = 'processing' AND claimed_at IS NOT NULL \
         AND julianday(claimed_at) < julianday(?)",
    )
    .bind(claimed_before)
    .execute(exec)
    .await?;
    Ok(res.rows_affected())
}

pub async fn count_jobs_by_status(pool: &Pool) -> Result<BTreeMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM notification_jobs GROUP BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, JobType};
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn job(scheduled_at: DateTime<Utc>) -> NewJob<'static> {
        NewJob {
            job_type: JobType::ProductAvailable,
            entry_id: None,
            recipient: "a@x.com",
            subject: "Back in stock",
            body: "<p>hi</p>",
            scheduled_at,
        }
    }

    #[tokio::test]
    async fn due_jobs_ordered_by_schedule() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let later = insert_job(&pool, &job(now - chrono::Duration::minutes(1)), now)
            .await
            .unwrap();
        let earlier = insert_job(&pool, &job(now - chrono::Duration::minutes(5)), now)
            .await
            .unwrap();
        let _future = insert_job(&pool, &job(now + chrono::Duration::hours(1)), now)
            .await
            .unwrap();

        assert_eq!(due_job_ids(&pool, now, 50).await.unwrap(), vec![earlier, later]);
        assert_eq!(due_job_ids(&pool, now, 1).await.unwrap(), vec![earlier]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_stale_claims_are_released() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let id = insert_job(&pool, &job(now), now).await.unwrap();

        assert!(claim_job(&pool, id, now).await.unwrap());
        assert!(!claim_job(&pool, id, now).await.unwrap());
        assert!(due_job_ids(&pool, now, 50).await.unwrap().is_empty());

        let released = release_stale_claims(&pool, now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(released, 1);
        let stored = find_job(&pool, id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.claimed_at.is_none());
    }

    #[tokio::test]
    async fn status_counts() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let a = insert_job(&pool, &job(now), now).await.unwrap();
        insert_job(&pool, &job(now), now).await.unwrap();
        claim_job(&pool, a, now).await.unwrap();
        mark_job_sent(&pool, a, now).await.unwrap();

        let counts = count_jobs_by_status(&pool).await.unwrap();
        assert_eq!(counts.get("sent"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
    }
}
