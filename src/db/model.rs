//! Row models returned by repositories.
//!
//! Rows keep the persisted string forms; conversion into domain types lives
//! here so repositories stay focused on SQL.

use crate::error::WaitlistError;
use crate::model::{
    EntryKind, EntryStatus, JobStatus, JobType, NotificationJob, RefundStatus, WaitlistEntry,
};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub id: i64,
    pub product_id: i64,
    pub variation_id: Option<i64>,
    pub email: String,
    pub account_id: Option<i64>,
    pub kind: String,
    pub priority_score: i64,
    pub position: i64,
    pub deposit_amount_cents: i64,
    pub deposit_order_ref: Option<String>,
    pub deposit_confirmed_at: Option<DateTime<Utc>>,
    pub refund_status: Option<String>,
    pub status: String,
    pub source: Option<String>,
    pub metadata: Option<String>,
    pub conversion_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<EntryRow> for WaitlistEntry {
    type Error = WaitlistError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let kind = EntryKind::parse(&row.kind)
            .ok_or_else(|| WaitlistError::Corrupt(format!("entry {} kind {}", row.id, row.kind)))?;
        let status = EntryStatus::parse(&row.status).ok_or_else(|| {
            WaitlistError::Corrupt(format!("entry {} status {}", row.id, row.status))
        })?;
        let refund_status = match row.refund_status.as_deref() {
            None => None,
            Some(s) => Some(RefundStatus::parse(s).ok_or_else(|| {
                WaitlistError::Corrupt(format!("entry {} refund status {}", row.id, s))
            })?),
        };
        // Metadata is caller-supplied and opaque; a malformed blob is kept as a string.
        let metadata = row.metadata.map(|raw| {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        });

        Ok(WaitlistEntry {
            id: row.id,
            product_id: row.product_id,
            variation_id: row.variation_id,
            email: row.email,
            account_id: row.account_id,
            kind,
            priority_score: row.priority_score,
            position: row.position,
            deposit_amount_cents: row.deposit_amount_cents,
            deposit_order_ref: row.deposit_order_ref,
            deposit_confirmed_at: row.deposit_confirmed_at,
            refund_status,
            status,
            source: row.source,
            metadata,
            conversion_id: row.conversion_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub job_type: String,
    pub entry_id: Option<i64>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for NotificationJob {
    type Error = WaitlistError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_type = JobType::parse(&row.job_type).ok_or_else(|| {
            WaitlistError::Corrupt(format!("job {} type {}", row.id, row.job_type))
        })?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| WaitlistError::Corrupt(format!("job {} status {}", row.id, row.status)))?;
        Ok(NotificationJob {
            id: row.id,
            job_type,
            entry_id: row.entry_id,
            recipient: row.recipient,
            subject: row.subject,
            body: row.body,
            status,
            scheduled_at: row.scheduled_at,
            claimed_at: row.claimed_at,
            sent_at: row.sent_at,
            retry_count: row.retry_count,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

/// Insert payload for a new active entry.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub product_id: i64,
    pub variation_id: Option<i64>,
    pub email: &'a str,
    pub account_id: Option<i64>,
    pub source: Option<&'a str>,
    pub metadata: Option<&'a serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new notification job.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub job_type: JobType,
    pub entry_id: Option<i64>,
    pub recipient: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub scheduled_at: DateTime<Utc>,
}
