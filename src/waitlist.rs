//! Joining a waitlist and reading it back.

use crate::db::{self, NewEntry, NewJob};
use crate::engine::{normalize_variation, Engine};
use crate::error::{Result, WaitlistError};
use crate::messages;
use crate::model::{AnalyticsEvent, JobType, WaitlistEntry};
use crate::settings::SettingKey;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$")
        .expect("email pattern compiles")
});

/// Trimmed, lower-cased address, or `ValidationFailed`.
pub fn canonical_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    if email.len() > 254 || !EMAIL_RE.is_match(&email) {
        return Err(WaitlistError::ValidationFailed(format!(
            "invalid email address {raw:?}"
        )));
    }
    Ok(email)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    pub product_id: i64,
    pub variation_id: Option<i64>,
    pub email: String,
    pub source: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joined {
    pub entry_id: i64,
    /// Arrival count at join time, for display.
    pub position: i64,
}

impl Engine {
    pub async fn join(&self, request: JoinRequest) -> Result<Joined> {
        self.join_at(request, Utc::now()).await
    }

    /// Create a free active entry for an out-of-stock subject and queue the
    /// join confirmation in the same transaction.
    #[instrument(skip_all, fields(product_id = request.product_id, variation_id = ?request.variation_id))]
    pub async fn join_at(&self, request: JoinRequest, now: DateTime<Utc>) -> Result<Joined> {
        let email = canonical_email(&request.email)?;
        if request.product_id <= 0 {
            return Err(WaitlistError::ValidationFailed(format!(
                "invalid product id {}",
                request.product_id
            )));
        }
        let product_id = request.product_id;
        let variation_id = normalize_variation(request.variation_id);

        if !self.settings.enabled(product_id).await? {
            return Err(WaitlistError::ValidationFailed(format!(
                "waitlist is disabled for product {product_id}"
            )));
        }

        let subject = self.lookup_subject(product_id, variation_id).await?;
        if subject.in_stock {
            return Err(WaitlistError::InStock);
        }

        let account_id = match crate::collab::call(
            "catalog",
            self.policy.collaborator_timeout,
            self.catalog.find_account(&email),
        )
        .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "account lookup failed; joining as guest");
                None
            }
        };

        let days = self.settings.expiration_days(product_id).await?;
        let expires_at = (days > 0).then(|| now + chrono::Duration::days(i64::from(days)));
        let subject_template = self
            .settings
            .template(SettingKey::EmailWaitlistJoinedSubject, product_id)
            .await?;

        let new = NewEntry {
            product_id,
            variation_id,
            email: &email,
            account_id,
            source: request.source.as_deref(),
            metadata: request.metadata.as_ref(),
            expires_at,
        };

        let mut tx = self.pool.begin().await?;
        let (entry_id, position) = db::insert_active_entry(&mut *tx, &new, now).await?;
        let entry = db::get_entry(&mut *tx, entry_id).await?;
        let rendered = messages::join_confirmed(
            &subject_template,
            &self.policy.site_name,
            &subject.display_name,
            &entry,
        );
        let job_id = self
            .queue
            .enqueue_tx(
                &mut *tx,
                &NewJob {
                    job_type: JobType::JoinConfirmed,
                    entry_id: Some(entry_id),
                    recipient: &email,
                    subject: &rendered.subject,
                    body: &rendered.body,
                    scheduled_at: now,
                },
                now,
            )
            .await?;
        tx.commit().await?;

        info!(entry_id, position, "joined waitlist");
        self.queue.after_commit(job_id, now).await;
        self.record(AnalyticsEvent::for_entry("waitlist_join", &entry)).await;

        Ok(Joined { entry_id, position })
    }

    pub async fn get_entry(&self, entry_id: i64) -> Result<WaitlistEntry> {
        db::get_entry(&self.pool, entry_id).await
    }

    /// Active entries for the subject, highest priority first, then by arrival.
    pub async fn list_active(
        &self,
        product_id: i64,
        variation_id: Option<i64>,
    ) -> Result<Vec<WaitlistEntry>> {
        db::list_active(&self.pool, product_id, normalize_variation(variation_id), None).await
    }

    pub async fn count_active(&self, product_id: i64, variation_id: Option<i64>) -> Result<i64> {
        db::count_active(&self.pool, product_id, normalize_variation(variation_id)).await
    }

    /// Live 1-based rank of an active entry among its siblings.
    pub async fn live_rank(&self, entry_id: i64) -> Result<i64> {
        let entry = self.get_entry(entry_id).await?;
        if !entry.is_active() {
            return Err(WaitlistError::InvalidState(format!(
                "entry {entry_id} is {}",
                entry.status.as_str()
            )));
        }
        let ranked = db::list_active(&self.pool, entry.product_id, entry.variation_id, None).await?;
        ranked
            .iter()
            .position(|e| e.id == entry_id)
            .map(|idx| idx as i64 + 1)
            .ok_or_else(|| WaitlistError::NotFound(format!("entry {entry_id}")))
    }
}
