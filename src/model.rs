use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority tier granted to a confirmed deposit entry.
pub const MAX_PRIORITY: i64 = 100;
/// Priority tier of a free entry.
pub const FREE_PRIORITY: i64 = 0;
/// Delivery attempts before a notification job is parked as `failed`.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Free,
    DepositPending,
    Deposit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Free => "free",
            EntryKind::DepositPending => "deposit_pending",
            EntryKind::Deposit => "deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(EntryKind::Free),
            "deposit_pending" => Some(EntryKind::DepositPending),
            "deposit" => Some(EntryKind::Deposit),
            _ => None,
        }
    }

    pub fn holds_deposit(&self) -> bool {
        matches!(self, EntryKind::DepositPending | EntryKind::Deposit)
    }
}

/// Entry lifecycle. `Notified` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Active,
    Notified,
    Expired,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Notified => "notified",
            EntryStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EntryStatus::Active),
            "notified" => Some(EntryStatus::Notified),
            "expired" => Some(EntryStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Active)
    }
}

/// Outcome of the automatic refund attempted when a deposit entry expires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Refunded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Refunded => "refunded",
            RefundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refunded" => Some(RefundStatus::Refunded),
            "failed" => Some(RefundStatus::Failed),
            _ => None,
        }
    }
}

/// One customer's claim on the restock of a product or one of its variations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitlistEntry {
    pub id: i64,
    pub product_id: i64,
    pub variation_id: Option<i64>,
    pub email: String,
    pub account_id: Option<i64>,
    pub kind: EntryKind,
    pub priority_score: i64,
    /// Arrival count at join time. Display only, never used for ranking.
    pub position: i64,
    pub deposit_amount_cents: i64,
    pub deposit_order_ref: Option<String>,
    pub deposit_confirmed_at: Option<DateTime<Utc>>,
    pub refund_status: Option<RefundStatus>,
    pub status: EntryStatus,
    pub source: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub conversion_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl WaitlistEntry {
    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    JoinConfirmed,
    ProductAvailable,
    DepositConfirmed,
    DepositRefunded,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::JoinConfirmed => "join_confirmed",
            JobType::ProductAvailable => "product_available",
            JobType::DepositConfirmed => "deposit_confirmed",
            JobType::DepositRefunded => "deposit_refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "join_confirmed" => Some(JobType::JoinConfirmed),
            "product_available" => Some(JobType::ProductAvailable),
            "deposit_confirmed" => Some(JobType::DepositConfirmed),
            "deposit_refunded" => Some(JobType::DepositRefunded),
            _ => None,
        }
    }
}

/// Delivery state: pending -> processing -> {sent | pending (retry) | failed}.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "sent" => Some(JobStatus::Sent),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A queued outbound message. The body is rendered before enqueue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationJob {
    pub id: i64,
    pub job_type: JobType,
    pub entry_id: Option<i64>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Catalog view of a product or variation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub price_cents: i64,
    pub in_stock: bool,
    pub display_name: String,
    pub purchase_url: String,
}

/// Order status as reported by the payment system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
    Other(String),
}

impl OrderStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().trim_start_matches("wc-") {
            "pending" => OrderStatus::Pending,
            "processing" => OrderStatus::Processing,
            "on-hold" | "on_hold" => OrderStatus::OnHold,
            "completed" => OrderStatus::Completed,
            "cancelled" => OrderStatus::Cancelled,
            "refunded" => OrderStatus::Refunded,
            "failed" => OrderStatus::Failed,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    /// Payment captured: the entry should hold a confirmed deposit.
    pub fn is_paid(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Processing)
    }

    /// Money returned or never taken: the entry falls back to free.
    pub fn is_reversed(&self) -> bool {
        matches!(self, OrderStatus::Refunded | OrderStatus::Cancelled)
    }
}

/// Append-only analytics record. Attributes are free-form JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsEvent {
    pub event_type: String,
    pub entry_id: Option<i64>,
    pub product_id: Option<i64>,
    pub variation_id: Option<i64>,
    pub email: Option<String>,
    pub attributes: serde_json::Value,
}

impl AnalyticsEvent {
    /// Event about a single entry, carrying its ranking snapshot.
    pub fn for_entry(event_type: &str, entry: &WaitlistEntry) -> Self {
        AnalyticsEvent {
            event_type: event_type.to_string(),
            entry_id: Some(entry.id),
            product_id: Some(entry.product_id),
            variation_id: entry.variation_id,
            email: Some(entry.email.clone()),
            attributes: serde_json::json!({
                "entry_id": entry.id,
                "position": entry.position,
                "kind": entry.kind.as_str(),
                "deposit_amount_cents": entry.deposit_amount_cents,
            }),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &mut self.attributes {
            map.insert(key.to_string(), value);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_forms_round_trip() {
        for kind in [EntryKind::Free, EntryKind::DepositPending, EntryKind::Deposit] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        for status in [EntryStatus::Active, EntryStatus::Notified, EntryStatus::Expired] {
            assert_eq!(EntryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobType::parse("deposit_refunded"), Some(JobType::DepositRefunded));
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn order_status_classification() {
        assert!(OrderStatus::parse("completed").is_paid());
        assert!(OrderStatus::parse("wc-processing").is_paid());
        assert!(OrderStatus::parse("refunded").is_reversed());
        assert!(OrderStatus::parse("cancelled").is_reversed());
        let other = OrderStatus::parse("waitlist-deposit");
        assert_eq!(other, OrderStatus::Other("waitlist-deposit".into()));
        assert!(!other.is_paid() && !other.is_reversed());
        assert!(!OrderStatus::parse("on-hold").is_paid());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!EntryStatus::Active.is_terminal());
        assert!(EntryStatus::Notified.is_terminal());
        assert!(EntryStatus::Expired.is_terminal());
        assert!(EntryKind::DepositPending.holds_deposit());
        assert!(!EntryKind::Free.holds_deposit());
    }
}
