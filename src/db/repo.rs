use super::model::{EntryRow, NewEntry};
use crate::error::{Result, WaitlistError};
use crate::model::{EntryKind, EntryStatus, RefundStatus, WaitlistEntry};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

const ENTRY_COLUMNS: &str = "id, product_id, variation_id, email, account_id, kind, priority_score, \
     position, deposit_amount_cents, deposit_order_ref, deposit_confirmed_at, refund_status, status, \
     source, metadata, conversion_id, created_at, updated_at, expires_at";

pub async fn init_pool(database_url: &str) -> anyhow::Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with full sync; writers wait on each other instead of failing fast.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("failed to open database")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn into_entries(rows: Vec<EntryRow>) -> Result<Vec<WaitlistEntry>> {
    rows.into_iter().map(WaitlistEntry::try_from).collect()
}

/// Insert a new active free entry and stamp its arrival position.
///
/// The partial unique index on active entries turns a concurrent double join
/// into `AlreadyOnWaitlist` instead of a second row. The position is the count
/// of active entries for the subject including the new row. Run it inside a
/// transaction so a rejected insert is rolled back with the connection state.
#[instrument(skip_all, fields(product_id = new.product_id, variation_id = ?new.variation_id))]
pub async fn insert_active_entry(
    conn: &mut SqliteConnection,
    new: &NewEntry<'_>,
    now: DateTime<Utc>,
) -> Result<(i64, i64)> {
    let metadata = new.metadata.map(|m| m.to_string());
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO waitlist_entries \
         (product_id, variation_id, email, account_id, kind, priority_score, position, \
          deposit_amount_cents, status, source, metadata, created_at, updated_at, expires_at) \
         VALUES (?, ?, ?, ?, 'free', 0, 0, 0, 'active', ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.product_id)
    .bind(new.variation_id)
    .bind(new.email)
    .bind(new.account_id)
    .bind(new.source)
    .bind(metadata)
    .bind(now)
    .bind(now)
    .bind(new.expires_at)
    .fetch_one(&mut *conn)
    .await;

    let id = match inserted {
        Ok(id) => id,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(WaitlistError::AlreadyOnWaitlist);
        }
        Err(err) => return Err(err.into()),
    };

    let position: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM waitlist_entries \
         WHERE product_id = ? AND IFNULL(variation_id, 0) = ? AND status = 'active'",
    )
    .bind(new.product_id)
    .bind(new.variation_id.unwrap_or(0))
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE waitlist_entries SET position = ? WHERE id = ?")
        .bind(position)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok((id, position))
}

#[instrument(skip_all, fields(entry_id = id))]
pub async fn find_entry(exec: impl SqliteExecutor<'_>, id: i64) -> Result<Option<WaitlistEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE id = ?");
    let row = sqlx::query_as::<_, EntryRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.map(WaitlistEntry::try_from).transpose()
}

pub async fn get_entry(exec: impl SqliteExecutor<'_>, id: i64) -> Result<WaitlistEntry> {
    find_entry(exec, id)
        .await?
        .ok_or_else(|| WaitlistError::NotFound(format!("entry {id}")))
}

#[instrument(skip_all)]
pub async fn find_entry_by_order_ref(
    exec: impl SqliteExecutor<'_>,
    order_ref: &str,
) -> Result<Option<WaitlistEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE deposit_order_ref = ? \
         ORDER BY id DESC LIMIT 1"
    );
    let row = sqlx::query_as::<_, EntryRow>(&sql)
        .bind(order_ref)
        .fetch_optional(exec)
        .await?;
    row.map(WaitlistEntry::try_from).transpose()
}

/// Active entries for the subject in ranking order: priority descending,
/// then arrival. A missing variation matches parent-level entries only.
#[instrument(skip_all, fields(product_id = product_id, variation_id = ?variation_id))]
pub async fn list_active(
    exec: impl SqliteExecutor<'_>,
    product_id: i64,
    variation_id: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<WaitlistEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
         WHERE product_id = ? AND IFNULL(variation_id, 0) = ? AND status = 'active' \
         ORDER BY priority_score DESC, julianday(created_at) ASC, id ASC LIMIT ?"
    );
    let rows = sqlx::query_as::<_, EntryRow>(&sql)
        .bind(product_id)
        .bind(variation_id.unwrap_or(0))
        .bind(limit.unwrap_or(-1))
        .fetch_all(exec)
        .await?;
    into_entries(rows)
}

#[instrument(skip_all, fields(product_id = product_id, variation_id = ?variation_id))]
pub async fn count_active(
    exec: impl SqliteExecutor<'_>,
    product_id: i64,
    variation_id: Option<i64>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM waitlist_entries \
         WHERE product_id = ? AND IFNULL(variation_id, 0) = ? AND status = 'active'",
    )
    .bind(product_id)
    .bind(variation_id.unwrap_or(0))
    .fetch_one(exec)
    .await?;
    Ok(count)
}

/// Absolute assignment of the deposit classification. `None` for the amount
/// or order ref keeps the stored value.
#[instrument(skip_all, fields(entry_id = id, kind = kind.as_str()))]
pub async fn update_kind_and_priority(
    exec: impl SqliteExecutor<'_>,
    id: i64,
    kind: EntryKind,
    priority_score: i64,
    deposit_amount_cents: Option<i64>,
    deposit_order_ref: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE waitlist_entries SET kind = ?, priority_score = ?, \
         deposit_amount_cents = COALESCE(?, deposit_amount_cents), \
         deposit_order_ref = COALESCE(?, deposit_order_ref), updated_at = ? \
         WHERE id = ?",
    )
    .bind(kind.as_str())
    .bind(priority_score)
    .bind(deposit_amount_cents)
    .bind(deposit_order_ref)
    .bind(now)
    .bind(id)
    .execute(exec)
    .await?;
    if res.rows_affected() == 0 {
        return Err(WaitlistError::NotFound(format!("entry {id}")));
    }
    Ok(())
}

/// Set the deposit confirmation marker if unset. Returns true only for the
/// call that set it.
pub async fn claim_deposit_confirmation(
    exec: impl SqliteExecutor<'_>,
    id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE waitlist_entries SET deposit_confirmed_at = ? \
         WHERE id = ? AND deposit_confirmed_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn clear_deposit_confirmation(exec: impl SqliteExecutor<'_>, id: i64) -> Result<()> {
    sqlx::query("UPDATE waitlist_entries SET deposit_confirmed_at = NULL WHERE id = ?")
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Move an active entry to a terminal status. Returns false when the entry
/// was not active (already terminal or missing).
pub async fn transition_terminal(
    exec: impl SqliteExecutor<'_>,
    id: i64,
    status: EntryStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    if !status.is_terminal() {
        return Err(WaitlistError::InvalidState(format!(
            "entry {id} cannot be moved back to {}",
            status.as_str()
        )));
    }
    let res = sqlx::query(
        "UPDATE waitlist_entries SET status = ?, updated_at = ? WHERE id = ? AND status = 'active'",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(res.rows_affected() == 1)
}

async fn mark_terminal(pool: &Pool, id: i64, status: EntryStatus) -> Result<()> {
    if transition_terminal(pool, id, status, Utc::now()).await? {
        return Ok(());
    }
    let entry = get_entry(pool, id).await?;
    Err(WaitlistError::InvalidState(format!(
        "entry {id} is already {}",
        entry.status.as_str()
    )))
}

#[instrument(skip_all, fields(entry_id = id))]
pub async fn mark_notified(pool: &Pool, id: i64) -> Result<()> {
    mark_terminal(pool, id, EntryStatus::Notified).await
}

#[instrument(skip_all, fields(entry_id = id))]
pub async fn mark_expired(pool: &Pool, id: i64) -> Result<()> {
    mark_terminal(pool, id, EntryStatus::Expired).await
}

pub async fn set_refund_status(
    exec: impl SqliteExecutor<'_>,
    id: i64,
    refund_status: RefundStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE waitlist_entries SET refund_status = ?, updated_at = ? WHERE id = ?")
        .bind(refund_status.as_str())
        .bind(now)
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Active deposit entries whose window lapsed before `now`.
#[instrument(skip_all)]
pub async fn select_expired_deposits(
    exec: impl SqliteExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<WaitlistEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
         WHERE status = 'active' AND kind = 'deposit' AND deposit_order_ref IS NOT NULL \
         AND expires_at IS NOT NULL AND julianday(expires_at) < julianday(?) \
         ORDER BY expires_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, EntryRow>(&sql)
        .bind(now)
        .fetch_all(exec)
        .await?;
    into_entries(rows)
}

/// Expired deposit entries whose automatic refund has not gone through yet.
#[instrument(skip_all)]
pub async fn select_failed_refunds(exec: impl SqliteExecutor<'_>) -> Result<Vec<WaitlistEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
         WHERE status = 'expired' AND kind = 'deposit' AND refund_status = 'failed' \
         AND deposit_order_ref IS NOT NULL ORDER BY updated_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, EntryRow>(&sql).fetch_all(exec).await?;
    into_entries(rows)
}

/// Active free entries whose window lapsed before `now`.
#[instrument(skip_all)]
pub async fn select_lapsed_free(
    exec: impl SqliteExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<WaitlistEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
         WHERE status = 'active' AND kind = 'free' \
         AND expires_at IS NOT NULL AND julianday(expires_at) < julianday(?) \
         ORDER BY expires_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, EntryRow>(&sql)
        .bind(now)
        .fetch_all(exec)
        .await?;
    into_entries(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MAX_PRIORITY;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_entry(email: &str) -> NewEntry<'_> {
        NewEntry {
            product_id: 42,
            variation_id: None,
            email,
            account_id: None,
            source: None,
            metadata: None,
            expires_at: Some(Utc::now() + chrono::Duration::days(60)),
        }
    }

    /// Insert in its own transaction, the way `Engine::join_at` does.
    async fn try_insert(pool: &Pool, new: &NewEntry<'_>) -> Result<(i64, i64)> {
        let mut tx = pool.begin().await?;
        let inserted = insert_active_entry(&mut *tx, new, Utc::now()).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert(pool: &Pool, email: &str) -> (i64, i64) {
        try_insert(pool, &new_entry(email)).await.unwrap()
    }

    #[test]
    fn prepare_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_url_keeps_query_and_creates_parent() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("waitlist.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, url);
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn positions_count_active_siblings() {
        let pool = setup_pool().await;
        assert_eq!(insert(&pool, "a@x.com").await.1, 1);
        assert_eq!(insert(&pool, "b@x.com").await.1, 2);

        let mut variant = new_entry("a@x.com");
        variant.variation_id = Some(7);
        let (_, pos) = try_insert(&pool, &variant).await.unwrap();
        assert_eq!(pos, 1, "variation entries are counted separately");

        assert_eq!(count_active(&pool, 42, None).await.unwrap(), 2);
        assert_eq!(count_active(&pool, 42, Some(7)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_active_entry_is_rejected() {
        let pool = setup_pool().await;
        let (id, _) = insert(&pool, "a@x.com").await;
        let err = try_insert(&pool, &new_entry("a@x.com")).await.unwrap_err();
        assert!(matches!(err, WaitlistError::AlreadyOnWaitlist));
        assert_eq!(count_active(&pool, 42, None).await.unwrap(), 1);

        // Once terminal, the same email may join again.
        mark_notified(&pool, id).await.unwrap();
        let (rejoined, pos) = try_insert(&pool, &new_entry("a@x.com")).await.unwrap();
        assert_ne!(rejoined, id);
        assert_eq!(pos, 1);
    }

    #[tokio::test]
    async fn reused_position_does_not_jump_the_queue() {
        let pool = setup_pool().await;
        let (a, _) = insert(&pool, "a@x.com").await;
        let (b, _) = insert(&pool, "b@x.com").await;
        let (c, c_pos) = insert(&pool, "c@x.com").await;
        assert_eq!(c_pos, 3);

        // Once earlier siblings leave, a later joiner is stamped with a lower
        // position than `c` but still ranks behind it.
        mark_expired(&pool, a).await.unwrap();
        mark_expired(&pool, b).await.unwrap();
        let (d, d_pos) = insert(&pool, "d@x.com").await;
        assert_eq!(d_pos, 2);

        let ranked = list_active(&pool, 42, None, None).await.unwrap();
        let ids: Vec<i64> = ranked.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![c, d]);
        let positions: Vec<i64> = ranked.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![3, 2]);
    }

    #[tokio::test]
    async fn terminal_transitions_are_one_way() {
        let pool = setup_pool().await;
        let (id, _) = insert(&pool, "a@x.com").await;
        mark_expired(&pool, id).await.unwrap();
        let err = mark_notified(&pool, id).await.unwrap_err();
        assert!(matches!(err, WaitlistError::InvalidState(_)));
        assert!(matches!(
            mark_expired(&pool, 999).await.unwrap_err(),
            WaitlistError::NotFound(_)
        ));
        assert!(transition_terminal(&pool, id, EntryStatus::Active, Utc::now())
            .await
            .is_err());
        assert_eq!(
            get_entry(&pool, id).await.unwrap().status,
            EntryStatus::Expired
        );
    }

    #[tokio::test]
    async fn list_active_orders_by_priority_then_arrival() {
        let pool = setup_pool().await;
        let (a, _) = insert(&pool, "a@x.com").await;
        let (b, _) = insert(&pool, "b@x.com").await;
        let (c, _) = insert(&pool, "c@x.com").await;
        update_kind_and_priority(
            &pool,
            c,
            EntryKind::Deposit,
            MAX_PRIORITY,
            Some(500),
            Some("order-1"),
            Utc::now(),
        )
        .await
        .unwrap();

        let ids: Vec<i64> = list_active(&pool, 42, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![c, a, b]);

        let first = list_active(&pool, 42, None, Some(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].deposit_order_ref.as_deref(), Some("order-1"));
        assert_eq!(
            find_entry_by_order_ref(&pool, "order-1")
                .await
                .unwrap()
                .map(|e| e.id),
            Some(c)
        );
    }

    #[tokio::test]
    async fn deposit_confirmation_claim_happens_once() {
        let pool = setup_pool().await;
        let (id, _) = insert(&pool, "a@x.com").await;
        assert!(claim_deposit_confirmation(&pool, id, Utc::now()).await.unwrap());
        assert!(!claim_deposit_confirmation(&pool, id, Utc::now()).await.unwrap());
        clear_deposit_confirmation(&pool, id).await.unwrap();
        assert!(claim_deposit_confirmation(&pool, id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_selection_filters_kind_and_time() {
        let pool = setup_pool().await;
        let (dep, _) = insert(&pool, "dep@x.com").await;
        let (free, _) = insert(&pool, "free@x.com").await;
        let (_fresh, _) = insert(&pool, "fresh@x.com").await;
        update_kind_and_priority(
            &pool,
            dep,
            EntryKind::Deposit,
            MAX_PRIORITY,
            Some(250),
            Some("order-9"),
            Utc::now(),
        )
        .await
        .unwrap();
        let past = Utc::now() - chrono::Duration::days(1);
        sqlx::query("UPDATE waitlist_entries SET expires_at = ? WHERE id IN (?, ?)")
            .bind(past)
            .bind(dep)
            .bind(free)
            .execute(&pool)
            .await
            .unwrap();

        let deposits = select_expired_deposits(&pool, Utc::now()).await.unwrap();
        assert_eq!(deposits.iter().map(|e| e.id).collect::<Vec<_>>(), vec![dep]);
        let lapsed = select_lapsed_free(&pool, Utc::now()).await.unwrap();
        assert_eq!(lapsed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![free]);

        mark_expired(&pool, dep).await.unwrap();
        set_refund_status(&pool, dep, RefundStatus::Failed, Utc::now())
            .await
            .unwrap();
        let failed = select_failed_refunds(&pool).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].refund_status, Some(RefundStatus::Failed));
    }
}
