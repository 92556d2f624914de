use super::repo::Pool;
use crate::error::Result;
use crate::model::AnalyticsEvent;
use sqlx::SqliteExecutor;
use tracing::instrument;

/// Raw value stored for `key` at exactly this scope (`None` = global).
pub async fn get_setting(
    exec: impl SqliteExecutor<'_>,
    key: &str,
    product_id: Option<i64>,
) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>(
        "SELECT setting_value FROM settings WHERE setting_key = ? AND IFNULL(product_id, 0) = ?",
    )
    .bind(key)
    .bind(product_id.unwrap_or(0))
    .fetch_optional(exec)
    .await?;
    Ok(value)
}

#[instrument(skip_all, fields(key = %key, product_id = ?product_id))]
pub async fn put_setting(
    pool: &Pool,
    key: &str,
    product_id: Option<i64>,
    value: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM settings WHERE setting_key = ? AND IFNULL(product_id, 0) = ?")
        .bind(key)
        .bind(product_id.unwrap_or(0))
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO settings (setting_key, product_id, setting_value, updated_at) \
         VALUES (?, ?, ?, CURRENT_TIMESTAMP)",
    )
    .bind(key)
    .bind(product_id)
    .bind(value)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn delete_setting(pool: &Pool, key: &str, product_id: Option<i64>) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE setting_key = ? AND IFNULL(product_id, 0) = ?")
        .bind(key)
        .bind(product_id.unwrap_or(0))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_analytics_event(
    exec: impl SqliteExecutor<'_>,
    event: &AnalyticsEvent,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO analytics_events \
         (event_type, entry_id, product_id, variation_id, email, attributes) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&event.event_type)
    .bind(event.entry_id)
    .bind(event.product_id)
    .bind(event.variation_id)
    .bind(event.email.as_deref())
    .bind(event.attributes.to_string())
    .fetch_one(exec)
    .await?;
    Ok(id)
}

pub async fn count_analytics_events(pool: &Pool, event_type: &str) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM analytics_events WHERE event_type = ?",
    )
    .bind(event_type)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn settings_are_scoped() {
        let pool = setup_pool().await;
        put_setting(&pool, "deposit_percentage", None, "25").await.unwrap();
        put_setting(&pool, "deposit_percentage", Some(42), "40").await.unwrap();
        put_setting(&pool, "deposit_percentage", Some(42), "50").await.unwrap();

        assert_eq!(
            get_setting(&pool, "deposit_percentage", None).await.unwrap().as_deref(),
            Some("25")
        );
        assert_eq!(
            get_setting(&pool, "deposit_percentage", Some(42)).await.unwrap().as_deref(),
            Some("50")
        );
        assert_eq!(get_setting(&pool, "deposit_percentage", Some(7)).await.unwrap(), None);

        delete_setting(&pool, "deposit_percentage", Some(42)).await.unwrap();
        assert_eq!(get_setting(&pool, "deposit_percentage", Some(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn analytics_rows_append() {
        let pool = setup_pool().await;
        let event = AnalyticsEvent {
            event_type: "waitlist_join".into(),
            entry_id: Some(1),
            product_id: Some(42),
            variation_id: None,
            email: Some("a@x.com".into()),
            attributes: serde_json::json!({ "position": 1 }),
        };
        insert_analytics_event(&pool, &event).await.unwrap();
        insert_analytics_event(&pool, &event).await.unwrap();
        assert_eq!(count_analytics_events(&pool, "waitlist_join").await.unwrap(), 2);
        assert_eq!(count_analytics_events(&pool, "entry_expired").await.unwrap(), 0);
    }
}
