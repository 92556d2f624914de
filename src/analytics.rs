use crate::collab::AnalyticsSink;
use crate::db::{self, Pool};
use crate::model::AnalyticsEvent;
use anyhow::Result;
use async_trait::async_trait;

/// Writes events to the append-only `analytics_events` table.
#[derive(Debug, Clone)]
pub struct SqliteAnalytics {
    pool: Pool,
}

impl SqliteAnalytics {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn count(&self, event_type: &str) -> Result<i64> {
        Ok(db::count_analytics_events(&self.pool, event_type).await?)
    }
}

#[async_trait]
impl AnalyticsSink for SqliteAnalytics {
    async fn record_event(&self, event: &AnalyticsEvent) -> Result<()> {
        db::insert_analytics_event(&self.pool, event).await?;
        Ok(())
    }
}
