//! Typed business settings with per-product overrides.
//!
//! Values resolve product -> global -> built-in default. Lookups are cached
//! per exact scope; every write through [`Settings::set`] invalidates the key.

use crate::db::{self, Pool};
use crate::error::{Result, WaitlistError};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    Enabled,
    DepositEnabled,
    DepositPercentage,
    WaitlistExpirationDays,
    EmailWaitlistJoinedSubject,
    EmailProductAvailableSubject,
}

impl SettingKey {
    pub const ALL: [SettingKey; 6] = [
        SettingKey::Enabled,
        SettingKey::DepositEnabled,
        SettingKey::DepositPercentage,
        SettingKey::WaitlistExpirationDays,
        SettingKey::EmailWaitlistJoinedSubject,
        SettingKey::EmailProductAvailableSubject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Enabled => "enabled",
            SettingKey::DepositEnabled => "deposit_enabled",
            SettingKey::DepositPercentage => "deposit_percentage",
            SettingKey::WaitlistExpirationDays => "waitlist_expiration_days",
            SettingKey::EmailWaitlistJoinedSubject => "email_waitlist_joined_subject",
            SettingKey::EmailProductAvailableSubject => "email_product_available_subject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            SettingKey::Enabled => "1",
            SettingKey::DepositEnabled => "1",
            SettingKey::DepositPercentage => "25",
            SettingKey::WaitlistExpirationDays => "60",
            SettingKey::EmailWaitlistJoinedSubject => "You've joined the waitlist for {product_name}",
            SettingKey::EmailProductAvailableSubject => "Good news! {product_name} is back in stock",
        }
    }

    fn validate(&self, value: &str) -> Result<()> {
        match self {
            SettingKey::Enabled | SettingKey::DepositEnabled => parse_flag(*self, value).map(|_| ()),
            SettingKey::DepositPercentage => parse_percentage(value).map(|_| ()),
            SettingKey::WaitlistExpirationDays => parse_days(value).map(|_| ()),
            SettingKey::EmailWaitlistJoinedSubject | SettingKey::EmailProductAvailableSubject => {
                if value.trim().is_empty() {
                    Err(WaitlistError::ValidationFailed(format!(
                        "{} must be non-empty",
                        self.as_str()
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn parse_flag(key: SettingKey, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(WaitlistError::ValidationFailed(format!(
            "{} must be a flag, got {other:?}",
            key.as_str()
        ))),
    }
}

fn parse_percentage(value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(p) if (1..=100).contains(&p) => Ok(p),
        _ => Err(WaitlistError::ValidationFailed(format!(
            "deposit_percentage must be between 1 and 100, got {value:?}"
        ))),
    }
}

fn parse_days(value: &str) -> Result<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        WaitlistError::ValidationFailed(format!(
            "waitlist_expiration_days must be a whole number, got {value:?}"
        ))
    })
}

type CacheKey = (SettingKey, Option<i64>);

pub struct Settings {
    pool: Pool,
    cache: RwLock<HashMap<CacheKey, Option<String>>>,
}

impl Settings {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Stored value at exactly this scope.
    async fn scoped(&self, key: SettingKey, product_id: Option<i64>) -> Result<Option<String>> {
        if let Some(hit) = self.cache.read().await.get(&(key, product_id)) {
            return Ok(hit.clone());
        }
        let value = db::get_setting(&self.pool, key.as_str(), product_id).await?;
        self.cache
            .write()
            .await
            .insert((key, product_id), value.clone());
        Ok(value)
    }

    /// Product override, then global value, then built-in default.
    pub async fn resolve(&self, key: SettingKey, product_id: Option<i64>) -> Result<String> {
        if product_id.is_some() {
            if let Some(value) = self.scoped(key, product_id).await? {
                return Ok(value);
            }
        }
        if let Some(value) = self.scoped(key, None).await? {
            return Ok(value);
        }
        Ok(key.default_value().to_string())
    }

    pub async fn set(&self, key: SettingKey, product_id: Option<i64>, value: &str) -> Result<()> {
        key.validate(value)?;
        db::put_setting(&self.pool, key.as_str(), product_id, value).await?;
        self.invalidate(Some(key)).await;
        debug!(key = key.as_str(), ?product_id, "setting updated");
        Ok(())
    }

    pub async fn clear(&self, key: SettingKey, product_id: Option<i64>) -> Result<()> {
        db::delete_setting(&self.pool, key.as_str(), product_id).await?;
        self.invalidate(Some(key)).await;
        Ok(())
    }

    /// Drop cached values for `key`, or everything when `None`.
    pub async fn invalidate(&self, key: Option<SettingKey>) {
        let mut cache = self.cache.write().await;
        match key {
            Some(key) => cache.retain(|(k, _), _| *k != key),
            None => cache.clear(),
        }
    }

    pub async fn enabled(&self, product_id: i64) -> Result<bool> {
        let raw = self.resolve(SettingKey::Enabled, Some(product_id)).await?;
        parse_flag(SettingKey::Enabled, &raw)
    }

    pub async fn deposit_enabled(&self, product_id: i64) -> Result<bool> {
        let raw = self.resolve(SettingKey::DepositEnabled, Some(product_id)).await?;
        parse_flag(SettingKey::DepositEnabled, &raw)
    }

    pub async fn deposit_percentage(&self, product_id: i64) -> Result<u32> {
        let raw = self
            .resolve(SettingKey::DepositPercentage, Some(product_id))
            .await?;
        parse_percentage(&raw)
    }

    /// Waitlist window in days. Zero means entries never expire.
    pub async fn expiration_days(&self, product_id: i64) -> Result<u32> {
        let raw = self
            .resolve(SettingKey::WaitlistExpirationDays, Some(product_id))
            .await?;
        parse_days(&raw)
    }

    pub async fn template(&self, key: SettingKey, product_id: i64) -> Result<String> {
        self.resolve(key, Some(product_id)).await
    }
}
