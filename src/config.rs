//! Configuration loader and validator for the waitlist service.
use crate::engine::EnginePolicy;
use crate::outbox::QueuePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub queue: Queue,
    pub sweeper: Sweeper,
    pub dispatch: Dispatch,
    pub collaborators: Collaborators,
    pub storefront: Storefront,
    pub mailer: Mailer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Substituted for `{site_name}` in message templates.
    pub site_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_retries: i64,
    pub retry_backoff_seconds: i64,
    #[serde(default)]
    pub exponential_backoff: bool,
    pub max_backoff_seconds: i64,
    pub claim_lease_seconds: i64,
    pub deliver_on_enqueue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sweeper {
    pub interval_seconds: u64,
    pub expire_free_entries: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub chunk_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collaborators {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storefront {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Smtp,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mailer {
    pub transport: Transport,
    pub from: String,
    #[serde(default)]
    pub smtp: Option<Smtp>,
    #[serde(default)]
    pub http: Option<HttpRelay>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smtp {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRelay {
    pub endpoint: String,
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` if set, else a database file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/waitlist.db", self.app.data_dir))
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborators.timeout_ms)
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_retries: self.queue.max_retries,
            retry_backoff_secs: self.queue.retry_backoff_seconds,
            exponential: self.queue.exponential_backoff,
            max_backoff_secs: self.queue.max_backoff_seconds,
            claim_lease_secs: self.queue.claim_lease_seconds,
            batch_size: self.queue.batch_size,
            deliver_on_enqueue: self.queue.deliver_on_enqueue,
        }
    }

    pub fn engine_policy(&self) -> EnginePolicy {
        EnginePolicy {
            site_name: self.app.site_name.clone(),
            collaborator_timeout: self.collaborator_timeout(),
            queue: self.queue_policy(),
            dispatch_chunk_size: self.dispatch.chunk_size,
            expire_free_entries: self.sweeper.expire_free_entries,
            ..EnginePolicy::default()
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.site_name.trim().is_empty() {
        return Err(ConfigError::Invalid("app.site_name must be non-empty"));
    }

    let q = &cfg.queue;
    if q.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("queue.poll_interval_ms must be > 0"));
    }
    if q.batch_size <= 0 {
        return Err(ConfigError::Invalid("queue.batch_size must be > 0"));
    }
    if q.max_retries <= 0 {
        return Err(ConfigError::Invalid("queue.max_retries must be > 0"));
    }
    if q.retry_backoff_seconds <= 0 {
        return Err(ConfigError::Invalid("queue.retry_backoff_seconds must be > 0"));
    }
    if q.max_backoff_seconds < 0 {
        return Err(ConfigError::Invalid("queue.max_backoff_seconds must be >= 0"));
    }
    if q.claim_lease_seconds <= 0 {
        return Err(ConfigError::Invalid("queue.claim_lease_seconds must be > 0"));
    }

    if cfg.sweeper.interval_seconds == 0 {
        return Err(ConfigError::Invalid("sweeper.interval_seconds must be > 0"));
    }
    if cfg.dispatch.chunk_size <= 0 {
        return Err(ConfigError::Invalid("dispatch.chunk_size must be > 0"));
    }
    if cfg.collaborators.timeout_ms == 0 {
        return Err(ConfigError::Invalid("collaborators.timeout_ms must be > 0"));
    }

    if cfg.storefront.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("storefront.base_url must be non-empty"));
    }
    if cfg.storefront.token.trim().is_empty() {
        return Err(ConfigError::Invalid("storefront.token must be non-empty"));
    }

    if cfg.mailer.from.trim().is_empty() {
        return Err(ConfigError::Invalid("mailer.from must be non-empty"));
    }
    match cfg.mailer.transport {
        Transport::Smtp => {
            let smtp = cfg
                .mailer
                .smtp
                .as_ref()
                .ok_or(ConfigError::Invalid("mailer.smtp is required for the smtp transport"))?;
            if smtp.host.trim().is_empty() {
                return Err(ConfigError::Invalid("mailer.smtp.host must be non-empty"));
            }
            if smtp.port == 0 {
                return Err(ConfigError::Invalid("mailer.smtp.port must be > 0"));
            }
        }
        Transport::Http => {
            let http = cfg
                .mailer
                .http
                .as_ref()
                .ok_or(ConfigError::Invalid("mailer.http is required for the http transport"))?;
            if http.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid("mailer.http.endpoint must be non-empty"));
            }
        }
    }

    Ok(())
}

/// Sample configuration; also used as a test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  site_name: "Example Store"

queue:
  poll_interval_ms: 5000
  batch_size: 50
  max_retries: 3
  retry_backoff_seconds: 3600
  exponential_backoff: false
  max_backoff_seconds: 21600
  claim_lease_seconds: 900
  deliver_on_enqueue: true

sweeper:
  interval_seconds: 3600
  expire_free_entries: true

dispatch:
  chunk_size: 100

collaborators:
  timeout_ms: 10000

storefront:
  base_url: "https://shop.example.com/api/v1"
  token: "YOUR_STOREFRONT_API_TOKEN"

mailer:
  transport: smtp
  from: "Example Store <noreply@example.com>"
  smtp:
    host: "smtp.example.com"
    port: 587
    username: "YOUR_SMTP_USER"
    password: "YOUR_SMTP_PASSWORD"
"#
}
