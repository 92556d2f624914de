//! Email transports.

use crate::collab::Mailer;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Posts messages as JSON to an HTTP mail relay.
#[derive(Clone)]
pub struct HttpMailer {
    http: Client,
    endpoint: Url,
    token: String,
    from: String,
}

impl fmt::Debug for HttpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMailer")
            .field("endpoint", &self.endpoint)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl HttpMailer {
    pub fn new(endpoint: &str, token: String, from: String, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid mail relay URL")?;
        let http = Client::builder()
            .user_agent(concat!("restock-waitlist/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            token,
            from,
        })
    }

    pub fn build_body(&self, recipient: &str, subject: &str, html_body: &str) -> Value {
        json!({
            "from": self.from,
            "to": [recipient],
            "subject": subject,
            "html": html_body,
        })
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.token))
            .json(body)
            .build()
            .context("failed to build mail relay request")
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send_email(&self, recipient: &str, subject: &str, html_body: &str) -> Result<()> {
        let request = self.build_request(&self.build_body(recipient, subject, html_body))?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach mail relay")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("mail relay error {status}: {body}"));
        }
        debug!(recipient, "mail relay accepted message");
        Ok(())
    }
}

/// Sends through an SMTP relay with STARTTLS and credentials.
#[derive(Clone)]
pub struct SmtpMailer {
    host: String,
    port: u16,
    credentials: Credentials,
    from: String,
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    pub fn new(host: String, port: u16, username: String, password: String, from: String) -> Self {
        Self {
            host,
            port,
            credentials: Credentials::new(username, password),
            from,
        }
    }

    pub fn build_message(&self, recipient: &str, subject: &str, html_body: &str) -> Result<Message> {
        Message::builder()
            .from(self.from.parse().context("invalid from address")?)
            .to(recipient.parse().context("invalid recipient address")?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .context("failed to build email")
    }

    fn build_transport(&self) -> Result<SmtpTransport> {
        Ok(SmtpTransport::relay(&self.host)
            .context("SMTP relay error")?
            .port(self.port)
            .credentials(self.credentials.clone())
            .build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_email(&self, recipient: &str, subject: &str, html_body: &str) -> Result<()> {
        let message = self.build_message(recipient, subject, html_body)?;
        let transport = self.build_transport()?;
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .context("email task failed")?
            .context("failed to send email")?;
        debug!(recipient, "smtp relay accepted message");
        Ok(())
    }
}
