//! HTTP adapter for the storefront's REST API.
//!
//! One client serves both the catalog and the order system. Amounts cross the
//! wire as integer cents.

use crate::collab::{Catalog, DepositOrder, DepositOrderRequest, PaymentGateway, RefundOutcome};
use crate::model::{OrderStatus, Subject};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StorefrontClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for StorefrontClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorefrontClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProductResp {
    name: String,
    price_cents: i64,
    in_stock: bool,
    #[serde(default)]
    permalink: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CustomerResp {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateOrderResp {
    order_ref: String,
    checkout_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderResp {
    status: String,
}

#[derive(Debug, Clone, Serialize)]
struct RefundReq<'a> {
    amount_cents: i64,
    reason: &'a str,
}

impl StorefrontClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("invalid storefront base URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("restock-waitlist/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Append `segments` to the base path, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("storefront base URL {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn build_request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .request(method, self.endpoint(segments)?)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build storefront request")
    }

    /// Send and return the status with the body text.
    async fn execute(&self, request: reqwest::Request) -> Result<(StatusCode, String)> {
        let url = request.url().clone();
        debug!(method = %request.method(), %url, "storefront request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach storefront at {url}"))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%url, "rate limited by storefront");
        }
        Ok((status, body))
    }

    async fn get_optional<T: for<'de> Deserialize<'de>>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let request = self.build_request(Method::GET, segments, query, None)?;
        let (status, body) = self.execute(request).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("storefront error {status}: {body}"));
        }
        let parsed = serde_json::from_str(&body).context("invalid storefront response JSON")?;
        Ok(Some(parsed))
    }
}

pub fn subject_segments(product_id: i64, variation_id: Option<i64>) -> Vec<String> {
    let mut segments = vec!["products".to_string(), product_id.to_string()];
    if let Some(v) = variation_id {
        segments.extend(["variations".to_string(), v.to_string()]);
    }
    segments
}

pub fn build_order_body(request: &DepositOrderRequest) -> Value {
    json!({
        "status": "pending",
        "customer_email": request.buyer_email,
        "customer_id": request.buyer_account_id,
        "line_items": [{
            "product_id": request.product_id,
            "variation_id": request.variation_id,
            "name": request.description,
            "quantity": 1,
            "total_cents": request.amount_cents,
        }],
        "meta": {
            "waitlist_entry_id": request.entry_id,
            "waitlist_deposit_percentage": request.percentage,
        },
    })
}

#[async_trait]
impl Catalog for StorefrontClient {
    async fn get_subject(
        &self,
        product_id: i64,
        variation_id: Option<i64>,
    ) -> Result<Option<Subject>> {
        let owned = subject_segments(product_id, variation_id);
        let segments: Vec<&str> = owned.iter().map(String::as_str).collect();
        let product: Option<ProductResp> = self.get_optional(&segments, &[]).await?;
        Ok(product.map(|p| Subject {
            price_cents: p.price_cents,
            in_stock: p.in_stock,
            display_name: p.name,
            purchase_url: p.permalink.unwrap_or_default(),
        }))
    }

    async fn find_account(&self, email: &str) -> Result<Option<i64>> {
        let customers: Option<Vec<CustomerResp>> =
            self.get_optional(&["customers"], &[("email", email)]).await?;
        Ok(customers.and_then(|c| c.first().map(|c| c.id)))
    }
}

#[async_trait]
impl PaymentGateway for StorefrontClient {
    async fn create_deposit_order(&self, request: &DepositOrderRequest) -> Result<DepositOrder> {
        let body = build_order_body(request);
        let req = self.build_request(Method::POST, &["orders"], &[], Some(&body))?;
        let (status, text) = self.execute(req).await?;
        if !status.is_success() {
            return Err(anyhow!("create order failed {status}: {text}"));
        }
        let created: CreateOrderResp =
            serde_json::from_str(&text).context("invalid create order response")?;
        Ok(DepositOrder {
            order_ref: created.order_ref,
            checkout_url: created.checkout_url,
        })
    }

    async fn order_status(&self, order_ref: &str) -> Result<OrderStatus> {
        let order: Option<OrderResp> = self.get_optional(&["orders", order_ref], &[]).await?;
        let order = order.ok_or_else(|| anyhow!("order {order_ref} not found"))?;
        Ok(OrderStatus::parse(&order.status))
    }

    async fn refund_order(
        &self,
        order_ref: &str,
        amount_cents: i64,
        reason: &str,
    ) -> Result<RefundOutcome> {
        let body = serde_json::to_value(RefundReq {
            amount_cents,
            reason,
        })?;
        let req = self.build_request(
            Method::POST,
            &["orders", order_ref, "refunds"],
            &[],
            Some(&body),
        )?;
        let (status, text) = self.execute(req).await?;
        match status {
            s if s.is_success() => Ok(RefundOutcome::Refunded),
            StatusCode::CONFLICT => Ok(RefundOutcome::AlreadyRefunded),
            s => Err(anyhow!("refund failed {s}: {text}")),
        }
    }
}
