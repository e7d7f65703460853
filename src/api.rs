//! Remote backend client.
//!
//! Defines the `RemoteBackend` seam the sync engine talks through, plus the
//! production HTTP implementation. Every submission carries the caller's
//! idempotency key so a retried request after a transient failure resolves
//! to the record the first attempt created instead of a duplicate.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::customers::OfflineCustomer;
use crate::error::SyncError;
use crate::menu::MenuSnapshot;
use crate::orders::OfflineOrder;

/// Server acknowledgement for a submitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    /// Server-assigned id that supersedes the local one in later references.
    pub server_id: String,
}

/// The remote source of truth, as consumed by the sync engine and menu
/// cache. Implementations must honor the idempotency key: resubmitting an
/// already-applied key returns the existing record's ack.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn submit_order(
        &self,
        idempotency_key: &str,
        order: &OfflineOrder,
    ) -> Result<RemoteAck, SyncError>;

    async fn submit_customer(
        &self,
        idempotency_key: &str,
        customer: &OfflineCustomer,
    ) -> Result<RemoteAck, SyncError>;

    /// Update the status of an order the remote already knows, addressed by
    /// server id when available, local id otherwise.
    async fn update_order(&self, order_ref: &str, status: &str) -> Result<(), SyncError>;

    async fn fetch_menu(&self, restaurant_id: &str) -> Result<MenuSnapshot, SyncError>;

    /// Lightweight reachability probe. Never errors; unreachable is `false`.
    async fn health_check(&self) -> bool;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a transport-level `reqwest::Error` into the sync taxonomy.
pub(crate) fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_timeout() {
        return SyncError::Timeout(format!("connection to {url} timed out"));
    }
    if err.is_connect() {
        return SyncError::Network(format!("cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return SyncError::Network(format!("invalid backend url: {url}"));
    }
    SyncError::Network(format!("network error communicating with {url}: {err}"))
}

/// Map a non-success HTTP status (with response body) into the taxonomy.
/// 408/429 are transport pressure and retryable; other 4xx are semantic
/// rejections; 5xx are the server's problem and retryable.
pub(crate) fn status_error(status: StatusCode, body: &str) -> SyncError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected response")
                    .to_string()
            } else {
                trimmed.to_string()
            }
        });

    let code = status.as_u16();
    match code {
        408 => SyncError::Timeout(format!("{detail} (HTTP {code})")),
        429 => SyncError::Network(format!("{detail} (HTTP {code})")),
        400..=499 => SyncError::Rejected(format!("{detail} (HTTP {code})")),
        _ => SyncError::Network(format!("{detail} (HTTP {code})")),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Production backend speaking JSON over HTTP to the platform API.
pub struct HttpBackend {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("build http client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
        })
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        idempotency_key: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method, &url)
            .header("X-Api-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Network(format!("invalid JSON from backend: {e}")))
    }
}

fn ack_from_response(resp: &Value) -> Result<RemoteAck, SyncError> {
    resp.get("id")
        .or_else(|| resp.get("server_id"))
        .and_then(Value::as_str)
        .map(|s| RemoteAck {
            server_id: s.to_string(),
        })
        .ok_or_else(|| SyncError::Network("backend response missing record id".to_string()))
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn submit_order(
        &self,
        idempotency_key: &str,
        order: &OfflineOrder,
    ) -> Result<RemoteAck, SyncError> {
        let body = serde_json::to_value(order)
            .map_err(|e| SyncError::Storage(format!("serialize order: {e}")))?;
        let resp = self
            .request_json(
                reqwest::Method::POST,
                "/api/pos/orders",
                Some(idempotency_key),
                Some(&body),
            )
            .await?;
        ack_from_response(&resp)
    }

    async fn submit_customer(
        &self,
        idempotency_key: &str,
        customer: &OfflineCustomer,
    ) -> Result<RemoteAck, SyncError> {
        let body = serde_json::to_value(customer)
            .map_err(|e| SyncError::Storage(format!("serialize customer: {e}")))?;
        let resp = self
            .request_json(
                reqwest::Method::POST,
                "/api/pos/customers",
                Some(idempotency_key),
                Some(&body),
            )
            .await?;
        ack_from_response(&resp)
    }

    async fn update_order(&self, order_ref: &str, status: &str) -> Result<(), SyncError> {
        let body = serde_json::json!({ "status": status });
        self.request_json(
            reqwest::Method::PATCH,
            &format!("/api/pos/orders/{order_ref}/status"),
            None,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn fetch_menu(&self, restaurant_id: &str) -> Result<MenuSnapshot, SyncError> {
        let resp = self
            .request_json(
                reqwest::Method::GET,
                &format!("/api/pos/menu?restaurant_id={restaurant_id}"),
                None,
                None,
            )
            .await?;
        serde_json::from_value(resp)
            .map_err(|e| SyncError::Network(format!("invalid menu payload: {e}")))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .client
            .head(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status().is_success();
                debug!(online = ok, "health check");
                ok
            }
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
