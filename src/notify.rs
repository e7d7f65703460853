//! WhatsApp bridge collaborator surface.
//!
//! The bridge runs as a separate process; this module only speaks its HTTP
//! API. The sync engine fires `notify_order_status` best-effort after an
//! order syncs; delivery retries belong to the bridge, not to us.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::api::{normalize_base_url, status_error, transport_error};
use crate::error::SyncError;

/// Outbound messaging as exposed by the bridge process.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    /// Free-form message to a phone number.
    async fn send_message(&self, phone: &str, message: &str) -> Result<(), SyncError>;

    /// Templated order-status notification; `courier` names the motoboy for
    /// delivery orders.
    async fn notify_order_status(
        &self,
        order_id: &str,
        status: &str,
        phone: &str,
        order_number: &str,
        courier: Option<&str>,
    ) -> Result<(), SyncError>;
}

/// HTTP client for the bridge process.
pub struct HttpNotifier {
    bridge_url: String,
    device_id: String,
    client: Client,
}

impl HttpNotifier {
    pub fn new(bridge_url: &str, device_id: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("build bridge client: {e}")))?;
        Ok(Self {
            bridge_url: normalize_base_url(bridge_url),
            device_id: device_id.to_string(),
            client,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), SyncError> {
        let url = format!("{}{path}", self.bridge_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.bridge_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body_text));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderNotifier for HttpNotifier {
    async fn send_message(&self, phone: &str, message: &str) -> Result<(), SyncError> {
        self.post(
            "/messages/send",
            json!({
                "phone": phone,
                "message": message,
                "device_id": self.device_id,
            }),
        )
        .await
    }

    async fn notify_order_status(
        &self,
        order_id: &str,
        status: &str,
        phone: &str,
        order_number: &str,
        courier: Option<&str>,
    ) -> Result<(), SyncError> {
        self.post(
            "/messages/order-status",
            json!({
                "order_id": order_id,
                "status": status,
                "phone": phone,
                "order_number": order_number,
                "courier": courier,
                "device_id": self.device_id,
            }),
        )
        .await
    }
}
