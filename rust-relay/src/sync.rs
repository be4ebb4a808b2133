//! Upstream synchronization with SparkLoop.
//!
//! ```text
//! PUT  {base}/subscribers/{email}   ── 404 ──▶  POST {base}/subscribers
//! ```
//!
//! One attempt per call; retry policy belongs to whoever sent the webhook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::error::RelayError;
use crate::event::SubscriberEvent;

/// Metadata keys used only inside the relay.
pub const INTERNAL_METADATA_KEYS: [&str; 4] = ["ghost_event", "ghost_status", "subscribed", "source"];

const USER_AGENT: &str = "SparkLoop-Worker/1.0";

/// Status and parsed body of a SparkLoop response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: StatusCode,
    /// Parsed JSON body, or `None` when the body was not JSON.
    pub body: Option<Value>,
}

impl ApiReply {
    pub fn new(status: StatusCode, body: Option<Value>) -> Self {
        Self { status, body }
    }

    fn remote_error(&self) -> String {
        let detail = self
            .body
            .as_ref()
            .and_then(|b| b.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        format!("SparkLoop API error: {}", detail)
    }
}

/// The subscriber endpoints the relay needs.
#[async_trait]
pub trait SubscriberApi: Send + Sync {
    /// Update the subscriber identified by `email`.
    async fn update(&self, email: &str, payload: &Value) -> Result<ApiReply, RelayError>;

    /// Create a subscriber; `payload` includes the email.
    async fn create(&self, payload: &Value) -> Result<ApiReply, RelayError>;
}

#[async_trait]
impl<T: SubscriberApi + ?Sized> SubscriberApi for Arc<T> {
    async fn update(&self, email: &str, payload: &Value) -> Result<ApiReply, RelayError> {
        (**self).update(email, payload).await
    }

    async fn create(&self, payload: &Value) -> Result<ApiReply, RelayError> {
        (**self).create(payload).await
    }
}

/// `reqwest` client for the SparkLoop v2 API.
#[derive(Clone)]
pub struct SparkLoopClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SparkLoopClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn api_key(&self) -> Result<&str, RelayError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| RelayError::Upstream("SparkLoop API key not configured".to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder, payload: &Value) -> Result<ApiReply, RelayError> {
        let response = request
            .header("X-Api-Key", self.api_key()?)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, is_timeout = e.is_timeout(), "sparkloop_request_failed");
                RelayError::Upstream(format!("SparkLoop API request failed: {}", e))
            })?;

        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(e) => {
                warn!(error = %e, status = status.as_u16(), "sparkloop_body_read_failed");
                None
            }
        };

        Ok(ApiReply::new(status, body))
    }
}

#[async_trait]
impl SubscriberApi for SparkLoopClient {
    async fn update(&self, email: &str, payload: &Value) -> Result<ApiReply, RelayError> {
        let url = format!("{}/subscribers/{}", self.base_url, encode_path_segment(email));
        self.send(self.client.put(url), payload).await
    }

    async fn create(&self, payload: &Value) -> Result<ApiReply, RelayError> {
        let url = format!("{}/subscribers", self.base_url);
        self.send(self.client.post(url), payload).await
    }
}

/// Update-or-create driver over a [`SubscriberApi`].
pub struct Synchronizer<A> {
    api: A,
}

impl<A: SubscriberApi> Synchronizer<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    /// Push `event` to SparkLoop and return the remote response body.
    pub async fn sync(&self, event: &SubscriberEvent) -> Result<Value, RelayError> {
        let email = event.email();
        info!(email = %email, status = %event.status(), "sparkloop_update_start");

        let update_payload = upstream_payload(event, false);
        let reply = self.api.update(email, &update_payload).await?;

        if reply.status.is_success() {
            info!(email = %email, status_code = reply.status.as_u16(), "sparkloop_update_complete");
            return into_result(reply);
        }

        if reply.status != StatusCode::NOT_FOUND {
            error!(
                email = %email,
                status_code = reply.status.as_u16(),
                body = ?reply.body,
                "sparkloop_update_error"
            );
            return Err(RelayError::Upstream(reply.remote_error()));
        }

        info!(email = %email, "sparkloop_subscriber_not_found_creating");

        let create_payload = upstream_payload(event, true);
        let created = self.api.create(&create_payload).await?;

        if !created.status.is_success() {
            error!(
                email = %email,
                status_code = created.status.as_u16(),
                body = ?created.body,
                "sparkloop_create_error"
            );
            return Err(RelayError::Upstream(created.remote_error()));
        }

        info!(email = %email, status_code = created.status.as_u16(), "sparkloop_create_complete");
        into_result(created)
    }
}

fn into_result(reply: ApiReply) -> Result<Value, RelayError> {
    reply.body.ok_or_else(|| {
        RelayError::Upstream("SparkLoop API error: invalid JSON in response".to_string())
    })
}

/// Build the JSON body sent upstream.
///
/// Internal keys and null-valued metadata are dropped. With `include_email`
/// the payload is the create form, `{email, status, ...}`.
pub fn upstream_payload(event: &SubscriberEvent, include_email: bool) -> Value {
    let mut payload = Map::new();
    if include_email {
        payload.insert("email".into(), Value::String(event.email().to_string()));
    }
    payload.insert("status".into(), Value::String(event.status().to_string()));

    for (key, value) in event.metadata() {
        if value.is_null() || INTERNAL_METADATA_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "email" || key == "status" {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }

    Value::Object(payload)
}

/// Percent-encode an email for use as a URL path segment.
fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Build the shared outbound HTTP client.
pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}
