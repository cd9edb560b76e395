//! HTTP transport posting batches as JSON.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::transport::{Batch, RemoteTransport};
use offsync_common::{Error, Result};

/// Header carrying the batch id so the remote can drop duplicate deliveries.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP transport.
///
/// - `POST {endpoint}/batches` with the batch as JSON body
/// - `GET {endpoint}/health` for reachability probing
pub struct HttpTransport {
    http: Client,
    endpoint: Url,
}

impl HttpTransport {
    /// Create a transport for the given base URL.
    ///
    /// # Errors
    /// - Endpoint is not a valid absolute URL
    /// - HTTP client could not be constructed
    pub fn new(endpoint: &str) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Configuration(format!("Invalid endpoint '{}': {}", endpoint, e)))?;

        // Url::join replaces the last segment unless the base ends with '/'.
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, endpoint })
    }

    /// Create a transport from registry configuration.
    ///
    /// Expects `{"endpoint": "https://..."}`.
    pub fn from_config(config: &Value) -> Result<Self> {
        let endpoint = config
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Configuration("HTTP transport requires 'endpoint'".to_string())
            })?;
        Self::new(endpoint)
    }

    /// Base URL all requests are resolved against.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| Error::Configuration(format!("Invalid request path '{}': {}", path, e)))
    }
}

/// Map a response status to the engine's error taxonomy.
///
/// Validation-style statuses are rejections; everything else that is not a
/// success is treated as transient so the batch is retried.
fn classify_status(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::BAD_REQUEST
        || status == StatusCode::CONFLICT
        || status == StatusCode::UNPROCESSABLE_ENTITY
    {
        Err(Error::Rejected(format!("{} - {}", status, body)))
    } else {
        Err(Error::Transport(format!("API error: {} - {}", status, body)))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, batch: &Batch) -> Result<()> {
        let url = self.url("batches")?;
        debug!(
            "POST {} batch={} records={}",
            url,
            batch.batch_id,
            batch.len()
        );

        let response = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, batch.batch_id.to_string())
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to send batch: {}", e)))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        classify_status(status, &body)
    }

    async fn probe(&self) -> Result<bool> {
        let response = self
            .http
            .get(self.url("health")?)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Health check failed: {}", e)))?;

        Ok(response.status().is_success())
    }
}
