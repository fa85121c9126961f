//! HTTP delivery of signal batches
//!
//! Batches are posted as a JSON array to
//! `{base_url}/api/v1/apps/{app_id}/signals/multiple/`. Any 2xx response is
//! a success; everything else, including transport errors, is a failure
//! the scheduler recovers from by re-queueing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::SettingsHandle;
use crate::error::{Error, Result};
use crate::signal::SignalRecord;

/// Why a batch was not accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Could not reach the server (DNS, refused, timeout)
    #[error("connection error: {0}")]
    Connection(String),

    /// The exchange broke down after connecting
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unauthorized (401)")]
    Unauthorized,

    #[error("forbidden (403)")]
    Forbidden,

    #[error("payload is too large (413)")]
    PayloadTooLarge,

    #[error("invalid status code {0}")]
    InvalidStatusCode(u16),

    /// The batch could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DeliveryError {
    /// Classify a non-2xx status
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => DeliveryError::Unauthorized,
            StatusCode::FORBIDDEN => DeliveryError::Forbidden,
            StatusCode::PAYLOAD_TOO_LARGE => DeliveryError::PayloadTooLarge,
            other => DeliveryError::InvalidStatusCode(other.as_u16()),
        }
    }

    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, DeliveryError::PayloadTooLarge)
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure {
        /// Request body that was rejected
        body: String,
        error: DeliveryError,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }

    /// Convert to a `Result`, for callers that want `?`
    pub fn into_result(self) -> Result<()> {
        match self {
            DeliveryOutcome::Success => Ok(()),
            DeliveryOutcome::Failure { error, .. } => Err(Error::Delivery(error)),
        }
    }
}

/// Something that can deliver a batch of signals
///
/// Implementations never return early with an error; every attempt ends in
/// exactly one `DeliveryOutcome`.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send(&self, batch: &[SignalRecord]) -> DeliveryOutcome;
}

/// Build the ingestion URL for an app
pub fn signals_url(base_url: &str, app_id: &str) -> String {
    format!(
        "{}/api/v1/apps/{}/signals/multiple/",
        base_url.trim_end_matches('/'),
        urlencoding::encode(app_id)
    )
}

/// `SignalTransport` over HTTP
pub struct HttpDelivery {
    settings: SettingsHandle,
    http_client: reqwest::Client,
}

impl HttpDelivery {
    /// Create a delivery client
    ///
    /// Base URL and app id are read from `settings` on every send.
    pub fn new(settings: SettingsHandle, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            settings,
            http_client,
        })
    }

    async fn post(&self, url: &str, body: String) -> std::result::Result<(), DeliveryError> {
        let response = self
            .http_client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, response = %text, "Signals accepted");
            Ok(())
        } else {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            tracing::debug!(status = %status, response = %text, "Signals rejected");
            Err(DeliveryError::from_status(status))
        }
    }
}

#[async_trait]
impl SignalTransport for HttpDelivery {
    async fn send(&self, batch: &[SignalRecord]) -> DeliveryOutcome {
        let settings = self.settings.snapshot();
        let url = signals_url(&settings.base_url, &settings.app_id);

        let body = match serde_json::to_string(batch) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryOutcome::Failure {
                    body: String::new(),
                    error: DeliveryError::Serialization(e.to_string()),
                }
            }
        };
        tracing::trace!(url = %url, body = %body, "Posting signals");

        match self.post(&url, body.clone()).await {
            Ok(()) => DeliveryOutcome::Success,
            Err(error) => DeliveryOutcome::Failure { body, error },
        }
    }
}

fn classify_transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_connect() || e.is_timeout() {
        DeliveryError::Connection(e.to_string())
    } else {
        DeliveryError::Protocol(e.to_string())
    }
}
