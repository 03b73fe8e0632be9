//! Payout gateway clients
//!
//! The processor only needs "send this much to this destination"; the
//! gateway decides how. `HttpPayoutGateway` talks to a JSON disbursement
//! API, `LoggingPayoutGateway` just logs and succeeds (dev mode).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::schemas::PayoutQueueDoc;
use crate::types::{Amount, Result, UplineError};

/// Default gateway request timeout
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

/// One disbursement attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequest {
    pub withdrawal_id: String,
    pub user_id: String,
    /// Net amount, after fees
    pub amount: Amount,
    pub destination: String,
    /// 1-based attempt number
    pub attempt: u32,
}

impl PayoutRequest {
    pub fn from_entry(entry: &PayoutQueueDoc) -> Self {
        Self {
            withdrawal_id: entry.withdrawal_id.clone(),
            user_id: entry.user_id.clone(),
            amount: entry.amount,
            destination: entry.destination.clone(),
            attempt: entry.attempts + 1,
        }
    }
}

/// Gateway confirmation of a sent payout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub reference: String,
}

#[async_trait]
pub trait PayoutGateway: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Send a payout. Any error counts as a failed attempt.
    async fn send(&self, request: &PayoutRequest) -> Result<PayoutReceipt>;
}

/// Response body accepted from the disbursement API
#[derive(Debug, Default, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// JSON-over-HTTP disbursement API
pub struct HttpPayoutGateway {
    url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpPayoutGateway {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(UplineError::Config("Payout URL is empty".into()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UplineError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url,
            api_key: api_key.filter(|k| !k.is_empty()),
            http_client,
        })
    }
}

#[async_trait]
impl PayoutGateway for HttpPayoutGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        // The withdrawal id is stable across attempts so the gateway can
        // drop a resend of a payout it already made.
        let mut builder = self
            .http_client
            .post(&self.url)
            .header("Idempotency-Key", &request.withdrawal_id)
            .json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UplineError::Payout(format!("Gateway unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                withdrawal_id = %request.withdrawal_id,
                status = %status,
                "Payout gateway refused request"
            );
            return Err(UplineError::Payout(format!(
                "Gateway returned {status}: {}",
                truncate(&body, 200)
            )));
        }

        let body: GatewayResponse = response.json().await.unwrap_or_default();
        let reference = body
            .reference
            .or(body.id)
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| format!("payout-{}", request.withdrawal_id));

        debug!(withdrawal_id = %request.withdrawal_id, reference, "Payout accepted");
        Ok(PayoutReceipt { reference })
    }
}

/// Dev gateway: logs the payout and reports success
#[derive(Debug, Default)]
pub struct LoggingPayoutGateway;

#[async_trait]
impl PayoutGateway for LoggingPayoutGateway {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn send(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        info!(
            withdrawal_id = %request.withdrawal_id,
            user_id = %request.user_id,
            amount = %request.amount,
            destination = %request.destination,
            attempt = request.attempt,
            "Simulated payout"
        );
        Ok(PayoutReceipt {
            reference: format!("dev-{}", request.withdrawal_id),
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
