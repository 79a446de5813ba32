use std::fmt;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    FirstByte,
    Total,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::FirstByte => f.write_str("first byte"),
            TimeoutPhase::Total => f.write_str("total"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{phase} timeout after {after_ms}ms")]
    Timeout { phase: TimeoutPhase, after_ms: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// A POST that can be issued again verbatim on retry.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub expect_sse: bool,
}

impl WireRequest {
    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let accept = if self.expect_sse {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut builder = client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .json(&self.body);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

/// `None` disables a timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchTimeouts {
    pub first_byte: Option<Duration>,
    pub total: Option<Duration>,
}

impl FetchTimeouts {
    pub fn is_disabled(&self) -> bool {
        self.first_byte.is_none() && self.total.is_none()
    }
}

/// Status and fully read body. Any status counts as a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: String,
}

/// Issues one request bounded by a first-byte timer (cleared once headers
/// arrive) and a total timer (covering the body read).
pub async fn fetch_with_timeout(
    client: &reqwest::Client,
    request: &WireRequest,
    timeouts: FetchTimeouts,
    cancel: &CancellationToken,
) -> Result<FetchedResponse, FetchError> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let exchange = async {
        let pending = request.build(client).send();
        let response = match timeouts.first_byte {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| timeout_error(TimeoutPhase::FirstByte, limit))??,
            None => pending.await?,
        };
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok::<_, FetchError>(FetchedResponse { status, body })
    };
    let bounded = async {
        match timeouts.total {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or_else(|_| Err(timeout_error(TimeoutPhase::Total, limit))),
            None => exchange.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        result = bounded => result,
    }
}

/// Makes up to `max_attempts` attempts, retrying timeouts only. Cancellation,
/// transport errors and every HTTP status are returned as they are.
pub async fn fetch_with_timeout_and_retry(
    client: &reqwest::Client,
    request: &WireRequest,
    timeouts: FetchTimeouts,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<FetchedResponse, FetchError> {
    if timeouts.is_disabled() {
        return fetch_with_timeout(client, request, timeouts, cancel).await;
    }

    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetch_with_timeout(client, request, timeouts, cancel).await {
            Err(FetchError::Timeout { phase, after_ms }) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    %phase,
                    after_ms,
                    url = request.url.as_str(),
                    "provider request timed out, retrying"
                );
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn timeout_error(phase: TimeoutPhase, limit: Duration) -> FetchError {
    FetchError::Timeout {
        phase,
        after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    }
}
