use async_trait::async_trait;
use memory_worker_config::{ProviderConfig, ProviderProtocol};
use memory_worker_core::{EngineError, ProviderEngine};
use memory_worker_protocol::{ConversationMessage, ProviderReply};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod history;
pub mod protocol;

pub use history::{estimate_tokens, truncate_history, HistoryLimits};
pub use protocol::endpoint::{build_gemini_url, build_openai_chat_url};
pub use protocol::response::{decode_sse_events, normalize_response};
pub use protocol::transport::{
    fetch_with_timeout, fetch_with_timeout_and_retry, FetchError, FetchTimeouts, FetchedResponse,
    TimeoutPhase, WireRequest,
};

use protocol::request::{build_gemini_payload, build_openai_payload};
use protocol::response::summarize_error_body;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("provider returned non-success status: {status}; body: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("provider reported an error: {message}")]
    Provider { message: String },
    #[error("malformed provider response (HTTP {status}): {detail}")]
    MalformedResponse { status: u16, detail: String },
    #[error("history has no user message to send")]
    EmptyHistory,
}

impl ModelError {
    /// Whether another provider might succeed where this one failed.
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            ModelError::Fetch(FetchError::Request(_)) => true,
            ModelError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            ModelError::Provider { .. } => true,
            ModelError::Fetch(_) | ModelError::MalformedResponse { .. } | ModelError::EmptyHistory => {
                false
            }
        }
    }
}

impl From<ModelError> for EngineError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::Fetch(FetchError::Cancelled) => EngineError::Cancelled,
            ModelError::Fetch(timeout @ FetchError::Timeout { .. }) => {
                EngineError::Timeout(timeout.to_string())
            }
            other => EngineError::Provider {
                fallback_eligible: other.is_fallback_eligible(),
                message: other.to_string(),
            },
        }
    }
}

/// One configured provider endpoint speaking either chat-completions or
/// Gemini `generateContent`.
pub struct ProviderClient {
    config: ProviderConfig,
    client: reqwest::Client,
    last_request: Mutex<Option<Instant>>,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            last_request: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn complete(
        &self,
        history: &[ConversationMessage],
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ModelError> {
        let window = truncate_history(history, HistoryLimits::from(&self.config));
        // Providers require the conversation to open with a user turn, even
        // when the history already fits the budgets untouched.
        let Some(first_user) = window.iter().position(ConversationMessage::is_user) else {
            return Err(ModelError::EmptyHistory);
        };
        let window = &window[first_user..];
        if window.len() < history.len() {
            debug!(
                provider = self.config.provider_name.as_str(),
                kept = window.len(),
                dropped = history.len() - window.len(),
                "truncated conversation history"
            );
        }

        self.wait_for_rate_limit(cancel).await?;
        let request = self.build_request(window);
        let timeouts = FetchTimeouts {
            first_byte: self.config.first_token_timeout(),
            total: self.config.total_timeout(),
        };
        let response = fetch_with_timeout_and_retry(
            &self.client,
            &request,
            timeouts,
            self.config.max_retries,
            cancel,
        )
        .await?;

        if !(200..300).contains(&response.status) {
            return Err(ModelError::HttpStatus {
                status: response.status,
                body: summarize_error_body(&response.body),
            });
        }

        let reply = normalize_response(self.config.protocol, response.status, &response.body)?;
        info!(
            provider = self.config.provider_name.as_str(),
            model = self.config.model.as_str(),
            chars = reply.content.chars().count(),
            tokens_used = reply.tokens_used,
            "provider reply received"
        );
        Ok(reply)
    }

    fn build_request(&self, history: &[ConversationMessage]) -> WireRequest {
        let streaming = self.config.streaming;
        match self.config.protocol {
            ProviderProtocol::OpenAi => WireRequest {
                url: build_openai_chat_url(&self.config.base_url),
                headers: vec![(
                    "authorization".to_string(),
                    format!("Bearer {}", self.config.api_key),
                )],
                body: build_openai_payload(&self.config.model, history, streaming),
                expect_sse: streaming,
            },
            ProviderProtocol::Gemini => WireRequest {
                url: build_gemini_url(&self.config.base_url, &self.config.model, streaming),
                headers: vec![("x-goog-api-key".to_string(), self.config.api_key.clone())],
                body: build_gemini_payload(history, self.config.thinking_budget),
                expect_sse: streaming,
            },
        }
    }

    async fn wait_for_rate_limit(&self, cancel: &CancellationToken) -> Result<(), ModelError> {
        let Some(interval) = self.config.min_request_interval() else {
            return Ok(());
        };
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                debug!(
                    provider = self.config.provider_name.as_str(),
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "rate limiting provider request"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled.into()),
                    _ = sleep(wait) => {}
                }
            }
        }
        *last_request = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl ProviderEngine for ProviderClient {
    fn provider_name(&self) -> &str {
        &self.config.provider_name
    }

    async fn query(
        &self,
        history: &[ConversationMessage],
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, EngineError> {
        self.complete(history, cancel).await.map_err(EngineError::from)
    }
}
