use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use memory_worker_parser::{parse_observations_json, parse_summary_json};
use memory_worker_protocol::{
    ConversationMessage, ObservationMode, ParsedObservation, ParsedSummary, PendingMessage,
    ProviderReply, SummarizeRequest, ToolUseEvent,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod prompts;

pub use prompts::DefaultPromptBuilder;

/// Failure reported by a provider engine, already classified for the driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("provider timed out: {0}")]
    Timeout(String),
    #[error("provider call cancelled")]
    Cancelled,
    #[error("{message}")]
    Provider {
        message: String,
        fallback_eligible: bool,
    },
}

impl EngineError {
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            EngineError::Provider {
                fallback_eligible: true,
                ..
            }
        )
    }
}

#[async_trait]
pub trait ProviderEngine: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn query(
        &self,
        history: &[ConversationMessage],
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, EngineError>;
}

#[async_trait]
pub trait MessageSource: Send {
    /// `None` once the queue is drained for good.
    async fn next_message(&mut self) -> Option<PendingMessage>;
}

#[async_trait]
impl MessageSource for mpsc::Receiver<PendingMessage> {
    async fn next_message(&mut self) -> Option<PendingMessage> {
        self.recv().await
    }
}

#[async_trait]
impl MessageSource for VecDeque<PendingMessage> {
    async fn next_message(&mut self) -> Option<PendingMessage> {
        self.pop_front()
    }
}

/// Everything one provider turn produced, handed to the sink in one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationBatch {
    pub session_id: String,
    pub project: String,
    pub prompt_number: u32,
    pub source_message_id: Option<i64>,
    pub provider: String,
    pub tokens_used: Option<u64>,
    pub observations: Vec<ParsedObservation>,
    pub summary: Option<ParsedSummary>,
}

#[derive(Debug, Error)]
#[error("observation sink failed: {message}")]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ObservationSink: Send + Sync {
    async fn store(&self, batch: ObservationBatch) -> Result<(), SinkError>;
}

pub trait PromptBuilder: Send + Sync {
    fn init_prompt(&self, session: &SessionState, mode: &ObservationMode) -> String;
    fn continuation_prompt(&self, session: &SessionState, mode: &ObservationMode) -> String;
    fn observation_prompt(&self, event: &ToolUseEvent, mode: &ObservationMode) -> String;
    fn summary_prompt(
        &self,
        session: &SessionState,
        request: &SummarizeRequest,
        mode: &ObservationMode,
    ) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: String,
    pub project: String,
    pub user_prompt: String,
    pub prompt_number: u32,
    pub history: Vec<ConversationMessage>,
    pub total_tokens: u64,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        project: impl Into<String>,
        user_prompt: impl Into<String>,
        prompt_number: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project: project.into(),
            user_prompt: user_prompt.into(),
            prompt_number,
            history: Vec::new(),
            total_tokens: 0,
        }
    }

    fn correlation_id(&self) -> String {
        format!("{}:{}", self.session_id, self.prompt_number)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub turns: u32,
    pub empty_replies: u32,
    pub observations_stored: usize,
    pub summaries_stored: usize,
    pub total_tokens: u64,
    pub provider: String,
    pub fallback_used: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session cancelled")]
    Cancelled,
    #[error("provider '{provider}' failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Init,
    Observation,
    Summary,
}

/// Drives one memory session: primes the provider, then turns each pending
/// message into a prompt, queries, parses and forwards the result.
pub struct SessionDriver {
    engines: Vec<Arc<dyn ProviderEngine>>,
    prompts: Arc<dyn PromptBuilder>,
    sink: Arc<dyn ObservationSink>,
    mode: ObservationMode,
}

impl SessionDriver {
    pub fn new(
        primary: Arc<dyn ProviderEngine>,
        sink: Arc<dyn ObservationSink>,
        mode: ObservationMode,
    ) -> Self {
        Self {
            engines: vec![primary],
            prompts: Arc::new(DefaultPromptBuilder),
            sink,
            mode,
        }
    }

    pub fn with_fallback(mut self, engine: Arc<dyn ProviderEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub async fn run(
        &self,
        state: &mut SessionState,
        source: &mut dyn MessageSource,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, SessionError> {
        let mut report = SessionReport {
            session_id: state.session_id.clone(),
            ..SessionReport::default()
        };
        let mut active = 0usize;

        let opening = if state.prompt_number <= 1 {
            self.prompts.init_prompt(state, &self.mode)
        } else {
            self.prompts.continuation_prompt(state, &self.mode)
        };
        info!(
            session_id = state.session_id.as_str(),
            prompt_number = state.prompt_number,
            provider = self.engines[active].provider_name(),
            "starting memory session"
        );
        self.run_turn(state, TurnKind::Init, opening, None, &mut active, &mut report, cancel)
            .await?;

        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                message = source.next_message() => message,
            };
            let Some(message) = next else {
                break;
            };

            let source_message_id = message.persistent_id();
            match message {
                PendingMessage::Observation(event) => {
                    if let Some(prompt_number) = event.prompt_number {
                        state.prompt_number = prompt_number;
                    }
                    let prompt = self.prompts.observation_prompt(&event, &self.mode);
                    self.run_turn(
                        state,
                        TurnKind::Observation,
                        prompt,
                        source_message_id,
                        &mut active,
                        &mut report,
                        cancel,
                    )
                    .await?;
                }
                PendingMessage::Summarize(request) => {
                    let prompt = self.prompts.summary_prompt(state, &request, &self.mode);
                    self.run_turn(
                        state,
                        TurnKind::Summary,
                        prompt,
                        source_message_id,
                        &mut active,
                        &mut report,
                        cancel,
                    )
                    .await?;
                }
            }
        }

        report.total_tokens = state.total_tokens;
        report.provider = self.engines[active].provider_name().to_string();
        report.fallback_used = active > 0;
        info!(
            session_id = state.session_id.as_str(),
            turns = report.turns,
            observations = report.observations_stored,
            summaries = report.summaries_stored,
            total_tokens = report.total_tokens,
            "memory session finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        &self,
        state: &mut SessionState,
        kind: TurnKind,
        prompt: String,
        source_message_id: Option<i64>,
        active: &mut usize,
        report: &mut SessionReport,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        state.history.push(ConversationMessage::user(prompt));
        let reply = self.query_with_fallback(&state.history, active, cancel).await?;
        report.turns += 1;
        if let Some(tokens) = reply.tokens_used {
            state.total_tokens = state.total_tokens.saturating_add(tokens);
        }

        let correlation_id = state.correlation_id();
        if reply.is_empty() {
            warn!(
                correlation_id = correlation_id.as_str(),
                provider = self.engines[*active].provider_name(),
                ?kind,
                "provider returned an empty reply, skipping turn"
            );
            report.empty_replies += 1;
            return Ok(());
        }
        state
            .history
            .push(ConversationMessage::assistant(reply.content.clone()));

        let (observations, summary) = match kind {
            TurnKind::Summary => (Vec::new(), parse_summary_json(&reply.content, &correlation_id)),
            TurnKind::Init | TurnKind::Observation => (
                parse_observations_json(&reply.content, &correlation_id, &self.mode),
                None,
            ),
        };
        if observations.is_empty() && summary.is_none() {
            debug!(
                correlation_id = correlation_id.as_str(),
                ?kind,
                "turn produced nothing to store"
            );
            return Ok(());
        }

        let stored_observations = observations.len();
        let stored_summary = summary.is_some();
        self.sink
            .store(ObservationBatch {
                session_id: state.session_id.clone(),
                project: state.project.clone(),
                prompt_number: state.prompt_number,
                source_message_id,
                provider: self.engines[*active].provider_name().to_string(),
                tokens_used: reply.tokens_used,
                observations,
                summary,
            })
            .await?;
        report.observations_stored += stored_observations;
        if stored_summary {
            report.summaries_stored += 1;
        }
        Ok(())
    }

    async fn query_with_fallback(
        &self,
        history: &[ConversationMessage],
        active: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, SessionError> {
        loop {
            let engine = &self.engines[*active];
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                result = engine.query(history, cancel) => result,
            };
            match outcome {
                Ok(reply) => return Ok(reply),
                Err(EngineError::Cancelled) => return Err(SessionError::Cancelled),
                Err(error) if error.is_fallback_eligible() && *active + 1 < self.engines.len() => {
                    let next = &self.engines[*active + 1];
                    warn!(
                        from = engine.provider_name(),
                        to = next.provider_name(),
                        error = %error,
                        "provider failed, switching to fallback provider"
                    );
                    *active += 1;
                }
                Err(error) => {
                    return Err(SessionError::Provider {
                        provider: engine.provider_name().to_string(),
                        source: error,
                    })
                }
            }
        }
    }
}
