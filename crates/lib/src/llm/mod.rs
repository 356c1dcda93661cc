//! Backend clients for chat turns.
//!
//! [`ChatBackend`] is the one contract the session state machine talks to. Two implementations:
//! [`DifyClient`] (one blocking request per turn, continuity carried in a business token) and
//! [`GeminiClient`] (SSE streaming, continuity carried by replaying history).

mod dify;
mod gemini;

pub use dify::{decode_answer, DecodedAnswer, DifyClient};
pub use gemini::GeminiClient;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentConfig, AgentRegistry};
use crate::config::{self, BackendKind, Config};
use crate::session::Role;

/// What a session's agent/model reference resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Agent(AgentConfig),
    Model(String),
}

/// One prior turn replayed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub target: Target,
    pub text: String,
    pub user_id: String,
    /// Token from the previous turn; empty on the first turn.
    pub continuity_token: String,
    /// Prior turns, oldest first, without the current user text.
    pub history: Vec<HistoryTurn>,
    pub system_instruction: Option<String>,
}

/// A started turn: reply fragments in arrival order and the backend's continuity token.
/// The stream is finite and not restartable.
pub struct Turn {
    pub fragments: BoxStream<'static, Result<String, BackendError>>,
    pub continuity_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no agent or model configured")]
    ConfigurationMissing,
    #[error("network error: {0}")]
    Request(#[source] reqwest::Error),
    #[error("API 错误: {status} {message}")]
    Api { status: u16, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    pub(crate) fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(timeout)
        } else {
            BackendError::Request(e)
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether replies arrive incrementally and can be stopped part-way.
    fn streaming(&self) -> bool;

    /// Resolve a session reference. `None` means nothing usable is configured and no request
    /// should be made.
    fn resolve(&self, agent_ref: &str, agents: &AgentRegistry) -> Option<Target>;

    /// Reference assigned to new sessions.
    fn default_ref(&self, agents: &AgentRegistry) -> String;

    async fn converse(&self, request: TurnRequest) -> Result<Turn, BackendError>;
}

/// Build an `Api` error from a non-2xx response: status code plus the server's message
/// (`message` or `error.message` in a JSON body), else the status reason.
pub(crate) async fn api_error(res: reqwest::Response) -> BackendError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(|m| m.as_str())
                .or_else(|| v.pointer("/error/message").and_then(|m| m.as_str()))
                .map(str::to_string)
        })
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
    BackendError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Construct the backend selected in config. Missing credentials are not an error here;
/// the backend reports them through [`ChatBackend::resolve`].
pub fn backend_from_config(config: &Config) -> Arc<dyn ChatBackend> {
    let timeout = Duration::from_secs(config.backend.request_timeout_secs.max(1));
    match config.backend.kind {
        BackendKind::Dify => Arc::new(DifyClient::new(
            Some(config.backend.dify_base_url.clone()),
            config::resolve_dify_api_key(config),
            timeout,
        )),
        BackendKind::Gemini => Arc::new(gemini_from_config(config)),
    }
}

pub fn gemini_from_config(config: &Config) -> GeminiClient {
    GeminiClient::new(
        Some(config.backend.gemini_base_url.clone()),
        config::resolve_gemini_api_key(config),
        config.backend.gemini_model.clone(),
        Duration::from_secs(config.backend.request_timeout_secs.max(1)),
    )
}
