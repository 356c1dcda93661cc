//! Gemini client (`streamGenerateContent` over SSE).
//!
//! Each turn replays the prior history as role-tagged contents plus an optional system
//! instruction. The SSE body is split on blank lines; every text part of every event is one
//! fragment, yielded in arrival order.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use super::{api_error, BackendError, ChatBackend, HistoryTurn, Target, Turn, TurnRequest};
use crate::agents::AgentRegistry;
use crate::session::Role;
use crate::title::TitleSummarizer;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Client for the Gemini generateContent API.
#[derive(Clone)]
pub struct GeminiClient {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

impl GenerateResponse {
    fn texts(self) -> Result<Vec<String>, BackendError> {
        if let Some(err) = self.error {
            return Err(BackendError::Api {
                status: err.code.unwrap_or(500),
                message: err.message,
            });
        }
        Ok(self
            .candidates
            .into_iter()
            .take(1)
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .map(|p| p.text)
            .filter(|t| !t.is_empty())
            .collect())
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn text_content(role: Option<&str>, text: &str) -> Content {
    Content {
        role: role.map(str::to_string),
        parts: vec![Part {
            text: text.to_string(),
        }],
    }
}

fn build_request(history: &[HistoryTurn], text: &str, system: Option<&str>) -> GenerateRequest {
    let mut contents: Vec<Content> = history
        .iter()
        .map(|t| text_content(Some(role_name(t.role)), &t.text))
        .collect();
    contents.push(text_content(Some("user"), text));
    GenerateRequest {
        contents,
        system_instruction: system
            .filter(|s| !s.trim().is_empty())
            .map(|s| text_content(None, s)),
    }
}

/// Remove every complete event (terminated by a blank line) from `buffer`.
/// `buffer` must already have carriage returns stripped.
fn drain_events(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let event_bytes: Vec<u8> = buffer.drain(..pos).collect();
        buffer.drain(..2);
        events.push(String::from_utf8_lossy(&event_bytes).into_owned());
    }
    events
}

/// Text fragments carried by one SSE event. Events that do not parse are skipped.
fn event_fragments(event: &str) -> Result<Vec<String>, BackendError> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let data = data.join("\n");
    if data.trim() == "[DONE]" {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<GenerateResponse>(&data) {
        Ok(chunk) => chunk.texts(),
        Err(e) => {
            log::debug!("gemini: skipping unparseable event: {}", e);
            Ok(Vec::new())
        }
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, BackendError>>,
    finished: bool,
    idle: Duration,
}

impl SseState {
    fn push_events(&mut self, events: Vec<String>) {
        for event in events {
            match event_fragments(&event) {
                Ok(texts) => self.pending.extend(texts.into_iter().map(Ok)),
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                    return;
                }
            }
        }
    }
}

/// Lazily turn an SSE response body into fragments. `idle` bounds the wait for each chunk.
fn fragment_stream(res: reqwest::Response, idle: Duration) -> BoxStream<'static, Result<String, BackendError>> {
    let state = SseState {
        body: res.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        idle,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match tokio::time::timeout(st.idle, st.body.next()).await {
                Err(_) => {
                    st.finished = true;
                    st.pending.push_back(Err(BackendError::Timeout(st.idle)));
                }
                Ok(None) => {
                    st.finished = true;
                    let rest = String::from_utf8_lossy(&std::mem::take(&mut st.buffer)).into_owned();
                    if !rest.trim().is_empty() {
                        st.push_events(vec![rest]);
                    }
                }
                Ok(Some(Err(e))) => {
                    st.finished = true;
                    st.pending
                        .push_back(Err(BackendError::from_reqwest(e, st.idle)));
                }
                Ok(Some(Ok(chunk))) => {
                    st.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
                    let events = drain_events(&mut st.buffer);
                    st.push_events(events);
                }
            }
        }
    })
    .boxed()
}

impl GeminiClient {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            default_model: default_model.into(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<&str, BackendError> {
        self.api_key
            .as_deref()
            .ok_or(BackendError::ConfigurationMissing)
    }

    async fn post(&self, url: &str, body: &GenerateRequest) -> Result<reqwest::Response, BackendError> {
        let send = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
            .json(body)
            .send();
        let res = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        Ok(res)
    }

    /// POST /models/{model}:streamGenerateContent?alt=sse
    pub async fn chat_stream(
        &self,
        model: &str,
        history: &[HistoryTurn],
        text: &str,
        system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String, BackendError>>, BackendError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let body = build_request(history, text, system_instruction);
        log::debug!("gemini: POST {} ({} history turns)", url, history.len());
        let res = self.post(&url, &body).await?;
        Ok(fragment_stream(res, self.timeout))
    }

    /// POST /models/{model}:generateContent; the whole reply in one response.
    pub async fn generate(
        &self,
        model: &str,
        text: &str,
        system_instruction: Option<&str>,
    ) -> Result<String, BackendError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = build_request(&[], text, system_instruction);
        let res = self.post(&url, &body).await?;
        let data = tokio::time::timeout(self.timeout, res.json::<GenerateResponse>())
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        Ok(data.texts()?.concat())
    }
}

#[async_trait]
impl ChatBackend for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn streaming(&self) -> bool {
        true
    }

    fn resolve(&self, agent_ref: &str, _agents: &AgentRegistry) -> Option<Target> {
        self.api_key.as_ref()?;
        let model = agent_ref.trim();
        if model.is_empty() {
            Some(Target::Model(self.default_model.clone()))
        } else {
            Some(Target::Model(model.to_string()))
        }
    }

    fn default_ref(&self, _agents: &AgentRegistry) -> String {
        self.default_model.clone()
    }

    async fn converse(&self, request: TurnRequest) -> Result<Turn, BackendError> {
        let Target::Model(model) = &request.target else {
            return Err(BackendError::ConfigurationMissing);
        };
        let fragments = self
            .chat_stream(
                model,
                &request.history,
                &request.text,
                request.system_instruction.as_deref(),
            )
            .await?;
        Ok(Turn {
            fragments,
            continuity_token: None,
        })
    }
}

#[async_trait]
impl TitleSummarizer for GeminiClient {
    async fn summarize(&self, first_message: &str) -> Result<String, BackendError> {
        let prompt = format!(
            "Generate a very short title (max 5 words) for a chat that starts with this message. \
             Reply with the title only, no quotes or punctuation.\n\n{}",
            first_message
        );
        self.generate(&self.default_model, &prompt, None).await
    }
}
