//! Dify agent client (blocking `chat-messages`).
//!
//! The continuity token travels only in `inputs.conversation_id`, the workflow's own business
//! variable. The top-level `conversation_id` is always sent empty: once Dify binds a request to
//! one of its conversations it ignores updated `inputs`, and the agent would lose context.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{api_error, BackendError, ChatBackend, Target, Turn, TurnRequest};
use crate::agents::AgentRegistry;

const DEFAULT_BASE_URL: &str = "https://ai-agent.tinetcloud.com/v1";
const EMPTY_REPLY: &str = "智能体未返回有效内容。";

/// Client for the Dify chat-messages API.
#[derive(Clone)]
pub struct DifyClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    inputs: ChatInputs<'a>,
    query: &'a str,
    response_mode: &'static str,
    conversation_id: &'static str,
    user: &'a str,
    files: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct ChatInputs<'a> {
    access_key_id: &'a str,
    access_key_secret: &'a str,
    agent_id: &'a str,
    user_id: &'a str,
    conversation_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    answer: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
}

/// Result of decoding Dify's `answer` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedAnswer {
    /// A structured envelope; may carry the workflow's conversation id.
    Envelope {
        text: String,
        conversation_id: Option<String>,
    },
    /// Plain text, or text that only looked like JSON.
    Raw(String),
}

impl DecodedAnswer {
    pub fn text(&self) -> &str {
        match self {
            DecodedAnswer::Envelope { text, .. } | DecodedAnswer::Raw(text) => text,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            DecodedAnswer::Envelope {
                conversation_id, ..
            } => conversation_id.as_deref(),
            DecodedAnswer::Raw(_) => None,
        }
    }
}

/// Flatten a JSON value to text: strings as-is, arrays joined, objects via `content`/`answer`/`text`.
fn extract_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(extract_content).collect(),
        Value::Object(map) => ["content", "answer", "text"]
            .iter()
            .filter_map(|k| map.get(*k).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .unwrap_or("")
            .to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn envelope_conversation_id(value: &Value) -> Option<String> {
    value
        .get("conversation_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn decode_envelope(parsed: &Value) -> DecodedAnswer {
    let text = match parsed.get("answer").and_then(Value::as_array) {
        Some(fragments) => fragments
            .iter()
            .filter_map(|f| f.get("content").and_then(Value::as_str))
            .collect(),
        None => extract_content(parsed),
    };
    DecodedAnswer::Envelope {
        text,
        conversation_id: envelope_conversation_id(parsed),
    }
}

/// Decode the `answer` field. A string that looks like a JSON object or array is parsed once;
/// if that fails the trimmed text is used verbatim.
pub fn decode_answer(answer: &Value) -> DecodedAnswer {
    match answer {
        Value::String(s) => {
            let trimmed = s.trim();
            let looks_json = (trimmed.starts_with('{') && trimmed.ends_with('}'))
                || (trimmed.starts_with('[') && trimmed.ends_with(']'));
            if !looks_json {
                return DecodedAnswer::Raw(trimmed.to_string());
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(parsed) => decode_envelope(&parsed),
                Err(e) => {
                    log::debug!("dify: answer looked like JSON but did not parse: {}", e);
                    DecodedAnswer::Raw(trimmed.to_string())
                }
            }
        }
        other => DecodedAnswer::Envelope {
            text: extract_content(other),
            conversation_id: envelope_conversation_id(other),
        },
    }
}

fn value_text(value: Option<&Value>) -> Option<String> {
    value
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .filter(|s| !s.is_empty())
}

/// Reply text and token from a response body. Falls back to `metadata.message`, then `message`,
/// then a fixed notice; the token falls back to `previous_token`.
fn reply_from(data: &ChatResponse, previous_token: &str) -> (String, Option<String>) {
    let decoded = data.answer.as_ref().filter(|a| !a.is_null()).map(decode_answer);
    let mut text = decoded
        .as_ref()
        .map(|d| d.text().to_string())
        .unwrap_or_default();
    if text.is_empty() {
        text = value_text(data.metadata.as_ref().and_then(|m| m.get("message")))
            .or_else(|| value_text(data.message.as_ref()))
            .unwrap_or_else(|| EMPTY_REPLY.to_string());
    }
    let token = decoded
        .as_ref()
        .and_then(|d| d.conversation_id().map(str::to_string))
        .or_else(|| Some(previous_token.to_string()).filter(|t| !t.is_empty()));
    (text, token)
}

impl DifyClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    /// POST /chat-messages (blocking). Returns reply text and the workflow's conversation id.
    pub async fn chat(&self, request: &TurnRequest) -> Result<(String, Option<String>), BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(BackendError::ConfigurationMissing)?;
        let Target::Agent(agent) = &request.target else {
            return Err(BackendError::ConfigurationMissing);
        };
        let url = format!("{}/chat-messages", self.base_url);
        let body = ChatRequest {
            inputs: ChatInputs {
                access_key_id: &agent.credentials.access_key_id,
                access_key_secret: &agent.credentials.access_key_secret,
                agent_id: &agent.agent_id,
                user_id: &request.user_id,
                conversation_id: &request.continuity_token,
            },
            query: &request.text,
            response_mode: "blocking",
            conversation_id: "",
            user: &request.user_id,
            files: Vec::new(),
        };
        log::debug!("dify: POST {} agent={}", url, agent.agent_id);
        let res = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let raw = res
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        let data: ChatResponse = serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!("dify: response body is not a JSON object: {}", e);
            ChatResponse {
                answer: Some(Value::String(raw.clone())),
                ..ChatResponse::default()
            }
        });
        Ok(reply_from(&data, &request.continuity_token))
    }
}

#[async_trait]
impl ChatBackend for DifyClient {
    fn name(&self) -> &'static str {
        "dify"
    }

    fn streaming(&self) -> bool {
        false
    }

    fn resolve(&self, agent_ref: &str, agents: &AgentRegistry) -> Option<Target> {
        self.api_key.as_ref()?;
        agents.get(agent_ref).cloned().map(Target::Agent)
    }

    fn default_ref(&self, agents: &AgentRegistry) -> String {
        agents.first().map(|a| a.id.clone()).unwrap_or_default()
    }

    async fn converse(&self, request: TurnRequest) -> Result<Turn, BackendError> {
        let (text, continuity_token) = self.chat(&request).await?;
        Ok(Turn {
            fragments: futures_util::stream::once(async move { Ok(text) }).boxed(),
            continuity_token,
        })
    }
}
