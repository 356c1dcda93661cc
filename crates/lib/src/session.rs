//! Chat sessions and their message history.
//!
//! A session always holds at least one message: new sessions are seeded with a synthetic
//! welcome message that is shown to the user but never sent to the backend.
//! [`SessionStore`] is the shared, lock-protected list of sessions (newest first) plus the
//! active-session pointer; every read-modify-write happens inside one lock scope.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// Unique message identifier within a session.
pub type MessageId = String;

pub const DEFAULT_TITLE: &str = "新对话";
pub const WELCOME_TEXT: &str = "您今天在想什么？";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "model")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    #[serde(rename = "timestamp")]
    pub created_at: i64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub exclude_from_history: bool,
    #[serde(default, rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

fn new_message_id(prefix: &str) -> MessageId {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

impl Message {
    fn base(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: new_message_id("msg"),
            role,
            text: text.into(),
            created_at: now_millis(),
            is_error: false,
            is_streaming: false,
            exclude_from_history: false,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, text)
    }

    /// Synthetic greeting for the home view. Excluded from backend history.
    pub fn welcome() -> Self {
        Self {
            id: new_message_id("welcome"),
            exclude_from_history: true,
            ..Self::base(Role::Assistant, WELCOME_TEXT)
        }
    }

    /// Empty assistant message awaiting the reply.
    pub fn placeholder() -> Self {
        let now = now_millis();
        Self {
            is_streaming: true,
            started_at: Some(now),
            ..Self::base(Role::Assistant, "")
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::base(Role::Assistant, text)
        }
    }

    /// Stop streaming and stamp the end time.
    pub fn finalize(&mut self) {
        self.is_streaming = false;
        if self.ended_at.is_none() {
            self.ended_at = Some(now_millis());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    /// Agent config id (Dify) or model name (Gemini) used for this session.
    #[serde(rename = "modelId", default)]
    pub agent_ref: String,
    /// Opaque token that lets the backend recall earlier turns.
    #[serde(rename = "innerConversationId", default)]
    pub continuity_token: String,
}

impl Session {
    pub fn new(agent_ref: impl Into<String>) -> Self {
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            title: DEFAULT_TITLE.to_string(),
            messages: vec![Message::welcome()],
            created_at: now_millis(),
            agent_ref: agent_ref.into(),
            continuity_token: String::new(),
        }
    }

    /// True while only the welcome message is present.
    pub fn is_home_view(&self) -> bool {
        self.messages.len() == 1 && self.messages[0].exclude_from_history
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn remove_message(&mut self, id: &str) -> Option<Message> {
        let idx = self.position(id)?;
        Some(self.messages.remove(idx))
    }

    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming).count()
    }

    /// Messages eligible as backend history: no errors, no synthetic greetings, nothing in flight.
    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_error && !m.exclude_from_history && !m.is_streaming)
    }

    /// Store a token returned by the backend. Absent or empty tokens keep the current one.
    pub fn advance_token(&mut self, token: Option<&str>) {
        if let Some(t) = token.map(str::trim).filter(|t| !t.is_empty()) {
            self.continuity_token = t.to_string();
        }
    }

    /// Finalize messages left streaming by an interrupted run and restore the welcome
    /// message if the list is empty. Returns true if anything changed.
    pub fn settle(&mut self) -> bool {
        let mut changed = false;
        for m in self.messages.iter_mut().filter(|m| m.is_streaming) {
            m.finalize();
            changed = true;
        }
        if self.messages.is_empty() {
            self.messages.push(Message::welcome());
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, Default)]
struct SessionList {
    sessions: Vec<Session>,
    active: Option<SessionId>,
}

/// Shared list of sessions, newest first, and the active-session pointer.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<SessionList>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted sessions; the first one becomes active.
    pub fn from_sessions(mut sessions: Vec<Session>) -> Self {
        for s in sessions.iter_mut() {
            if s.settle() {
                log::debug!("session {}: settled interrupted messages", s.id);
            }
        }
        let active = sessions.first().map(|s| s.id.clone());
        Self {
            inner: Arc::new(RwLock::new(SessionList { sessions, active })),
        }
    }

    /// Clone of all sessions in display order.
    pub async fn list(&self) -> Vec<Session> {
        self.inner.read().await.sessions.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    /// Return a clone of the session if it exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn active_id(&self) -> Option<SessionId> {
        self.inner.read().await.active.clone()
    }

    /// Point at an existing session; false if it does not exist.
    pub async fn set_active(&self, id: &str) -> bool {
        let mut g = self.inner.write().await;
        if g.sessions.iter().any(|s| s.id == id) {
            g.active = Some(id.to_string());
            true
        } else {
            false
        }
    }

    /// Insert at the front (newest first) and make it active.
    pub async fn insert_front(&self, session: Session) {
        let mut g = self.inner.write().await;
        g.active = Some(session.id.clone());
        g.sessions.insert(0, session);
    }

    /// Apply `f` to the session under the write lock; `None` if the session is gone.
    pub async fn update<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut g = self.inner.write().await;
        g.sessions.iter_mut().find(|s| s.id == id).map(f)
    }

    /// Remove a session. When it was active, the next remaining session (the one that followed it,
    /// else the new last one) becomes active; the pointer is cleared if none remain.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let mut g = self.inner.write().await;
        let idx = g.sessions.iter().position(|s| s.id == id)?;
        let removed = g.sessions.remove(idx);
        if g.active.as_deref() == Some(id) {
            let next = g
                .sessions
                .get(idx)
                .or_else(|| g.sessions.last())
                .map(|s| s.id.clone());
            g.active = next;
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_in_home_view() {
        let s = Session::new("agent-1");
        assert_eq!(s.messages.len(), 1);
        assert!(s.messages[0].exclude_from_history);
        assert!(s.is_home_view());
        assert_eq!(s.title, DEFAULT_TITLE);
        assert!(s.continuity_token.is_empty());
        assert_eq!(s.history().count(), 0);
    }

    #[test]
    fn history_skips_errors_greetings_and_streaming() {
        let mut s = Session::new("a");
        s.messages.push(Message::user("hi"));
        s.messages.push(Message::error("boom"));
        s.messages.push(Message::assistant("hello"));
        s.messages.push(Message::placeholder());
        let texts: Vec<&str> = s.history().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
    }

    #[test]
    fn advance_token_never_regresses() {
        let mut s = Session::new("a");
        s.advance_token(Some("T1"));
        s.advance_token(None);
        assert_eq!(s.continuity_token, "T1");
        s.advance_token(Some("  "));
        assert_eq!(s.continuity_token, "T1");
        s.advance_token(Some("T2"));
        assert_eq!(s.continuity_token, "T2");
    }

    #[test]
    fn finalize_sets_end_time_once() {
        let mut m = Message::placeholder();
        assert!(m.is_streaming);
        assert!(m.started_at.is_some());
        m.finalize();
        assert!(!m.is_streaming);
        let ended = m.ended_at;
        assert!(ended.is_some());
        m.finalize();
        assert_eq!(m.ended_at, ended);
    }

    #[test]
    fn persisted_field_names() {
        let s = Session::new("agent-9");
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["modelId"], "agent-9");
        assert_eq!(v["innerConversationId"], "");
        assert_eq!(v["messages"][0]["role"], "model");
        assert_eq!(v["messages"][0]["excludeFromHistory"], true);
    }

    #[test]
    fn settle_finishes_interrupted_stream() {
        let mut s = Session::new("a");
        s.messages.clear();
        assert!(s.settle());
        assert!(s.is_home_view());

        s.messages.push(Message::placeholder());
        assert!(s.settle());
        assert_eq!(s.streaming_count(), 0);
        assert!(!s.settle());
    }

    #[tokio::test]
    async fn remove_active_moves_to_next_remaining() {
        let a = Session::new("x");
        let b = Session::new("x");
        let c = Session::new("x");
        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());
        let store = SessionStore::from_sessions(vec![a, b, c]);
        assert_eq!(store.active_id().await.as_deref(), Some(a_id.as_str()));

        store.remove(&a_id).await.unwrap();
        assert_eq!(store.active_id().await.as_deref(), Some(b_id.as_str()));

        assert!(store.set_active(&c_id).await);
        store.remove(&c_id).await.unwrap();
        assert_eq!(store.active_id().await.as_deref(), Some(b_id.as_str()));

        store.remove(&b_id).await.unwrap();
        assert_eq!(store.active_id().await, None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn remove_inactive_keeps_pointer() {
        let a = Session::new("x");
        let b = Session::new("x");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        let store = SessionStore::from_sessions(vec![a, b]);
        store.remove(&b_id).await.unwrap();
        assert_eq!(store.active_id().await.as_deref(), Some(a_id.as_str()));
    }

    #[tokio::test]
    async fn insert_front_orders_newest_first() {
        let store = SessionStore::new();
        let older = Session::new("x");
        let newer = Session::new("x");
        let newer_id = newer.id.clone();
        store.insert_front(older).await;
        store.insert_front(newer).await;
        let list = store.list().await;
        assert_eq!(list[0].id, newer_id);
        assert_eq!(store.active_id().await.as_deref(), Some(newer_id.as_str()));
    }
}
