//! Chat turns over the session list: send, stream into a placeholder, regenerate, stop.
//!
//! Every turn ends with the session idle and exactly one of: the placeholder finalized with the
//! reply (or the partial reply, when stopped), or the placeholder replaced by an error message.
//! The placeholder is always addressed by id, never by position. The full session list is
//! written to the store after every mutation.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentConfig, AgentError, AgentRegistry};
use crate::llm::{BackendError, ChatBackend, HistoryTurn, Target, TurnRequest};
use crate::session::{Message, MessageId, Role, Session, SessionId, SessionStore, DEFAULT_TITLE};
use crate::store::{self, KeyValueStore, KEY_SESSIONS};
use crate::title::TitleGenerator;

/// Why a send did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyText,
    AlreadySending,
    UnknownSession,
    NotRegenerable,
}

/// How a send or regenerate call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was changed and no request was made.
    Rejected(RejectReason),
    /// No usable agent/model for the session; the caller should prompt for configuration.
    ConfigurationMissing,
    /// The placeholder holds the full reply.
    Completed { message_id: MessageId },
    /// Stopped by the user; the placeholder keeps what had arrived.
    Cancelled { message_id: MessageId },
    /// The placeholder was replaced by the error message `message_id`.
    Failed { message_id: MessageId, error: String },
}

/// Notifications for front-ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Fragment {
        session_id: SessionId,
        message_id: MessageId,
        text: String,
    },
    TitleChanged {
        session_id: SessionId,
        title: String,
    },
}

enum TurnEnd {
    Completed(Option<String>),
    Cancelled(Option<String>),
    Failed(BackendError),
    Orphaned,
}

struct PreparedTurn {
    placeholder_id: MessageId,
    continuity_token: String,
    history: Vec<HistoryTurn>,
    first_real: bool,
}

/// Writes the session list. Snapshot and write happen under one lock, so writes land in the
/// order their snapshots were taken. File IO runs on the blocking pool.
#[derive(Clone)]
struct Persister {
    sessions: SessionStore,
    store: Arc<dyn KeyValueStore>,
    lock: Arc<Mutex<()>>,
}

impl Persister {
    async fn persist(&self) {
        let _guard = self.lock.lock().await;
        let list = self.sessions.list().await;
        let backing = Arc::clone(&self.store);
        let written =
            tokio::task::spawn_blocking(move || store::save(backing.as_ref(), KEY_SESSIONS, &list))
                .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("chat: saving sessions failed: {}", e),
            Err(e) => log::warn!("chat: session writer task failed: {}", e),
        }
    }
}

fn history_of(messages: &[Message]) -> Vec<HistoryTurn> {
    messages
        .iter()
        .filter(|m| !m.is_error && !m.exclude_from_history && !m.is_streaming)
        .map(|m| HistoryTurn {
            role: m.role,
            text: m.text.clone(),
        })
        .collect()
}

/// Owns the sessions, agent configs and in-flight turns, and drives the backend.
pub struct ChatService {
    sessions: SessionStore,
    store: Arc<dyn KeyValueStore>,
    persister: Persister,
    backend: Arc<dyn ChatBackend>,
    agents: RwLock<AgentRegistry>,
    titles: Arc<TitleGenerator>,
    user_id: String,
    system_instruction: RwLock<Option<String>>,
    in_flight: Mutex<HashMap<SessionId, CancellationToken>>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatService {
    /// Load sessions and agents from `store`. With no saved sessions, one fresh session is created.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn ChatBackend>,
        titles: TitleGenerator,
        user_id: impl Into<String>,
    ) -> Self {
        let agents = AgentRegistry::load(store.as_ref());
        let mut sessions: Vec<Session> = store::load(store.as_ref(), KEY_SESSIONS).unwrap_or_default();
        if sessions.is_empty() {
            sessions.push(Session::new(backend.default_ref(&agents)));
        }
        log::info!(
            "chat: {} sessions, {} agents, backend {}",
            sessions.len(),
            agents.all().len(),
            backend.name()
        );
        let sessions = SessionStore::from_sessions(sessions);
        let persister = Persister {
            sessions: sessions.clone(),
            store: Arc::clone(&store),
            lock: Arc::new(Mutex::new(())),
        };
        let (events, _) = broadcast::channel(256);
        Self {
            sessions,
            store,
            persister,
            backend,
            agents: RwLock::new(agents),
            titles: Arc::new(titles),
            user_id: user_id.into(),
            system_instruction: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_system_instruction(self, instruction: Option<String>) -> Self {
        Self {
            system_instruction: RwLock::new(instruction.filter(|s| !s.trim().is_empty())),
            ..self
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn backend(&self) -> &dyn ChatBackend {
        self.backend.as_ref()
    }

    async fn persist(&self) {
        self.persister.persist().await;
    }

    // --- sessions ---

    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.list().await
    }

    pub async fn session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).await
    }

    pub async fn active_session_id(&self) -> Option<SessionId> {
        self.sessions.active_id().await
    }

    pub async fn select_session(&self, id: &str) -> bool {
        self.sessions.set_active(id).await
    }

    pub async fn is_home_view(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .await
            .map(|s| s.is_home_view())
            .unwrap_or(false)
    }

    pub async fn is_sending(&self, id: &str) -> bool {
        self.in_flight.lock().await.contains_key(id)
    }

    /// New session at the top of the list, made active. Without an explicit reference it inherits
    /// the active session's agent, else the backend default.
    pub async fn create_session(&self, agent_ref: Option<&str>) -> Session {
        let agent_ref = match agent_ref {
            Some(r) => r.to_string(),
            None => self.default_agent_ref().await,
        };
        let session = Session::new(agent_ref);
        self.sessions.insert_front(session.clone()).await;
        self.persist().await;
        log::debug!("chat: created session {}", session.id);
        session
    }

    async fn default_agent_ref(&self) -> String {
        if let Some(active) = self.sessions.active_id().await {
            if let Some(s) = self.sessions.get(&active).await {
                if !s.agent_ref.is_empty() {
                    return s.agent_ref;
                }
            }
        }
        let agents = self.agents.read().await;
        self.backend.default_ref(&agents)
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        let renamed = self
            .sessions
            .update(id, |s| s.title = title.to_string())
            .await
            .is_some();
        if renamed {
            self.persist().await;
        }
        renamed
    }

    /// Point a session at a different agent/model.
    pub async fn set_session_agent(&self, id: &str, agent_ref: &str) -> bool {
        let changed = self
            .sessions
            .update(id, |s| s.agent_ref = agent_ref.to_string())
            .await
            .is_some();
        if changed {
            self.persist().await;
        }
        changed
    }

    /// Delete a session, stopping its turn if one is running. If it was active, the next
    /// remaining session becomes active; if none remain, a fresh one is created.
    pub async fn delete_session(&self, id: &str) -> bool {
        if let Some(token) = self.in_flight.lock().await.get(id) {
            token.cancel();
        }
        let agent_ref = match self.sessions.remove(id).await {
            Some(removed) => removed.agent_ref,
            None => return false,
        };
        if self.sessions.is_empty().await {
            let fallback = if agent_ref.is_empty() {
                let agents = self.agents.read().await;
                self.backend.default_ref(&agents)
            } else {
                agent_ref
            };
            self.sessions.insert_front(Session::new(fallback)).await;
        }
        self.persist().await;
        true
    }

    // --- agents and instruction ---

    pub async fn agents(&self) -> Vec<AgentConfig> {
        self.agents.read().await.all().to_vec()
    }

    /// Draft for the agent editor, copied from `template_id` when given.
    pub async fn draft_agent(&self, template_id: Option<&str>) -> AgentConfig {
        self.agents.read().await.draft_from(template_id)
    }

    pub async fn upsert_agent(&self, agent: AgentConfig) -> Result<(), AgentError> {
        let mut agents = self.agents.write().await;
        agents.upsert(agent)?;
        if let Err(e) = agents.save(self.store.as_ref()) {
            log::warn!("chat: saving agents failed: {}", e);
        }
        Ok(())
    }

    pub async fn remove_agent(&self, id: &str) -> Result<AgentConfig, AgentError> {
        let mut agents = self.agents.write().await;
        let removed = agents.remove(id)?;
        if let Err(e) = agents.save(self.store.as_ref()) {
            log::warn!("chat: saving agents failed: {}", e);
        }
        Ok(removed)
    }

    pub async fn set_system_instruction(&self, instruction: Option<String>) {
        *self.system_instruction.write().await = instruction.filter(|s| !s.trim().is_empty());
    }

    async fn resolve(&self, agent_ref: &str) -> Option<Target> {
        let agents = self.agents.read().await;
        self.backend.resolve(agent_ref, &agents)
    }

    async fn claim(&self, session_id: &str) -> Option<CancellationToken> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(session_id) {
            return None;
        }
        let token = CancellationToken::new();
        in_flight.insert(session_id.to_string(), token.clone());
        Some(token)
    }

    async fn release(&self, session_id: &str) {
        self.in_flight.lock().await.remove(session_id);
    }

    // --- turns ---

    /// Send `text` as the user's next message and wait for the turn to end.
    pub async fn send_message(&self, session_id: &str, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Rejected(RejectReason::EmptyText);
        }
        let Some(session) = self.sessions.get(session_id).await else {
            return SendOutcome::Rejected(RejectReason::UnknownSession);
        };
        if self.is_sending(session_id).await {
            return SendOutcome::Rejected(RejectReason::AlreadySending);
        }
        let Some(target) = self.resolve(&session.agent_ref).await else {
            log::info!("chat: session {} has no usable agent configured", session_id);
            return SendOutcome::ConfigurationMissing;
        };
        let Some(cancel) = self.claim(session_id).await else {
            return SendOutcome::Rejected(RejectReason::AlreadySending);
        };

        let user_text = text.to_string();
        let prepared = self
            .sessions
            .update(session_id, |s| {
                let first_real = s.is_home_view();
                if first_real {
                    s.messages.clear();
                }
                let history = history_of(&s.messages);
                s.messages.push(Message::user(user_text.clone()));
                let placeholder = Message::placeholder();
                let placeholder_id = placeholder.id.clone();
                s.messages.push(placeholder);
                PreparedTurn {
                    placeholder_id,
                    continuity_token: s.continuity_token.clone(),
                    history,
                    first_real,
                }
            })
            .await;
        let Some(prepared) = prepared else {
            self.release(session_id).await;
            return SendOutcome::Rejected(RejectReason::UnknownSession);
        };
        self.run_turn(session_id, user_text, target, cancel, prepared).await
    }

    /// Re-ask the user message preceding `message_id`: the list is cut to end just before
    /// `message_id` and a new reply is produced for the same user text. No-op unless the
    /// preceding message is from the user.
    pub async fn regenerate(&self, session_id: &str, message_id: &str) -> SendOutcome {
        let Some(session) = self.sessions.get(session_id).await else {
            return SendOutcome::Rejected(RejectReason::UnknownSession);
        };
        let user_text = match session.position(message_id) {
            Some(idx) if idx > 0 && session.messages[idx - 1].role == Role::User => {
                session.messages[idx - 1].text.trim().to_string()
            }
            _ => return SendOutcome::Rejected(RejectReason::NotRegenerable),
        };
        if user_text.is_empty() {
            return SendOutcome::Rejected(RejectReason::EmptyText);
        }
        let Some(target) = self.resolve(&session.agent_ref).await else {
            return SendOutcome::ConfigurationMissing;
        };
        let Some(cancel) = self.claim(session_id).await else {
            return SendOutcome::Rejected(RejectReason::AlreadySending);
        };

        let prepared = self
            .sessions
            .update(session_id, |s| {
                let idx = s.position(message_id)?;
                if idx == 0 || s.messages[idx - 1].role != Role::User {
                    return None;
                }
                s.messages.truncate(idx);
                let history = history_of(&s.messages[..idx - 1]);
                let placeholder = Message::placeholder();
                let placeholder_id = placeholder.id.clone();
                s.messages.push(placeholder);
                Some(PreparedTurn {
                    placeholder_id,
                    continuity_token: s.continuity_token.clone(),
                    history,
                    first_real: false,
                })
            })
            .await
            .flatten();
        let Some(prepared) = prepared else {
            self.release(session_id).await;
            return SendOutcome::Rejected(RejectReason::NotRegenerable);
        };
        log::debug!("chat: regenerating reply in session {}", session_id);
        self.run_turn(session_id, user_text, target, cancel, prepared).await
    }

    /// Stop the running turn of a streaming backend. The partial reply is kept.
    pub async fn stop_generation(&self, session_id: &str) -> bool {
        if !self.backend.streaming() {
            return false;
        }
        match self.in_flight.lock().await.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_turn(
        &self,
        session_id: &str,
        text: String,
        target: Target,
        cancel: CancellationToken,
        prepared: PreparedTurn,
    ) -> SendOutcome {
        self.persist().await;
        if prepared.first_real {
            self.spawn_title(session_id.to_string(), text.clone());
        }

        let request = TurnRequest {
            target,
            text,
            user_id: self.user_id.clone(),
            continuity_token: prepared.continuity_token,
            history: prepared.history,
            system_instruction: self.system_instruction.read().await.clone(),
        };
        let placeholder_id = prepared.placeholder_id;
        let end = self
            .consume(session_id, &placeholder_id, request, &cancel)
            .await;

        let outcome = match end {
            TurnEnd::Completed(token) => {
                self.finalize_placeholder(session_id, &placeholder_id, token).await;
                SendOutcome::Completed {
                    message_id: placeholder_id,
                }
            }
            TurnEnd::Cancelled(token) => {
                log::debug!("chat: turn in session {} stopped", session_id);
                self.finalize_placeholder(session_id, &placeholder_id, token).await;
                SendOutcome::Cancelled {
                    message_id: placeholder_id,
                }
            }
            TurnEnd::Failed(e) => {
                log::warn!("chat: turn in session {} failed: {}", session_id, e);
                let error_message = Message::error(format!("错误: {}", e));
                let message_id = error_message.id.clone();
                self.sessions
                    .update(session_id, |s| {
                        s.remove_message(&placeholder_id);
                        s.messages.push(error_message);
                    })
                    .await;
                SendOutcome::Failed {
                    message_id,
                    error: e.to_string(),
                }
            }
            TurnEnd::Orphaned => SendOutcome::Cancelled {
                message_id: placeholder_id,
            },
        };
        self.release(session_id).await;
        self.persist().await;
        outcome
    }

    async fn finalize_placeholder(&self, session_id: &str, placeholder_id: &str, token: Option<String>) {
        self.sessions
            .update(session_id, |s| {
                if let Some(m) = s.message_mut(placeholder_id) {
                    m.finalize();
                }
                s.advance_token(token.as_deref());
            })
            .await;
    }

    /// Drive the backend and append fragments to the placeholder in arrival order.
    async fn consume(
        &self,
        session_id: &str,
        placeholder_id: &str,
        request: TurnRequest,
        cancel: &CancellationToken,
    ) -> TurnEnd {
        let turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TurnEnd::Cancelled(None),
            res = self.backend.converse(request) => match res {
                Ok(turn) => turn,
                Err(e) => return TurnEnd::Failed(e),
            },
        };
        let token = turn.continuity_token;
        let mut fragments = turn.fragments;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TurnEnd::Cancelled(token),
                next = fragments.next() => next,
            };
            let text = match next {
                None => return TurnEnd::Completed(token),
                Some(Err(e)) => return TurnEnd::Failed(e),
                Some(Ok(text)) => text,
            };
            let patched = self
                .sessions
                .update(session_id, |s| match s.message_mut(placeholder_id) {
                    Some(m) => {
                        m.text.push_str(&text);
                        true
                    }
                    None => false,
                })
                .await
                .unwrap_or(false);
            if !patched {
                log::debug!("chat: placeholder in session {} is gone, dropping stream", session_id);
                return TurnEnd::Orphaned;
            }
            let _ = self.events.send(ChatEvent::Fragment {
                session_id: session_id.to_string(),
                message_id: placeholder_id.to_string(),
                text,
            });
            self.persist().await;
        }
    }

    /// Generate a title in the background. It is applied only while the session still has the
    /// default title, so a rename made in the meantime wins.
    fn spawn_title(&self, session_id: SessionId, first_message: String) {
        let sessions = self.sessions.clone();
        let persister = self.persister.clone();
        let titles = Arc::clone(&self.titles);
        let events = self.events.clone();
        tokio::spawn(async move {
            let title = titles.generate(&first_message).await;
            let applied = sessions
                .update(&session_id, |s| {
                    if s.title == DEFAULT_TITLE {
                        s.title = title.clone();
                        true
                    } else {
                        false
                    }
                })
                .await
                .unwrap_or(false);
            if applied {
                persister.persist().await;
                let _ = events.send(ChatEvent::TitleChanged { session_id, title });
            } else {
                log::debug!("chat: session {} renamed or gone, generated title dropped", session_id);
            }
        });
    }
}
