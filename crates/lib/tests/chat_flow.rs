//! Turn state machine against a scripted in-process backend: sending, streaming, failures,
//! stopping, regeneration, continuity tokens and persistence.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use lib::agents::AgentRegistry;
use lib::chat::{ChatEvent, ChatService, RejectReason, SendOutcome};
use lib::llm::{BackendError, ChatBackend, Target, Turn, TurnRequest};
use lib::session::{Role, Session, DEFAULT_TITLE};
use lib::store::{self, FileStore, KeyValueStore, MemoryStore, KEY_SESSIONS};
use lib::title::{TitleGenerator, TitleSummarizer};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

enum Reply {
    Text {
        fragments: Vec<&'static str>,
        token: Option<&'static str>,
    },
    Fail,
    FailMidStream(&'static str),
    /// One fragment, then nothing until the turn is stopped.
    Hang(&'static str),
    /// Fragments as the test sends them; ends when the sender is dropped.
    Fed(mpsc::UnboundedReceiver<String>),
}

fn text(fragments: Vec<&'static str>, token: Option<&'static str>) -> Reply {
    Reply::Text { fragments, token }
}

struct Scripted {
    streaming: bool,
    configured: bool,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl Scripted {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            streaming: true,
            configured: true,
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn blocking(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            streaming: false,
            configured: true,
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn unconfigured() -> Arc<Self> {
        Arc::new(Self {
            streaming: true,
            configured: false,
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn streaming(&self) -> bool {
        self.streaming
    }

    fn resolve(&self, agent_ref: &str, _agents: &AgentRegistry) -> Option<Target> {
        if self.configured {
            Some(Target::Model(agent_ref.to_string()))
        } else {
            None
        }
    }

    fn default_ref(&self, _agents: &AgentRegistry) -> String {
        "test-model".to_string()
    }

    async fn converse(&self, request: TurnRequest) -> Result<Turn, BackendError> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text(vec!["ok"], None));
        match reply {
            Reply::Text { fragments, token } => Ok(Turn {
                fragments: stream::iter(fragments.into_iter().map(|f| Ok(f.to_string()))).boxed(),
                continuity_token: token.map(str::to_string),
            }),
            Reply::Fail => Err(BackendError::Api {
                status: 500,
                message: "boom".to_string(),
            }),
            Reply::FailMidStream(first) => Ok(Turn {
                fragments: stream::iter(vec![
                    Ok(first.to_string()),
                    Err(BackendError::Timeout(Duration::from_secs(60))),
                ])
                .boxed(),
                continuity_token: None,
            }),
            Reply::Hang(first) => Ok(Turn {
                fragments: stream::iter(vec![Ok(first.to_string())])
                    .chain(stream::pending())
                    .boxed(),
                continuity_token: None,
            }),
            Reply::Fed(rx) => Ok(Turn {
                fragments: stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|t| (Ok::<_, BackendError>(t), rx))
                })
                .boxed(),
                continuity_token: None,
            }),
        }
    }
}

fn service(backend: Arc<Scripted>) -> (Arc<ChatService>, Arc<MemoryStore>) {
    service_with_titles(backend, TitleGenerator::default())
}

fn service_with_titles(backend: Arc<Scripted>, titles: TitleGenerator) -> (Arc<ChatService>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let svc = ChatService::new(store.clone(), backend, titles, "user-1");
    (Arc::new(svc), store)
}

/// Summarizer that answers after a delay.
struct SlowSummary(Duration);

#[async_trait]
impl TitleSummarizer for SlowSummary {
    async fn summarize(&self, _first_message: &str) -> Result<String, BackendError> {
        tokio::time::sleep(self.0).await;
        Ok("Generated".to_string())
    }
}

async fn active(svc: &ChatService) -> Session {
    let id = svc.active_session_id().await.expect("active session");
    svc.session(&id).await.expect("session exists")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn new_session_shows_welcome_only() {
    let (svc, _) = service(Scripted::new(vec![]));
    let s = active(&svc).await;
    assert_eq!(s.messages.len(), 1);
    assert!(s.messages[0].exclude_from_history);
    assert!(svc.is_home_view(&s.id).await);
    assert_eq!(s.agent_ref, "test-model");
}

#[tokio::test]
async fn first_message_replaces_welcome_and_sets_title() {
    let backend = Scripted::new(vec![text(vec!["Hi ", "there"], None)]);
    let (svc, _) = service(backend.clone());
    let id = active(&svc).await.id;

    let outcome = svc.send_message(&id, "hello").await;
    assert!(matches!(outcome, SendOutcome::Completed { .. }));

    let s = svc.session(&id).await.unwrap();
    assert_eq!(s.messages.len(), 2);
    assert_eq!(s.messages[0].role, Role::User);
    assert_eq!(s.messages[0].text, "hello");
    assert_eq!(s.messages[1].role, Role::Assistant);
    assert_eq!(s.messages[1].text, "Hi there");
    assert!(!s.messages[1].is_streaming);
    assert!(s.messages[1].started_at.is_some());
    assert!(s.messages[1].ended_at.is_some());
    assert!(!svc.is_home_view(&id).await);
    assert!(!svc.is_sending(&id).await);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text, "hello");
    assert_eq!(requests[0].user_id, "user-1");
    assert!(requests[0].history.is_empty());

    let svc2 = svc.clone();
    let id2 = id.clone();
    eventually(move || {
        let svc = svc2.clone();
        let id = id2.clone();
        async move { svc.session(&id).await.map(|s| s.title == "hello").unwrap_or(false) }
    })
    .await;
}

#[tokio::test]
async fn blank_text_is_a_no_op() {
    let backend = Scripted::new(vec![]);
    let (svc, _) = service(backend.clone());
    let before = active(&svc).await;

    let outcome = svc.send_message(&before.id, "  \n\t ").await;
    assert_eq!(outcome, SendOutcome::Rejected(RejectReason::EmptyText));
    assert_eq!(svc.session(&before.id).await.unwrap(), before);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn missing_configuration_makes_no_request() {
    let backend = Scripted::unconfigured();
    let (svc, _) = service(backend.clone());
    let before = active(&svc).await;

    let outcome = svc.send_message(&before.id, "hello").await;
    assert_eq!(outcome, SendOutcome::ConfigurationMissing);
    assert_eq!(svc.session(&before.id).await.unwrap(), before);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn continuity_token_only_advances() {
    let backend = Scripted::new(vec![
        text(vec!["a"], Some("T1")),
        text(vec!["b"], None),
        text(vec!["c"], Some("")),
    ]);
    let (svc, _) = service(backend.clone());
    let id = active(&svc).await.id;

    svc.send_message(&id, "first").await;
    assert_eq!(svc.session(&id).await.unwrap().continuity_token, "T1");
    svc.send_message(&id, "second").await;
    assert_eq!(svc.session(&id).await.unwrap().continuity_token, "T1");
    svc.send_message(&id, "third").await;
    assert_eq!(svc.session(&id).await.unwrap().continuity_token, "T1");

    let requests = backend.requests();
    assert_eq!(requests[0].continuity_token, "");
    assert_eq!(requests[1].continuity_token, "T1");
    assert_eq!(requests[2].continuity_token, "T1");
}

#[tokio::test]
async fn backend_error_replaces_placeholder_with_error_message() {
    let (svc, _) = service(Scripted::new(vec![Reply::Fail]));
    let id = active(&svc).await.id;

    let outcome = svc.send_message(&id, "hello").await;
    let SendOutcome::Failed { message_id, error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("500"));

    let s = svc.session(&id).await.unwrap();
    assert_eq!(s.messages.len(), 2);
    assert_eq!(s.messages[0].text, "hello");
    let err = &s.messages[1];
    assert_eq!(err.id, message_id);
    assert!(err.is_error);
    assert!(err.text.starts_with("错误: "));
    assert_eq!(s.streaming_count(), 0);
    assert!(!svc.is_sending(&id).await);
}

#[tokio::test]
async fn mid_stream_error_leaves_no_streaming_message() {
    let (svc, _) = service(Scripted::new(vec![Reply::FailMidStream("par")]));
    let id = active(&svc).await.id;

    let outcome = svc.send_message(&id, "hello").await;
    assert!(matches!(outcome, SendOutcome::Failed { .. }));

    let s = svc.session(&id).await.unwrap();
    assert_eq!(s.messages.len(), 2);
    assert!(s.messages[1].is_error);
    assert_eq!(s.streaming_count(), 0);
}

#[tokio::test]
async fn history_excludes_errors_and_greeting() {
    let backend = Scripted::new(vec![text(vec!["ok"], None), Reply::Fail, text(vec!["fine"], None)]);
    let (svc, _) = service(backend.clone());
    let id = active(&svc).await.id;

    svc.send_message(&id, "first").await;
    svc.send_message(&id, "second").await;
    svc.send_message(&id, "third").await;

    let requests = backend.requests();
    let history: Vec<(Role, &str)> = requests[2]
        .history
        .iter()
        .map(|t| (t.role, t.text.as_str()))
        .collect();
    assert_eq!(
        history,
        vec![
            (Role::User, "first"),
            (Role::Assistant, "ok"),
            (Role::User, "second"),
        ]
    );
}

#[tokio::test]
async fn fragments_are_applied_in_arrival_order() {
    let (svc, _) = service(Scripted::new(vec![text(vec!["a", "b", "c"], None)]));
    let id = active(&svc).await.id;
    let mut events = svc.subscribe();

    svc.send_message(&id, "go").await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ChatEvent::Fragment { text, .. } = event {
            seen.push(text);
        }
    }
    assert_eq!(seen, vec!["a", "b", "c"]);
    assert_eq!(svc.session(&id).await.unwrap().messages[1].text, "abc");
}

#[tokio::test]
async fn second_send_while_sending_is_rejected_and_stop_keeps_partial_text() {
    let (svc, _) = service(Scripted::new(vec![Reply::Hang("partial")]));
    let id = active(&svc).await.id;

    let task = {
        let svc = svc.clone();
        let id = id.clone();
        tokio::spawn(async move { svc.send_message(&id, "long question").await })
    };

    let (watcher, watch_id) = (svc.clone(), id.clone());
    eventually(move || {
        let svc = watcher.clone();
        let id = watch_id.clone();
        async move {
            svc.session(&id)
                .await
                .map(|s| s.messages.last().map(|m| m.text == "partial").unwrap_or(false))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(svc.is_sending(&id).await);

    let during = svc.session(&id).await.unwrap();
    assert_eq!(during.streaming_count(), 1);
    let outcome = svc.send_message(&id, "again").await;
    assert_eq!(outcome, SendOutcome::Rejected(RejectReason::AlreadySending));
    assert_eq!(svc.session(&id).await.unwrap().messages.len(), during.messages.len());

    assert!(svc.stop_generation(&id).await);
    let outcome = task.await.unwrap();
    let SendOutcome::Cancelled { message_id } = outcome else {
        panic!("expected cancellation, got {:?}", outcome);
    };

    let s = svc.session(&id).await.unwrap();
    let reply = s.message(&message_id).unwrap();
    assert_eq!(reply.text, "partial");
    assert!(!reply.is_streaming);
    assert!(reply.ended_at.is_some());
    assert_eq!(s.streaming_count(), 0);
    assert!(!svc.is_sending(&id).await);
}

#[tokio::test]
async fn stop_is_unsupported_for_blocking_backends() {
    let (svc, _) = service(Scripted::blocking(vec![]));
    let id = active(&svc).await.id;
    assert!(!svc.stop_generation(&id).await);
}

#[tokio::test]
async fn regenerate_last_reply_reuses_user_text() {
    let backend = Scripted::new(vec![text(vec!["one"], None), text(vec!["two"], None)]);
    let (svc, _) = service(backend.clone());
    let id = active(&svc).await.id;

    svc.send_message(&id, "question").await;
    let reply_id = svc.session(&id).await.unwrap().messages[1].id.clone();

    let outcome = svc.regenerate(&id, &reply_id).await;
    assert!(matches!(outcome, SendOutcome::Completed { .. }));

    let s = svc.session(&id).await.unwrap();
    let texts: Vec<(Role, &str)> = s.messages.iter().map(|m| (m.role, m.text.as_str())).collect();
    assert_eq!(texts, vec![(Role::User, "question"), (Role::Assistant, "two")]);
    assert!(s.message(&reply_id).is_none());

    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].text, "question");
    assert!(requests[1].history.is_empty());
}

#[tokio::test]
async fn regenerate_after_error_retries_the_turn() {
    let (svc, _) = service(Scripted::new(vec![Reply::Fail, text(vec!["recovered"], None)]));
    let id = active(&svc).await.id;

    svc.send_message(&id, "question").await;
    let error_id = svc.session(&id).await.unwrap().messages[1].id.clone();
    let outcome = svc.regenerate(&id, &error_id).await;
    assert!(matches!(outcome, SendOutcome::Completed { .. }));

    let s = svc.session(&id).await.unwrap();
    assert_eq!(s.messages.len(), 2);
    assert_eq!(s.messages[1].text, "recovered");
    assert!(!s.messages.iter().any(|m| m.is_error));
}

#[tokio::test]
async fn regenerate_without_preceding_user_message_is_a_no_op() {
    let backend = Scripted::new(vec![text(vec!["a1"], None), text(vec!["a2"], None)]);
    let (svc, _) = service(backend.clone());
    let id = active(&svc).await.id;

    svc.send_message(&id, "u1").await;
    svc.send_message(&id, "u2").await;
    let before = svc.session(&id).await.unwrap();

    // u2 follows an assistant reply
    let outcome = svc.regenerate(&id, &before.messages[2].id).await;
    assert_eq!(outcome, SendOutcome::Rejected(RejectReason::NotRegenerable));
    // first message has nothing before it
    let outcome = svc.regenerate(&id, &before.messages[0].id).await;
    assert_eq!(outcome, SendOutcome::Rejected(RejectReason::NotRegenerable));
    let outcome = svc.regenerate(&id, "missing").await;
    assert_eq!(outcome, SendOutcome::Rejected(RejectReason::NotRegenerable));

    assert_eq!(svc.session(&id).await.unwrap().messages, before.messages);
    assert_eq!(backend.requests().len(), 2);
}

#[tokio::test]
async fn sessions_are_persisted_after_each_turn() {
    let (svc, store) = service(Scripted::new(vec![text(vec!["saved"], Some("T9"))]));
    let id = active(&svc).await.id;
    svc.send_message(&id, "persist me").await;

    let stored: Vec<Session> = store::load(store.as_ref(), KEY_SESSIONS).unwrap();
    let current = svc.sessions().await;
    assert_eq!(stored.len(), current.len());
    assert_eq!(stored[0].messages, current[0].messages);
    assert_eq!(stored[0].continuity_token, "T9");

    let reloaded = ChatService::new(store.clone(), Scripted::new(vec![]), TitleGenerator::default(), "user-1");
    let again = reloaded.session(&id).await.unwrap();
    assert_eq!(again.messages, current[0].messages);
    assert_eq!(reloaded.active_session_id().await.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn corrupt_session_store_starts_fresh() {
    let store = Arc::new(MemoryStore::new());
    store.save_raw(KEY_SESSIONS, "{{{").unwrap();
    let svc = ChatService::new(store, Scripted::new(vec![]), TitleGenerator::default(), "u");
    let sessions = svc.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].is_home_view());
}

#[tokio::test]
async fn new_sessions_go_first_and_inherit_agent() {
    let (svc, _) = service(Scripted::new(vec![]));
    let first = active(&svc).await;
    assert!(svc.set_session_agent(&first.id, "other-model").await);

    let created = svc.create_session(None).await;
    let sessions = svc.sessions().await;
    assert_eq!(sessions[0].id, created.id);
    assert_eq!(created.agent_ref, "other-model");
    assert_eq!(svc.active_session_id().await.as_deref(), Some(created.id.as_str()));
}

#[tokio::test]
async fn deleting_last_session_creates_a_fresh_one() {
    let (svc, _) = service(Scripted::new(vec![]));
    let only = active(&svc).await;

    assert!(svc.delete_session(&only.id).await);
    let sessions = svc.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_ne!(sessions[0].id, only.id);
    assert!(sessions[0].is_home_view());
    assert_eq!(svc.active_session_id().await.as_deref(), Some(sessions[0].id.as_str()));
    assert!(!svc.delete_session("missing").await);
}

#[tokio::test]
async fn deleting_active_session_activates_next() {
    let (svc, _) = service(Scripted::new(vec![]));
    let older = active(&svc).await;
    let newer = svc.create_session(None).await;

    assert!(svc.delete_session(&newer.id).await);
    assert_eq!(svc.active_session_id().await.as_deref(), Some(older.id.as_str()));
}

#[tokio::test]
async fn rename_rejects_blank_titles() {
    let (svc, _) = service(Scripted::new(vec![]));
    let id = active(&svc).await.id;
    assert!(!svc.rename_session(&id, "   ").await);
    assert!(svc.rename_session(&id, " Trip ").await);
    assert_eq!(svc.session(&id).await.unwrap().title, "Trip");
}

#[tokio::test]
async fn fragments_reach_placeholder_after_list_changes() {
    let (tx, rx) = mpsc::unbounded_channel();
    let (svc, _) = service(Scripted::new(vec![Reply::Fed(rx)]));
    let id = active(&svc).await.id;

    let task = {
        let svc = svc.clone();
        let id = id.clone();
        tokio::spawn(async move { svc.send_message(&id, "question").await })
    };
    tx.send("first ".to_string()).unwrap();
    let (watcher, watch_id) = (svc.clone(), id.clone());
    eventually(move || {
        let svc = watcher.clone();
        let id = watch_id.clone();
        async move {
            svc.session(&id)
                .await
                .and_then(|s| s.messages.last().map(|m| m.text == "first "))
                .unwrap_or(false)
        }
    })
    .await;

    // a new session at the front shifts every position; the streaming session is edited too
    let other = svc.create_session(Some("other-model")).await;
    assert!(svc.rename_session(&id, "Renamed").await);
    assert!(svc.set_session_agent(&id, "second-model").await);
    tx.send("second".to_string()).unwrap();
    drop(tx);

    let outcome = task.await.unwrap();
    let SendOutcome::Completed { message_id } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    let s = svc.session(&id).await.unwrap();
    let reply = s.message(&message_id).unwrap();
    assert_eq!(reply.text, "first second");
    assert!(!reply.is_streaming);
    assert_eq!(s.messages.len(), 2);
    assert_eq!(s.title, "Renamed");
    assert_eq!(s.agent_ref, "second-model");

    let sessions = svc.sessions().await;
    assert_eq!(sessions[0].id, other.id);
    assert_eq!(sessions[1].id, id);
    assert!(sessions[0].is_home_view());
}

#[tokio::test]
async fn rename_during_title_generation_is_kept() {
    let titles = TitleGenerator::Summarize {
        summarizer: Arc::new(SlowSummary(Duration::from_millis(200))),
        fallback: DEFAULT_TITLE.to_string(),
    };
    let (svc, store) = service_with_titles(Scripted::new(vec![]), titles);
    let renamed = active(&svc).await.id;

    svc.send_message(&renamed, "hello").await;
    assert!(svc.rename_session(&renamed, "My Name").await);

    let untouched = svc.create_session(None).await.id;
    svc.send_message(&untouched, "hello again").await;

    let (watcher, watch_id) = (svc.clone(), untouched.clone());
    eventually(move || {
        let svc = watcher.clone();
        let id = watch_id.clone();
        async move { svc.session(&id).await.map(|s| s.title == "Generated").unwrap_or(false) }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(svc.session(&renamed).await.unwrap().title, "My Name");
    let stored: Vec<Session> = store::load(store.as_ref(), KEY_SESSIONS).unwrap();
    let on_disk = stored.iter().find(|s| s.id == renamed).unwrap();
    assert_eq!(on_disk.title, "My Name");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_turns_leave_disk_matching_memory() {
    let dir = tempfile::tempdir().unwrap();
    let file_store = Arc::new(FileStore::new(dir.path()));
    let replies = (0..4)
        .map(|_| text(vec!["a", "b", "c", "d", "e", "f", "g", "h"], Some("T")))
        .collect();
    let svc = Arc::new(ChatService::new(
        file_store.clone(),
        Scripted::new(replies),
        TitleGenerator::default(),
        "user-1",
    ));

    let mut ids = vec![active(&svc).await.id];
    for _ in 0..3 {
        ids.push(svc.create_session(None).await.id);
    }
    let tasks: Vec<_> = ids
        .iter()
        .map(|id| {
            let svc = svc.clone();
            let id = id.clone();
            tokio::spawn(async move { svc.send_message(&id, "parallel").await })
        })
        .collect();
    for task in tasks {
        assert!(matches!(task.await.unwrap(), SendOutcome::Completed { .. }));
    }

    let (watcher, watch_store) = (svc.clone(), file_store.clone());
    eventually(move || {
        let svc = watcher.clone();
        let store = watch_store.clone();
        async move {
            let memory = svc.sessions().await;
            let titled = memory.iter().all(|s| s.title == "parallel");
            let disk: Option<Vec<Session>> = store::load(store.as_ref(), KEY_SESSIONS);
            titled && disk.as_ref() == Some(&memory)
        }
    })
    .await;

    let entries = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(entries, 1);
    assert!(file_store.load_raw(KEY_SESSIONS).unwrap().is_some());
}
