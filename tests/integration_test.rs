/// End-to-end tests driving the memory service with the in-memory
/// collaborators.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recall_config::Config;
use recall_core::{AbortOutcome, MemoryHandle, MemoryNotice, MemoryService, SessionView};
use recall_model::{
    InMemoryHistory, MessageRecord, ModelSelection, Part, RecordingControl, Role, Session, SessionStatus,
    TransportEvent,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn session(id: &str) -> Session {
    let now = Utc::now();
    Session {
        id: id.into(),
        directory: "/work/project".into(),
        title: format!("session {id}"),
        shared: false,
        created_at: now,
        updated_at: now,
    }
}

fn config(max_sessions: usize) -> Config {
    let mut config = Config::default();
    config.memory.max_sessions = max_sessions;
    config.memory.cooldown_ms = 20;
    config.history.backoff_ms = 1;
    config
}

fn transcript(n: u64) -> Vec<MessageRecord> {
    (1..=n)
        .map(|i| {
            if i % 2 == 1 {
                MessageRecord::user(format!("m{i:03}"), i, format!("question {i}"))
            } else {
                MessageRecord::assistant(format!("m{i:03}"), i, format!("answer {i}"))
            }
        })
        .collect()
}

fn start(
    config: Config,
    history: Arc<InMemoryHistory>,
    control: Arc<RecordingControl>,
) -> MemoryHandle {
    let (service, handle) = MemoryService::new(&config, history, control);
    tokio::spawn(service.run());
    handle
}

async fn select_and_wait(handle: &MemoryHandle, id: &str) -> SessionView {
    handle.select_session(id).await.unwrap();
    timeout(WAIT, async {
        loop {
            if let Some(view) = handle.view(id).await.unwrap() {
                if view.history_loading.is_none() {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("history load timed out")
}

async fn next_matching<F>(notices: &mut broadcast::Receiver<MemoryNotice>, mut pred: F) -> MemoryNotice
where
    F: FnMut(&MemoryNotice) -> bool,
{
    timeout(WAIT, async {
        loop {
            match notices.recv().await {
                Ok(n) if pred(&n) => return n,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("notice channel closed"),
            }
        }
    })
    .await
    .expect("notice did not arrive")
}

fn part(session: &str, message: &str, order: u64, text: &str) -> TransportEvent {
    TransportEvent::MessagePart {
        session_id: session.into(),
        message_id: message.into(),
        role: Role::Assistant,
        order,
        part: Part::text(format!("{message}-p0"), text),
    }
}

fn status(session: &str, status: SessionStatus) -> TransportEvent {
    TransportEvent::StatusChange {
        session_id: session.into(),
        status,
    }
}

// ── Pause ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pause_survives_eviction_and_resumes_without_history_fetch() {
    let history = Arc::new(InMemoryHistory::new());
    history.insert("s1", transcript(6));
    history.insert("s2", transcript(3));
    let control = Arc::new(RecordingControl::new());
    let handle = start(config(1), history.clone(), control.clone());
    handle.upsert_session(session("s1")).await.unwrap();
    handle.upsert_session(session("s2")).await.unwrap();

    select_and_wait(&handle, "s1").await;
    let selection = ModelSelection {
        provider: Some("anthropic".into()),
        model: Some("claude-sonnet".into()),
        agent: Some("build".into()),
    };
    let paused = handle.pause("s1", selection.clone()).await.unwrap();
    assert_eq!(paused.last_user_message_id.as_deref(), Some("m005"));

    // Selecting s2 with max_sessions = 1 evicts s1.
    select_and_wait(&handle, "s2").await;
    let s1 = handle.view("s1").await.unwrap().unwrap();
    assert!(s1.messages.is_empty(), "s1 must have been evicted");
    let fetches = history.calls();

    let resumed = handle.resume("s1").await.unwrap();
    assert_eq!(resumed.selection, selection);
    assert_eq!(resumed.last_user_text.as_deref(), Some("question 5"));
    assert_eq!(history.calls(), fetches, "resume must not fetch history");
    assert_eq!(control.count("resume"), 1);
    assert_eq!(handle.stats().await.unwrap().paused, 0);
}

// ── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_status_settles_stream_after_cooldown() {
    let handle = start(config(5), Arc::new(InMemoryHistory::new()), Arc::new(RecordingControl::new()));
    let mut notices = handle.subscribe();
    handle.upsert_session(session("s1")).await.unwrap();

    handle.deliver(status("s1", SessionStatus::Busy)).await.unwrap();
    handle.deliver(part("s1", "a1", 2, "Hel")).await.unwrap();
    handle.deliver(part("s1", "a1", 2, "Hello")).await.unwrap();
    handle.deliver(status("s1", SessionStatus::Idle)).await.unwrap();

    let settled = next_matching(&mut notices, |n| matches!(n, MemoryNotice::StreamSettled { .. })).await;
    assert_eq!(
        settled,
        MemoryNotice::StreamSettled {
            session_id: "s1".into(),
            message_id: "a1".into(),
        }
    );
    let view = handle.view("s1").await.unwrap().unwrap();
    assert!(!view.is_streaming);
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].text(), "Hello");
}

// ── Eviction ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hot_set_stays_bounded_across_selections() {
    let history = Arc::new(InMemoryHistory::new());
    for id in ["a", "b", "c", "d"] {
        history.insert(id, transcript(4));
    }
    let handle = start(config(2), history, Arc::new(RecordingControl::new()));
    let mut notices = handle.subscribe();
    for id in ["a", "b", "c", "d"] {
        handle.upsert_session(session(id)).await.unwrap();
        select_and_wait(&handle, id).await;
        let stats = handle.stats().await.unwrap();
        assert!(stats.hot_sessions <= 2, "hot set grew to {}", stats.hot_sessions);
    }
    let evicted = next_matching(&mut notices, |n| matches!(n, MemoryNotice::SessionEvicted { .. })).await;
    assert_eq!(
        evicted,
        MemoryNotice::SessionEvicted {
            session_id: "a".into()
        }
    );
    assert_eq!(handle.view("d").await.unwrap().unwrap().messages.len(), 4);

    let by_dir = handle.sessions_by_directory("/work/project").await.unwrap();
    assert_eq!(by_dir.len(), 4);
}

// ── Abort ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_press_abort_fires_once_and_drops_late_parts() {
    let control = Arc::new(RecordingControl::new());
    let handle = start(config(5), Arc::new(InMemoryHistory::new()), control.clone());
    handle.upsert_session(session("s1")).await.unwrap();
    handle.deliver(status("s1", SessionStatus::Busy)).await.unwrap();
    handle.deliver(part("s1", "a1", 2, "working")).await.unwrap();

    handle
        .arm_abort_prompt("s1", Some(Duration::from_millis(5000)))
        .await
        .unwrap();
    assert_eq!(handle.request_abort("s1").await.unwrap(), AbortOutcome::Aborted);
    assert_eq!(control.count("abort"), 1);
    assert!(handle.acknowledge_abort("s1").await.unwrap());

    // Late delivery for the aborted turn is discarded.
    handle.deliver(part("s1", "a1", 2, "working on it")).await.unwrap();
    let view = handle.view("s1").await.unwrap().unwrap();
    assert_eq!(view.messages[0].text(), "working");
    assert!(!view.is_streaming);

    // The prompt was consumed; the next press arms again.
    assert!(matches!(
        handle.request_abort("s1").await.unwrap(),
        AbortOutcome::Armed { .. }
    ));
    assert_eq!(control.count("abort"), 1);
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn removed_session_is_forgotten() {
    let handle = start(config(5), Arc::new(InMemoryHistory::new()), Arc::new(RecordingControl::new()));
    handle.upsert_session(session("s1")).await.unwrap();
    handle.deliver(part("s1", "a1", 1, "hi")).await.unwrap();
    let removed = handle.remove_session("s1").await.unwrap();
    assert_eq!(removed.id, "s1");
    assert!(handle.view("s1").await.unwrap().is_none());
    assert!(handle.select_session("s1").await.is_err());
}
