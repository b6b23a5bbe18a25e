//! End-to-end write-behind lifecycle: answers land in the fast tier, the
//! flusher moves them to SQLite, and a restarted process reads them back.

use std::sync::Arc;

use versa::chat::{ChatService, ResponseOutcome, SendRequest};
use versa::config::Config;
use versa::infra::{FlushScheduler, PeriodicJob, StaleKeyReaper};
use versa::observability::Metrics;
use versa::providers::{NoopRetriever, ScriptedModel};
use versa::relay::RelayHub;
use versa::sessions::{ManualClock, Role, SessionCoordinator};
use versa::storage::{DurableStore, FastStore, InMemoryFastStore, SqliteDurableStore};

const START: i64 = 1_700_000_000;

struct Process {
    chat: ChatService,
    coordinator: Arc<SessionCoordinator>,
    flusher: FlushScheduler,
    model: Arc<ScriptedModel>,
}

async fn boot(db: &std::path::Path, clock: Arc<ManualClock>, config: &Config) -> Process {
    let durable = Arc::new(SqliteDurableStore::open(db).await.unwrap());
    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::new(InMemoryFastStore::new()),
        durable,
        clock,
    ));
    let metrics = Metrics::new().unwrap();
    let model = Arc::new(ScriptedModel::new(["Answer ", "text"]).with_completion("Quarterly Budget Review"));
    let chat = ChatService::new(
        coordinator.clone(),
        RelayHub::new(),
        model.clone(),
        Arc::new(NoopRetriever),
        config,
    );
    let flusher = FlushScheduler::new(coordinator.clone(), &config.sessions, metrics);
    Process {
        chat,
        coordinator,
        flusher,
        model,
    }
}

fn request(text: &str) -> SendRequest {
    SendRequest {
        session_id: "s-e2e".into(),
        user_id: "u-1".into(),
        pdf_id: "pdf-9".into(),
        message: text.into(),
    }
}

async fn turn(process: &Process, text: &str) {
    let ticket = process.chat.send(request(text)).await.unwrap();
    if let Some(title) = ticket.title {
        title.await.unwrap();
    }
    let outcome = ticket.response.await.unwrap();
    assert!(matches!(outcome, ResponseOutcome::Completed { stored: true, .. }));
}

#[tokio::test]
async fn idle_session_is_flushed_and_survives_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db = tmp.path().join("sessions.db");
    let config = Config::default();
    let clock = Arc::new(ManualClock::new(START));

    let first = boot(&db, clock.clone(), &config).await;
    turn(&first, "What is the budget?").await;

    let durable = first.coordinator.durable_record("s-e2e").await.unwrap().unwrap();
    assert_eq!(durable.title.as_deref(), Some("Quarterly Budget Review"));
    assert!(durable.chat_history.is_empty());
    assert_eq!(first.coordinator.active_sessions().await.unwrap(), vec!["s-e2e"]);

    // Below threshold and not idle yet.
    let report = first.flusher.tick().await.unwrap();
    assert_eq!(report.acted, 0);

    clock.advance(i64::try_from(config.sessions.idle_flush_secs).unwrap() + 1);
    let report = first.flusher.tick().await.unwrap();
    assert_eq!((report.examined, report.acted, report.failed), (1, 1, 0));
    assert!(first.coordinator.active_sessions().await.unwrap().is_empty());
    assert!(first.coordinator.fast_record("s-e2e").await.unwrap().is_none());

    drop(first);

    let second = boot(&db, clock.clone(), &config).await;
    let history = second.coordinator.get_history("s-e2e").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::Human);
    assert_eq!(history[0].content, "What is the budget?");
    assert_eq!(history[1].role, Role::Ai);
    assert_eq!(history[1].content, "Answer text");

    // An existing durable document means no new title is generated.
    clock.advance(5);
    let ticket = second.chat.send(request("And next year?")).await.unwrap();
    assert!(!ticket.new_session);
    assert!(ticket.title.is_none());
    ticket.response.await.unwrap();

    let prompt = second.model.prompts().pop().unwrap();
    let context = &prompt.last().unwrap().content;
    assert!(context.contains("human: What is the budget?"));
    assert!(context.contains("ai: Answer text"));

    // Shutdown drain commits the unflushed turn regardless of policy.
    let report = second.flusher.drain().await.unwrap();
    assert_eq!(report.acted, 1);
    let durable = second.coordinator.durable_record("s-e2e").await.unwrap().unwrap();
    assert_eq!(durable.chat_history.len(), 4);
    assert!(durable
        .chat_history
        .windows(2)
        .all(|pair| pair[0].timestamp < pair[1].timestamp));
}

#[tokio::test]
async fn reaper_clears_flush_marks_after_retention() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db = tmp.path().join("sessions.db");
    let config = Config::default();
    let clock = Arc::new(ManualClock::new(START));
    let process = boot(&db, clock.clone(), &config).await;

    turn(&process, "hello").await;
    process.flusher.drain().await.unwrap();

    let reaper = StaleKeyReaper::new(
        process.coordinator.fast_store().clone(),
        clock.clone(),
        &config.sessions,
        Metrics::new().unwrap(),
    );
    let fast = process.coordinator.fast_store();
    assert!(!fast.scan_prefix("session_last_flush:").await.unwrap().is_empty());

    clock.advance(i64::try_from(config.sessions.last_flush_retention_secs).unwrap() + 1);
    let report = reaper.tick().await.unwrap();
    assert!(report.acted >= 1);
    assert!(fast.scan_prefix("session_last_flush:").await.unwrap().is_empty());

    let store = SqliteDurableStore::open(&db).await.unwrap();
    assert_eq!(store.list_for_user("u-1").await.unwrap().len(), 1);
}
