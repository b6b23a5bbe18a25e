//! Session state coordinator: the single writer of both tier projections.
//!
//! Writes land in the fast tier only. [`SessionCoordinator::commit_flush`] moves
//! a session's pending messages into the durable tier and then clears the fast
//! tier; the durable write always happens first, so a crash between the two
//! steps leaves messages duplicated (and de-duplicated on the next flush by the
//! high-water mark) rather than lost.

use std::sync::Arc;

use super::clock::Clock;
use super::keys;
use super::locks::SessionLocks;
use super::policy::PendingState;
use super::types::{FastTierRecord, FlushOutcome, Message, Role, SessionError, SessionResult};
use crate::storage::{
    DurableBatch, DurableOp, DurableRecord, DurableStore, FastStore, Pipeline, SessionSummary,
};

pub struct SessionCoordinator {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
}

fn parse_int(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
}

impl SessionCoordinator {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fast,
            durable,
            clock,
            locks: SessionLocks::new(),
        }
    }

    pub fn fast_store(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    pub fn durable_store(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Read and decode the fast-tier record without taking the session lock.
    async fn load_fast_record(&self, session_id: &str) -> SessionResult<Option<FastTierRecord>> {
        let Some(raw) = self.fast.get(&keys::record(session_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SessionError::Decode {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Current fast-tier record, if any.
    pub async fn fast_record(&self, session_id: &str) -> SessionResult<Option<FastTierRecord>> {
        let _guard = self.locks.acquire(session_id).await;
        self.load_fast_record(session_id).await
    }

    /// Current durable document, if any.
    pub async fn durable_record(&self, session_id: &str) -> SessionResult<Option<DurableRecord>> {
        Ok(self.durable.get(session_id).await?)
    }

    /// Append a message to the session's fast-tier record.
    ///
    /// The assigned timestamp is the current second, bumped forward if needed so
    /// it is strictly greater than every timestamp this session has already
    /// written or flushed.
    pub async fn add_message(
        &self,
        session_id: &str,
        user_id: &str,
        pdf_id: &str,
        role: Role,
        content: &str,
    ) -> SessionResult<Message> {
        let _guard = self.locks.acquire(session_id).await;

        let mut record = self
            .load_fast_record(session_id)
            .await?
            .unwrap_or_else(|| FastTierRecord::new(user_id, pdf_id));
        let flushed_mark = parse_int(
            self.fast
                .get(&keys::last_flush(session_id))
                .await?
                .as_deref(),
        );

        let now = self.clock.now_secs();
        let floor = record
            .last_timestamp()
            .into_iter()
            .chain(flushed_mark)
            .max()
            .map(|ts| ts.saturating_add(1));
        let timestamp = floor.map_or(now, |floor| now.max(floor));

        let message = Message {
            role,
            content: content.to_string(),
            timestamp,
            pdf_id: pdf_id.to_string(),
        };
        record.pdf_id = pdf_id.to_string();
        record.chat_history.push(message.clone());

        let payload = serde_json::to_string(&record).map_err(|e| SessionError::Decode {
            session_id: session_id.to_string(),
            reason: format!("encode failed: {e}"),
        })?;

        self.fast
            .execute(
                Pipeline::new()
                    .set(keys::record(session_id), payload)
                    .incr(keys::count(session_id))
                    .set(keys::last_activity(session_id), now.to_string())
                    .sadd(keys::ACTIVE_SESSIONS, session_id),
            )
            .await?;

        tracing::debug!(
            session_id,
            role = %role,
            timestamp,
            pending = record.chat_history.len(),
            "Message appended to fast tier"
        );
        Ok(message)
    }

    /// Full history: durable messages followed by fast-tier messages newer than
    /// the durable high-water mark.
    pub async fn get_history(&self, session_id: &str) -> SessionResult<Vec<Message>> {
        let _guard = self.locks.acquire(session_id).await;

        let durable = self.durable.get(session_id).await?;
        let high_water = durable.as_ref().map_or(0, DurableRecord::high_water_mark);
        let mut history = durable.map(|d| d.chat_history).unwrap_or_default();

        if let Some(fast) = self.load_fast_record(session_id).await? {
            history.extend(
                fast.chat_history
                    .into_iter()
                    .filter(|m| m.timestamp > high_water),
            );
        }
        Ok(history)
    }

    /// Create the durable document with an empty history. A document that
    /// already exists is kept as it is.
    pub async fn create_session(
        &self,
        session_id: &str,
        user_id: &str,
        pdf_id: &str,
        title: &str,
    ) -> SessionResult<()> {
        let now = self.clock.now();
        let record = DurableRecord {
            user_id: user_id.to_string(),
            latest_pdf_id: pdf_id.to_string(),
            title: Some(title.to_string()),
            chat_history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let mut batch = DurableBatch::new();
        batch.push(DurableOp::CreateIfAbsent {
            id: session_id.to_string(),
            record,
        });
        self.durable.commit(batch).await?;
        tracing::info!(session_id, user_id, "Session created");
        Ok(())
    }

    /// Set the durable document's title. Not retried here.
    pub async fn update_session_title(&self, session_id: &str, title: &str) -> SessionResult<()> {
        self.durable
            .update_title(session_id, title, self.clock.now())
            .await
            .map_err(|source| SessionError::TitleUpdateFailed {
                session_id: session_id.to_string(),
                source,
            })
    }

    /// Remove every trace of a session from both tiers.
    pub async fn clear_session(&self, session_id: &str) -> SessionResult<()> {
        let _guard = self.locks.acquire(session_id).await;

        self.fast
            .execute(
                Pipeline::new()
                    .delete(keys::all(session_id))
                    .srem(keys::ACTIVE_SESSIONS, session_id),
            )
            .await?;
        self.durable.delete(session_id).await?;
        tracing::info!(session_id, "Session cleared");
        Ok(())
    }

    /// Session ids with unflushed fast-tier state.
    pub async fn active_sessions(&self) -> SessionResult<Vec<String>> {
        Ok(self.fast.smembers(keys::ACTIVE_SESSIONS).await?)
    }

    pub async fn list_sessions(&self, user_id: &str) -> SessionResult<Vec<SessionSummary>> {
        Ok(self.durable.list_for_user(user_id).await?)
    }

    /// Bookkeeping snapshot fed to the flush policy.
    ///
    /// The pending count comes from the counter key, falling back to the fast
    /// record's history length when the counter is missing or malformed.
    pub async fn pending_state(&self, session_id: &str) -> SessionResult<PendingState> {
        let values = self
            .fast
            .mget(&[keys::count(session_id), keys::last_activity(session_id)])
            .await?;
        let count = parse_int(values.first().and_then(|v| v.as_deref()));
        let last_activity = parse_int(values.get(1).and_then(|v| v.as_deref()));

        let pending_messages = match count {
            Some(n) => u64::try_from(n).unwrap_or(0),
            None => self
                .load_fast_record(session_id)
                .await?
                .map_or(0, |r| r.chat_history.len() as u64),
        };
        let durable_exists = self.durable.get(session_id).await?.is_some();

        Ok(PendingState {
            durable_exists,
            pending_messages,
            last_activity,
        })
    }

    /// Commit pending fast-tier messages to the durable tier, then clear the
    /// fast tier.
    ///
    /// Safe to repeat: a second call finds no fast record and only clears
    /// bookkeeping. On any error the fast tier is left untouched and the
    /// session stays active.
    pub async fn commit_flush(&self, session_id: &str) -> SessionResult<FlushOutcome> {
        let _guard = self.locks.acquire(session_id).await;

        let Some(fast) = self.load_fast_record(session_id).await? else {
            self.fast
                .execute(
                    Pipeline::new()
                        .delete([keys::count(session_id), keys::last_activity(session_id)])
                        .srem(keys::ACTIVE_SESSIONS, session_id),
                )
                .await?;
            return Ok(FlushOutcome::Empty);
        };

        let now = self.clock.now();
        let durable = self.durable.get(session_id).await?;
        let mut batch = DurableBatch::new();

        let (outcome, high_water) = match &durable {
            None => {
                // A document created after the read above keeps its title.
                let written = fast.chat_history.len();
                batch.push(DurableOp::CreateIfAbsent {
                    id: session_id.to_string(),
                    record: DurableRecord {
                        user_id: fast.user_id.clone(),
                        latest_pdf_id: fast.pdf_id.clone(),
                        title: None,
                        chat_history: Vec::new(),
                        created_at: now,
                        updated_at: now,
                    },
                });
                if written > 0 {
                    batch.push(DurableOp::AppendHistory {
                        id: session_id.to_string(),
                        messages: fast.chat_history.clone(),
                        updated_at: now,
                    });
                }
                (FlushOutcome::Created { messages: written }, 0)
            }
            Some(doc) => {
                let high_water = doc.high_water_mark();
                let fresh: Vec<Message> = fast
                    .chat_history
                    .iter()
                    .filter(|m| m.timestamp > high_water)
                    .cloned()
                    .collect();
                let written = fresh.len();
                if !fresh.is_empty() {
                    batch.push(DurableOp::AppendHistory {
                        id: session_id.to_string(),
                        messages: fresh,
                        updated_at: now,
                    });
                }
                if doc.latest_pdf_id != fast.pdf_id {
                    batch.push(DurableOp::SetLatestPdf {
                        id: session_id.to_string(),
                        pdf_id: fast.pdf_id.clone(),
                    });
                }
                let outcome = if written == 0 {
                    FlushOutcome::Unchanged
                } else {
                    FlushOutcome::Appended { messages: written }
                };
                (outcome, high_water)
            }
        };

        if !batch.is_empty() {
            self.durable.commit(batch).await?;
        }

        let flushed_mark = fast
            .last_timestamp()
            .unwrap_or(0)
            .max(high_water)
            .max(now.timestamp());

        self.fast
            .execute(
                Pipeline::new()
                    .delete([
                        keys::record(session_id),
                        keys::count(session_id),
                        keys::last_activity(session_id),
                    ])
                    .srem(keys::ACTIVE_SESSIONS, session_id)
                    .set(keys::last_flush(session_id), flushed_mark.to_string()),
            )
            .await?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::clock::ManualClock;
    use crate::storage::{InMemoryDurableStore, InMemoryFastStore};

    const T0: i64 = 1_700_000_000;

    struct Harness {
        fast: Arc<InMemoryFastStore>,
        durable: Arc<InMemoryDurableStore>,
        clock: Arc<ManualClock>,
        coordinator: SessionCoordinator,
    }

    fn harness() -> Harness {
        let fast = Arc::new(InMemoryFastStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let coordinator = SessionCoordinator::new(fast.clone(), durable.clone(), clock.clone());
        Harness {
            fast,
            durable,
            clock,
            coordinator,
        }
    }

    fn msg(ts: i64) -> Message {
        Message {
            role: Role::Human,
            content: format!("m{ts}"),
            timestamp: ts,
            pdf_id: "pdf-1".into(),
        }
    }

    fn durable_with(history: Vec<Message>) -> DurableRecord {
        let now = chrono::Utc::now();
        DurableRecord {
            user_id: "user-1".into(),
            latest_pdf_id: "pdf-1".into(),
            title: Some("New Chat".into()),
            chat_history: history,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn appended_messages_read_back_in_order() {
        let h = harness();
        let c = &h.coordinator;
        c.add_message("s1", "user-1", "pdf-1", Role::Human, "a").await.unwrap();
        h.clock.advance(1);
        c.add_message("s1", "user-1", "pdf-1", Role::Ai, "b").await.unwrap();
        h.clock.advance(1);
        c.add_message("s1", "user-1", "pdf-1", Role::Human, "c").await.unwrap();

        let contents: Vec<_> = c
            .get_history("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn same_second_appends_get_distinct_timestamps() {
        let h = harness();
        let c = &h.coordinator;
        let a = c.add_message("s1", "u", "p", Role::Human, "a").await.unwrap();
        let b = c.add_message("s1", "u", "p", Role::Ai, "b").await.unwrap();
        let d = c.add_message("s1", "u", "p", Role::Human, "c").await.unwrap();
        assert_eq!(a.timestamp, T0);
        assert_eq!(b.timestamp, T0 + 1);
        assert_eq!(d.timestamp, T0 + 2);
    }

    #[tokio::test]
    async fn add_message_sets_bookkeeping() {
        let h = harness();
        h.coordinator
            .add_message("s1", "user-1", "pdf-1", Role::Human, "hi")
            .await
            .unwrap();
        h.coordinator
            .add_message("s1", "user-1", "pdf-2", Role::Human, "again")
            .await
            .unwrap();

        assert_eq!(h.fast.get("session_count:s1").await.unwrap().as_deref(), Some("2"));
        assert_eq!(
            h.fast.get("session_last_activity:s1").await.unwrap(),
            Some(T0.to_string())
        );
        assert_eq!(h.fast.smembers("active_sessions").await.unwrap(), vec!["s1"]);

        let record = h.coordinator.fast_record("s1").await.unwrap().unwrap();
        assert_eq!(record.pdf_id, "pdf-2");
        assert_eq!(record.chat_history.len(), 2);
    }

    #[tokio::test]
    async fn merge_drops_fast_messages_at_or_below_high_water() {
        let h = harness();
        h.durable
            .put("s1", &durable_with(vec![msg(1), msg(2), msg(3)]))
            .await
            .unwrap();
        let fast = FastTierRecord {
            user_id: "user-1".into(),
            pdf_id: "pdf-1".into(),
            chat_history: vec![msg(3), msg(4), msg(5)],
        };
        h.fast
            .set("session:s1", &serde_json::to_string(&fast).unwrap())
            .await
            .unwrap();

        let stamps: Vec<_> = h
            .coordinator
            .get_history("s1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(stamps, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn unknown_session_has_empty_history() {
        let h = harness();
        assert!(h.coordinator.get_history("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_creates_document_then_second_flush_is_noop() {
        let h = harness();
        let c = &h.coordinator;
        c.add_message("s1", "user-1", "pdf-1", Role::Human, "q").await.unwrap();
        c.add_message("s1", "user-1", "pdf-1", Role::Ai, "a").await.unwrap();

        let first = c.commit_flush("s1").await.unwrap();
        assert_eq!(first, FlushOutcome::Created { messages: 2 });
        let after_first = h.durable.get("s1").await.unwrap().unwrap();

        let second = c.commit_flush("s1").await.unwrap();
        assert_eq!(second, FlushOutcome::Empty);
        let after_second = h.durable.get("s1").await.unwrap().unwrap();
        assert_eq!(after_first, after_second);

        assert!(h.fast.get("session:s1").await.unwrap().is_none());
        assert!(h.fast.get("session_count:s1").await.unwrap().is_none());
        assert!(h.fast.smembers("active_sessions").await.unwrap().is_empty());
        assert_eq!(
            h.fast.get("session_last_flush:s1").await.unwrap(),
            Some((T0 + 1).to_string())
        );
    }

    #[tokio::test]
    async fn flush_appends_only_new_messages_and_updates_pdf() {
        let h = harness();
        let c = &h.coordinator;
        c.create_session("s1", "user-1", "pdf-1", "New Chat").await.unwrap();
        c.add_message("s1", "user-1", "pdf-1", Role::Human, "one").await.unwrap();
        assert_eq!(
            c.commit_flush("s1").await.unwrap(),
            FlushOutcome::Appended { messages: 1 }
        );

        c.add_message("s1", "user-1", "pdf-2", Role::Human, "two").await.unwrap();
        assert_eq!(
            c.commit_flush("s1").await.unwrap(),
            FlushOutcome::Appended { messages: 1 }
        );

        let doc = h.durable.get("s1").await.unwrap().unwrap();
        assert_eq!(doc.chat_history.len(), 2);
        assert_eq!(doc.latest_pdf_id, "pdf-2");
        assert_eq!(doc.title.as_deref(), Some("New Chat"));
        assert!(doc.chat_history[0].timestamp < doc.chat_history[1].timestamp);
    }

    #[tokio::test]
    async fn message_after_flush_in_same_second_survives_merge() {
        let h = harness();
        let c = &h.coordinator;
        c.add_message("s1", "u", "p", Role::Human, "before").await.unwrap();
        c.commit_flush("s1").await.unwrap();
        let later = c.add_message("s1", "u", "p", Role::Ai, "after").await.unwrap();
        assert!(later.timestamp > T0);

        let contents: Vec<_> = c
            .get_history("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["before", "after"]);
    }

    #[tokio::test]
    async fn durable_failure_leaves_fast_tier_intact() {
        let h = harness();
        let c = &h.coordinator;
        c.add_message("s1", "u", "p", Role::Human, "q").await.unwrap();

        h.durable.set_offline(true);
        assert!(matches!(
            c.commit_flush("s1").await,
            Err(SessionError::StorageUnavailable(_))
        ));
        assert!(h.fast.get("session:s1").await.unwrap().is_some());
        assert_eq!(h.fast.smembers("active_sessions").await.unwrap(), vec!["s1"]);

        h.durable.set_offline(false);
        assert_eq!(
            c.commit_flush("s1").await.unwrap(),
            FlushOutcome::Created { messages: 1 }
        );
    }

    #[tokio::test]
    async fn corrupt_fast_payload_is_a_decode_error() {
        let h = harness();
        h.fast.set("session:s1", "{not json").await.unwrap();
        h.fast
            .execute(Pipeline::new().sadd("active_sessions", "s1"))
            .await
            .unwrap();

        assert!(matches!(
            h.coordinator.commit_flush("s1").await,
            Err(SessionError::Decode { .. })
        ));
        assert_eq!(h.fast.smembers("active_sessions").await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn fast_outage_surfaces_as_storage_unavailable() {
        let h = harness();
        h.fast.set_offline(true);
        let result = h
            .coordinator
            .add_message("s1", "u", "p", Role::Human, "q")
            .await;
        assert!(matches!(result, Err(SessionError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn title_update_on_missing_session_fails() {
        let h = harness();
        assert!(matches!(
            h.coordinator.update_session_title("ghost", "Title").await,
            Err(SessionError::TitleUpdateFailed { .. })
        ));

        h.coordinator
            .create_session("s1", "u", "p", "New Chat")
            .await
            .unwrap();
        h.coordinator
            .update_session_title("s1", "Budget review")
            .await
            .unwrap();
        let doc = h.durable.get("s1").await.unwrap().unwrap();
        assert_eq!(doc.title.as_deref(), Some("Budget review"));
    }

    #[tokio::test]
    async fn clear_session_removes_both_tiers() {
        let h = harness();
        let c = &h.coordinator;
        c.create_session("s1", "u", "p", "New Chat").await.unwrap();
        c.add_message("s1", "u", "p", Role::Human, "q").await.unwrap();
        c.commit_flush("s1").await.unwrap();
        c.add_message("s1", "u", "p", Role::Human, "again").await.unwrap();

        c.clear_session("s1").await.unwrap();

        assert!(c.get_history("s1").await.unwrap().is_empty());
        assert!(h.durable.get("s1").await.unwrap().is_none());
        assert!(h.fast.scan_prefix("session").await.unwrap().is_empty());
        assert!(c.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_state_falls_back_to_history_length() {
        let h = harness();
        let c = &h.coordinator;
        c.add_message("s1", "u", "p", Role::Human, "q").await.unwrap();
        c.add_message("s1", "u", "p", Role::Ai, "a").await.unwrap();
        h.fast.set("session_count:s1", "garbage").await.unwrap();

        let state = c.pending_state("s1").await.unwrap();
        assert_eq!(state.pending_messages, 2);
        assert!(!state.durable_exists);
        assert_eq!(state.last_activity, Some(T0));
    }

    /// Reports the document as missing on the first read, then creates it with
    /// a title, as a concurrent session bootstrap would.
    struct CreatedAfterRead {
        inner: Arc<InMemoryDurableStore>,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl DurableStore for CreatedAfterRead {
        async fn get(&self, id: &str) -> crate::storage::StoreResult<Option<DurableRecord>> {
            let current = self.inner.get(id).await?;
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let mut titled = durable_with(Vec::new());
                titled.title = Some("Budget Review".into());
                self.inner.put(id, &titled).await?;
            }
            Ok(current)
        }

        async fn put(&self, id: &str, record: &DurableRecord) -> crate::storage::StoreResult<()> {
            self.inner.put(id, record).await
        }

        async fn update_title(
            &self,
            id: &str,
            title: &str,
            at: chrono::DateTime<chrono::Utc>,
        ) -> crate::storage::StoreResult<()> {
            self.inner.update_title(id, title, at).await
        }

        async fn delete(&self, id: &str) -> crate::storage::StoreResult<()> {
            self.inner.delete(id).await
        }

        async fn commit(&self, batch: DurableBatch) -> crate::storage::StoreResult<()> {
            self.inner.commit(batch).await
        }

        async fn list_for_user(&self, user_id: &str) -> crate::storage::StoreResult<Vec<SessionSummary>> {
            self.inner.list_for_user(user_id).await
        }

        fn name(&self) -> &str {
            "created_after_read"
        }
    }

    #[tokio::test]
    async fn flush_keeps_title_written_after_its_read() {
        let inner = Arc::new(InMemoryDurableStore::new());
        let c = SessionCoordinator::new(
            Arc::new(InMemoryFastStore::new()),
            Arc::new(CreatedAfterRead {
                inner: inner.clone(),
                raced: std::sync::atomic::AtomicBool::new(false),
            }),
            Arc::new(ManualClock::new(T0)),
        );
        c.add_message("s1", "user-1", "pdf-1", Role::Human, "q").await.unwrap();

        assert_eq!(
            c.commit_flush("s1").await.unwrap(),
            FlushOutcome::Created { messages: 1 }
        );
        let doc = inner.get("s1").await.unwrap().unwrap();
        assert_eq!(doc.title.as_deref(), Some("Budget Review"));
        assert_eq!(doc.chat_history.len(), 1);
        assert_eq!(doc.chat_history[0].content, "q");
    }

    #[tokio::test]
    async fn create_session_does_not_reset_existing_history() {
        let h = harness();
        let c = &h.coordinator;
        c.add_message("s1", "user-1", "pdf-1", Role::Human, "q").await.unwrap();
        c.commit_flush("s1").await.unwrap();

        c.create_session("s1", "user-1", "pdf-1", "New Chat").await.unwrap();
        let doc = h.durable.get("s1").await.unwrap().unwrap();
        assert_eq!(doc.chat_history.len(), 1);
        assert!(doc.title.is_none());
    }

    fn shared() -> (Arc<InMemoryDurableStore>, Arc<SessionCoordinator>) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(InMemoryFastStore::new()),
            durable.clone(),
            Arc::new(ManualClock::new(T0)),
        ));
        (durable, coordinator)
    }

    fn assert_each_once(history: &[Message], expected: usize) {
        assert_eq!(history.len(), expected);
        assert!(history.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
        let mut contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        contents.sort_unstable();
        contents.dedup();
        assert_eq!(contents.len(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_lose_nothing() {
        const WRITERS: usize = 32;
        let (_durable, c) = shared();

        let mut handles = Vec::with_capacity(WRITERS);
        for i in 0..WRITERS {
            let c = Arc::clone(&c);
            handles.push(tokio::spawn(async move {
                c.add_message("s1", "u", "p", Role::Human, &format!("msg-{i}"))
                    .await
                    .unwrap()
            }));
        }
        let mut stamps = Vec::with_capacity(WRITERS);
        for handle in handles {
            stamps.push(handle.await.unwrap().timestamp);
        }
        stamps.sort_unstable();
        stamps.dedup();
        assert_eq!(stamps.len(), WRITERS);

        let history = c.get_history("s1").await.unwrap();
        assert_each_once(&history, WRITERS);
        let pending = c.fast_store().get("session_count:s1").await.unwrap();
        assert_eq!(pending, Some(WRITERS.to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn appends_racing_flushes_are_neither_lost_nor_duplicated() {
        const WRITERS: usize = 24;
        let (durable, c) = shared();

        let flusher = {
            let c = Arc::clone(&c);
            tokio::spawn(async move {
                for _ in 0..WRITERS {
                    c.commit_flush("s1").await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut handles = Vec::with_capacity(WRITERS);
        for i in 0..WRITERS {
            let c = Arc::clone(&c);
            handles.push(tokio::spawn(async move {
                c.add_message("s1", "u", "p", Role::Human, &format!("msg-{i}"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        flusher.await.unwrap();

        assert_each_once(&c.get_history("s1").await.unwrap(), WRITERS);

        c.commit_flush("s1").await.unwrap();
        assert!(c.fast_record("s1").await.unwrap().is_none());
        let doc = durable.get("s1").await.unwrap().unwrap();
        assert_each_once(&doc.chat_history, WRITERS);
        assert_each_once(&c.get_history("s1").await.unwrap(), WRITERS);
    }
}
