//! SQLite-backed durable tier.
//!
//! One row per session in `sessions`, one row per message in `messages`. The
//! uniqueness key on `messages` turns a replayed append into a no-op, which is
//! what makes a retried flush safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::traits::{
    DurableBatch, DurableOp, DurableRecord, DurableStore, SessionSummary, StoreError,
    StoreResult,
};
use crate::sessions::types::{Message, Role};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    latest_pdf_id TEXT NOT NULL,
    title         TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, updated_at);

CREATE TABLE IF NOT EXISTS messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    timestamp  INTEGER NOT NULL,
    pdf_id     TEXT NOT NULL,
    UNIQUE(session_id, timestamp, role, content)
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp, seq);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(format!("sqlite: {err}"))
    }
}

/// Durable store over a single SQLite connection. Every call runs on the
/// blocking pool and holds the connection only for the duration of the query.
#[derive(Clone)]
pub struct SqliteDurableStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteDurableStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> StoreResult<Connection> {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Unavailable(format!(
                            "cannot create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
            let conn = Connection::open(&db_path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))??;

        tracing::info!(path = %path.display(), "SQLite durable store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run_blocking<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn parse_time(raw: &str, key: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn session_exists(tx: &Transaction<'_>, id: &str) -> StoreResult<bool> {
    Ok(tx
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", params![id], |_| {
            Ok(())
        })
        .optional()?
        .is_some())
}

fn insert_messages(tx: &Transaction<'_>, id: &str, messages: &[Message]) -> StoreResult<usize> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO messages (session_id, role, content, timestamp, pdf_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut inserted = 0;
    for message in messages {
        inserted += stmt.execute(params![
            id,
            message.role.as_str(),
            message.content,
            message.timestamp,
            message.pdf_id
        ])?;
    }
    Ok(inserted)
}

fn apply_op(tx: &Transaction<'_>, op: DurableOp) -> StoreResult<()> {
    match op {
        DurableOp::Put { id, record } => {
            tx.execute(
                "INSERT INTO sessions (id, user_id, latest_pdf_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    latest_pdf_id = excluded.latest_pdf_id,
                    title = excluded.title,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    record.user_id,
                    record.latest_pdf_id,
                    record.title,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                ],
            )?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
            insert_messages(tx, &id, &record.chat_history)?;
        }
        DurableOp::CreateIfAbsent { id, record } => {
            let created = tx.execute(
                "INSERT INTO sessions (id, user_id, latest_pdf_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    id,
                    record.user_id,
                    record.latest_pdf_id,
                    record.title,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                ],
            )?;
            if created > 0 {
                insert_messages(tx, &id, &record.chat_history)?;
            }
        }
        DurableOp::AppendHistory {
            id,
            messages,
            updated_at,
        } => {
            if !session_exists(tx, &id)? {
                return Err(StoreError::NotFound(id));
            }
            insert_messages(tx, &id, &messages)?;
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![id, updated_at.to_rfc3339()],
            )?;
        }
        DurableOp::SetLatestPdf { id, pdf_id } => {
            let changed = tx.execute(
                "UPDATE sessions SET latest_pdf_id = ?2 WHERE id = ?1",
                params![id, pdf_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
        }
    }
    Ok(())
}

fn load_record(conn: &Connection, id: &str) -> StoreResult<Option<DurableRecord>> {
    let row = conn
        .query_row(
            "SELECT user_id, latest_pdf_id, title, created_at, updated_at
             FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((user_id, latest_pdf_id, title, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT role, content, timestamp, pdf_id FROM messages
         WHERE session_id = ?1 ORDER BY timestamp, seq",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut chat_history = Vec::new();
    for row in rows {
        let (role, content, timestamp, pdf_id) = row?;
        let role = role.parse::<Role>().map_err(|reason| StoreError::Corrupt {
            key: id.to_string(),
            reason,
        })?;
        chat_history.push(Message {
            role,
            content,
            timestamp,
            pdf_id,
        });
    }

    Ok(Some(DurableRecord {
        user_id,
        latest_pdf_id,
        title,
        chat_history,
        created_at: parse_time(&created_at, id)?,
        updated_at: parse_time(&updated_at, id)?,
    }))
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn get(&self, id: &str) -> StoreResult<Option<DurableRecord>> {
        let id = id.to_string();
        self.run_blocking(move |conn| load_record(conn, &id)).await
    }

    async fn put(&self, id: &str, record: &DurableRecord) -> StoreResult<()> {
        let mut batch = DurableBatch::new();
        batch.push(DurableOp::Put {
            id: id.to_string(),
            record: record.clone(),
        });
        self.commit(batch).await
    }

    async fn update_title(&self, id: &str, title: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let id = id.to_string();
        let title = title.to_string();
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, title, at.to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn commit(&self, batch: DurableBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            for op in batch.into_ops() {
                // Dropping `tx` on error rolls the whole batch back.
                apply_op(&tx, op)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>> {
        let user_id = user_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT s.id, s.title, s.latest_pdf_id, s.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
                 FROM sessions s WHERE s.user_id = ?1
                 ORDER BY s.updated_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, title, latest_pdf_id, updated_at, count) = row?;
                let updated_at = parse_time(&updated_at, &id)?;
                summaries.push(SessionSummary {
                    chat_session_id: id,
                    title,
                    latest_pdf_id,
                    message_count: usize::try_from(count).unwrap_or(0),
                    updated_at,
                });
            }
            Ok(summaries)
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn msg(ts: i64, role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
            timestamp: ts,
            pdf_id: "pdf-1".into(),
        }
    }

    fn empty_record() -> DurableRecord {
        let now = Utc::now();
        DurableRecord {
            user_id: "user-1".into(),
            latest_pdf_id: "pdf-1".into(),
            title: Some("New Chat".into()),
            chat_history: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    async fn open_store() -> (TempDir, SqliteDurableStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteDurableStore::open(tmp.path().join("sessions.db"))
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_history_in_order() {
        let (_tmp, store) = open_store().await;
        let mut record = empty_record();
        record.chat_history = vec![
            msg(10, Role::Human, "hello\nthere"),
            msg(11, Role::Ai, "hi"),
        ];
        store.put("s1", &record).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.chat_history, record.chat_history);
        assert_eq!(loaded.title.as_deref(), Some("New Chat"));
        assert_eq!(loaded.high_water_mark(), 11);
    }

    #[tokio::test]
    async fn missing_document_is_none() {
        let (_tmp, store) = open_store().await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replayed_append_does_not_duplicate() {
        let (_tmp, store) = open_store().await;
        store.put("s1", &empty_record()).await.unwrap();

        for _ in 0..2 {
            let mut batch = DurableBatch::new();
            batch.push(DurableOp::AppendHistory {
                id: "s1".into(),
                messages: vec![msg(1, Role::Human, "q"), msg(2, Role::Ai, "a")],
                updated_at: Utc::now(),
            });
            store.commit(batch).await.unwrap();
        }

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.chat_history.len(), 2);
    }

    #[tokio::test]
    async fn create_if_absent_keeps_existing_title() {
        let (_tmp, store) = open_store().await;
        store.put("s1", &empty_record()).await.unwrap();
        store
            .update_title("s1", "Budget Review", Utc::now())
            .await
            .unwrap();

        let mut untitled = empty_record();
        untitled.title = None;
        let mut batch = DurableBatch::new();
        batch.push(DurableOp::CreateIfAbsent {
            id: "s1".into(),
            record: untitled.clone(),
        });
        batch.push(DurableOp::AppendHistory {
            id: "s1".into(),
            messages: vec![msg(1, Role::Human, "q")],
            updated_at: Utc::now(),
        });
        store.commit(batch).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Budget Review"));
        assert_eq!(loaded.chat_history.len(), 1);

        let mut batch = DurableBatch::new();
        batch.push(DurableOp::CreateIfAbsent {
            id: "s2".into(),
            record: untitled,
        });
        store.commit(batch).await.unwrap();
        assert!(store.get("s2").await.unwrap().unwrap().title.is_none());
    }

    #[tokio::test]
    async fn failed_batch_rolls_back() {
        let (_tmp, store) = open_store().await;
        let mut batch = DurableBatch::new();
        batch.push(DurableOp::Put {
            id: "s1".into(),
            record: empty_record(),
        });
        batch.push(DurableOp::AppendHistory {
            id: "ghost".into(),
            messages: vec![msg(1, Role::Human, "q")],
            updated_at: Utc::now(),
        });

        assert!(matches!(
            store.commit(batch).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_latest_pdf_and_title() {
        let (_tmp, store) = open_store().await;
        store.put("s1", &empty_record()).await.unwrap();

        let mut batch = DurableBatch::new();
        batch.push(DurableOp::SetLatestPdf {
            id: "s1".into(),
            pdf_id: "pdf-2".into(),
        });
        store.commit(batch).await.unwrap();
        store
            .update_title("s1", "Quarterly report", Utc::now())
            .await
            .unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.latest_pdf_id, "pdf-2");
        assert_eq!(loaded.title.as_deref(), Some("Quarterly report"));
    }

    #[tokio::test]
    async fn delete_cascades_messages() {
        let (_tmp, store) = open_store().await;
        let mut record = empty_record();
        record.chat_history = vec![msg(1, Role::Human, "q")];
        store.put("s1", &record).await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();

        assert!(store.get("s1").await.unwrap().is_none());
        assert!(store.list_for_user("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopen_preserves_documents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("sessions.db");
        {
            let store = SqliteDurableStore::open(&path).await.unwrap();
            store.put("s1", &empty_record()).await.unwrap();
        }
        let store = SqliteDurableStore::open(&path).await.unwrap();
        let sessions = store.list_for_user("user-1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].chat_session_id, "s1");
    }
}
