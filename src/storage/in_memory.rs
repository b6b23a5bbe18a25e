//! In-memory implementations of both storage tiers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use super::traits::{
    DurableBatch, DurableOp, DurableRecord, DurableStore, FastOp, FastStore, Pipeline,
    SessionSummary, StoreError, StoreResult,
};

#[derive(Default)]
struct FastState {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// A fast tier backed by mutex-protected maps. Pipelines run under a single
/// lock acquisition, so they are atomic with respect to every other call.
pub struct InMemoryFastStore {
    state: Mutex<FastState>,
    offline: AtomicBool,
}

impl InMemoryFastStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FastState::default()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate the store becoming unreachable (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("fast store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_counter(key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>().map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("not an integer: {e}"),
    })
}

/// Reject the pipeline if any `Incr` would hit a non-integer value, looking at
/// live state and at the writes queued ahead of it. Only `Incr` can fail, so a
/// pipeline that passes here applies in place without partial effects.
fn check_incr_targets(state: &FastState, ops: &[FastOp]) -> StoreResult<()> {
    // Key -> value the pipeline will have written by this point (None = deleted).
    let mut staged: HashMap<&str, Option<&str>> = HashMap::new();
    for op in ops {
        match op {
            FastOp::Set { key, value } => {
                staged.insert(key, Some(value.as_str()));
            }
            FastOp::Delete { keys } => {
                for key in keys {
                    staged.insert(key, None);
                }
            }
            FastOp::Incr { key } => {
                let current = match staged.get(key.as_str()) {
                    Some(value) => *value,
                    None => state.strings.get(key).map(String::as_str),
                };
                if let Some(raw) = current {
                    parse_counter(key, raw)?;
                }
                // An integer from here on.
                staged.insert(key, Some("0"));
            }
            FastOp::SetAdd { .. } | FastOp::SetRemove { .. } => {}
        }
    }
    Ok(())
}

fn apply_fast_op(state: &mut FastState, op: &FastOp) -> StoreResult<()> {
    match op {
        FastOp::Set { key, value } => {
            state.strings.insert(key.clone(), value.clone());
        }
        FastOp::Incr { key } => {
            let current = match state.strings.get(key) {
                Some(raw) => parse_counter(key, raw)?,
                None => 0,
            };
            state.strings.insert(key.clone(), (current + 1).to_string());
        }
        FastOp::Delete { keys } => {
            for key in keys {
                state.strings.remove(key);
                state.sets.remove(key);
                state.lists.remove(key);
            }
        }
        FastOp::SetAdd { set, member } => {
            state
                .sets
                .entry(set.clone())
                .or_default()
                .insert(member.clone());
        }
        FastOp::SetRemove { set, member } => {
            if let Some(members) = state.sets.get_mut(set) {
                members.remove(member);
                if members.is_empty() {
                    state.sets.remove(set);
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        Ok(self.state.lock().strings.get(key).cloned())
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.check_online()?;
        let state = self.state.lock();
        Ok(keys.iter().map(|k| state.strings.get(k).cloned()).collect())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_online()?;
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        self.check_online()?;
        let mut state = self.state.lock();
        let mut removed = 0;
        for key in keys {
            let existed = state.strings.remove(key).is_some()
                | state.sets.remove(key).is_some()
                | state.lists.remove(key).is_some();
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn smembers(&self, set: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        Ok(self
            .state
            .lock()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn lpush(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.check_online()?;
        let mut state = self.state.lock();
        let entries = state.lists.entry(list.to_string()).or_default();
        entries.push_front(value.to_string());
        Ok(entries.len())
    }

    async fn rpop(&self, list: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let mut state = self.state.lock();
        let popped = state.lists.get_mut(list).and_then(VecDeque::pop_back);
        if state.lists.get(list).is_some_and(VecDeque::is_empty) {
            state.lists.remove(list);
        }
        Ok(popped)
    }

    async fn execute(&self, pipeline: Pipeline) -> StoreResult<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        check_incr_targets(&state, pipeline.ops())?;
        for op in pipeline.ops() {
            apply_fast_op(&mut state, op)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Durable tier kept in process memory. Used for tests and for running the
/// server without a database file.
pub struct InMemoryDurableStore {
    documents: Mutex<HashMap<String, DurableRecord>>,
    offline: AtomicBool,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("durable store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_durable_op(docs: &mut HashMap<String, DurableRecord>, op: DurableOp) -> StoreResult<()> {
    match op {
        DurableOp::Put { id, record } => {
            docs.insert(id, record);
        }
        DurableOp::CreateIfAbsent { id, record } => {
            docs.entry(id).or_insert(record);
        }
        DurableOp::AppendHistory {
            id,
            messages,
            updated_at,
        } => {
            let doc = docs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            for message in messages {
                if !doc.chat_history.contains(&message) {
                    doc.chat_history.push(message);
                }
            }
            doc.updated_at = updated_at;
        }
        DurableOp::SetLatestPdf { id, pdf_id } => {
            let doc = docs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            doc.latest_pdf_id = pdf_id;
        }
    }
    Ok(())
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, id: &str) -> StoreResult<Option<DurableRecord>> {
        self.check_online()?;
        Ok(self.documents.lock().get(id).cloned())
    }

    async fn put(&self, id: &str, record: &DurableRecord) -> StoreResult<()> {
        self.check_online()?;
        self.documents
            .lock()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn update_title(&self, id: &str, title: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_online()?;
        let mut docs = self.documents.lock();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        doc.title = Some(title.to_string());
        doc.updated_at = at;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.check_online()?;
        self.documents.lock().remove(id);
        Ok(())
    }

    async fn commit(&self, batch: DurableBatch) -> StoreResult<()> {
        self.check_online()?;
        let mut docs = self.documents.lock();
        let mut scratch = docs.clone();
        for op in batch.into_ops() {
            apply_durable_op(&mut scratch, op)?;
        }
        *docs = scratch;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>> {
        self.check_online()?;
        let docs = self.documents.lock();
        let mut results: Vec<SessionSummary> = docs
            .iter()
            .filter(|(_, doc)| doc.user_id == user_id)
            .map(|(id, doc)| SessionSummary {
                chat_session_id: id.clone(),
                title: doc.title.clone(),
                latest_pdf_id: doc.latest_pdf_id.clone(),
                message_count: doc.chat_history.len(),
                updated_at: doc.updated_at,
            })
            .collect();
        results.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(results)
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
