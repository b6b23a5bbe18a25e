//! Fast-tier key layout.

/// Set of session ids with unflushed fast-tier state.
pub const ACTIVE_SESSIONS: &str = "active_sessions";

/// List of pending PDF ingestion tasks.
pub const PDF_INGESTION_QUEUE: &str = "pdf_ingestion_queue";

pub const LAST_FLUSH_PREFIX: &str = "session_last_flush:";

pub fn record(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn count(session_id: &str) -> String {
    format!("session_count:{session_id}")
}

pub fn last_activity(session_id: &str) -> String {
    format!("session_last_activity:{session_id}")
}

pub fn last_flush(session_id: &str) -> String {
    format!("{LAST_FLUSH_PREFIX}{session_id}")
}

/// Every key a session may own in the fast tier, including the last-flush mark.
pub fn all(session_id: &str) -> Vec<String> {
    vec![
        record(session_id),
        count(session_id),
        last_activity(session_id),
        last_flush(session_id),
    ]
}
