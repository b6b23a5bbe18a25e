//! Fixed-window per-client request limiting.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::AppState;

const WINDOW: Duration = Duration::from_secs(60);

/// Counts requests per client key in one-minute windows.
///
/// The table holds at most `max_keys` clients. When a new client arrives at a
/// full table, expired windows are dropped first and then the oldest window.
pub struct RateLimiter {
    limit_per_minute: u32,
    max_keys: usize,
    windows: Mutex<HashMap<String, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32, max_keys: usize) -> Self {
        Self {
            limit_per_minute,
            max_keys: max_keys.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `key`. `Err` carries the seconds until the
    /// client's window resets.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), u64> {
        if self.limit_per_minute == 0 {
            return Ok(());
        }
        let mut windows = self.windows.lock();

        if !windows.contains_key(key) && windows.len() >= self.max_keys {
            windows.retain(|_, (_, start)| now.duration_since(*start) < WINDOW);
            if windows.len() >= self.max_keys {
                let oldest = windows
                    .iter()
                    .min_by_key(|(_, (_, start))| *start)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    windows.remove(&oldest);
                }
            }
        }

        let entry = windows.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= WINDOW {
            *entry = (0, now);
        }
        entry.0 += 1;

        if entry.0 > self.limit_per_minute {
            let elapsed = now.duration_since(entry.1).as_secs();
            return Err(WINDOW.as_secs().saturating_sub(elapsed).max(1));
        }
        Ok(())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Client identity for limiting: the first forwarded address when forwarded
/// headers are trusted, otherwise the socket peer.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            });
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
    }
    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(request.headers(), peer, state.trust_forwarded_headers);

    match state.limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(client = %key, retry_after, "Rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.to_string())],
                Json(serde_json::json!({
                    "error": format!("Rate limit exceeded. Retry after {retry_after} seconds")
                })),
            )
                .into_response()
        }
    }
}
