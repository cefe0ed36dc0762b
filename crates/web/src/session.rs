//! Ephemeral trace sessions
//!
//! A time-bounded key-value store that keeps uploaded trace bytes around
//! long enough for a human to re-view them. Injected as a constructor
//! dependency into the server, never ambient. Expiry is enforced on
//! read and reclaimed by an explicit sweep, driven by a scheduler task
//! outside request handling.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

/// Handle to a stored trace
#[derive(Debug, Clone, Serialize)]
pub struct TraceSession {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a session lookup
pub enum SessionLookup {
    Found(Bytes),
    Expired,
    NotFound,
}

struct SessionEntry {
    bytes: Bytes,
    expires_at: DateTime<Utc>,
}

/// In-memory trace store with per-entry TTL
pub struct TraceSessionStore {
    entries: DashMap<String, SessionEntry>,
    ttl: chrono::Duration,
}

impl TraceSessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    /// Store trace bytes, returning the session handle
    pub fn put(&self, bytes: Vec<u8>) -> TraceSession {
        let id = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.ttl;
        self.entries.insert(
            id.clone(),
            SessionEntry {
                bytes: Bytes::from(bytes),
                expires_at,
            },
        );
        debug!("Stored trace session {} (expires {})", id, expires_at);
        TraceSession { id, expires_at }
    }

    /// Whether a live (non-expired) session exists for this handle
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|e| e.expires_at > Utc::now())
            .unwrap_or(false)
    }

    /// Fetch session bytes. Expiry is enforced here too, so a handle past
    /// its deadline reads as `Expired` even before the next sweep runs.
    pub fn get(&self, id: &str) -> SessionLookup {
        match self.entries.get(id) {
            None => SessionLookup::NotFound,
            Some(entry) if entry.expires_at <= Utc::now() => SessionLookup::Expired,
            Some(entry) => SessionLookup::Found(entry.bytes.clone()),
        }
    }

    /// Fetch a byte range of a session, clamped to the stored length
    pub fn get_range(&self, id: &str, range: Range<usize>) -> SessionLookup {
        match self.get(id) {
            SessionLookup::Found(bytes) => {
                let start = range.start.min(bytes.len());
                let end = range.end.min(bytes.len());
                SessionLookup::Found(bytes.slice(start..end))
            }
            other => other,
        }
    }

    /// Drop every expired entry, returning how many were purged
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before - self.entries.len();
        if purged > 0 {
            info!("Swept {} expired trace session(s)", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run the expiry sweep on a fixed interval until the store is dropped
pub fn spawn_sweeper(
    store: Arc<TraceSessionStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            store.sweep();
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let store = TraceSessionStore::new(60);
        let session = store.put(vec![1, 2, 3, 4]);
        assert!(store.contains(&session.id));
        match store.get(&session.id) {
            SessionLookup::Found(bytes) => assert_eq!(bytes.as_ref(), &[1, 2, 3, 4]),
            _ => panic!("expected Found"),
        }
        assert!(matches!(store.get("no-such-id"), SessionLookup::NotFound));
    }

    #[test]
    fn range_reads_clamp() {
        let store = TraceSessionStore::new(60);
        let session = store.put(vec![0, 1, 2, 3, 4, 5]);
        match store.get_range(&session.id, 2..4) {
            SessionLookup::Found(bytes) => assert_eq!(bytes.as_ref(), &[2, 3]),
            _ => panic!("expected Found"),
        }
        match store.get_range(&session.id, 4..100) {
            SessionLookup::Found(bytes) => assert_eq!(bytes.as_ref(), &[4, 5]),
            _ => panic!("expected Found"),
        }
    }

    #[test]
    fn expiry_is_enforced_on_read_and_sweep() {
        let store = TraceSessionStore::new(0);
        let session = store.put(vec![9]);
        // ttl of zero expires immediately
        assert!(!store.contains(&session.id));
        assert!(matches!(store.get(&session.id), SessionLookup::Expired));
        assert_eq!(store.sweep(), 1);
        assert!(matches!(store.get(&session.id), SessionLookup::NotFound));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sweeper_task_purges() {
        let store = Arc::new(TraceSessionStore::new(0));
        store.put(vec![1]);
        let handle = spawn_sweeper(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
