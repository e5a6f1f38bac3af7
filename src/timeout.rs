//! `TimeoutTable` — a keyed TTL store with an eviction callback, and the
//! background sweeper that drives it (spec.md §4.2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::conn::ConnState;
use crate::logger::{Level, Logger};

struct Entry {
    conn: Arc<ConnState>,
    inserted_at: Instant,
    ttl: Duration,
}

/// Callback invoked once per evicted entry. Spec.md §4.2: "the callback
/// attempts a graceful close frame with status GoingAway, reason
/// 'timeout', then delegates to the onClose user handler."
pub type EvictionHandler = Arc<dyn Fn(Arc<ConnState>) + Send + Sync>;

/// An ordered collection of `(key → ConnState, insertedAt, ttl)` entries
/// with background eviction (spec.md §4.2).
pub struct TimeoutTable {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
    on_evict: EvictionHandler,
    logger: Arc<dyn Logger>,
}

impl TimeoutTable {
    pub fn new(default_ttl: Duration, on_evict: EvictionHandler, logger: Arc<dyn Logger>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            on_evict,
            logger,
        })
    }

    /// Create or refresh an entry, resetting its expiry (spec.md `Touch`).
    pub async fn touch(&self, key: impl Into<String>, conn: Arc<ConnState>) {
        self.touch_with_ttl(key, conn, self.default_ttl).await;
    }

    pub async fn touch_with_ttl(&self, key: impl Into<String>, conn: Arc<ConnState>, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.into(),
            Entry {
                conn,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove without firing eviction (spec.md `Delete`).
    pub async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Advance expiries and emit evictions for anything past its TTL.
    /// Called by the background sweeper, but exposed directly for tests.
    pub async fn sweep_once(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<ConnState>> = {
            let mut entries = self.entries.lock().await;
            let expired_keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.inserted_at) >= e.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            expired_keys
                .into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| e.conn))
                .collect()
        };

        // Evictions run off the lock (so Touch/Delete from other tasks
        // aren't blocked behind a slow close), but serialized against
        // each other: the sweeper is the table's only writer of eviction
        // events, and runs on a single task.
        for conn in expired {
            self.evict(conn).await;
        }
    }

    async fn evict(&self, conn: Arc<ConnState>) {
        self.logger.log(
            Level::Debug,
            "timeout",
            &format_args!("evicting connection {} (idle timeout)", conn.id()),
        );

        let close = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "timeout".into(),
        }));

        // Best-effort: a failing close frame does not retry (spec.md
        // "Failure semantics"). The transport is closed unconditionally
        // either way.
        let _ = conn.send(close).await;
        conn.close().await;

        (self.on_evict)(conn);
    }

    /// Spawn the background sweeper loop on the current runtime. Holding
    /// the returned `JoinHandle` and aborting it is how `Server::stop`
    /// tears the sweeper down.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                table.sweep_once().await;
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::TracingLogger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_conn() -> Arc<ConnState> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        ConnState::new("127.0.0.1:0".parse().unwrap(), rx)
    }

    #[tokio::test]
    async fn touch_then_delete_skips_eviction() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let evicted2 = Arc::clone(&evicted);
        let table = TimeoutTable::new(
            Duration::from_millis(10),
            Arc::new(move |_| {
                evicted2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(TracingLogger),
        );
        table.touch("a", test_conn()).await;
        table.delete("a").await;
        table.sweep_once().await;
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_exactly_once() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let evicted2 = Arc::clone(&evicted);
        let table = TimeoutTable::new(
            Duration::from_millis(5),
            Arc::new(move |_| {
                evicted2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(TracingLogger),
        );
        table.touch("a", test_conn()).await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        table.sweep_once().await;
        table.sweep_once().await;
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }
}
