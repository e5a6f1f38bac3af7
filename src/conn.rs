//! `ConnState` — the per-connection state object (spec.md §3, §4.1).

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::Mutex;

use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Headers captured at handshake completion: name → list of values, to
/// mirror HTTP's repeatable-header semantics (spec.md §3).
pub type Headers = HashMap<String, Vec<String>>;

/// The per-connection mutable state object. One instance per accepted TCP
/// connection, created in `OnOpen` and destroyed when the connection
/// closes (spec.md §4.1).
pub struct ConnState {
    /// Stable opaque id, assigned once, immutable.
    id: String,
    remote_addr: SocketAddr,
    /// Write half of the split WebSocket stream. `None` until the
    /// handshake completes. An async `Mutex` (not a `std::sync::Mutex`)
    /// because `send`/`close` hold the guard across the sink's own
    /// `.await` — a `std::sync::MutexGuard` held over an await point
    /// would make the enclosing future `!Send`, which `tokio::spawn`
    /// (every worker-pool task) requires.
    sink: Mutex<Option<WsSink>>,
    upgraded: AtomicBool,
    last_active: AtomicI64,
    headers: RwLock<Option<Arc<Headers>>>,
    attrs: RwLock<Option<HashMap<String, Box<dyn Any + Send + Sync>>>>,
    /// Per-connection error counter used by the protocol engine (spec.md
    /// §9: "a dedicated atomic u32 on ConnState is cleaner than a generic
    /// map").
    error_count: AtomicU32,
    /// Guards `on_close` to fire exactly once (spec.md §3/§8: "onClose(c,
    /// _) is invoked exactly once"), no matter which of the client-Close
    /// path, the idle-eviction sweeper, or the reactor's unconditional
    /// cleanup observes the connection ending first.
    closed: AtomicBool,
    /// Resolves when the server starts draining (spec.md §5 `Stop(ctx)`).
    shutdown: tokio::sync::watch::Receiver<bool>,
    started_at: Instant,
}

impl ConnState {
    pub fn new(remote_addr: SocketAddr, shutdown: tokio::sync::watch::Receiver<bool>) -> Arc<Self> {
        let now = monotonic_seconds();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            sink: Mutex::new(None),
            upgraded: AtomicBool::new(false),
            last_active: AtomicI64::new(now),
            headers: RwLock::new(None),
            attrs: RwLock::new(None),
            error_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            shutdown,
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Install the write half once the handshake has produced one. Called
    /// once, immediately after construction, before any other task can
    /// have observed this `ConnState` — `try_lock` cannot contend.
    pub(crate) fn install_sink(&self, sink: WsSink) {
        *self.sink.try_lock().expect("sink mutex unexpectedly contended at install") = Some(sink);
    }

    /// Write a single frame to the peer. Fire-and-forget with respect to
    /// other concurrent writers — spec.md §5 is explicit that the
    /// reference design provides no write lock by default. Callers that
    /// need to serialize a multi-frame write against other writers
    /// should take [`ConnState::write_guard`] first.
    pub async fn send(&self, msg: WsMessage) -> Result<(), crate::error::RippleError> {
        use futures_util::SinkExt;
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink
                .send(msg)
                .await
                .map_err(|e| crate::error::RippleError::Transport(std::io::Error::other(e))),
            None => Err(crate::error::RippleError::Transport(std::io::Error::other(
                "write before upgrade",
            ))),
        }
    }

    pub async fn close(&self) {
        use futures_util::SinkExt;
        let mut guard = self.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            let _ = sink.close().await;
        }
    }

    /// Opt-in write serialization (spec.md §5 documents no default write
    /// lock; this supplements it the way the original's `SafeConn`
    /// wrapper does, as an opt-in rather than a default). Holding the
    /// returned guard across multiple `send`-equivalent writes blocks
    /// `send`/`close` from any other caller until it's dropped; write it
    /// through directly via `SinkExt` on the guard's deref target.
    pub async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, Option<WsSink>> {
        self.sink.lock().await
    }

    /// `true` once the handshake has completed (spec.md §4.1 invariant:
    /// "No handler-level write occurs on a connection with upgraded=false").
    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_upgraded(&self, headers: Headers) {
        *self.headers.write().expect("headers lock poisoned") = Some(Arc::new(headers));
        self.upgraded.store(true, Ordering::Release);
        self.keep_alive();
    }

    pub fn headers(&self) -> Option<Arc<Headers>> {
        self.headers.read().expect("headers lock poisoned").clone()
    }

    /// Stamp `last_active` with the current monotonic second. Never
    /// decreases a previous value (spec.md invariant).
    pub fn keep_alive(&self) {
        let now = monotonic_seconds();
        // Fetch-max keeps the monotonic-non-decreasing guarantee even if
        // two callers race (e.g. KeepAlive from a handshake and from the
        // dispatcher in close succession).
        self.last_active.fetch_max(now, Ordering::AcqRel);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Acquire)
    }

    /// Concurrent-safe keyed attribute set (spec.md §4.1 `Set`).
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut guard = self.attrs.write().expect("attrs lock poisoned");
        guard.get_or_insert_with(HashMap::new).insert(key.into(), Box::new(value));
    }

    /// Typed fetch with a found/cast boolean folded into `Option` (spec.md
    /// §4.1 `TypedGet<T>`).
    pub fn get_typed<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        let guard = self.attrs.read().expect("attrs lock poisoned");
        guard.as_ref()?.get(key)?.downcast_ref::<T>().cloned()
    }

    pub fn remove(&self, key: &str) {
        if let Some(map) = self.attrs.write().expect("attrs lock poisoned").as_mut() {
            map.remove(key);
        }
    }

    /// Per-connection error counter used by [`crate::engine::ProtocolEngine`].
    /// Returns the count *after* incrementing.
    pub(crate) fn bump_error_count(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Claims the right to fire `on_close` for this connection. The first
    /// caller (client-Close arm, idle-eviction sweeper, or the reactor's
    /// unconditional post-loop cleanup — whichever observes the ending
    /// connection first) gets `true` and must invoke `on_close`; every
    /// other caller gets `false` and must not (spec.md §3/§8: "onClose(c,
    /// _) is invoked exactly once").
    pub(crate) fn claim_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// A cancellation-propagating scope tied to the server's lifetime
    /// (spec.md §3 `ctx`). Resolves once the server starts draining.
    pub fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

fn monotonic_seconds() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Arc<ConnState> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        ConnState::new("127.0.0.1:0".parse().unwrap(), rx)
    }

    #[test]
    fn attrs_roundtrip() {
        let conn = test_conn();
        assert_eq!(conn.get_typed::<u32>("errCount"), None);
        conn.set("errCount", 1u32);
        assert_eq!(conn.get_typed::<u32>("errCount"), Some(1));
    }

    #[test]
    fn last_active_monotonic_under_races() {
        let conn = test_conn();
        let before = conn.last_active();
        conn.keep_alive();
        assert!(conn.last_active() >= before);
    }

    #[test]
    fn not_upgraded_by_default() {
        let conn = test_conn();
        assert!(!conn.is_upgraded());
    }

    #[test]
    fn ids_are_unique() {
        let a = test_conn();
        let b = test_conn();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn claim_close_only_grants_the_first_caller() {
        let conn = test_conn();
        assert!(conn.claim_close());
        assert!(!conn.claim_close());
        assert!(!conn.claim_close());
    }
}
