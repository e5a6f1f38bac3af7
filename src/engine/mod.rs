//! `ProtocolEngine<T, K>` — tag-routed, middleware-chained dispatch on
//! top of the raw reactor (spec.md §4.8).
//!
//! Generic over the decoded value `T` and its routing key `K`, the way
//! spec.md §9 asks for in a language with real generics ("the engine is
//! parametric in the decoded value type and its comparable key").

pub mod codec;
pub mod proto;
pub mod request;

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;

pub use codec::{Codec, JsonCodec, XmlCodec};
pub use proto::{InstancePool, Proto};
pub use request::Request;

use crate::config::EngineConfig;
use crate::conn::ConnState;
use crate::logger::{Level, Logger};
use crate::reactor::{Packet, PacketHandler};

/// Handlers borrow the request rather than own it, so the engine can
/// reclaim the pooled instance after the call returns — or panics
/// (spec.md §4.8 step 3's "deferred destroy" runs regardless of panic).
pub type HandlerFn<T> = Arc<
    dyn for<'a> Fn(&'a mut Request<T>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> + Send + Sync,
>;
pub type BrokerFn<T> = Arc<
    dyn for<'a> Fn(&'a Request<T>) -> Pin<Box<dyn Future<Output = Result<(), crate::error::RippleError>> + Send + 'a>>
        + Send
        + Sync,
>;
/// Receives `(key, req, panic payload)` (spec.md §4.8
/// `RegisterRecovery(fn(key, req, panicVal))`). Invoked with the request
/// still intact — before the deferred destroy reclaims its pooled
/// instance — so a recovery hook can inspect the connection, opcode, and
/// decoded value that panicked.
pub type RecoveryFn<T, K> = Arc<dyn Fn(K, &Request<T>, Box<dyn std::any::Any + Send>) + Send + Sync>;
pub type DestroyFn<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

const BUILDING: u8 = 0;
const RUNNING: u8 = 1;

/// Generic tag→handler protocol engine (spec.md §4.8).
pub struct ProtocolEngine<T, K>
where
    T: Proto<K> + Default + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    handlers: RwLock<HashMap<K, HandlerFn<T>>>,
    brokers: RwLock<Vec<BrokerFn<T>>>,
    codec: RwLock<Arc<dyn Codec<T>>>,
    recovery: RwLock<Option<RecoveryFn<T, K>>>,
    destroy: RwLock<Option<DestroyFn<T>>>,
    pool: InstancePool<T>,
    config: Arc<EngineConfig>,
    logger: Arc<dyn Logger>,
    state: AtomicU8,
}

impl<T, K> ProtocolEngine<T, K>
where
    T: Proto<K> + Default + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(config: Arc<EngineConfig>, logger: Arc<dyn Logger>) -> Arc<Self>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            brokers: RwLock::new(Vec::new()),
            codec: RwLock::new(Arc::new(JsonCodec::<T>::new())),
            recovery: RwLock::new(None),
            destroy: RwLock::new(None),
            pool: InstancePool::new(),
            config,
            logger,
            state: AtomicU8::new(BUILDING),
        })
    }

    fn assert_building(&self, op: &str) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            BUILDING,
            "ProtocolEngine::{op} called after use_handler() froze the engine"
        );
    }

    /// Register a handler for `key` (spec.md §4.8 `Register`).
    /// Overwrite-on-duplicate, as spec.md permits.
    pub fn register(&self, key: K, handler: HandlerFn<T>) {
        self.assert_building("register");
        self.handlers.write().expect("handlers lock poisoned").insert(key, handler);
    }

    /// Append middleware, run in registration order (spec.md §4.8
    /// `UseBrokers`).
    pub fn use_brokers(&self, brokers: impl IntoIterator<Item = BrokerFn<T>>) {
        self.assert_building("use_brokers");
        self.brokers.write().expect("brokers lock poisoned").extend(brokers);
    }

    pub fn register_codec(&self, codec: Arc<dyn Codec<T>>) {
        self.assert_building("register_codec");
        *self.codec.write().expect("codec lock poisoned") = codec;
    }

    pub fn register_recovery(&self, f: RecoveryFn<T, K>) {
        self.assert_building("register_recovery");
        *self.recovery.write().expect("recovery lock poisoned") = Some(f);
    }

    pub fn register_destroy_proto(&self, f: DestroyFn<T>) {
        self.assert_building("register_destroy_proto");
        *self.destroy.write().expect("destroy lock poisoned") = Some(f);
    }

    /// Freeze the engine and return the boxed [`Packet`] handler closure
    /// to pass to [`crate::server::ServerBuilder::with_handler`] (spec.md
    /// §4.8 `UseHandler`).
    pub fn use_handler(self: Arc<Self>) -> PacketHandler {
        self.state
            .compare_exchange(BUILDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .expect("use_handler() called more than once");
        let engine = self;
        Arc::new(move |packet: Packet| {
            let engine = Arc::clone(&engine);
            Box::pin(async move { engine.dispatch(packet).await })
        })
    }

    /// spec.md §4.8 dispatch algorithm, steps 1-8.
    async fn dispatch(self: &Arc<Self>, packet: Packet) {
        let Packet { opcode, payload, conn } = packet;

        // 1. payload-size guard
        if self.config.payload_too_large(payload.len()) {
            self.register_error(&conn, "payload too large").await;
            return;
        }

        // 2. allocate from the instance pool
        let mut instance = self.pool.alloc();

        // 4. decode
        let codec = Arc::clone(&*self.codec.read().expect("codec lock poisoned"));
        let decoded = match codec.decode(&payload) {
            Ok(v) => v,
            Err(e) => {
                self.pool.free(instance);
                self.logger.log(Level::Debug, "engine", &format_args!("decode failed: {e}"));
                self.register_error(&conn, "decode failed").await;
                return;
            }
        };
        *instance = decoded;

        // 5. route by key
        let key = instance.key();
        let handler = self.handlers.read().expect("handlers lock poisoned").get(&key).cloned();
        let Some(handler) = handler else {
            self.pool.free(instance);
            self.register_error(&conn, "no handler for key").await;
            return;
        };

        let mut request = Request::new(opcode, Arc::clone(&conn), instance, payload);

        // 7. broker chain
        let brokers = self.brokers.read().expect("brokers lock poisoned").clone();
        for broker in &brokers {
            if let Err(e) = broker(&request).await {
                self.destroy_and_free(request.into_value());
                self.logger.log(Level::Debug, "engine", &format_args!("broker rejected: {e}"));
                self.register_error(&conn, "broker rejected request").await;
                return;
            }
        }

        // 8. invoke handler under a panic boundary. Recovery (if any) runs
        // with the request still intact; the deferred destroy then always
        // runs, whether or not the handler panicked (spec.md §4.8 step 3).
        let result = std::panic::AssertUnwindSafe(handler(&mut request)).catch_unwind().await;

        if let Err(panic_payload) = result {
            self.logger.log(Level::Error, "engine", &"handler panicked");
            let recovery = self.recovery.read().expect("recovery lock poisoned").clone();
            match recovery {
                Some(f) => f(key, &request, panic_payload),
                None => {
                    // spec.md §9: exit-0 fail-fast is "almost certainly a
                    // bug"; default policy is log-and-continue.
                    self.logger.log(
                        Level::Error,
                        "engine",
                        &"no recovery installed — continuing (see EngineConfig panic policy)",
                    );
                }
            }
        }

        self.destroy_and_free(request.into_value());
    }

    fn destroy_and_free(&self, mut instance: Box<T>) {
        if let Some(destroy) = self.destroy.read().expect("destroy lock poisoned").as_ref() {
            destroy(&mut instance);
        }
        self.pool.free(instance);
    }

    /// Error counter policy (spec.md §4.8 "Error counter policy"): first
    /// error is silent, subsequent ones close at `maxErrorCount` with
    /// `GoingAway`/"too many error".
    async fn register_error(&self, conn: &Arc<ConnState>, context: &str) {
        let count = conn.bump_error_count();
        self.logger.log(
            Level::Debug,
            "engine",
            &format_args!("connection {} error #{count}: {context}", conn.id()),
        );
        if count >= self.config.max_error_count() {
            let frame = tokio_tungstenite::tungstenite::Message::Close(Some(
                tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Away,
                    reason: "too many error".into(),
                },
            ));
            let _ = conn.send(frame).await;
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Opcode;
    use crate::logger::TracingLogger;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Ping {
        kind: String,
        n: u32,
    }

    impl Proto<String> for Ping {
        fn key(&self) -> String {
            self.kind.clone()
        }
    }

    fn test_conn() -> Arc<ConnState> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        ConnState::new("127.0.0.1:0".parse().unwrap(), rx)
    }

    fn test_engine(max_payload: u64, max_errors: u32) -> Arc<ProtocolEngine<Ping, String>> {
        let config = Arc::new(EngineConfig::new(max_payload, max_errors));
        ProtocolEngine::new(config, Arc::new(TracingLogger))
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let engine = test_engine(0, 3);
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = Arc::clone(&seen);
        engine.register(
            "ping".to_string(),
            Arc::new(move |req: &mut Request<Ping>| {
                let seen = Arc::clone(&seen2);
                req.n += 1;
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        let handler = Arc::clone(&engine).use_handler();
        let conn = test_conn();
        let payload = serde_json::to_vec(&Ping { kind: "ping".into(), n: 0 }).unwrap();
        handler(Packet { opcode: Opcode::Text, payload, conn: Arc::clone(&conn) }).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(conn.error_count(), 0);
    }

    #[tokio::test]
    async fn unroutable_key_increments_error_count() {
        let engine = test_engine(0, 3);
        engine.register(
            "ping".to_string(),
            Arc::new(|_req: &mut Request<Ping>| Box::pin(async move {})),
        );
        let handler = Arc::clone(&engine).use_handler();
        let conn = test_conn();
        let payload = serde_json::to_vec(&Ping { kind: "unknown".into(), n: 0 }).unwrap();
        handler(Packet { opcode: Opcode::Text, payload, conn: Arc::clone(&conn) }).await;
        assert_eq!(conn.error_count(), 1);
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_before_decode() {
        let engine = test_engine(8, 3);
        engine.register(
            "ping".to_string(),
            Arc::new(|_req: &mut Request<Ping>| Box::pin(async move {})),
        );
        let handler = Arc::clone(&engine).use_handler();
        let conn = test_conn();
        let payload = vec![0u8; 8];
        handler(Packet { opcode: Opcode::Text, payload, conn: Arc::clone(&conn) }).await;
        assert_eq!(conn.error_count(), 1);
    }

    #[tokio::test]
    async fn panic_invokes_recovery_instead_of_propagating() {
        let engine = test_engine(0, 3);
        let recovered = Arc::new(AtomicU32::new(0));
        let recovered2 = Arc::clone(&recovered);
        engine.register(
            "ping".to_string(),
            Arc::new(|_req: &mut Request<Ping>| Box::pin(async move { panic!("boom") })),
        );
        engine.register_recovery(Arc::new(move |_key, req: &Request<Ping>, _payload| {
            assert_eq!(req.kind, "ping");
            recovered2.fetch_add(1, Ordering::SeqCst);
        }));
        let handler = Arc::clone(&engine).use_handler();
        let conn = test_conn();
        let payload = serde_json::to_vec(&Ping { kind: "ping".into(), n: 0 }).unwrap();
        handler(Packet { opcode: Opcode::Text, payload, conn: Arc::clone(&conn) }).await;
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registering_after_use_handler_panics() {
        let engine = test_engine(0, 3);
        let _handler = Arc::clone(&engine).use_handler();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.register(
                "late".to_string(),
                Arc::new(|_req: &mut Request<Ping>| Box::pin(async move {})),
            );
        }));
        assert!(result.is_err());
    }
}
