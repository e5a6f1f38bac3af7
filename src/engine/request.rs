//! `Request<T>` — what a protocol handler sees (spec.md §3).

use std::sync::Arc;
use std::time::Instant;

use crate::conn::ConnState;
use crate::dispatch::Opcode;

/// A fully-decoded inbound message, ready to route by key and hand to a
/// handler. Built by [`super::ProtocolEngine`]'s dispatch pipeline.
///
/// `value` is the pooled instance itself (spec.md §3 `Self()→*T`, the
/// mutable view) rather than a copy — the engine reclaims the `Box` once
/// the handler returns, via `Deref`/`DerefMut` this type exposes.
pub struct Request<T> {
    pub opcode: Opcode,
    pub conn: Arc<ConnState>,
    pub value: Box<T>,
    pub raw: Vec<u8>,
    pub received_at: Instant,
    ctx: tokio::sync::watch::Receiver<bool>,
}

impl<T> Request<T> {
    pub(crate) fn new(opcode: Opcode, conn: Arc<ConnState>, value: Box<T>, raw: Vec<u8>) -> Self {
        let ctx = conn.shutdown_signal();
        Self {
            opcode,
            conn,
            value,
            raw,
            received_at: Instant::now(),
            ctx,
        }
    }

    /// The cancellation-propagating scope tied to the server's lifetime
    /// (spec.md §3 `ctx`), not the connection's — a request-local
    /// deadline would need its own timer; this only tells the handler
    /// the server has started draining.
    pub fn ctx(&self) -> tokio::sync::watch::Receiver<bool> {
        self.ctx.clone()
    }

    /// Take the instance back out, for the engine to return to its pool
    /// after the handler (or its panic) has run.
    pub(crate) fn into_value(self) -> Box<T> {
        self.value
    }
}

impl<T> std::ops::Deref for Request<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for Request<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
