//! `ripple` — a reactor-driven, high-concurrency WebSocket server
//! framework.
//!
//! A TCP listener hands each accepted connection to [`reactor`], which
//! drives it through the HTTP→WebSocket handshake ([`upgrade`]), reads
//! frames via [`dispatch`], and fans decoded messages out to a bounded
//! [`pool::WorkerPool`]. [`conn::ConnState`] is the per-connection handle
//! threaded through all of it; [`timeout::TimeoutTable`] evicts
//! connections that go idle. [`server::Server`] wires these pieces
//! together behind a builder; [`client::Client`] dials the same protocol
//! from the other side. [`engine`] is an optional layer on top: a
//! tag-routed, middleware-chained protocol engine for services that want
//! request/response semantics instead of raw packets.

pub mod client;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logger;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod timeout;
pub mod upgrade;

pub use conn::ConnState;
pub use error::{RippleError, Result};
pub use logger::{Level, Logger, TracingLogger};
pub use reactor::Packet;
pub use server::{Server, ServerBuilder};
