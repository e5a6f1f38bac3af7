//! Error taxonomy shared by the reactor, the upgrade handshake and the
//! protocol engine.
//!
//! Every variant maps to one of the close-status codes in spec.md §6 via
//! [`RippleError::close_frame`], so callers never have to hand-translate an
//! error kind into a wire status code.

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Top-level error type for the crate. Handler code and application-level
/// callers generally work with `anyhow::Result`; this enum exists for the
/// call sites inside `ripple` itself that need to branch on error kind
/// (close-frame selection, error-counter policy).
#[derive(Debug, thiserror::Error)]
pub enum RippleError {
    /// Read, write or close failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The HTTP→WebSocket upgrade was rejected or malformed.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Malformed WebSocket framing, or an unsupported/unknown opcode.
    #[error("framing error: {0}")]
    Framing(String),

    /// Payload failed to decode (or encode) under the registered codec.
    #[error("codec error: {0}")]
    Codec(String),

    /// No handler is registered for the decoded message's key.
    #[error("no handler registered for key")]
    Routing,

    /// A broker in the chain rejected the request.
    #[error("broker rejected request: {0}")]
    Broker(String),

    /// The handler panicked, or explicitly asked for the connection to close.
    #[error("handler error: {0}")]
    Handler(String),

    /// A policy limit was exceeded (payload too large, error count exhausted).
    #[error("policy violation: {0}")]
    Policy(&'static str),

    /// The worker pool could not accept another task right now.
    #[error("worker pool exhausted")]
    PoolExhausted,
}

impl RippleError {
    /// The close-frame status code and reason string this error should
    /// surface to the peer, per spec.md §7 ("User-visible failure").
    ///
    /// `Codec`/`Routing`/`Broker`/`Policy` don't close a connection on
    /// their own — they feed the engine's error counter (spec.md §4.8) and
    /// only produce a close once `max_error_count` is reached, with the
    /// exact reason `"too many error"` (spec.md §9, preserved for wire
    /// compatibility). The mapping below is what a *direct* close for each
    /// kind would carry, used by the reactor for errors that close
    /// immediately (`Transport`, `Handshake`, `Framing`).
    pub fn close_frame(&self) -> (CloseCode, &'static str) {
        match self {
            RippleError::Transport(_) => (CloseCode::Abnormal, "transport error"),
            RippleError::Handshake(_) => (CloseCode::Protocol, "handshake rejected"),
            RippleError::Framing(_) => (CloseCode::Unsupported, "malformed frame"),
            RippleError::Codec(_) => (CloseCode::Away, "too many error"),
            RippleError::Routing => (CloseCode::Away, "too many error"),
            RippleError::Broker(_) => (CloseCode::Away, "too many error"),
            RippleError::Handler(_) => (CloseCode::Error, "handler error"),
            RippleError::Policy(_) => (CloseCode::Away, "too many error"),
            RippleError::PoolExhausted => (CloseCode::Error, "pool exhausted"),
        }
    }

    /// `true` for the categories that increment the per-connection error
    /// counter instead of closing immediately (spec.md §7).
    pub fn is_countable(&self) -> bool {
        matches!(
            self,
            RippleError::Codec(_) | RippleError::Routing | RippleError::Broker(_) | RippleError::Policy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RippleError>;
