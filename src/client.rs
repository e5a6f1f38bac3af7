//! `Client`/`ClientConn` — the dialer side of the protocol (spec.md
//! §4.7). A thin wrapper over the same frame codec the server side uses;
//! out of scope per spec.md §1 beyond that thin wrapper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::RippleError;

/// Caller-supplied headers merged onto the dialer's own (spec.md §4.7:
/// "merges caller headers onto the dialer headers, caller wins on
/// conflict").
pub type DialHeaders = HashMap<String, String>;

/// Dials remote WebSocket endpoints. Holds headers common to every dial
/// (e.g. a fixed `User-Agent`); `Dial` layers per-call headers on top.
#[derive(Default, Clone)]
pub struct Client {
    default_headers: DialHeaders,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Dial `url` (e.g. `"ws://host:port/path"`), performing the
    /// client-side handshake. TLS is out of scope (spec.md §1) beyond
    /// `tokio_tungstenite`'s own `wss://` support, which this delegates
    /// to untouched — there is no additional wrapping hook here, mirroring
    /// the upstream design's "optional connection wrapper" being the
    /// caller's responsibility, not the dialer's.
    pub async fn dial(&self, url: &str, headers: Option<DialHeaders>) -> Result<ClientConn, RippleError> {
        let mut merged = self.default_headers.clone();
        if let Some(caller_headers) = headers {
            merged.extend(caller_headers);
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| RippleError::Handshake(e.to_string()))?;
        for (name, value) in &merged {
            let header_name: tokio_tungstenite::tungstenite::http::HeaderName = name
                .parse()
                .map_err(|_| RippleError::Handshake(format!("invalid header name: {name}")))?;
            let header_value = value
                .parse()
                .map_err(|_| RippleError::Handshake(format!("invalid header value for {name}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RippleError::Handshake(e.to_string()))?;

        Ok(ClientConn::new(ws_stream))
    }
}

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A dialed, half-duplex connection handle (spec.md §4.7).
pub struct ClientConn {
    stream: tokio::sync::Mutex<Stream>,
    open: AtomicBool,
}

impl ClientConn {
    fn new(stream: Stream) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(stream),
            open: AtomicBool::new(true),
        }
    }

    fn check_open(&self) -> Result<(), RippleError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RippleError::Transport(std::io::Error::other("connection closed")))
        }
    }

    pub async fn write_text(&self, text: impl Into<String>) -> Result<(), RippleError> {
        self.check_open()?;
        self.stream
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| RippleError::Transport(std::io::Error::other(e)))
    }

    pub async fn write_binary(&self, data: Vec<u8>) -> Result<(), RippleError> {
        self.check_open()?;
        self.stream
            .lock()
            .await
            .send(WsMessage::Binary(data))
            .await
            .map_err(|e| RippleError::Transport(std::io::Error::other(e)))
    }

    /// Read the next message. Returns `None` once the peer has closed the
    /// stream.
    pub async fn read_message(&self) -> Option<Result<WsMessage, RippleError>> {
        if self.check_open().is_err() {
            return None;
        }
        self.stream
            .lock()
            .await
            .next()
            .await
            .map(|item| item.map_err(|e| RippleError::Transport(std::io::Error::other(e))))
    }

    /// Idempotent close: a second call returns `Closed` (spec.md §5
    /// "Client `Close` is idempotent").
    pub async fn close(&self) -> Result<(), RippleError> {
        self.close_by_reason(CloseCode::Normal, "").await
    }

    pub async fn close_by_reason(&self, code: CloseCode, reason: impl Into<String>) -> Result<(), RippleError> {
        if self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RippleError::Transport(std::io::Error::other("already closed")));
        }
        let frame = WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into().into(),
        }));
        let mut stream = self.stream.lock().await;
        let _ = stream.send(frame).await;
        stream
            .close()
            .await
            .map_err(|e| RippleError::Transport(std::io::Error::other(e)))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
