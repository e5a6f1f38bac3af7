//! `MessageDispatcher` — classifies already-decoded WebSocket messages by
//! opcode (spec.md §4.6).
//!
//! The raw frame reader/writer is the external collaborator spec.md §1
//! names (`tokio_tungstenite`'s codec, built on `tungstenite`): by the
//! time a `tungstenite::Message` reaches us, partial frames have already
//! been reassembled. What's left for `MessageDispatcher` to do is exactly
//! spec.md's "classify by opcode" half of the contract — draining
//! whatever complete messages are *already buffered* on the stream
//! without blocking the reactor, so a burst of messages delivered in one
//! `OnTraffic`-equivalent wakeup dispatches as a batch, in arrival order
//! (spec.md §4.4, §5 ordering guarantee).

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::RippleError;

/// The four-ish opcodes spec.md's glossary defines, plus a catch-all for
/// anything `tungstenite` hands back that isn't one of them (raw
/// `Frame`s, which only surface if the caller opts into frame-level
/// reads — never through the default `StreamExt::next`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

/// One decoded application message, paired with its opcode (spec.md §3
/// `Message`). `conn` isn't carried here — the reactor already knows
/// which `ConnState` owns the stream it's reading from.
#[derive(Debug)]
pub struct DecodedMessage {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

pub type ClientStream = SplitStream<WebSocketStream<TcpStream>>;

/// Reads zero or more complete messages from `stream` without blocking.
/// On a malformed frame, returns an error — the caller closes with
/// `StatusUnsupportedData` (spec.md §4.6).
pub async fn read_ready_messages(stream: &mut ClientStream) -> Result<Vec<DecodedMessage>, RippleError> {
    let mut out = Vec::new();
    loop {
        // `now_or_never` polls the stream once without suspending — if
        // nothing is ready yet, we stop and let the reactor's `select!`
        // await the next wakeup instead (spec.md: "partial frame returns
        // an empty slice with nil error; the Reactor will retry on the
        // next OnTraffic").
        let next = futures_util::future::FutureExt::now_or_never(stream.next());
        let item = match next {
            Some(item) => item,
            None => break,
        };
        match item {
            Some(Ok(msg)) => match classify(msg)? {
                Some(decoded) => out.push(decoded),
                None => continue,
            },
            Some(Err(e)) => return Err(RippleError::Framing(e.to_string())),
            None => break, // stream ended
        }
    }
    Ok(out)
}

/// Read exactly the next message, suspending until one arrives. Used by
/// the reactor's `select!` once `read_ready_messages` has drained
/// everything already buffered.
pub async fn read_one(stream: &mut ClientStream) -> Option<Result<DecodedMessage, RippleError>> {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => match classify(msg) {
                Ok(Some(decoded)) => return Some(Ok(decoded)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            },
            Some(Err(e)) => return Some(Err(RippleError::Framing(e.to_string()))),
            None => return None,
        }
    }
}

/// `Frame`-opcode messages (raw, unreassembled) are framing errors at
/// this layer; everything else maps 1:1 onto spec.md's opcode set.
/// Returns `Ok(None)` for message kinds that carry no payload of
/// interest to classify (there are none today, but keeps the match
/// exhaustive and future-proof against a new `tungstenite::Message`
/// variant without silently misclassifying it).
fn classify(msg: WsMessage) -> Result<Option<DecodedMessage>, RippleError> {
    let decoded = match msg {
        WsMessage::Text(text) => DecodedMessage {
            opcode: Opcode::Text,
            payload: text.into_bytes(),
        },
        WsMessage::Binary(data) => DecodedMessage {
            opcode: Opcode::Binary,
            payload: data,
        },
        WsMessage::Ping(data) => DecodedMessage {
            opcode: Opcode::Ping,
            payload: data,
        },
        WsMessage::Pong(data) => DecodedMessage {
            opcode: Opcode::Pong,
            payload: data,
        },
        WsMessage::Close(frame) => DecodedMessage {
            opcode: Opcode::Close,
            payload: frame.map(|f| f.reason.into_owned().into_bytes()).unwrap_or_default(),
        },
        WsMessage::Frame(_) => return Err(RippleError::Framing("raw frame read at message layer".into())),
    };
    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_text_as_text() {
        let decoded = classify(WsMessage::Text("hello".to_string())).unwrap().unwrap();
        assert_eq!(decoded.opcode, Opcode::Text);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn classifies_close() {
        let decoded = classify(WsMessage::Close(None)).unwrap().unwrap();
        assert_eq!(decoded.opcode, Opcode::Close);
    }
}
