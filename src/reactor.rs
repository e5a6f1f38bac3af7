//! The reactor adapter — the connection lifecycle state machine (spec.md
//! §4.4).
//!
//! Each accepted connection gets its own `tokio::spawn`ed task. Frame
//! parsing and state transitions for *that* connection only ever happen
//! on that one task — nothing here runs two readers over the same
//! stream concurrently — which is the single-threaded-dispatcher
//! invariant spec.md asks for, scoped to a connection rather than to a
//! whole OS thread (the underlying reactor library spec.md §1 treats as
//! an external collaborator is, here, tokio's multi-threaded executor;
//! `ripple` only relies on it never handing the same connection's stream
//! to two tasks at once, which `tokio::spawn` + move-only ownership
//! guarantees by construction).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::conn::ConnState;
use crate::dispatch::{self, Opcode};
use crate::error::RippleError;
use crate::logger::{Level, Logger};
use crate::pool::WorkerPool;
use crate::timeout::TimeoutTable;
use crate::upgrade::Upgrader;

/// One inbound application message plus the connection it arrived on
/// (spec.md §3 `Message` / glossary `Packet`).
pub struct Packet {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub conn: Arc<ConnState>,
}

pub type PacketHandler = Arc<dyn Fn(Packet) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;
pub type PingHandler = Arc<dyn Fn(Arc<ConnState>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(Arc<ConnState>, Option<String>) + Send + Sync>;

/// Collaborators the reactor needs to drive one connection through its
/// lifecycle (spec.md §4.4 table).
pub struct ReactorDeps {
    pub upgrader: Arc<Upgrader>,
    pub worker_pool: Arc<WorkerPool>,
    pub timeout_table: Arc<TimeoutTable>,
    pub conn_timeout: Duration,
    pub handler: PacketHandler,
    pub on_ping: PingHandler,
    pub on_close: CloseHandler,
    pub logger: Arc<dyn Logger>,
}

/// Default `on_ping`: reply with a Pong on the same connection (spec.md
/// §4.4: "The default onPing writes a Pong frame via the transport;
/// writes happen inside the worker").
pub fn default_on_ping() -> PingHandler {
    Arc::new(|conn: Arc<ConnState>| {
        Box::pin(async move {
            let _ = conn.send(WsMessage::Pong(Vec::new())).await;
        })
    })
}

pub fn noop_on_close() -> CloseHandler {
    Arc::new(|_conn, _err| {})
}

/// Drive one accepted TCP connection through `Accepted → Handshaking →
/// Established → Closing → Closed` (spec.md §4.4).
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, deps: Arc<ReactorDeps>, shutdown: tokio::sync::watch::Receiver<bool>) {
    let conn_key = format!("{peer}");
    let conn = ConnState::new(peer, shutdown);
    deps.timeout_table.touch_with_ttl(conn_key.clone(), Arc::clone(&conn), deps.conn_timeout).await;

    // ── Handshaking ──────────────────────────────────────────────────
    let upgrader = Arc::clone(&deps.upgrader);
    let headers_cell: Arc<std::sync::Mutex<Option<crate::conn::Headers>>> = Arc::new(std::sync::Mutex::new(None));
    let headers_cell2 = Arc::clone(&headers_cell);

    let accept_result = tokio_tungstenite::accept_hdr_async(stream, move |request: &tokio_tungstenite::tungstenite::handshake::server::Request, response| {
        *headers_cell2.lock().expect("headers cell poisoned") = Some(Upgrader::snapshot_headers(request));
        upgrader.validate(request, response)
    })
    .await;

    let ws_stream = match accept_result {
        Ok(ws) => ws,
        Err(e) => {
            deps.logger.log(Level::Warn, "handshake", &format_args!("rejected connection from {peer}: {e}"));
            deps.timeout_table.delete(&conn_key).await;
            return;
        }
    };

    let headers = headers_cell.lock().expect("headers cell poisoned").take().unwrap_or_default();
    conn.mark_upgraded(headers);

    let (sink, mut read_stream) = futures_util::StreamExt::split(ws_stream);
    conn.install_sink(sink);
    deps.timeout_table.touch_with_ttl(conn_key.clone(), Arc::clone(&conn), deps.conn_timeout).await;

    // ── Established ──────────────────────────────────────────────────
    let mut shutdown_rx = conn.shutdown_signal();
    loop {
        // Drain anything already buffered before suspending, so a burst
        // of messages delivered in one wakeup dispatches in order
        // without an extra round trip through `select!` per message
        // (spec.md §4.4/§5: parsed in arrival order, submitted in order).
        match dispatch::read_ready_messages(&mut read_stream).await {
            Ok(batch) if !batch.is_empty() => {
                let mut should_close = false;
                for decoded in batch {
                    if !handle_one(&deps, &conn, decoded).await {
                        should_close = true;
                        break;
                    }
                }
                if should_close {
                    break;
                }
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                close_with(&conn, e.close_frame()).await;
                break;
            }
        }

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                break;
            }

            next = dispatch::read_one(&mut read_stream) => {
                match next {
                    Some(Ok(decoded)) => {
                        if !handle_one(&deps, &conn, decoded).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        close_with(&conn, e.close_frame()).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // ── Closing / Closed ─────────────────────────────────────────────
    deps.timeout_table.delete(&conn_key).await;
    conn.close().await;
    if conn.claim_close() {
        (deps.on_close)(Arc::clone(&conn), None);
    }
}

/// Handle one decoded message per spec.md §4.4's dispatch table. Returns
/// `false` if the connection should close after this message.
async fn handle_one(deps: &Arc<ReactorDeps>, conn: &Arc<ConnState>, decoded: dispatch::DecodedMessage) -> bool {
    conn.keep_alive();
    match decoded.opcode {
        Opcode::Ping => {
            let on_ping = Arc::clone(&deps.on_ping);
            let conn = Arc::clone(conn);
            if deps.worker_pool.submit(async move { on_ping(conn).await }).is_err() {
                deps.logger.log(Level::Warn, "pool", &"ping handler dropped — pool exhausted");
            }
            true
        }
        Opcode::Text | Opcode::Binary => {
            let handler = Arc::clone(&deps.handler);
            let packet = Packet {
                opcode: decoded.opcode,
                payload: decoded.payload,
                conn: Arc::clone(conn),
            };
            if deps.worker_pool.submit(async move { handler(packet).await }).is_err() {
                deps.logger.log(Level::Warn, "pool", &"message dropped — pool exhausted");
            }
            true
        }
        Opcode::Close => {
            if conn.claim_close() {
                (deps.on_close)(Arc::clone(conn), None);
            }
            false
        }
        Opcode::Pong => {
            // spec.md §4.4: "Pong or unknown opcode: send
            // StatusUnsupportedData close, return Close."
            close_with(conn, (CloseCode::Unsupported, "unsupported data")).await;
            false
        }
    }
}

async fn close_with(conn: &Arc<ConnState>, (code, reason): (CloseCode, &'static str)) {
    let frame = WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    let _ = conn.send(frame).await;
}
