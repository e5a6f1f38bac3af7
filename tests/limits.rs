//! Boundary and threshold scenarios from spec.md §8 (scenarios 2-4).

use std::sync::Arc;
use std::time::Duration;

use ripple::client::Client;
use ripple::config::EngineConfig;
use ripple::engine::{Proto, ProtocolEngine, Request};
use ripple::logger::TracingLogger;
use ripple::server::Server;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ping {
    kind: String,
}

impl Proto<String> for Ping {
    fn key(&self) -> String {
        self.kind.clone()
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn read_until_close(conn: &ripple::client::ClientConn) -> (CloseCode, String) {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), conn.read_message())
            .await
            .expect("expected a message before timing out")
        {
            Some(Ok(WsMessage::Close(Some(frame)))) => return (frame.code, frame.reason.into_owned()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("transport error waiting for close: {e}"),
            None => panic!("stream ended without a close frame"),
        }
    }
}

#[tokio::test]
async fn error_threshold_closes_with_going_away_after_three_errors() {
    let port = free_port().await;
    let config = Arc::new(EngineConfig::new(0, 3));
    let engine: Arc<ProtocolEngine<Ping, String>> = ProtocolEngine::new(config, Arc::new(TracingLogger));
    // No handlers registered — every message is a routing miss.
    let handler = Arc::clone(&engine).use_handler();

    let server = Arc::new(Server::builder().with_packet_handler(handler).build().unwrap());
    let addr = format!("tcp://127.0.0.1:{port}");
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(&addr).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = Client::new();
    let conn = client.dial(&format!("ws://127.0.0.1:{port}/"), None).await.unwrap();

    for _ in 0..3 {
        let payload = serde_json::to_string(&Ping { kind: "unregistered".into() }).unwrap();
        conn.write_text(payload).await.unwrap();
    }

    let (code, reason) = read_until_close(&conn).await;
    assert_eq!(code, CloseCode::Away);
    assert_eq!(reason, "too many error");

    server.stop();
    server_task.abort();
}

#[tokio::test]
async fn oversize_payload_closes_connection_via_error_threshold() {
    let port = free_port().await;
    // max_error_count = 1 so a single oversize message triggers the close,
    // isolating the payload-size guard (spec.md §4.8 step 1) from the
    // routing-miss path exercised above.
    let config = Arc::new(EngineConfig::new(16, 1));
    let engine: Arc<ProtocolEngine<Ping, String>> = ProtocolEngine::new(config, Arc::new(TracingLogger));
    let handler = Arc::clone(&engine).use_handler();

    let server = Arc::new(Server::builder().with_packet_handler(handler).build().unwrap());
    let addr = format!("tcp://127.0.0.1:{port}");
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(&addr).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = Client::new();
    let conn = client.dial(&format!("ws://127.0.0.1:{port}/"), None).await.unwrap();

    conn.write_binary(vec![0u8; 16]).await.unwrap();

    let (code, reason) = read_until_close(&conn).await;
    assert_eq!(code, CloseCode::Away);
    assert_eq!(reason, "too many error");

    server.stop();
    server_task.abort();
}

#[tokio::test]
async fn idle_connection_is_evicted_with_timeout_reason() {
    let port = free_port().await;
    let server = Arc::new(
        Server::builder()
            .with_conn_timeout(Duration::from_millis(100))
            .with_handler(|_packet| async move {})
            .build()
            .unwrap(),
    );
    let addr = format!("tcp://127.0.0.1:{port}");
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(&addr).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = Client::new();
    let conn = client.dial(&format!("ws://127.0.0.1:{port}/"), None).await.unwrap();

    let (code, reason) = read_until_close(&conn).await;
    assert_eq!(code, CloseCode::Away);
    assert_eq!(reason, "timeout");

    server.stop();
    server_task.abort();
}
