//! Echo round-trip (spec.md §8 "Round-trips: Echo").

use std::sync::Arc;
use std::time::Duration;

use ripple::client::Client;
use ripple::server::Server;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn client_writes_text_handler_echoes_it_back() {
    let port = free_port().await;
    let server = Arc::new(
        Server::builder()
            .with_handler(|packet| async move {
                let _ = packet.conn.send(WsMessage::Text(String::from_utf8_lossy(&packet.payload).into_owned())).await;
            })
            .build()
            .unwrap(),
    );

    let server_task = {
        let server = Arc::clone(&server);
        let addr = format!("tcp://127.0.0.1:{port}");
        tokio::spawn(async move { server.serve(&addr).await })
    };

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = Client::new();
    let conn = client
        .dial(&format!("ws://127.0.0.1:{port}/"), None)
        .await
        .expect("dial should succeed");

    conn.write_text("hello").await.expect("write should succeed");

    let reply = tokio::time::timeout(Duration::from_secs(2), conn.read_message())
        .await
        .expect("should receive a reply before timing out")
        .expect("stream should not have ended")
        .expect("message should decode cleanly");

    match reply {
        WsMessage::Text(text) => assert_eq!(text, "hello"),
        other => panic!("expected a Text reply, got {other:?}"),
    }

    conn.close().await.ok();
    server.stop();
    server_task.abort();
}
