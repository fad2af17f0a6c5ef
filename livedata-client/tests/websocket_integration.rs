//! Integration tests over a real WebSocket.
//!
//! A minimal DDP server runs in-process on a free port; the client side is
//! the full stack: `WebSocketTransport` → `Connection` → `LiveClient`.

use futures_util::{SinkExt, StreamExt};
use livedata_client::{
    ConnectionOptions, Connection, LiveClient, LocalCollection, StatusKind, SubscriptionCallbacks,
    WebSocketTransport,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a toy DDP server. Every `connect` frame it sees is forwarded on the
/// returned channel. With `drop_first`, the first socket is closed right
/// after the handshake.
async fn start_test_server(drop_first: bool) -> (u16, mpsc::UnboundedReceiver<Value>) {
    let port = free_port().await;
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
    let (connects_tx, connects_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok((stream, _)) = listener.accept().await {
            accepted += 1;
            let close_after_handshake = drop_first && accepted == 1;
            let connects = connects_tx.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                ws.send(WsMessage::Text(r#"{"server_id":"0"}"#.into())).await.unwrap();

                while let Some(Ok(frame)) = ws.next().await {
                    let WsMessage::Text(text) = frame else { continue };
                    let msg: Value = serde_json::from_str(text.as_str()).unwrap();
                    let replies = match msg["msg"].as_str() {
                        Some("connect") => {
                            let _ = connects.send(msg.clone());
                            vec![json!({"msg": "connected", "session": "srv1"})]
                        }
                        Some("sub") => vec![
                            json!({"msg": "added", "collection": "items", "id": "a", "fields": {"n": 1}}),
                            json!({"msg": "ready", "subs": [msg["id"]]}),
                        ],
                        Some("method") => vec![
                            json!({"msg": "result", "id": msg["id"], "result": msg["params"][0]}),
                            json!({"msg": "updated", "methods": [msg["id"]]}),
                        ],
                        Some("ping") => vec![json!({"msg": "pong", "id": msg["id"]})],
                        _ => vec![],
                    };
                    for reply in replies {
                        ws.send(WsMessage::Text(reply.to_string().into())).await.unwrap();
                    }
                    if close_after_handshake && msg["msg"] == "connect" {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            });
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, connects_rx)
}

fn start_client(port: u16, options: ConnectionOptions) -> (LiveClient, LocalCollection) {
    let url = format!("ws://127.0.0.1:{port}");
    let (transport, events) = WebSocketTransport::connect(url, &options);
    let mut conn = Connection::new(Box::new(transport), options);
    let items = LocalCollection::new();
    conn.register_store("items", items.store()).unwrap();
    let (client, _task) = LiveClient::spawn(conn, events);
    (client, items)
}

#[tokio::test]
async fn test_subscribe_and_call_over_websocket() {
    let (port, mut connects) = start_test_server(false).await;
    let (client, items) = start_client(port, ConnectionOptions::default());

    let connect = timeout(Duration::from_secs(2), connects.recv()).await.unwrap().unwrap();
    assert_eq!(connect["version"], "1");

    let mut sub = client
        .subscribe("items", vec![], SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert!(timeout(Duration::from_secs(2), sub.ready()).await.unwrap());
    assert_eq!(items.get("a").unwrap()["n"], 1);

    let outcome = timeout(Duration::from_secs(2), client.call("echo", vec![json!("hi")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(json!("hi")));

    let status = client.status().await.unwrap();
    assert_eq!(status.status, StatusKind::Connected);

    client.close();
}

#[tokio::test]
async fn test_reconnect_resends_session_and_subscriptions() {
    let (port, mut connects) = start_test_server(true).await;
    let options = ConnectionOptions {
        retry_delay_ms: 50,
        ..ConnectionOptions::default()
    };
    let (client, items) = start_client(port, options);

    let first = timeout(Duration::from_secs(2), connects.recv()).await.unwrap().unwrap();
    assert!(first.get("session").is_none());

    let second = timeout(Duration::from_secs(2), connects.recv()).await.unwrap().unwrap();
    assert_eq!(second["session"], "srv1");

    let mut sub = client
        .subscribe("items", vec![], SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert!(timeout(Duration::from_secs(2), sub.ready()).await.unwrap());
    assert_eq!(items.len(), 1);

    client.close();
}

#[tokio::test]
async fn test_closed_client_rejects_commands() {
    let (port, _connects) = start_test_server(false).await;
    let (client, _items) = start_client(port, ConnectionOptions::default());
    client.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.status().await.is_err());
}
