//! WebSocket End-to-End Tests
//!
//! Runs the downstream endpoint on an ephemeral port, with an in-memory
//! upstream, and drives it with real WebSocket clients.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use bitmex_stream_proxy::infrastructure::websocket::{REALTIME_PATH, serve};
use bitmex_stream_proxy::{
    ControlPort, FanoutRelay, SessionRegistry, StreamProxy, UpstreamConfig, UpstreamManager,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    addr: SocketAddr,
    proxy: Arc<StreamProxy>,
    upstream: fmpsc::UnboundedSender<Result<Message, WsError>>,
    sent: fmpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
}

impl Relay {
    async fn start() -> Self {
        let cancel = CancellationToken::new();
        let relay = Arc::new(FanoutRelay::new(Arc::new(SessionRegistry::new())));
        let manager = Arc::new(UpstreamManager::new(
            UpstreamConfig::new("ws://upstream.invalid/realtime", "instrument"),
            Arc::clone(&relay),
            cancel.clone(),
        ));

        let (sent_tx, sent) = fmpsc::unbounded::<Message>();
        let (upstream, upstream_rx) = fmpsc::unbounded::<Result<Message, WsError>>();
        let sink = sent_tx.sink_map_err(|e| WsError::Io(std::io::Error::other(e)));
        let _read_loop = manager.attach(sink, upstream_rx).await;
        upstream
            .unbounded_send(Ok(Message::Text(
                r#"{"info":"Welcome to the BitMEX Realtime API.","version":"2.0.0"}"#.into(),
            )))
            .unwrap();

        let proxy = Arc::new(StreamProxy::new(relay, manager as Arc<dyn ControlPort>));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&proxy), 64, cancel.clone()));

        Self {
            addr,
            proxy,
            upstream,
            sent,
            cancel,
        }
    }

    async fn client(&self) -> Client {
        let url = format!("ws://{}{REALTIME_PATH}", self.addr);
        let (client, _response) = connect_async(url).await.unwrap();
        client
    }

    fn push(&self, frame: &Value) {
        self.upstream
            .unbounded_send(Ok(Message::Text(frame.to_string().into())))
            .unwrap();
    }

    async fn next_sent(&mut self) -> Value {
        loop {
            let msg = timeout(WAIT, self.sent.next())
                .await
                .expect("control frame in time")
                .expect("upstream sink open");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }
}

async fn send(client: &mut Client, body: &Value) {
    client
        .send(Message::Text(body.to_string().into()))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("downstream frame in time")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn subscribe_ack(symbol: &str) -> Value {
    let channel = format!("instrument:{symbol}");
    json!({"success": true, "subscribe": channel, "request": {"op": "subscribe", "args": [channel]}})
}

#[tokio::test]
async fn subscribe_and_receive_prices() {
    let mut relay = Relay::start().await;
    let mut client = relay.client().await;

    send(&mut client, &json!({"action": "subscribe", "symbols": ["XBTUSD"]})).await;
    assert_eq!(
        relay.next_sent().await,
        json!({"op": "subscribe", "args": "instrument:XBTUSD"})
    );

    relay.push(&subscribe_ack("XBTUSD"));
    assert_eq!(recv(&mut client).await, json!({"success": true}));

    relay.push(&json!({
        "table": "instrument",
        "action": "update",
        "data": [{
            "symbol": "XBTUSD",
            "timestamp": "2026-10-14T09:00:02.500Z",
            "impactAskPrice": 61_300.0,
            "lastPrice": 61_250.5,
            "markPrice": 61_240.1,
        }],
    }));
    assert_eq!(
        recv(&mut client).await,
        json!({"symbol": "XBTUSD", "timestamp": "2026-10-14T09:00:02.500Z", "price": 61_300.0})
    );

    relay.cancel.cancel();
}

#[tokio::test]
async fn bad_requests_get_error_frames() {
    let relay = Relay::start().await;
    let mut client = relay.client().await;

    client.send(Message::Text("{".into())).await.unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("malformed request"));

    send(&mut client, &json!({"action": "subscribe", "symbols": []})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].is_string());

    relay.cancel.cancel();
}

#[tokio::test]
async fn closing_the_socket_releases_the_symbol() {
    let mut relay = Relay::start().await;
    let mut client = relay.client().await;

    send(&mut client, &json!({"action": "subscribe", "symbols": ["ETHUSD"]})).await;
    relay.next_sent().await;
    relay.push(&subscribe_ack("ETHUSD"));
    assert_eq!(recv(&mut client).await, json!({"success": true}));
    assert_eq!(relay.proxy.relay().client_count(), 1);

    client.close(None).await.unwrap();
    assert_eq!(
        relay.next_sent().await,
        json!({"op": "unsubscribe", "args": "instrument:ETHUSD"})
    );
    assert_eq!(relay.proxy.relay().client_count(), 0);

    relay.cancel.cancel();
}
