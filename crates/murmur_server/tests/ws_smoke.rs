#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use murmur_server::server::connection::{ConnectionSettings, serve};
use murmur_server::server::history::InMemoryHistoryBackend;
use murmur_server::server::room::{Room, RoomConfig};
use murmur_server::util::time::SystemClock;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(cfg: RoomConfig) -> SocketAddr {
	let room = Room::open(cfg, Arc::new(InMemoryHistoryBackend::default()), Arc::new(SystemClock))
		.await
		.expect("room opens");
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	tokio::spawn(serve(listener, room, Arc::new(ConnectionSettings::default())));
	addr
}

async fn recv_json(ws: &mut Client) -> Value {
	loop {
		let frame = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("valid frame");
		if let Message::Text(text) = frame {
			return serde_json::from_str(text.as_str()).expect("server sends JSON");
		}
	}
}

async fn recv_until(ws: &mut Client, kind: &str) -> Value {
	loop {
		let v = recv_json(ws).await;
		if v["type"] == kind {
			return v;
		}
	}
}

async fn send_json(ws: &mut Client, v: Value) {
	ws.send(Message::Text(v.to_string().into())).await.expect("send");
}

#[tokio::test]
async fn join_and_message_round_trip_over_websocket() {
	let addr = start(RoomConfig::default()).await;

	let (mut a, _) = connect_async(format!("ws://{addr}")).await.expect("connect a");
	send_json(&mut a, json!({"type": "join", "sessionId": "smoke_a", "timestamp": 0})).await;
	assert_eq!(recv_json(&mut a).await, json!({"type": "user_count", "count": 1}));
	assert_eq!(recv_json(&mut a).await["type"], "system");

	let (mut b, _) = connect_async(format!("ws://{addr}")).await.expect("connect b");
	send_json(&mut b, json!({"type": "join", "sessionId": "smoke_b", "timestamp": 0})).await;
	assert_eq!(recv_until(&mut a, "user_count").await["count"], 2);

	send_json(
		&mut a,
		json!({"type": "message", "content": "hello", "sessionId": "smoke_a", "timestamp": 1}),
	)
	.await;

	for ws in [&mut a, &mut b] {
		let msg = recv_until(ws, "message").await;
		assert_eq!(msg["content"], "hello");
		assert_eq!(msg["sessionId"], "smoke_a");
		assert!(msg["editedAt"].is_null());
		assert_eq!(msg["signature"].as_str().map(str::len), Some(64));
	}

	a.close(None).await.expect("close a");
	assert_eq!(recv_until(&mut b, "user_count").await["count"], 1);
}

#[tokio::test]
async fn malformed_frames_after_join_get_an_error_event() {
	let addr = start(RoomConfig::default()).await;

	let (mut ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
	send_json(&mut ws, json!({"type": "join", "sessionId": "smoke_c"})).await;
	recv_until(&mut ws, "system").await;

	ws.send(Message::Text("not json".into())).await.expect("send");
	assert_eq!(recv_until(&mut ws, "error").await["type"], "error");

	send_json(&mut ws, json!({"type": "teleport"})).await;
	assert_eq!(recv_until(&mut ws, "error").await["type"], "error");
}

#[tokio::test]
async fn disallowed_origin_is_refused_before_upgrade() {
	let mut cfg = RoomConfig::default();
	cfg.admission.allowed_origins = vec!["https://chat.example.org".to_string()];
	let addr = start(cfg).await;

	let mut req = format!("ws://{addr}").into_client_request().expect("request");
	req.headers_mut()
		.insert("Origin", HeaderValue::from_static("https://evil.example.net"));

	match connect_async(req).await {
		Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 403),
		other => panic!("expected HTTP 403 rejection, got: {:?}", other.map(|(_, r)| r.status())),
	}

	let mut req = format!("ws://{addr}").into_client_request().expect("request");
	req.headers_mut()
		.insert("Origin", HeaderValue::from_static("https://chat.example.org"));
	assert!(connect_async(req).await.is_ok());
}
