#![forbid(unsafe_code)]

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use murmur_protocol::{DEFAULT_MAX_FRAME_SIZE, decode_client_event, encode_server_event};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::server::policy::AdmissionError;
use crate::server::registry::Outbound;
use crate::server::room::Room;

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Header carrying the client address when running behind a proxy (e.g. `CF-Connecting-IP`).
	pub trusted_ip_header: Option<String>,
	pub max_frame_size: usize,
	/// Upper bound for writing one frame to a peer.
	pub send_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			trusted_ip_header: None,
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			send_timeout: Duration::from_secs(5),
		}
	}
}

/// Pause after a failed `accept` (e.g. descriptor exhaustion) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop. Each connection runs on its own task.
pub async fn serve(listener: TcpListener, room: Room, settings: Arc<ConnectionSettings>) {
	loop {
		let (stream, peer) = accept_retrying(|| listener.accept(), ACCEPT_ERROR_BACKOFF).await;
		let room = room.clone();
		let settings = Arc::clone(&settings);
		tokio::spawn(async move {
			handle_connection(stream, peer, room, settings).await;
		});
	}
}

/// Poll `accept` until it yields, logging and pausing after each failure.
async fn accept_retrying<T, F, Fut>(mut accept: F, backoff: Duration) -> T
where
	F: FnMut() -> Fut,
	Fut: Future<Output = io::Result<T>>,
{
	loop {
		match accept().await {
			Ok(accepted) => return accepted,
			Err(e) => {
				metrics::counter!("murmur_server_accept_errors_total").increment(1);
				warn!(error = %e, "accept failed; retrying");
				tokio::time::sleep(backoff).await;
			}
		}
	}
}

/// Client address from the trusted header, if configured and parseable.
fn forwarded_ip(req: &Request, header: Option<&str>) -> Option<IpAddr> {
	let value = req.headers().get(header?)?.to_str().ok()?;
	value.split(',').next()?.trim().parse().ok()
}

fn reject(err: &AdmissionError) -> ErrorResponse {
	let mut resp = ErrorResponse::new(Some(err.to_string()));
	*resp.status_mut() = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::FORBIDDEN);
	resp
}

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, room: Room, settings: Arc<ConnectionSettings>) {
	let counts = room.ip_counts().await;
	let mut client_ip = peer.ip();

	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		if let Some(ip) = forwarded_ip(req, settings.trusted_ip_header.as_deref()) {
			client_ip = ip;
		}
		let origin = req.headers().get(ORIGIN).and_then(|v| v.to_str().ok());

		match room.check_admission(client_ip, origin, &counts) {
			Ok(()) => Ok(resp),
			Err(e) => Err(reject(&e)),
		}
	};

	let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%peer, error = %e, "websocket handshake failed");
			return;
		}
	};

	let (mut sink, mut stream) = ws.split();

	// The pre-upgrade check ran against a snapshot; registration is authoritative.
	let (handle, mut outbound) = match room.connect(client_ip).await {
		Ok(registered) => registered,
		Err(e) => {
			let close = Message::Close(Some(CloseFrame {
				code: CloseCode::Policy,
				reason: e.to_string().into(),
			}));
			let _ = tokio::time::timeout(settings.send_timeout, sink.send(close)).await;
			debug!(%peer, ip = %client_ip, error = %e, "connection refused after upgrade");
			return;
		}
	};
	let conn_id = handle.conn_id;
	drop(handle);
	info!(conn_id, %peer, ip = %client_ip, "connection opened");

	let send_timeout = settings.send_timeout;
	let mut writer = tokio::spawn(async move {
		while let Some(item) = outbound.recv().await {
			let (msg, closing) = match item {
				Outbound::Event(ev) => match encode_server_event(&ev) {
					Ok(text) => (Message::Text(text.into()), false),
					Err(e) => {
						warn!(conn_id, kind = ev.kind(), error = %e, "failed to encode server event");
						continue;
					}
				},
				Outbound::Close { reason } => (
					Message::Close(Some(CloseFrame {
						code: CloseCode::Normal,
						reason: reason.into(),
					})),
					true,
				),
			};

			match tokio::time::timeout(send_timeout, sink.send(msg)).await {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					debug!(conn_id, error = %e, "send failed");
					break;
				}
				Err(_) => {
					metrics::counter!("murmur_server_send_timeouts_total").increment(1);
					warn!(conn_id, "send timed out; closing connection");
					break;
				}
			}

			if closing {
				break;
			}
		}
		let _ = sink.close().await;
	});

	loop {
		tokio::select! {
			frame = stream.next() => match frame {
				Some(Ok(Message::Text(text))) => {
					metrics::counter!("murmur_server_frames_in_total").increment(1);
					match decode_client_event(text.as_str(), settings.max_frame_size) {
						Ok(ev) => {
							let _ = room.handle_event(conn_id, ev).await;
						}
						Err(e) => room.protocol_error(conn_id, &e.to_string()).await,
					}
				}
				Some(Ok(Message::Binary(_))) => room.protocol_error(conn_id, "binary frames are not supported").await,
				Some(Ok(Message::Close(_))) | None => break,
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(conn_id, error = %e, "read failed");
					break;
				}
			},
			_ = &mut writer => break,
		}
	}

	room.disconnect(conn_id).await;
	writer.abort();
	info!(conn_id, "connection closed");
}
