#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::room::RoomStats;
use crate::util::time::unix_ms_now;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	stats: Arc<RoomStats>,
}

impl HealthState {
	pub fn new(stats: Arc<RoomStats>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			stats,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsBody {
	timestamp: i64,
	active_connections: u64,
	total_messages: u64,
	participants: u64,
	total_connections: u64,
	errors: u64,
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "health server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (status, content_type, body) = route(req.method(), req.uri().path(), &state);

	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	if let Some(ct) = content_type {
		resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(ct));
	}
	Ok(resp)
}

fn route(method: &Method, path: &str, state: &HealthState) -> (StatusCode, Option<&'static str>, Bytes) {
	const JSON: Option<&str> = Some("application/json");

	if method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
	}

	match path {
		"/health" | "/healthz" => (
			StatusCode::OK,
			JSON,
			Bytes::from_static(br#"{"status":"healthy"}"#),
		),
		"/readyz" => {
			if state.is_ready() {
				(StatusCode::OK, None, Bytes::from_static(b"ready"))
			} else {
				(StatusCode::SERVICE_UNAVAILABLE, None, Bytes::from_static(b"not-ready"))
			}
		}
		"/metrics" => {
			let s = state.stats.snapshot();
			let body = MetricsBody {
				timestamp: unix_ms_now(),
				active_connections: s.active_connections,
				total_messages: s.total_messages,
				participants: s.participants,
				total_connections: s.total_connections,
				errors: s.errors,
			};
			match serde_json::to_vec(&body) {
				Ok(bytes) => (StatusCode::OK, JSON, Bytes::from(bytes)),
				Err(err) => {
					warn!(error = %err, "failed to encode metrics body");
					(StatusCode::INTERNAL_SERVER_ERROR, None, Bytes::new())
				}
			}
		}
		_ => (StatusCode::NOT_FOUND, None, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn health_reports_static_marker() {
		let state = HealthState::default();
		let (status, ct, body) = route(&Method::GET, "/health", &state);
		assert_eq!(status, StatusCode::OK);
		assert_eq!(ct, Some("application/json"));
		assert_eq!(&body[..], br#"{"status":"healthy"}"#);
	}

	#[test]
	fn readiness_follows_flag() {
		let state = HealthState::default();
		assert_eq!(route(&Method::GET, "/readyz", &state).0, StatusCode::SERVICE_UNAVAILABLE);
		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).0, StatusCode::OK);
	}

	#[test]
	fn metrics_body_has_aggregate_counters() {
		let state = HealthState::default();
		let (status, _, body) = route(&Method::GET, "/metrics", &state);
		assert_eq!(status, StatusCode::OK);

		let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(v["activeConnections"], 0);
		assert_eq!(v["totalMessages"], 0);
		assert!(v["timestamp"].as_i64().unwrap() > 0);
	}

	#[test]
	fn non_get_and_unknown_paths() {
		let state = HealthState::default();
		assert_eq!(route(&Method::POST, "/health", &state).0, StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/nope", &state).0, StatusCode::NOT_FOUND);
	}
}
