#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use murmur_domain::{ChatMessage, MessageId, ParseIdError, SessionId};
use murmur_protocol::{ClientEvent, EditEvent, JoinEvent, MessageEvent, ServerEvent, TypingEvent};
use murmur_util::secret::SecretString;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::server::history::{HistoryBackend, HistoryWriter};
use crate::server::policy::{
	AdmissionError, AdmissionPolicy, PolicyConfig, PolicyViolation, check_edit_ownership, check_edit_window, check_rate,
	sanitize_content, validate_content, validate_nickname,
};
use crate::server::registry::{ConnectionHandle, IpCounter, Outbound, SendFailure, SessionMeta, SessionRegistry};
use crate::server::signature::{DEV_HMAC_SECRET, MessageSigner, mint_message_id, mint_session_id};
use crate::server::store::{MessageStore, MessageStoreConfig};
use crate::util::time::Clock;

/// Configuration for `Room`.
#[derive(Debug, Clone)]
pub struct RoomConfig {
	pub policy: PolicyConfig,
	pub store: MessageStoreConfig,
	pub admission: AdmissionPolicy,

	/// Number of stored messages replayed to a joining session.
	pub history_replay_count: usize,

	/// Sessions with neither a join nor a message inside this window are evicted by `cleanup`.
	pub inactivity_timeout_ms: i64,

	pub cleanup_interval: Duration,

	/// Maximum number of queued outbound items per connection.
	pub outbound_queue_capacity: usize,

	pub welcome_message: String,

	pub hmac_secret: SecretString,
}

impl Default for RoomConfig {
	fn default() -> Self {
		Self {
			policy: PolicyConfig::default(),
			store: MessageStoreConfig::default(),
			admission: AdmissionPolicy::default(),
			history_replay_count: 50,
			inactivity_timeout_ms: 5 * 60 * 1_000,
			cleanup_interval: Duration::from_secs(60),
			outbound_queue_capacity: 256,
			welcome_message: "You joined the room.".to_string(),
			hmac_secret: SecretString::new(DEV_HMAC_SECRET),
		}
	}
}

/// In-room failure for one inbound event. The display text becomes the `error` event content.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
	#[error("connection is closed")]
	ConnectionClosed,

	#[error("join the room before sending {0} events")]
	NotJoined(&'static str),

	#[error("this connection already joined as {0}")]
	AlreadyJoined(SessionId),

	#[error("invalid session id: {0}")]
	InvalidSessionId(String),

	#[error("session id does not match this connection")]
	SessionMismatch,

	#[error("message signature verification failed")]
	InvalidSignature,

	#[error("message not found")]
	MessageNotFound,

	#[error("could not mint identifier: {0}")]
	Mint(ParseIdError),

	#[error("invalid event: {0}")]
	Protocol(String),

	#[error(transparent)]
	Policy(#[from] PolicyViolation),
}

/// Process-wide counters read by the metrics endpoint.
#[derive(Debug, Default)]
pub struct RoomStats {
	active_connections: AtomicU64,
	total_connections: AtomicU64,
	participants: AtomicU64,
	total_messages: AtomicU64,
	errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoomStatsSnapshot {
	pub active_connections: u64,
	pub total_connections: u64,
	pub participants: u64,
	pub total_messages: u64,
	pub errors: u64,
}

impl RoomStats {
	pub fn snapshot(&self) -> RoomStatsSnapshot {
		RoomStatsSnapshot {
			active_connections: self.active_connections.load(Ordering::Relaxed),
			total_connections: self.total_connections.load(Ordering::Relaxed),
			participants: self.participants.load(Ordering::Relaxed),
			total_messages: self.total_messages.load(Ordering::Relaxed),
			errors: self.errors.load(Ordering::Relaxed),
		}
	}
}

/// Result of one `cleanup` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
	pub evicted: Vec<SessionId>,
	/// Connections closed for never joining within the inactivity timeout.
	pub closed_unjoined: usize,
	pub pruned: bool,
}

#[derive(Debug)]
struct ConnState {
	handle: ConnectionHandle,
	connected_at: i64,
	/// `None` until a successful join (or after the session was taken over).
	session: Option<SessionId>,
}

#[derive(Debug)]
struct RoomState {
	connections: HashMap<u64, ConnState>,
	registry: SessionRegistry,
	typing: HashSet<SessionId>,
	ip_counter: IpCounter,
	store: MessageStore,
}

impl RoomState {
	fn bound_session(&self, conn_id: u64, kind: &'static str) -> Result<SessionId, RoomError> {
		let conn = self.connections.get(&conn_id).ok_or(RoomError::ConnectionClosed)?;
		match &conn.session {
			Some(sid) if self.registry.is_bound_to(sid, conn_id) => Ok(sid.clone()),
			_ => Err(RoomError::NotJoined(kind)),
		}
	}

	fn unicast(&self, conn_id: u64, event: ServerEvent) {
		if let Some(conn) = self.connections.get(&conn_id) {
			deliver(&conn.handle, Outbound::Event(event));
		}
	}

	/// Send to every joined session except `exclude`.
	fn broadcast(&self, event: &ServerEvent, exclude: Option<&SessionId>) {
		for (sid, entry) in self.registry.iter() {
			if exclude.is_some_and(|ex| ex == sid) {
				continue;
			}
			deliver(&entry.handle, Outbound::Event(event.clone()));
		}
	}

	fn broadcast_user_count(&self) {
		self.broadcast(
			&ServerEvent::UserCount {
				count: self.registry.len(),
			},
			None,
		);
	}

	/// Remove a connection and give back its address slot.
	fn drop_connection(&mut self, conn_id: u64) -> Option<ConnState> {
		let conn = self.connections.remove(&conn_id)?;
		self.ip_counter.decrement(&conn.handle.ip);
		Some(conn)
	}

	/// Clear `sid` from the typing set, telling the others if it was set.
	fn clear_typing(&mut self, sid: &SessionId) {
		if self.typing.remove(sid) {
			self.broadcast(
				&ServerEvent::Typing {
					session_id: sid.clone(),
					typing: false,
				},
				Some(sid),
			);
		}
	}

	/// Drop the registry entry for `sid` if `conn_id` still owns it.
	fn release_session(&mut self, sid: &SessionId, conn_id: u64) -> bool {
		if self.registry.remove_if_conn(sid, conn_id).is_none() {
			return false;
		}
		self.clear_typing(sid);
		true
	}
}

/// Best-effort send; failures are logged and never remove the session.
fn deliver(handle: &ConnectionHandle, item: Outbound) {
	match handle.try_send(item) {
		Ok(()) => {}
		Err(SendFailure::Full) => {
			metrics::counter!("murmur_server_outbound_dropped_total").increment(1);
			debug!(conn_id = handle.conn_id, "room: outbound queue full; dropped event");
		}
		Err(SendFailure::Closed) => {
			debug!(conn_id = handle.conn_id, "room: outbound queue closed");
		}
	}
}

/// The single chat room. All state mutations are serialized behind one lock.
#[derive(Debug, Clone)]
pub struct Room {
	inner: Arc<Mutex<RoomState>>,
	cfg: Arc<RoomConfig>,
	signer: MessageSigner,
	clock: Arc<dyn Clock>,
	history: HistoryWriter,
	stats: Arc<RoomStats>,
	next_conn_id: Arc<AtomicU64>,
}

impl Room {
	/// Load persisted history and start the background writer.
	///
	/// Failing to read the backend is fatal for the caller.
	pub async fn open(cfg: RoomConfig, backend: Arc<dyn HistoryBackend>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
		let loaded = backend.load().await.context("load message history")?;
		let loaded_len = loaded.len();
		let store = MessageStore::with_messages(cfg.store.clone(), loaded, clock.now_ms());

		let signer = MessageSigner::new(cfg.hmac_secret.clone())
			.map_err(|e| anyhow::anyhow!("initialize message signer: {e}"))?;
		if signer.is_dev_secret() {
			warn!("room: using the built-in development HMAC secret; set security.hmac_secret in production");
		}

		let history = HistoryWriter::spawn(backend);
		if store.len() != loaded_len {
			history.persist(store.snapshot());
		}

		info!(restored = store.len(), pruned = loaded_len - store.len(), "room: history loaded");

		Ok(Self {
			inner: Arc::new(Mutex::new(RoomState {
				connections: HashMap::new(),
				registry: SessionRegistry::default(),
				typing: HashSet::new(),
				ip_counter: IpCounter::default(),
				store,
			})),
			cfg: Arc::new(cfg),
			signer,
			clock,
			history,
			stats: Arc::new(RoomStats::default()),
			next_conn_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub fn config(&self) -> &RoomConfig {
		&self.cfg
	}

	pub fn signer(&self) -> &MessageSigner {
		&self.signer
	}

	pub fn stats(&self) -> Arc<RoomStats> {
		Arc::clone(&self.stats)
	}

	/// Connection admission: origin, address lists, then the per-address cap.
	pub async fn admit(&self, ip: IpAddr, origin: Option<&str>) -> Result<(), AdmissionError> {
		let counts = self.ip_counts().await;
		self.check_admission(ip, origin, &counts)
	}

	/// Open connections per address, for the pre-upgrade check outside the room lock.
	pub async fn ip_counts(&self) -> HashMap<IpAddr, u32> {
		self.inner.lock().await.ip_counter.snapshot()
	}

	/// Synchronous form of `admit` against a count snapshot; used from the upgrade callback.
	pub fn check_admission(
		&self,
		ip: IpAddr,
		origin: Option<&str>,
		counts: &HashMap<IpAddr, u32>,
	) -> Result<(), AdmissionError> {
		let admission = &self.cfg.admission;
		let res = admission
			.check_origin(origin)
			.and_then(|()| admission.check_ip(ip))
			.and_then(|()| admission.check_capacity(ip, counts.get(&ip).copied().unwrap_or(0)));

		if let Err(e) = &res {
			metrics::counter!("murmur_server_admission_rejected_total").increment(1);
			warn!(%ip, origin = origin.unwrap_or(""), error = %e, "room: connection rejected");
		}
		res
	}

	/// Register an accepted transport connection in the `UNJOINED` state.
	///
	/// The per-address slot is checked and taken under the room lock, so
	/// concurrent upgrades from one address cannot exceed the cap. It is held
	/// until `disconnect` or a `cleanup` eviction.
	pub async fn connect(&self, ip: IpAddr) -> Result<(ConnectionHandle, mpsc::Receiver<Outbound>), AdmissionError> {
		let mut st = self.inner.lock().await;
		if let Err(e) = self.cfg.admission.check_capacity(ip, st.ip_counter.count(&ip)) {
			metrics::counter!("murmur_server_admission_rejected_total").increment(1);
			warn!(%ip, error = %e, "room: connection rejected at registration");
			return Err(e);
		}

		let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let (handle, rx) = ConnectionHandle::channel(conn_id, ip, self.cfg.outbound_queue_capacity);
		st.ip_counter.increment(ip);
		st.connections.insert(
			conn_id,
			ConnState {
				handle: handle.clone(),
				connected_at: self.clock.now_ms(),
				session: None,
			},
		);

		self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
		self.sync_connection_gauges(&st);
		debug!(conn_id, %ip, "room: connection registered");

		Ok((handle, rx))
	}

	/// Process one inbound event. Validation failures are answered with a unicast
	/// `error` event and also returned.
	pub async fn handle_event(&self, conn_id: u64, event: ClientEvent) -> Result<(), RoomError> {
		let mut st = self.inner.lock().await;
		let now = self.clock.now_ms();
		let kind = event.kind();

		let res = match event {
			ClientEvent::Join(ev) => self.on_join(&mut st, conn_id, ev, now),
			ClientEvent::Message(ev) => self.on_message(&mut st, conn_id, ev, now),
			ClientEvent::Edit(ev) => self.on_edit(&mut st, conn_id, ev, now),
			ClientEvent::Typing(ev) => {
				self.on_typing(&mut st, conn_id, ev);
				Ok(())
			}
		};

		if let Err(e) = &res {
			self.stats.errors.fetch_add(1, Ordering::Relaxed);
			metrics::counter!("murmur_server_event_errors_total").increment(1);
			debug!(conn_id, kind, error = %e, "room: event rejected");
			st.unicast(conn_id, ServerEvent::error(e.to_string()));
		}

		res
	}

	/// Report an undecodable frame. Only bound sessions get an `error` reply.
	pub async fn protocol_error(&self, conn_id: u64, detail: &str) {
		let st = self.inner.lock().await;
		self.stats.errors.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("murmur_server_protocol_errors_total").increment(1);
		warn!(conn_id, detail, "room: protocol error");

		if st.bound_session(conn_id, "any").is_ok() {
			st.unicast(
				conn_id,
				ServerEvent::error(RoomError::Protocol(detail.to_string()).to_string()),
			);
		}
	}

	/// Tear down a connection. Returns `false` when it was already gone.
	pub async fn disconnect(&self, conn_id: u64) -> bool {
		let mut st = self.inner.lock().await;
		let Some(conn) = st.drop_connection(conn_id) else {
			return false;
		};

		if let Some(sid) = conn.session
			&& st.release_session(&sid, conn_id)
		{
			info!(conn_id, session_id = %sid, "room: session left");
			st.broadcast_user_count();
		}

		self.sync_connection_gauges(&st);
		true
	}

	/// Evict idle sessions, close connections that never joined, and re-apply retention.
	pub async fn cleanup(&self) -> CleanupReport {
		let mut st = self.inner.lock().await;
		let now = self.clock.now_ms();
		let timeout = self.cfg.inactivity_timeout_ms;
		let mut report = CleanupReport::default();

		let unjoined = st
			.connections
			.iter()
			.filter(|(_, conn)| conn.session.is_none() && now.saturating_sub(conn.connected_at) > timeout)
			.map(|(conn_id, _)| *conn_id)
			.collect::<Vec<_>>();

		for conn_id in unjoined {
			if let Some(conn) = st.drop_connection(conn_id) {
				deliver(
					&conn.handle,
					Outbound::Close {
						reason: "inactive".to_string(),
					},
				);
				debug!(conn_id, "room: closed connection that never joined");
				report.closed_unjoined += 1;
			}
		}

		let idle = st
			.registry
			.iter()
			.filter(|(_, entry)| {
				now.saturating_sub(entry.meta.join_time) > timeout
					&& now.saturating_sub(entry.meta.last_message_time) > timeout
			})
			.map(|(sid, entry)| (sid.clone(), entry.handle.conn_id))
			.collect::<Vec<_>>();

		for (sid, conn_id) in idle {
			if let Some(conn) = st.drop_connection(conn_id) {
				deliver(
					&conn.handle,
					Outbound::Close {
						reason: "inactive".to_string(),
					},
				);
			}
			if st.release_session(&sid, conn_id) {
				info!(conn_id, session_id = %sid, "room: evicted inactive session");
				report.evicted.push(sid);
			}
		}

		if !report.evicted.is_empty() {
			metrics::counter!("murmur_server_sessions_evicted_total").increment(report.evicted.len() as u64);
			st.broadcast_user_count();
		}
		if !report.evicted.is_empty() || report.closed_unjoined > 0 {
			self.sync_connection_gauges(&st);
		}

		report.pruned = st.store.prune(now);
		if report.pruned {
			self.history.persist(st.store.snapshot());
		}

		report
	}

	/// Run `cleanup` on a fixed interval until the runtime shuts down.
	pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
		let room = self.clone();
		let period = self.cfg.cleanup_interval.max(Duration::from_millis(10));

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker.tick().await;

			loop {
				ticker.tick().await;
				let report = room.cleanup().await;
				if !report.evicted.is_empty() || report.closed_unjoined > 0 || report.pruned {
					debug!(
						evicted = report.evicted.len(),
						closed_unjoined = report.closed_unjoined,
						pruned = report.pruned,
						"room: cleanup pass"
					);
				}
			}
		})
	}

	pub async fn participant_count(&self) -> usize {
		self.inner.lock().await.registry.len()
	}

	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.store.len()
	}

	pub async fn recent_messages(&self, n: usize) -> Vec<ChatMessage> {
		self.inner.lock().await.store.recent(n)
	}

	/// Session currently bound to `conn_id`, if joined.
	pub async fn session_for(&self, conn_id: u64) -> Option<SessionId> {
		self.inner.lock().await.bound_session(conn_id, "any").ok()
	}

	pub async fn typing_sessions(&self) -> HashSet<SessionId> {
		self.inner.lock().await.typing.clone()
	}

	fn sync_connection_gauges(&self, st: &RoomState) {
		let active = st.connections.len() as u64;
		let participants = st.registry.len() as u64;
		self.stats.active_connections.store(active, Ordering::Relaxed);
		self.stats.participants.store(participants, Ordering::Relaxed);
		metrics::gauge!("murmur_server_active_connections").set(active as f64);
		metrics::gauge!("murmur_server_participants").set(participants as f64);
	}

	fn on_join(&self, st: &mut RoomState, conn_id: u64, ev: JoinEvent, now: i64) -> Result<(), RoomError> {
		let conn = st.connections.get(&conn_id).ok_or(RoomError::ConnectionClosed)?;
		if let Some(existing) = &conn.session {
			return Err(RoomError::AlreadyJoined(existing.clone()));
		}
		let handle = conn.handle.clone();

		let sid = match ev.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
			Some(raw) => SessionId::new(raw).map_err(|e| RoomError::InvalidSessionId(e.to_string()))?,
			None => mint_session_id(now).map_err(RoomError::Mint)?,
		};

		let ip = handle.ip;
		if let Some(displaced) = st.registry.upsert(sid.clone(), handle, SessionMeta::new(ip, now)) {
			let old_conn = displaced.handle.conn_id;
			deliver(
				&displaced.handle,
				Outbound::Close {
					reason: "session replaced".to_string(),
				},
			);
			st.clear_typing(&sid);
			if let Some(old) = st.connections.get_mut(&old_conn) {
				old.session = None;
			}
			info!(conn_id, old_conn, session_id = %sid, "room: session taken over by new connection");
		}

		if let Some(conn) = st.connections.get_mut(&conn_id) {
			conn.session = Some(sid.clone());
		}
		self.sync_connection_gauges(st);

		info!(conn_id, session_id = %sid, %ip, participants = st.registry.len(), "room: session joined");

		st.broadcast_user_count();
		st.unicast(conn_id, ServerEvent::system(self.cfg.welcome_message.clone()));
		for msg in st.store.recent(self.cfg.history_replay_count) {
			st.unicast(conn_id, ServerEvent::Message(msg));
		}

		Ok(())
	}

	/// Signature (when supplied) is checked against the declared session id, then the
	/// declared id must match the bound one.
	fn check_declared(
		&self,
		bound: &SessionId,
		declared: Option<&str>,
		content: &str,
		timestamp: i64,
		signature: Option<&str>,
	) -> Result<(), RoomError> {
		if let Some(sig) = signature {
			let signed_as = declared.unwrap_or(bound.as_str());
			if !self.signer.verify(content, signed_as, timestamp, sig) {
				metrics::counter!("murmur_server_signature_failures_total").increment(1);
				warn!(session_id = %bound, "room: invalid event signature");
				return Err(RoomError::InvalidSignature);
			}
		}

		if let Some(declared) = declared
			&& declared != bound.as_str()
		{
			warn!(session_id = %bound, declared, "room: session id mismatch");
			return Err(RoomError::SessionMismatch);
		}

		Ok(())
	}

	fn on_message(&self, st: &mut RoomState, conn_id: u64, ev: MessageEvent, now: i64) -> Result<(), RoomError> {
		let sid = st.bound_session(conn_id, "message")?;
		self.check_declared(
			&sid,
			ev.session_id.as_deref(),
			&ev.content,
			ev.timestamp,
			ev.signature.as_deref(),
		)?;

		let policy = &self.cfg.policy;
		let content = sanitize_content(&ev.content);
		validate_content(&content, policy)?;
		let nickname = validate_nickname(ev.nickname.as_deref(), policy)?;

		let entry = st.registry.get_mut(&sid).ok_or(RoomError::NotJoined("message"))?;
		if let Err(e) = check_rate(&entry.meta, now, policy) {
			metrics::counter!("murmur_server_rate_limited_total").increment(1);
			return Err(e.into());
		}
		entry.meta.record_message(now, policy.rate_window_ms);

		let message = ChatMessage {
			message_id: mint_message_id(now).map_err(RoomError::Mint)?,
			signature: self.signer.sign(&content, sid.as_str(), now),
			content,
			session_id: sid.clone(),
			timestamp: now,
			edited_at: None,
			nickname,
		};

		st.store.append(message.clone(), now);
		self.history.persist(st.store.snapshot());

		self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("murmur_server_messages_total").increment(1);
		debug!(conn_id, session_id = %sid, message_id = %message.message_id, "room: message accepted");

		st.broadcast(&ServerEvent::Message(message), None);
		Ok(())
	}

	fn on_edit(&self, st: &mut RoomState, conn_id: u64, ev: EditEvent, now: i64) -> Result<(), RoomError> {
		let sid = st.bound_session(conn_id, "edit")?;
		self.check_declared(
			&sid,
			ev.session_id.as_deref(),
			&ev.new_content,
			ev.timestamp,
			ev.signature.as_deref(),
		)?;

		let message_id = MessageId::new(ev.message_id).map_err(|_| RoomError::MessageNotFound)?;
		let original = st.store.get(&message_id).ok_or(RoomError::MessageNotFound)?;

		if let Err(e) = check_edit_ownership(original, &sid) {
			warn!(
				session_id = %sid,
				owner = %original.session_id,
				message_id = %message_id,
				"room: edit attempt on another session's message"
			);
			return Err(e.into());
		}

		let policy = &self.cfg.policy;
		check_edit_window(original.timestamp, now, policy)?;

		let content = sanitize_content(&ev.new_content);
		validate_content(&content, policy)?;

		let signature = self.signer.sign(&content, sid.as_str(), original.timestamp);
		let edited = st
			.store
			.edit(&message_id, content, now, signature)
			.cloned()
			.ok_or(RoomError::MessageNotFound)?;

		self.history.persist(st.store.snapshot());
		metrics::counter!("murmur_server_edits_total").increment(1);
		debug!(conn_id, session_id = %sid, message_id = %message_id, "room: message edited");

		st.broadcast(&ServerEvent::MessageEdited { message: edited }, None);
		Ok(())
	}

	/// Silently ignored for connections without a bound session.
	fn on_typing(&self, st: &mut RoomState, conn_id: u64, ev: TypingEvent) {
		let Ok(sid) = st.bound_session(conn_id, "typing") else {
			return;
		};

		if ev.typing {
			st.typing.insert(sid.clone());
		} else {
			st.typing.remove(&sid);
		}

		st.broadcast(
			&ServerEvent::Typing {
				session_id: sid.clone(),
				typing: ev.typing,
			},
			Some(&sid),
		);
	}
}
