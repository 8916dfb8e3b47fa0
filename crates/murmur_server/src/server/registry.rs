#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use murmur_domain::SessionId;
use murmur_protocol::ServerEvent;
use tokio::sync::mpsc;

/// Items queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
	Event(ServerEvent),
	/// Ask the writer to send a close frame and stop.
	Close { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
	/// The peer's queue is full (slow consumer).
	Full,
	/// The writer task is gone.
	Closed,
}

/// Sending side of one transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	pub conn_id: u64,
	pub ip: IpAddr,
	tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
	pub fn new(conn_id: u64, ip: IpAddr, tx: mpsc::Sender<Outbound>) -> Self {
		Self { conn_id, ip, tx }
	}

	/// Create a handle together with the receiver its writer task drains.
	pub fn channel(conn_id: u64, ip: IpAddr, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self::new(conn_id, ip, tx), rx)
	}

	/// Non-blocking send.
	pub fn try_send(&self, item: Outbound) -> Result<(), SendFailure> {
		self.tx.try_send(item).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => SendFailure::Full,
			mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
		})
	}
}

/// Per-session bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
	pub ip: IpAddr,
	pub join_time: i64,
	pub message_count: u64,
	/// `0` until the first accepted message.
	pub last_message_time: i64,
	/// Accepted message times inside the trailing rate window, oldest first.
	pub recent_message_times: VecDeque<i64>,
}

impl SessionMeta {
	pub fn new(ip: IpAddr, join_time: i64) -> Self {
		Self {
			ip,
			join_time,
			message_count: 0,
			last_message_time: 0,
			recent_message_times: VecDeque::new(),
		}
	}

	/// Record an accepted message and drop window entries older than `window_ms`.
	pub fn record_message(&mut self, now_ms: i64, window_ms: i64) {
		self.message_count = self.message_count.saturating_add(1);
		self.last_message_time = now_ms;
		self.recent_message_times.push_back(now_ms);

		let threshold = now_ms.saturating_sub(window_ms);
		while let Some(front) = self.recent_message_times.front() {
			if *front <= threshold {
				self.recent_message_times.pop_front();
			} else {
				break;
			}
		}
	}
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
	pub handle: ConnectionHandle,
	pub meta: SessionMeta,
}

/// Live sessions keyed by id; at most one entry per id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
	/// Insert or replace; returns the displaced entry, if any.
	pub fn upsert(&mut self, session_id: SessionId, handle: ConnectionHandle, meta: SessionMeta) -> Option<SessionEntry> {
		self.sessions.insert(session_id, SessionEntry { handle, meta })
	}

	pub fn get(&self, session_id: &SessionId) -> Option<&SessionEntry> {
		self.sessions.get(session_id)
	}

	pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionEntry> {
		self.sessions.get_mut(session_id)
	}

	/// Whether `session_id` is currently bound to connection `conn_id`.
	pub fn is_bound_to(&self, session_id: &SessionId, conn_id: u64) -> bool {
		self.sessions
			.get(session_id)
			.is_some_and(|entry| entry.handle.conn_id == conn_id)
	}

	/// Remove the entry only if it still belongs to `conn_id`.
	pub fn remove_if_conn(&mut self, session_id: &SessionId, conn_id: u64) -> Option<SessionEntry> {
		if self.is_bound_to(session_id, conn_id) {
			self.sessions.remove(session_id)
		} else {
			None
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &SessionEntry)> {
		self.sessions.iter()
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}

/// Open connection count per network address, joined or not. Admission control only.
#[derive(Debug, Default)]
pub struct IpCounter {
	counts: HashMap<IpAddr, u32>,
}

impl IpCounter {
	pub fn count(&self, ip: &IpAddr) -> u32 {
		self.counts.get(ip).copied().unwrap_or(0)
	}

	pub fn increment(&mut self, ip: IpAddr) -> u32 {
		let c = self.counts.entry(ip).or_insert(0);
		*c = c.saturating_add(1);
		*c
	}

	/// Decrement, removing the entry at zero.
	pub fn decrement(&mut self, ip: &IpAddr) {
		match self.counts.get_mut(ip) {
			Some(c) if *c > 1 => *c -= 1,
			Some(_) => {
				self.counts.remove(ip);
			}
			None => {}
		}
	}

	pub fn snapshot(&self) -> HashMap<IpAddr, u32> {
		self.counts.clone()
	}
}
