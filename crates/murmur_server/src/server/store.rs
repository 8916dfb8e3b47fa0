#![forbid(unsafe_code)]

use std::collections::VecDeque;

use murmur_domain::{ChatMessage, MessageId};

#[derive(Debug, Clone)]
pub struct MessageStoreConfig {
	/// Messages older than this are pruned.
	pub retention_ms: i64,
	pub max_messages: usize,
}

impl Default for MessageStoreConfig {
	fn default() -> Self {
		Self {
			retention_ms: 12 * 60 * 60 * 1_000,
			max_messages: 500,
		}
	}
}

/// Bounded message log in insertion (display) order.
#[derive(Debug, Default)]
pub struct MessageStore {
	messages: VecDeque<ChatMessage>,
	cfg: MessageStoreConfig,
}

impl MessageStore {
	pub fn new(cfg: MessageStoreConfig) -> Self {
		Self {
			messages: VecDeque::new(),
			cfg,
		}
	}

	/// Restore from durable storage, pruned against `now_ms`.
	pub fn with_messages(cfg: MessageStoreConfig, messages: Vec<ChatMessage>, now_ms: i64) -> Self {
		let mut store = Self {
			messages: messages.into(),
			cfg,
		};
		store.prune(now_ms);
		store
	}

	/// Append and prune.
	pub fn append(&mut self, message: ChatMessage, now_ms: i64) {
		self.messages.push_back(message);
		self.prune(now_ms);
	}

	pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
		self.messages.iter().find(|m| &m.message_id == id)
	}

	/// Replace content in place; id, owner and creation time are preserved.
	pub fn edit(
		&mut self,
		id: &MessageId,
		content: String,
		edited_at_ms: i64,
		signature: String,
	) -> Option<&ChatMessage> {
		let msg = self.messages.iter_mut().find(|m| &m.message_id == id)?;
		msg.content = content;
		msg.edited_at = Some(edited_at_ms);
		msg.signature = signature;
		Some(msg)
	}

	/// Drop entries at or past the retention cutoff, then the oldest beyond the cap.
	/// Returns whether anything was removed.
	pub fn prune(&mut self, now_ms: i64) -> bool {
		let before = self.messages.len();
		let threshold = now_ms.saturating_sub(self.cfg.retention_ms);
		self.messages.retain(|m| m.timestamp > threshold);

		while self.messages.len() > self.cfg.max_messages {
			self.messages.pop_front();
		}

		self.messages.len() != before
	}

	/// The newest `n` messages, oldest first.
	pub fn recent(&self, n: usize) -> Vec<ChatMessage> {
		let skip = self.messages.len().saturating_sub(n);
		self.messages.iter().skip(skip).cloned().collect()
	}

	pub fn snapshot(&self) -> Vec<ChatMessage> {
		self.messages.iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.messages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}
}
