#![forbid(unsafe_code)]

//! Stateless policy checks consulted by the room on every inbound event.

use std::collections::HashSet;
use std::net::IpAddr;

use murmur_domain::{ChatMessage, SessionId};
use thiserror::Error;

use crate::server::registry::SessionMeta;

/// Content, rate and edit limits.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
	pub max_message_chars: usize,
	pub max_nickname_chars: usize,
	/// Minimum gap between two messages from one session.
	pub message_cooldown_ms: i64,
	/// Maximum accepted messages per session inside `rate_window_ms`.
	pub max_messages_per_window: u32,
	pub rate_window_ms: i64,
	/// Edits are accepted while `now - created_at < edit_window_ms`.
	pub edit_window_ms: i64,
}

impl Default for PolicyConfig {
	fn default() -> Self {
		Self {
			max_message_chars: 500,
			max_nickname_chars: 20,
			message_cooldown_ms: 1_000,
			max_messages_per_window: 30,
			rate_window_ms: 60_000,
			edit_window_ms: 10 * 60 * 1_000,
		}
	}
}

/// In-room validation failure. The display text is sent to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
	#[error("message content is empty")]
	EmptyContent,

	#[error("message can be at most {max} characters (got {len})")]
	ContentTooLong { len: usize, max: usize },

	#[error("nickname can be at most {max} characters (got {len})")]
	NicknameTooLong { len: usize, max: usize },

	#[error("sending messages too quickly; try again in {retry_after_ms} ms")]
	Cooldown { retry_after_ms: i64 },

	#[error("message rate limit exceeded ({max} messages per minute)")]
	RateLimited { max: u32 },

	#[error("you can only edit your own messages")]
	NotOwner,

	#[error("messages can only be edited within {window_minutes} minutes of sending")]
	EditWindowExpired { window_minutes: i64 },
}

/// Strip ASCII control characters (`\x00-\x1F`, `\x7F`) and trim.
pub fn sanitize_content(input: &str) -> String {
	input
		.chars()
		.filter(|c| !matches!(*c, '\u{0}'..='\u{1F}' | '\u{7F}'))
		.collect::<String>()
		.trim()
		.to_string()
}

/// Non-empty after trim and at most `max_message_chars` characters.
pub fn validate_content(content: &str, cfg: &PolicyConfig) -> Result<(), PolicyViolation> {
	if content.trim().is_empty() {
		return Err(PolicyViolation::EmptyContent);
	}

	let len = content.chars().count();
	if len > cfg.max_message_chars {
		return Err(PolicyViolation::ContentTooLong {
			len,
			max: cfg.max_message_chars,
		});
	}

	Ok(())
}

/// Nicknames are advisory display data; blank ones are treated as absent.
pub fn validate_nickname(nickname: Option<&str>, cfg: &PolicyConfig) -> Result<Option<String>, PolicyViolation> {
	let Some(nick) = nickname.map(sanitize_content).filter(|n| !n.is_empty()) else {
		return Ok(None);
	};

	let len = nick.chars().count();
	if len > cfg.max_nickname_chars {
		return Err(PolicyViolation::NicknameTooLong {
			len,
			max: cfg.max_nickname_chars,
		});
	}

	Ok(Some(nick))
}

/// Cooldown first, then the trailing-window cap.
pub fn check_rate(meta: &SessionMeta, now_ms: i64, cfg: &PolicyConfig) -> Result<(), PolicyViolation> {
	if meta.message_count > 0 {
		let elapsed = now_ms.saturating_sub(meta.last_message_time);
		if elapsed < cfg.message_cooldown_ms {
			return Err(PolicyViolation::Cooldown {
				retry_after_ms: cfg.message_cooldown_ms - elapsed,
			});
		}
	}

	let threshold = now_ms.saturating_sub(cfg.rate_window_ms);
	let in_window = meta.recent_message_times.iter().filter(|t| **t > threshold).count();
	if in_window >= cfg.max_messages_per_window as usize {
		return Err(PolicyViolation::RateLimited {
			max: cfg.max_messages_per_window,
		});
	}

	Ok(())
}

pub fn check_edit_ownership(message: &ChatMessage, requester: &SessionId) -> Result<(), PolicyViolation> {
	if message.is_owned_by(requester) {
		Ok(())
	} else {
		Err(PolicyViolation::NotOwner)
	}
}

/// Measured from the original creation time; reaching the window exactly counts as expired.
pub fn check_edit_window(created_at_ms: i64, now_ms: i64, cfg: &PolicyConfig) -> Result<(), PolicyViolation> {
	if now_ms.saturating_sub(created_at_ms) >= cfg.edit_window_ms {
		return Err(PolicyViolation::EditWindowExpired {
			window_minutes: cfg.edit_window_ms / 60_000,
		});
	}
	Ok(())
}

/// Connection-level rejection; answered with a plain HTTP status, never an in-room event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
	#[error("Unauthorized Origin")]
	UnauthorizedOrigin(String),

	#[error("Access Denied")]
	AccessDenied(IpAddr),

	#[error("Too many connections from this IP")]
	TooManyConnections { ip: IpAddr, max: u32 },
}

impl AdmissionError {
	pub fn status_code(&self) -> u16 {
		match self {
			AdmissionError::UnauthorizedOrigin(_) | AdmissionError::AccessDenied(_) => 403,
			AdmissionError::TooManyConnections { .. } => 429,
		}
	}
}

/// Origin and address rules applied before a connection is upgraded.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
	/// Origin prefixes; empty accepts any origin.
	pub allowed_origins: Vec<String>,
	pub denied_ips: HashSet<IpAddr>,
	/// When set, only these addresses may connect.
	pub allowed_ips: Option<HashSet<IpAddr>>,
	pub max_connections_per_ip: u32,
}

impl Default for AdmissionPolicy {
	fn default() -> Self {
		Self {
			allowed_origins: Vec::new(),
			denied_ips: HashSet::new(),
			allowed_ips: None,
			max_connections_per_ip: 5,
		}
	}
}

impl AdmissionPolicy {
	/// Requests without an `Origin` header (non-browser clients) pass.
	/// Loopback origins are always accepted for local development.
	pub fn check_origin(&self, origin: Option<&str>) -> Result<(), AdmissionError> {
		let Some(origin) = origin.map(str::trim).filter(|o| !o.is_empty()) else {
			return Ok(());
		};

		if self.allowed_origins.is_empty() {
			return Ok(());
		}

		let Ok(url) = url::Url::parse(origin) else {
			return Err(AdmissionError::UnauthorizedOrigin(origin.to_string()));
		};

		if matches!(url.host_str(), Some("localhost") | Some("127.0.0.1")) {
			return Ok(());
		}

		if self.allowed_origins.iter().any(|allowed| origin.starts_with(allowed.as_str())) {
			Ok(())
		} else {
			Err(AdmissionError::UnauthorizedOrigin(origin.to_string()))
		}
	}

	pub fn check_ip(&self, ip: IpAddr) -> Result<(), AdmissionError> {
		if self.denied_ips.contains(&ip) {
			return Err(AdmissionError::AccessDenied(ip));
		}

		if let Some(allowed) = &self.allowed_ips
			&& !allowed.contains(&ip)
		{
			return Err(AdmissionError::AccessDenied(ip));
		}

		Ok(())
	}

	/// Reject once `current` live connections from `ip` already reach the cap.
	pub fn check_capacity(&self, ip: IpAddr, current: u32) -> Result<(), AdmissionError> {
		if current >= self.max_connections_per_ip {
			return Err(AdmissionError::TooManyConnections {
				ip,
				max: self.max_connections_per_ip,
			});
		}
		Ok(())
	}
}
