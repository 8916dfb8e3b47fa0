#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("identifier too long: {len} > {max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Upper bound for client-supplied identifiers.
pub const MAX_ID_LEN: usize = 128;

fn validate_id(id: &str) -> Result<(), ParseIdError> {
	if id.trim().is_empty() {
		return Err(ParseIdError::Empty);
	}
	if id.len() > MAX_ID_LEN {
		return Err(ParseIdError::TooLong {
			len: id.len(),
			max: MAX_ID_LEN,
		});
	}
	if id.chars().any(|c| c.is_control() || c.is_whitespace()) {
		return Err(ParseIdError::InvalidFormat("whitespace or control characters".into()));
	}
	Ok(())
}

/// Opaque anonymous session identifier.
///
/// Clients persist it locally and present it again on reconnect, so it is
/// accepted from the wire as long as it is well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
	/// Create a validated `SessionId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		validate_id(&id)?;
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionId::new(s.to_string())
	}
}

impl TryFrom<String> for SessionId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		SessionId::new(value)
	}
}

impl From<SessionId> for String {
	fn from(value: SessionId) -> Self {
		value.0
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
	/// Create a validated `MessageId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		validate_id(&id)?;
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::new(s.to_string())
	}
}

impl TryFrom<String> for MessageId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		MessageId::new(value)
	}
}

impl From<MessageId> for String {
	fn from(value: MessageId) -> Self {
		value.0
	}
}

/// A stored chat message, as broadcast to clients and kept in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
	pub message_id: MessageId,
	pub content: String,
	pub session_id: SessionId,
	/// Creation time (unix ms). Never changes after creation.
	pub timestamp: i64,
	/// Last edit time (unix ms); serialized as `null` until edited.
	pub edited_at: Option<i64>,
	/// Advisory display name supplied by the sender.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nickname: Option<String>,
	/// Lowercase hex HMAC over `(content, sessionId, timestamp)`.
	pub signature: String,
}

impl ChatMessage {
	pub fn is_owned_by(&self, session_id: &SessionId) -> bool {
		&self.session_id == session_id
	}
}
