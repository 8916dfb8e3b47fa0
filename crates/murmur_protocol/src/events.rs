#![forbid(unsafe_code)]

use murmur_domain::{ChatMessage, SessionId};
use serde::{Deserialize, Serialize};

/// Inbound events, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
	Join(JoinEvent),
	Message(MessageEvent),
	Edit(EditEvent),
	Typing(TypingEvent),
}

impl ClientEvent {
	/// Wire tag of this event.
	pub const fn kind(&self) -> &'static str {
		match self {
			ClientEvent::Join(_) => "join",
			ClientEvent::Message(_) => "message",
			ClientEvent::Edit(_) => "edit",
			ClientEvent::Typing(_) => "typing",
		}
	}

	/// Tags accepted by the decoder.
	pub const KINDS: [&'static str; 4] = ["join", "message", "edit", "typing"];
}

/// `join`: the server mints a session id when none (or an empty one) is given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEvent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default)]
	pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
	#[serde(default)]
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default)]
	pub timestamp: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub signature: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nickname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditEvent {
	#[serde(default)]
	pub message_id: String,
	#[serde(default)]
	pub new_content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default)]
	pub timestamp: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub signature: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default)]
	pub typing: bool,
}

/// Outbound events, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	/// A new message; the message fields sit next to `type`.
	Message(ChatMessage),
	MessageEdited {
		message: ChatMessage,
	},
	UserCount {
		count: usize,
	},
	Typing {
		#[serde(rename = "sessionId")]
		session_id: SessionId,
		typing: bool,
	},
	System {
		content: String,
	},
	Error {
		content: String,
	},
}

impl ServerEvent {
	pub fn system(content: impl Into<String>) -> Self {
		ServerEvent::System {
			content: content.into(),
		}
	}

	pub fn error(content: impl Into<String>) -> Self {
		ServerEvent::Error {
			content: content.into(),
		}
	}

	pub const fn kind(&self) -> &'static str {
		match self {
			ServerEvent::Message(_) => "message",
			ServerEvent::MessageEdited { .. } => "message_edited",
			ServerEvent::UserCount { .. } => "user_count",
			ServerEvent::Typing { .. } => "typing",
			ServerEvent::System { .. } => "system",
			ServerEvent::Error { .. } => "error",
		}
	}
}
