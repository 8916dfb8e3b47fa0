#![forbid(unsafe_code)]

use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Default maximum size of one inbound text frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024; // 16 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("missing event type")]
	MissingType,

	#[error("unknown event type: {0}")]
	UnknownType(String),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Decode one inbound text frame into a `ClientEvent`.
///
/// Unknown or missing `type` tags are reported separately from malformed
/// payloads so callers can log them distinctly.
pub fn decode_client_event(text: &str, max_frame_size: usize) -> Result<ClientEvent, CodecError> {
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	let value: serde_json::Value = serde_json::from_str(text)?;
	let kind = match value.get("type") {
		Some(serde_json::Value::String(s)) => s.as_str(),
		_ => return Err(CodecError::MissingType),
	};

	if !ClientEvent::KINDS.contains(&kind) {
		return Err(CodecError::UnknownType(kind.to_string()));
	}

	Ok(serde_json::from_value(value)?)
}

/// Encode an outbound event as a JSON text frame.
pub fn encode_server_event(event: &ServerEvent) -> Result<String, CodecError> {
	Ok(serde_json::to_string(event)?)
}
