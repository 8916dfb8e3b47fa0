#![forbid(unsafe_code)]

pub mod codec;
pub mod events;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode_client_event, encode_server_event};
pub use events::{ClientEvent, EditEvent, JoinEvent, MessageEvent, ServerEvent, TypingEvent};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
