#![forbid(unsafe_code)]

use std::fmt;

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use murmur_domain::{MessageId, ParseIdError, SessionId};
use murmur_util::secret::SecretString;
use sha2::Sha256;

/// Secret used when none is configured. Only fit for local development.
pub const DEV_HMAC_SECRET: &str = "murmur-dev-secret-change-me";

/// Canonical signed payload: `{"content":…,"sessionId":…,"timestamp":…}`, keys in that order.
fn canonical_payload(content: &str, session_id: &str, timestamp: i64) -> String {
	serde_json::json!({
		"content": content,
		"sessionId": session_id,
		"timestamp": timestamp,
	})
	.to_string()
}

/// Computes and verifies message signatures with a server-held secret.
#[derive(Clone)]
pub struct MessageSigner {
	secret: SecretString,
	mac: Hmac<Sha256>,
}

impl fmt::Debug for MessageSigner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MessageSigner").field("secret", &self.secret).finish_non_exhaustive()
	}
}

impl MessageSigner {
	pub fn new(secret: SecretString) -> Result<Self, InvalidLength> {
		let mac = Hmac::<Sha256>::new_from_slice(secret.expose().as_bytes())?;
		Ok(Self { secret, mac })
	}

	pub fn is_dev_secret(&self) -> bool {
		self.secret.expose() == DEV_HMAC_SECRET
	}

	/// Lowercase hex HMAC-SHA256 over `(content, sessionId, timestamp)`.
	pub fn sign(&self, content: &str, session_id: &str, timestamp: i64) -> String {
		hex::encode(self.tag(content, session_id, timestamp))
	}

	/// Recomputes the tag and compares it to `signature_hex` in constant time.
	pub fn verify(&self, content: &str, session_id: &str, timestamp: i64, signature_hex: &str) -> bool {
		let Ok(provided) = hex::decode(signature_hex.trim()) else {
			return false;
		};
		let expected = self.tag(content, session_id, timestamp);
		constant_time_eq(&expected, &provided)
	}

	fn tag(&self, content: &str, session_id: &str, timestamp: i64) -> Vec<u8> {
		let mut mac = self.mac.clone();
		mac.update(canonical_payload(content, session_id, timestamp).as_bytes());
		mac.finalize().into_bytes().to_vec()
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Mint a session id: `user_<128 random bits as hex>_<base36 ms>`.
pub fn mint_session_id(now_ms: i64) -> Result<SessionId, ParseIdError> {
	let random: u128 = rand::random();
	SessionId::new(format!("user_{random:032x}_{}", to_base36(now_ms.max(0) as u64)))
}

/// Mint a message id: `msg_<ms>_<uuid v4>`.
pub fn mint_message_id(now_ms: i64) -> Result<MessageId, ParseIdError> {
	MessageId::new(format!("msg_{now_ms}_{}", uuid::Uuid::new_v4().simple()))
}

fn to_base36(mut n: u64) -> String {
	const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
	if n == 0 {
		return "0".to_string();
	}

	let mut out = Vec::new();
	while n > 0 {
		out.push(DIGITS[(n % 36) as usize]);
		n /= 36;
	}
	out.reverse();
	String::from_utf8(out).unwrap_or_default()
}
