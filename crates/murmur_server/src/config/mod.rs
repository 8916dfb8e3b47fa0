#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use murmur_protocol::DEFAULT_MAX_FRAME_SIZE;
use murmur_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;
use crate::server::policy::{AdmissionPolicy, PolicyConfig};
use crate::server::room::RoomConfig;
use crate::server::signature::DEV_HMAC_SECRET;
use crate::server::store::MessageStoreConfig;

/// Default config path: `~/.murmur/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".murmur").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub room: RoomSettings,
	pub security: SecuritySettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Header carrying the real client address behind a proxy.
	pub trusted_ip_header: Option<String>,
	pub outbound_queue_capacity: usize,
	pub send_timeout: Duration,
	pub max_frame_size: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			health_bind: None,
			metrics_bind: None,
			trusted_ip_header: None,
			outbound_queue_capacity: 256,
			send_timeout: Duration::from_secs(5),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
	pub max_message_chars: usize,
	pub max_nickname_chars: usize,
	pub message_cooldown_ms: u64,
	pub max_messages_per_minute: u32,
	pub edit_window_minutes: u64,
	pub retention_hours: u64,
	pub max_messages: usize,
	pub history_replay_count: usize,
	pub inactivity_timeout: Duration,
	pub cleanup_interval: Duration,
	pub welcome_message: Option<String>,
}

impl Default for RoomSettings {
	fn default() -> Self {
		Self {
			max_message_chars: 500,
			max_nickname_chars: 20,
			message_cooldown_ms: 1_000,
			max_messages_per_minute: 30,
			edit_window_minutes: 10,
			retention_hours: 12,
			max_messages: 500,
			history_replay_count: 50,
			inactivity_timeout: Duration::from_secs(5 * 60),
			cleanup_interval: Duration::from_secs(60),
			welcome_message: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SecuritySettings {
	/// HMAC secret for message signatures. Falls back to a development secret.
	pub hmac_secret: Option<SecretString>,
	pub allowed_origins: Vec<String>,
	pub denied_ips: Vec<String>,
	/// Empty means any address may connect.
	pub allowed_ips: Vec<String>,
	pub max_connections_per_ip: u32,
}

impl Default for SecuritySettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			allowed_origins: Vec::new(),
			denied_ips: Vec::new(),
			allowed_ips: Vec::new(),
			max_connections_per_ip: 5,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	room: FileRoomSettings,

	#[serde(default)]
	security: FileSecuritySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	trusted_ip_header: Option<String>,
	outbound_queue_capacity: Option<usize>,
	send_timeout_ms: Option<u64>,
	max_frame_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRoomSettings {
	max_message_chars: Option<usize>,
	max_nickname_chars: Option<usize>,
	message_cooldown_ms: Option<u64>,
	max_messages_per_minute: Option<u32>,
	edit_window_minutes: Option<u64>,
	retention_hours: Option<u64>,
	max_messages: Option<usize>,
	history_replay_count: Option<usize>,
	inactivity_timeout_secs: Option<u64>,
	cleanup_interval_secs: Option<u64>,
	welcome_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSecuritySettings {
	hmac_secret: Option<String>,
	#[serde(default)]
	allowed_origins: Vec<String>,
	#[serde(default)]
	denied_ips: Vec<String>,
	#[serde(default)]
	allowed_ips: Vec<String>,
	max_connections_per_ip: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_blank(list: Vec<String>) -> Vec<String> {
	list.into_iter()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.collect()
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let sd = ServerSettings::default();
		let rd = RoomSettings::default();
		let secd = SecuritySettings::default();

		Self {
			server: ServerSettings {
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				trusted_ip_header: file.server.trusted_ip_header.filter(|s| !s.trim().is_empty()),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(sd.outbound_queue_capacity),
				send_timeout: file
					.server
					.send_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(sd.send_timeout),
				max_frame_size: file.server.max_frame_size.filter(|v| *v > 0).unwrap_or(sd.max_frame_size),
			},
			room: RoomSettings {
				max_message_chars: file.room.max_message_chars.unwrap_or(rd.max_message_chars),
				max_nickname_chars: file.room.max_nickname_chars.unwrap_or(rd.max_nickname_chars),
				message_cooldown_ms: file.room.message_cooldown_ms.unwrap_or(rd.message_cooldown_ms),
				max_messages_per_minute: file.room.max_messages_per_minute.unwrap_or(rd.max_messages_per_minute),
				edit_window_minutes: file.room.edit_window_minutes.unwrap_or(rd.edit_window_minutes),
				retention_hours: file.room.retention_hours.filter(|v| *v > 0).unwrap_or(rd.retention_hours),
				max_messages: file.room.max_messages.filter(|v| *v > 0).unwrap_or(rd.max_messages),
				history_replay_count: file.room.history_replay_count.unwrap_or(rd.history_replay_count),
				inactivity_timeout: file
					.room
					.inactivity_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(rd.inactivity_timeout),
				cleanup_interval: file
					.room
					.cleanup_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(rd.cleanup_interval),
				welcome_message: file.room.welcome_message.filter(|s| !s.trim().is_empty()),
			},
			security: SecuritySettings {
				hmac_secret: file
					.security
					.hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				allowed_origins: non_blank(file.security.allowed_origins),
				denied_ips: non_blank(file.security.denied_ips),
				allowed_ips: non_blank(file.security.allowed_ips),
				max_connections_per_ip: file
					.security
					.max_connections_per_ip
					.filter(|v| *v > 0)
					.unwrap_or(secd.max_connections_per_ip),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}

	/// Build the room configuration. Fails on malformed address lists.
	pub fn room_config(&self) -> anyhow::Result<RoomConfig> {
		let room = &self.room;
		let security = &self.security;

		let policy = PolicyConfig {
			max_message_chars: room.max_message_chars,
			max_nickname_chars: room.max_nickname_chars,
			message_cooldown_ms: room.message_cooldown_ms as i64,
			max_messages_per_window: room.max_messages_per_minute,
			rate_window_ms: 60_000,
			edit_window_ms: (room.edit_window_minutes * 60_000) as i64,
		};

		let admission = AdmissionPolicy {
			allowed_origins: security.allowed_origins.clone(),
			denied_ips: parse_ips(&security.denied_ips).context("security.denied_ips")?,
			allowed_ips: if security.allowed_ips.is_empty() {
				None
			} else {
				Some(parse_ips(&security.allowed_ips).context("security.allowed_ips")?)
			},
			max_connections_per_ip: security.max_connections_per_ip,
		};

		let defaults = RoomConfig::default();
		Ok(RoomConfig {
			policy,
			store: MessageStoreConfig {
				retention_ms: (room.retention_hours * 60 * 60 * 1_000) as i64,
				max_messages: room.max_messages,
			},
			admission,
			history_replay_count: room.history_replay_count,
			inactivity_timeout_ms: room.inactivity_timeout.as_millis() as i64,
			cleanup_interval: room.cleanup_interval,
			outbound_queue_capacity: self.server.outbound_queue_capacity,
			welcome_message: room.welcome_message.clone().unwrap_or(defaults.welcome_message),
			hmac_secret: security
				.hmac_secret
				.clone()
				.unwrap_or_else(|| SecretString::new(DEV_HMAC_SECRET)),
		})
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			trusted_ip_header: self.server.trusted_ip_header.clone(),
			max_frame_size: self.server.max_frame_size,
			send_timeout: self.server.send_timeout,
		}
	}
}

fn parse_ips(list: &[String]) -> anyhow::Result<HashSet<IpAddr>> {
	list.iter()
		.map(|s| s.parse::<IpAddr>().with_context(|| format!("invalid IP address: {s}")))
		.collect()
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("MURMUR_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_TRUSTED_IP_HEADER") {
		cfg.server.trusted_ip_header = Some(v);
		info!("server config: trusted_ip_header overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_HMAC_SECRET") {
		cfg.security.hmac_secret = Some(SecretString::new(v));
		info!("security: hmac_secret overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_ALLOWED_ORIGINS") {
		cfg.security.allowed_origins = non_blank(v.split(',').map(str::to_string).collect());
		info!(
			count = cfg.security.allowed_origins.len(),
			"security: allowed_origins overridden by env"
		);
	}

	if let Some(v) = non_empty("MURMUR_MAX_CONNECTIONS_PER_IP")
		&& let Ok(max) = v.parse::<u32>()
		&& max > 0
	{
		cfg.security.max_connections_per_ip = max;
		info!(max, "security: max_connections_per_ip overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_MESSAGE_COOLDOWN_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.room.message_cooldown_ms = ms;
		info!(ms, "room config: message_cooldown_ms overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_MAX_MESSAGES_PER_MINUTE")
		&& let Ok(max) = v.parse::<u32>()
	{
		cfg.room.max_messages_per_minute = max;
		info!(max, "room config: max_messages_per_minute overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = non_empty("MURMUR_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence: enabled without database_url; history will not be persisted");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		ServerConfig::from_file(toml::from_str(toml_src).expect("valid TOML"))
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("");
		let room = cfg.room_config().unwrap();

		assert_eq!(room.policy.max_message_chars, 500);
		assert_eq!(room.policy.message_cooldown_ms, 1_000);
		assert_eq!(room.policy.max_messages_per_window, 30);
		assert_eq!(room.policy.edit_window_ms, 600_000);
		assert_eq!(room.store.retention_ms, 12 * 60 * 60 * 1_000);
		assert_eq!(room.store.max_messages, 500);
		assert_eq!(room.history_replay_count, 50);
		assert_eq!(room.inactivity_timeout_ms, 300_000);
		assert_eq!(room.admission.max_connections_per_ip, 5);
		assert!(room.admission.allowed_ips.is_none());
		assert_eq!(room.hmac_secret.expose(), DEV_HMAC_SECRET);
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn file_values_are_applied() {
		let cfg = parse(
			r#"
			[server]
			health_bind = "127.0.0.1:9000"
			trusted_ip_header = "CF-Connecting-IP"
			send_timeout_ms = 250

			[room]
			max_messages_per_minute = 10
			edit_window_minutes = 5
			inactivity_timeout_secs = 120

			[security]
			hmac_secret = "s3cret"
			allowed_origins = ["https://chat.example.org", "  "]
			denied_ips = ["10.0.0.9"]
			allowed_ips = ["10.0.0.1", "::1"]

			[persistence]
			enabled = true
			database_url = "sqlite://murmur.db"
			"#,
		);

		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9000"));
		assert_eq!(cfg.connection_settings().send_timeout, Duration::from_millis(250));
		assert_eq!(
			cfg.connection_settings().trusted_ip_header.as_deref(),
			Some("CF-Connecting-IP")
		);

		let room = cfg.room_config().unwrap();
		assert_eq!(room.policy.max_messages_per_window, 10);
		assert_eq!(room.policy.edit_window_ms, 300_000);
		assert_eq!(room.inactivity_timeout_ms, 120_000);
		assert_eq!(room.hmac_secret.expose(), "s3cret");
		assert_eq!(room.admission.allowed_origins, vec!["https://chat.example.org".to_string()]);
		assert!(room.admission.denied_ips.contains(&"10.0.0.9".parse::<IpAddr>().unwrap()));
		assert_eq!(room.admission.allowed_ips.as_ref().map(HashSet::len), Some(2));
		assert!(cfg.persistence.enabled);
	}

	#[test]
	fn malformed_ip_lists_are_rejected() {
		let cfg = parse("[security]\ndenied_ips = [\"not-an-ip\"]\n");
		assert!(cfg.room_config().is_err());
	}

	#[test]
	fn env_overrides_take_precedence() {
		let mut cfg = parse("[security]\nhmac_secret = \"file\"\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("MURMUR_HMAC_SECRET", "from-env"),
			("MURMUR_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
			("MURMUR_MAX_CONNECTIONS_PER_IP", "9"),
			("MURMUR_PERSISTENCE_ENABLED", "yes"),
			("MURMUR_HEALTH_BIND", "   "),
		]);

		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.security.hmac_secret.as_ref().map(SecretString::expose), Some("from-env"));
		assert_eq!(
			cfg.security.allowed_origins,
			vec!["https://a.example".to_string(), "https://b.example".to_string()]
		);
		assert_eq!(cfg.security.max_connections_per_ip, 9);
		assert!(cfg.persistence.enabled);
		assert!(cfg.server.health_bind.is_none());
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join("murmur-config-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
