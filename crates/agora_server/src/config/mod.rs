#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use agora_protocol::DEFAULT_MAX_FRAME_SIZE;
use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::engine::EngineConfig;
use crate::server::history::HistoryConfig;

pub const DEFAULT_BIND: &str = "127.0.0.1:18300";

const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Default config path: `~/.agora/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".agora").join("config.toml"))
}

/// Load the server config from TOML at `path` (if present) and process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
	cfg.clamp();

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub history: HistoryConfig,
	pub persistence: PersistenceSettings,
	pub sessions: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// QUIC listen address.
	pub bind: SocketAddr,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Outbound queue depth per connection.
	pub subscriber_queue_capacity: usize,
	/// Largest accepted frame payload.
	pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			server: ServerSettings {
				bind: SocketAddr::from(([127, 0, 0, 1], 18300)),
				tls_cert_path: None,
				tls_key_path: None,
				metrics_bind: None,
				health_bind: None,
				subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
				max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			},
			history: HistoryConfig::default(),
			persistence: PersistenceSettings::default(),
			sessions: EngineConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	history: FileHistorySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	sessions: FileSessionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerSettings {
	bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	subscriber_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHistorySettings {
	list_key: Option<String>,
	max_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSessionSettings {
	remove_on_disconnect: Option<bool>,
	echo_whispers: Option<bool>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_bind(v: &str) -> anyhow::Result<SocketAddr> {
	v.trim()
		.parse::<SocketAddr>()
		.with_context(|| format!("invalid bind address {v:?} (expected host:port)"))
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerConfig::default();

		let bind = match non_empty(file.server.bind) {
			Some(v) => parse_bind(&v)?,
			None => defaults.server.bind,
		};

		Ok(Self {
			server: ServerSettings {
				bind,
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.unwrap_or(defaults.server.subscriber_queue_capacity),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.server.max_frame_bytes),
			},
			history: HistoryConfig {
				list_key: non_empty(file.history.list_key).unwrap_or(defaults.history.list_key),
				max_len: file.history.max_len.unwrap_or(defaults.history.max_len),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
			sessions: EngineConfig {
				remove_on_disconnect: file
					.sessions
					.remove_on_disconnect
					.unwrap_or(defaults.sessions.remove_on_disconnect),
				echo_whispers: file.sessions.echo_whispers.unwrap_or(defaults.sessions.echo_whispers),
			},
		})
	}

	/// Replace values that would leave the server unable to work.
	fn clamp(&mut self) {
		if self.history.max_len == 0 {
			warn!("history config: max_len must be at least 1; using 1");
			self.history.max_len = 1;
		}

		if self.server.subscriber_queue_capacity == 0 {
			warn!(
				default = DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
				"server config: subscriber_queue_capacity must be at least 1; using default"
			);
			self.server.subscriber_queue_capacity = DEFAULT_SUBSCRIBER_QUEUE_CAPACITY;
		}

		if self.server.max_frame_bytes == 0 || self.server.max_frame_bytes > u32::MAX as usize {
			warn!(
				max_frame_bytes = self.server.max_frame_bytes,
				"server config: max_frame_bytes out of range; using default"
			);
			self.server.max_frame_bytes = DEFAULT_MAX_FRAME_SIZE;
		}

		if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
			warn!("server config: tls_cert_path and tls_key_path must be set together; using dev certificate");
			self.server.tls_cert_path = None;
			self.server.tls_key_path = None;
		}
	}
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

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
	let text = |key: &str| non_empty(env(key));

	if let Some(v) = text("AGORA_BIND") {
		cfg.server.bind = parse_bind(&v).context("AGORA_BIND")?;
		info!(bind = %cfg.server.bind, "server config: bind overridden by env");
	}

	if let Some(v) = text("AGORA_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("AGORA_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("AGORA_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("AGORA_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("AGORA_SUBSCRIBER_QUEUE_CAPACITY") {
		match v.parse::<usize>() {
			Ok(capacity) => {
				cfg.server.subscriber_queue_capacity = capacity;
				info!(capacity, "server config: subscriber_queue_capacity overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "ignoring invalid AGORA_SUBSCRIBER_QUEUE_CAPACITY"),
		}
	}

	if let Some(v) = text("AGORA_HISTORY_KEY") {
		info!(list_key = %v, "history config: list_key overridden by env");
		cfg.history.list_key = v;
	}

	if let Some(v) = text("AGORA_HISTORY_MAX_LEN") {
		match v.parse::<usize>() {
			Ok(max_len) => {
				cfg.history.max_len = max_len;
				info!(max_len, "history config: max_len overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "ignoring invalid AGORA_HISTORY_MAX_LEN"),
		}
	}

	if let Some(enabled) = text("AGORA_PERSISTENCE_ENABLED").as_deref().and_then(parse_env_bool) {
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = text("AGORA_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(remove) = text("AGORA_REMOVE_ON_DISCONNECT").as_deref().and_then(parse_env_bool) {
		cfg.sessions.remove_on_disconnect = remove;
		info!(remove, "sessions: remove_on_disconnect overridden by env");
	}

	if let Some(echo) = text("AGORA_ECHO_WHISPERS").as_deref().and_then(parse_env_bool) {
		cfg.sessions.echo_whispers = echo;
		info!(echo, "sessions: echo_whispers overridden by env");
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn load_str(toml_src: &str, env: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
		let file: FileConfig = toml::from_str(toml_src)?;
		let env = env
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect::<HashMap<_, _>>();

		let mut cfg = ServerConfig::from_file(file)?;
		apply_env_overrides(&mut cfg, |k| env.get(k).cloned())?;
		cfg.clamp();
		Ok(cfg)
	}

	#[test]
	fn empty_file_gives_defaults() {
		let cfg = load_str("", &[]).unwrap();
		assert_eq!(cfg.server.bind.to_string(), DEFAULT_BIND);
		assert_eq!(cfg.history.list_key, "chat:geral");
		assert_eq!(cfg.history.max_len, 50);
		assert_eq!(cfg.server.subscriber_queue_capacity, 256);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.sessions.remove_on_disconnect);
		assert!(!cfg.sessions.echo_whispers);
	}

	#[test]
	fn file_values_are_read() {
		let cfg = load_str(
			r#"
[server]
bind = "0.0.0.0:19000"
health_bind = "127.0.0.1:19001"

[history]
list_key = "chat:lobby"
max_len = 10

[persistence]
enabled = true
database_url = "sqlite::memory:"

[sessions]
remove_on_disconnect = false
echo_whispers = true
"#,
			&[],
		)
		.unwrap();

		assert_eq!(cfg.server.bind.port(), 19000);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:19001"));
		assert_eq!(cfg.history.list_key, "chat:lobby");
		assert_eq!(cfg.history.max_len, 10);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert!(!cfg.sessions.remove_on_disconnect);
		assert!(cfg.sessions.echo_whispers);
	}

	#[test]
	fn env_overrides_file() {
		let cfg = load_str(
			"[history]\nmax_len = 10\n",
			&[
				("AGORA_HISTORY_MAX_LEN", "20"),
				("AGORA_BIND", "127.0.0.1:4433"),
				("AGORA_ECHO_WHISPERS", "yes"),
				("AGORA_PERSISTENCE_ENABLED", "maybe"),
				("AGORA_DATABASE_URL", "  "),
			],
		)
		.unwrap();

		assert_eq!(cfg.history.max_len, 20);
		assert_eq!(cfg.server.bind.port(), 4433);
		assert!(cfg.sessions.echo_whispers);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn zero_values_are_clamped() {
		let cfg = load_str("[server]\nsubscriber_queue_capacity = 0\n[history]\nmax_len = 0\n", &[]).unwrap();
		assert_eq!(cfg.history.max_len, 1);
		assert_eq!(cfg.server.subscriber_queue_capacity, 256);
	}

	#[test]
	fn half_tls_config_falls_back_to_dev_cert() {
		let cfg = load_str("[server]\ntls_cert_path = \"/etc/agora/cert.pem\"\n", &[]).unwrap();
		assert!(cfg.server.tls_cert_path.is_none());
		assert!(cfg.server.tls_key_path.is_none());
	}

	#[test]
	fn bad_bind_is_an_error() {
		assert!(load_str("[server]\nbind = \"not-an-addr\"\n", &[]).is_err());
		assert!(load_str("", &[("AGORA_BIND", "nope")]).is_err());
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(toml::from_str::<FileConfig>("[server]\nbindd = \"x\"\n").is_err());
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("absent.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
