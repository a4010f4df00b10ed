#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.seqsync/server.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".seqsync").join("server.toml"))
}

/// Load TOML from `path` (missing file means defaults) and apply `SEQSYNC_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.normalize();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub sequence: SequenceSettings,
	pub persistence: PersistenceSettings,
	pub backfill: BackfillSettings,
	pub push: PushSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SequenceSettings {
	/// Values reserved durably per round trip to the next-sequence table.
	pub block_size: u32,
}

impl Default for SequenceSettings {
	fn default() -> Self {
		Self { block_size: 100 }
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackfillSettings {
	/// pts values retained per stream before the floor moves up.
	pub retention_window: u32,
	/// Upper bound on updates per backfill reply.
	pub max_page: u32,
}

impl Default for BackfillSettings {
	fn default() -> Self {
		Self {
			retention_window: 10_000,
			max_page: 1_000,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PushSettings {
	/// Queued pushes per live session before drops (and a lag marker) kick in.
	pub session_queue_capacity: usize,
}

impl Default for PushSettings {
	fn default() -> Self {
		Self {
			session_queue_capacity: 1024,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	sequence: FileSequenceSettings,
	#[serde(default)]
	persistence: FilePersistenceSettings,
	#[serde(default)]
	backfill: FileBackfillSettings,
	#[serde(default)]
	push: FilePushSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSequenceSettings {
	block_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackfillSettings {
	retention_window: Option<u32>,
	max_page: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePushSettings {
	session_queue_capacity: Option<usize>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let sequence_defaults = SequenceSettings::default();
		let backfill_defaults = BackfillSettings::default();
		let push_defaults = PushSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
			},
			sequence: SequenceSettings {
				block_size: file.sequence.block_size.unwrap_or(sequence_defaults.block_size),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
			},
			backfill: BackfillSettings {
				retention_window: file
					.backfill
					.retention_window
					.unwrap_or(backfill_defaults.retention_window),
				max_page: file.backfill.max_page.unwrap_or(backfill_defaults.max_page),
			},
			push: PushSettings {
				session_queue_capacity: file
					.push
					.session_queue_capacity
					.unwrap_or(push_defaults.session_queue_capacity),
			},
		}
	}

	fn normalize(&mut self) {
		if self.sequence.block_size == 0 {
			warn!("sequence config: block_size = 0 is not usable; using 1");
			self.sequence.block_size = 1;
		}
		if self.backfill.max_page == 0 {
			warn!("backfill config: max_page = 0 is not usable; using 1");
			self.backfill.max_page = 1;
		}
		if self.backfill.retention_window == 0 {
			warn!("backfill config: retention_window = 0 would trim every update on write; using 1");
			self.backfill.retention_window = 1;
		}
		if self.push.session_queue_capacity == 0 {
			warn!("push config: session_queue_capacity = 0 is not usable; using 1");
			self.push.session_queue_capacity = 1;
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
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name).ok().and_then(|v| non_blank(Some(v)))
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
	let raw = env_string(name)?;
	match raw.parse::<T>() {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(env = name, value = %raw, "ignoring unparseable env override");
			None
		}
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("SEQSYNC_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("SEQSYNC_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("SEQSYNC_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(block_size) = env_parsed::<u32>("SEQSYNC_SEQUENCE_BLOCK_SIZE") {
		cfg.sequence.block_size = block_size;
		info!(block_size, "sequence config: block_size overridden by env");
	}

	if let Some(v) = env_string("SEQSYNC_PERSISTENCE_ENABLED") {
		match parse_env_bool(&v) {
			Some(enabled) => {
				cfg.persistence.enabled = enabled;
				info!(enabled, "persistence: enabled overridden by env");
			}
			None => warn!(value = %v, "persistence: SEQSYNC_PERSISTENCE_ENABLED is not a boolean; ignored"),
		}
	}

	if let Some(v) = env_string("SEQSYNC_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(window) = env_parsed::<u32>("SEQSYNC_BACKFILL_RETENTION_WINDOW") {
		cfg.backfill.retention_window = window;
		info!(window, "backfill config: retention_window overridden by env");
	}

	if let Some(max_page) = env_parsed::<u32>("SEQSYNC_BACKFILL_MAX_PAGE") {
		cfg.backfill.max_page = max_page;
		info!(max_page, "backfill config: max_page overridden by env");
	}

	if let Some(capacity) = env_parsed::<usize>("SEQSYNC_PUSH_QUEUE_CAPACITY") {
		cfg.push.session_queue_capacity = capacity;
		info!(capacity, "push config: session_queue_capacity overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(parse_toml("").unwrap());
		assert_eq!(cfg.sequence.block_size, 100);
		assert_eq!(cfg.backfill.retention_window, 10_000);
		assert_eq!(cfg.backfill.max_page, 1_000);
		assert_eq!(cfg.push.session_queue_capacity, 1024);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.server.tls_cert_path.is_none());
	}

	#[test]
	fn sections_are_read() {
		let cfg = ServerConfig::from_file(
			parse_toml(
				r#"
				[server]
				metrics_bind = "127.0.0.1:9300"
				tls_cert_path = "  "

				[sequence]
				block_size = 16

				[persistence]
				enabled = true
				database_url = "sqlite::memory:"

				[backfill]
				retention_window = 50
				max_page = 10

				[push]
				session_queue_capacity = 8
				"#,
			)
			.unwrap(),
		);

		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9300"));
		assert!(cfg.server.tls_cert_path.is_none());
		assert_eq!(cfg.sequence.block_size, 16);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!((cfg.backfill.retention_window, cfg.backfill.max_page), (50, 10));
		assert_eq!(cfg.push.session_queue_capacity, 8);
	}

	#[test]
	fn zero_block_size_is_coerced() {
		let mut cfg = ServerConfig::from_file(parse_toml("[sequence]\nblock_size = 0\n").unwrap());
		cfg.normalize();
		assert_eq!(cfg.sequence.block_size, 1);
	}

	#[test]
	fn zero_retention_window_is_coerced() {
		let mut cfg = ServerConfig::from_file(parse_toml("[backfill]\nretention_window = 0\n").unwrap());
		cfg.normalize();
		assert_eq!(cfg.backfill.retention_window, 1);
	}

	#[test]
	fn unknown_types_fail_to_parse() {
		assert!(parse_toml("[sequence]\nblock_size = \"many\"\n").is_err());
	}

	#[test]
	fn env_bool_forms() {
		assert_eq!(parse_env_bool(" Yes "), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
