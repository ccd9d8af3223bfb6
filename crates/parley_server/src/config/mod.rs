#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::client::{BATCH_CHANNEL_CAPACITY, ClientConfig, DIRECT_CHANNEL_CAPACITY};

const DEFAULT_BIND: &str = "127.0.0.1:23000";

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub client: ClientSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Client listener address.
	pub bind: SocketAddr,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Largest accepted frame payload, in bytes.
	pub max_frame_bytes: usize,
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ClientSettings {
	pub direct_capacity: usize,
	pub batch_capacity: usize,
	pub shutdown_grace: Duration,
	pub write_timeout: Duration,
	pub slow_read: Duration,
	pub slow_handler: Duration,
}

impl Default for ClientSettings {
	fn default() -> Self {
		let defaults = ClientConfig::default();
		Self {
			direct_capacity: defaults.direct_capacity,
			batch_capacity: defaults.batch_capacity,
			shutdown_grace: defaults.shutdown_grace,
			write_timeout: defaults.write_timeout,
			slow_read: defaults.slow_read_threshold,
			slow_handler: defaults.slow_handler_threshold,
		}
	}
}

impl ClientSettings {
	pub fn to_client_config(&self) -> ClientConfig {
		ClientConfig {
			direct_capacity: self.direct_capacity,
			batch_capacity: self.batch_capacity,
			shutdown_grace: self.shutdown_grace,
			write_timeout: self.write_timeout,
			slow_read_threshold: self.slow_read,
			slow_handler_threshold: self.slow_handler,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	client: FileClientSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileClientSettings {
	direct_capacity: Option<usize>,
	batch_capacity: Option<usize>,
	shutdown_grace_ms: Option<u64>,
	write_timeout_ms: Option<u64>,
	slow_read_secs: Option<u64>,
	slow_handler_ms: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let bind = file
			.server
			.bind
			.filter(|s| !s.trim().is_empty())
			.unwrap_or_else(|| DEFAULT_BIND.to_string());
		let bind: SocketAddr = bind
			.trim()
			.parse()
			.with_context(|| format!("invalid server.bind (expected host:port): {bind}"))?;

		let defaults = ClientSettings::default();

		Ok(Self {
			server: ServerSettings {
				bind,
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
			},
			client: ClientSettings {
				direct_capacity: file
					.client
					.direct_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DIRECT_CHANNEL_CAPACITY),
				batch_capacity: file
					.client
					.batch_capacity
					.filter(|v| *v > 0)
					.unwrap_or(BATCH_CHANNEL_CAPACITY),
				shutdown_grace: file
					.client
					.shutdown_grace_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.shutdown_grace),
				write_timeout: file
					.client
					.write_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.write_timeout),
				slow_read: file
					.client
					.slow_read_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.slow_read),
				slow_handler: file
					.client
					.slow_handler_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.slow_handler),
			},
		})
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

fn env_nonempty(key: &str) -> Option<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_nonempty("PARLEY_BIND") {
		match v.parse::<SocketAddr>() {
			Ok(addr) => {
				cfg.server.bind = addr;
				info!(%addr, "server config: bind overridden by env");
			}
			Err(e) => warn!(error = %e, bind = %v, "PARLEY_BIND is invalid, ignoring"),
		}
	}

	if let Some(v) = env_nonempty("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_DIRECT_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.client.direct_capacity = capacity;
		info!(capacity, "client config: direct_capacity overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_BATCH_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.client.batch_capacity = capacity;
		info!(capacity, "client config: batch_capacity overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_SHUTDOWN_GRACE_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.client.shutdown_grace = Duration::from_millis(ms);
		info!(ms, "client config: shutdown_grace overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_WRITE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.client.write_timeout = Duration::from_millis(ms);
		info!(ms, "client config: write_timeout overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_SLOW_READ_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.client.slow_read = Duration::from_secs(secs);
		info!(secs, "client config: slow_read overridden by env");
	}

	if let Some(v) = env_nonempty("PARLEY_SLOW_HANDLER_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.client.slow_handler = Duration::from_millis(ms);
		info!(ms, "client config: slow_handler overridden by env");
	}
}
