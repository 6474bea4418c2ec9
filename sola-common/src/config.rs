//! Configuration loading and resolution
//!
//! Values are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is not fatal: the services log a warning and start on
//! compiled defaults. An explicitly requested file that cannot be read is.

use crate::shards::{parse_shard_list, ShardTarget};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SOLA_CONFIG";

/// Top-level TOML configuration shared by both services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// SQLite database holding tiers, users, the search log and the job queue
    pub database_path: Option<PathBuf>,
    /// Redis URL for the counter cache; the in-memory store is used when unset
    pub redis_url: Option<String>,
    pub logging: LoggingConfig,
    pub search: SearchSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` level or filter directive when RUST_LOG is unset
    pub level: String,
}

impl LoggingConfig {
    /// Fallback filter for a service binary. A bare level such as `debug`
    /// applies to the service crate and the HTTP trace layer; anything that
    /// already looks like a directive is used as is.
    pub fn filter_directive(&self, service_target: &str) -> String {
        let level = self.level.trim();
        if level.contains('=') || level.contains(',') {
            level.to_string()
        } else {
            format!("{}={},tower_http={}", service_target, level, level)
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Request path settings (admission + orchestration)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub bind_addr: String,
    /// Search shard base URLs queried on every search
    pub shards: Vec<ShardTarget>,
    /// Request handler name on each shard
    pub query_handler: String,
    pub accuracy: u32,
    pub initial_candidates: u64,
    pub rows: u32,
    /// Hits of the same file closer than this many seconds merge into one scene
    pub merge_window_secs: f64,
    pub top_k: usize,
    /// Global priority backlog at which new searches are turned away
    pub queue_cap: i64,
    pub counter_ttl_secs: u64,
    pub media_url: String,
    pub media_salt: String,
    pub image_proxy_url: String,
    /// Image hosts fetched directly instead of through the proxy
    pub direct_fetch_hosts: Vec<String>,
    pub max_body_bytes: usize,
    pub shard_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub ffmpeg_timeout_ms: u64,
    pub enrichment_url: String,
    pub enrichment_timeout_ms: u64,
    pub enrichment_per_minute: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3311".to_string(),
            shards: Vec::new(),
            query_handler: "lireq".to_string(),
            accuracy: 100,
            initial_candidates: 1_000_000,
            rows: 30,
            merge_window_secs: 5.0,
            top_k: 10,
            queue_cap: 5,
            counter_ttl_secs: 60,
            media_url: "http://127.0.0.1:3000".to_string(),
            media_salt: String::new(),
            image_proxy_url: "https://trace.moe/image-proxy".to_string(),
            direct_fetch_hosts: vec![
                "api.telegram.org".to_string(),
                "cdn.discordapp.com".to_string(),
                "media.discordapp.net".to_string(),
                "media.trace.moe".to_string(),
            ],
            max_body_bytes: 25 * 1024 * 1024,
            shard_timeout_ms: 30_000,
            store_timeout_ms: 2_000,
            fetch_timeout_ms: 10_000,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            ffmpeg_timeout_ms: 10_000,
            enrichment_url: "https://graphql.anilist.co/".to_string(),
            enrichment_timeout_ms: 5_000,
            enrichment_per_minute: 90,
        }
    }
}

/// Ingestion path settings (worker job scheduler)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub bind_addr: String,
    /// Load targets, in round-robin order
    pub shards: Vec<ShardTarget>,
    /// Search servers whose admin endpoint lists core populations
    pub solr_servers: Vec<String>,
    pub admin_status_path: String,
    /// Hash algorithm name; also the name of the queue table
    pub algorithm: String,
    pub probe_timeout_ms: u64,
    /// Periodic scheduling pass for rows uploaded while every worker idles
    pub pass_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            shards: Vec::new(),
            solr_servers: Vec::new(),
            admin_status_path: "admin/cores?wt=json".to_string(),
            algorithm: "cl".to_string(),
            probe_timeout_ms: 5_000,
            pass_interval_ms: 10_000,
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Apply `SOLA_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_value("SOLA_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_value("SOLA_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(list) = env_value("SOLA_SHARDS") {
            let shards = parse_shard_list(&list);
            self.search.shards = shards.clone();
            self.scheduler.shards = shards;
        }
        if let Some(list) = env_value("SOLA_SOLR_LIST") {
            self.scheduler.solr_servers = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(url) = env_value("SOLA_MEDIA_URL") {
            self.search.media_url = url;
        }
        if let Some(salt) = env_value("SOLA_MEDIA_SALT") {
            self.search.media_salt = salt;
        }
        if let Some(accuracy) = env_value("SOLA_ACCURACY") {
            match accuracy.parse() {
                Ok(value) => self.search.accuracy = value,
                Err(_) => warn!("Ignoring non-numeric SOLA_ACCURACY={}", accuracy),
            }
        }
        if let Some(algo) = env_value("SOLA_ALGO") {
            self.scheduler.algorithm = algo;
        }
    }

    /// Database path, falling back to the platform data directory
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Locate the config file: CLI argument, then `SOLA_CONFIG`, then the
/// per-user and system-wide default locations (only if they exist)
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Some(path) = env_value(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("sola").join("config.toml"));
    let system_config = PathBuf::from("/etc/sola/config.toml");

    user_config
        .into_iter()
        .chain(std::iter::once(system_config))
        .find(|p| p.exists())
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    TomlConfig::from_toml_str(&content)
}

/// Resolve, load and env-override the configuration
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match resolve_config_path(cli_arg) {
        Some(path) => {
            let config = load_toml_config(&path)?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        None => {
            warn!("No config file found, using compiled defaults");
            TomlConfig::default()
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Default database location for the platform
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("sola"))
        .unwrap_or_else(|| PathBuf::from("./sola_data"))
        .join("sola.db")
}
