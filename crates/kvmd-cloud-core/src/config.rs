//! Configuration loading for the kvmd-cloud agent.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Main config file (`/etc/kvmd/cloud/cloud.toml` or `--config`)
//! 3. Auth config file (`/etc/kvmd/cloud/auth.toml`), which only carries the token
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory holding the agent configuration files.
pub const BASE_CONFIG_DIR: &str = "/etc/kvmd/cloud";

/// Main configuration file name.
pub const MAIN_CONFIG_NAME: &str = "cloud.toml";

/// Auth configuration file name, written during enrollment.
pub const AUTH_CONFIG_NAME: &str = "auth.toml";

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Bearer token presented to hive and proxies.
    pub auth_token: String,
    /// Disable TLS for hive and proxy connections (development only).
    pub nossl: bool,
    pub ssl: SslConfig,
    pub hive: HiveConfig,
    /// Path of the local control socket.
    pub unix_ctl_socket: PathBuf,
    /// Human-readable agent name reported on registration.
    pub agent_name: String,
    pub log: LogConfig,
    pub tunnel: TunnelTimings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            nossl: false,
            ssl: SslConfig::default(),
            hive: HiveConfig::default(),
            unix_ctl_socket: PathBuf::from("/run/kvmd/cloud.sock"),
            agent_name: String::new(),
            log: LogConfig::default(),
            tunnel: TunnelTimings::default(),
        }
    }
}

/// TLS trust configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SslConfig {
    /// Extra CA certificate (PEM) trusted in addition to the system roots.
    pub ca: Option<PathBuf>,
}

/// Hive (control service) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HiveConfig {
    /// Hive endpoints; only the first one is dialed.
    pub endpoints: Vec<String>,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["pikvm.cloud:9000".to_string()],
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    /// Log file appended to; `-` writes to stdout.
    pub file: String,
    /// Include source file and line in every record.
    pub trace: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: "-".to_string(),
            trace: false,
        }
    }
}

/// Timings of the tunnel runtime, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelTimings {
    /// Fixed delay between reconnection attempts.
    pub retry_interval_ms: u64,
    /// Total width of the random jitter applied around the retry interval.
    pub retry_jitter_ms: u64,
    /// Interval of keepalive pings on the events channels.
    pub ping_interval_ms: u64,
    /// Timeout for establishing a transport connection.
    pub connect_timeout_ms: u64,
}

impl Default for TunnelTimings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 3_000,
            retry_jitter_ms: 500,
            ping_interval_ms: 2_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl AgentConfig {
    /// First configured hive endpoint.
    pub fn hive_endpoint(&self) -> Result<&str> {
        self.hive
            .endpoints
            .first()
            .map(String::as_str)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::Config("hive endpoints not specified".into()))
    }

    /// Check that the configuration can be used to start the agent.
    pub fn validate(&self) -> Result<()> {
        self.hive_endpoint()?;
        if self.auth_token.is_empty() {
            return Err(Error::Config(
                "auth_token is empty, the agent is not enrolled".into(),
            ));
        }
        let timings = [
            ("tunnel.retry_interval_ms", self.tunnel.retry_interval_ms),
            ("tunnel.ping_interval_ms", self.tunnel.ping_interval_ms),
            ("tunnel.connect_timeout_ms", self.tunnel.connect_timeout_ms),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be positive")));
        }
        Ok(())
    }

    /// Render the effective configuration as pretty JSON with the token masked.
    pub fn dump(&self) -> Result<String> {
        let mut masked = self.clone();
        if !masked.auth_token.is_empty() {
            masked.auth_token = "<hidden>".into();
        }
        Ok(serde_json::to_string_pretty(&masked)?)
    }
}

/// Auth file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthFile {
    auth_token: String,
}

/// Load configuration with layered resolution.
///
/// `config_path` replaces the default main config location. A missing main
/// config is not an error (defaults are used); a missing auth file neither.
pub fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
    let base_dir = Path::new(BASE_CONFIG_DIR);
    let main_path = config_path.map_or_else(|| base_dir.join(MAIN_CONFIG_NAME), Path::to_path_buf);
    let auth_path = main_path
        .parent()
        .unwrap_or(base_dir)
        .join(AUTH_CONFIG_NAME);

    let mut config = if main_path.exists() {
        load_config_file(&main_path)?
    } else if config_path.is_some() {
        return Err(Error::Config(format!(
            "Config file {} does not exist",
            main_path.display()
        )));
    } else {
        AgentConfig::default()
    };

    if auth_path.exists() {
        let auth = load_auth_file(&auth_path)?;
        if !auth.auth_token.is_empty() {
            config.auth_token = auth.auth_token;
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<AgentConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn load_auth_file(path: &Path) -> Result<AuthFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read auth file {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(val) = std::env::var("KVMD_CLOUD_AUTH_TOKEN")
        && !val.is_empty()
    {
        config.auth_token = val;
    }
    if let Ok(val) = std::env::var("KVMD_CLOUD_LOG_LEVEL") {
        config.log.level = val;
    }
}
