//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets never live in the TOML itself: upstream keys come from
//! GEMINI_API_KEYS or `pool.keys_file`, the proxy access key from
//! PROXY_API_KEY or `access_key_file`.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when neither `--config` nor CONFIG_PATH is given.
/// Unlike an explicit path, it may be absent.
pub const DEFAULT_CONFIG_PATH: &str = "gemini-proxy.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path to a file holding the key clients must present to use the proxy
    #[serde(default)]
    pub access_key_file: Option<PathBuf>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(skip)]
    pub access_key: Option<Secret<String>>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Cooldown before a disabled key is put back into rotation
    #[serde(default = "default_reactivate_after")]
    pub reactivate_after_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Comma or newline separated upstream keys (alternative to GEMINI_API_KEYS)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reactivate_after_secs: default_reactivate_after(),
            sweep_interval_secs: default_sweep_interval(),
            keys_file: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_connections() -> usize {
    1000
}

fn default_reactivate_after() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_optional(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_toml("")
        }
    }

    /// Parse, validate, and resolve secrets.
    ///
    /// Key resolution order:
    /// 1. GEMINI_API_KEYS / PROXY_API_KEY env vars
    /// 2. pool.keys_file / access_key_file paths from config
    fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        // Validate upstream_url is a valid URL with http(s) scheme
        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }

        config.api_keys = match non_blank_env("GEMINI_API_KEYS") {
            Some(raw) => parse_keys(&raw),
            None => match config.pool.keys_file {
                Some(ref path) => parse_keys(&read_secret_file(path, "keys_file")?),
                None => Vec::new(),
            },
        };
        if config.api_keys.is_empty() {
            return Err(common::Error::Config(
                "no upstream API keys configured: set GEMINI_API_KEYS or pool.keys_file".into(),
            ));
        }

        config.access_key = match non_blank_env("PROXY_API_KEY") {
            Some(key) => Some(Secret::new(key.trim().to_owned())),
            None => match config.access_key_file {
                Some(ref path) => {
                    let key = read_secret_file(path, "access_key_file")?;
                    let key = key.trim();
                    (!key.is_empty()).then(|| Secret::new(key.to_owned()))
                }
                None => None,
            },
        };
        if config.access_key.is_none() {
            return Err(common::Error::Config(
                "no proxy access key configured: set PROXY_API_KEY or access_key_file".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_secs)
    }

    pub fn reactivate_after(&self) -> Duration {
        Duration::from_secs(self.pool.reactivate_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pool.sweep_interval_secs)
    }
}

/// Split a key list on commas and newlines, dropping blanks.
pub fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

fn non_blank_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_secret_file(path: &Path, field: &str) -> common::Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {field} {}: {e}", path.display()))
    })
}
