use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Port the proxy listens on when neither the CLI nor the config file sets one.
pub const DEFAULT_PORT: u16 = 10010;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream repository.  The inbound path-and-query is
    /// appended to it verbatim.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds to wait for upstream response headers, fractions allowed.
    /// `0` waits forever.
    #[serde(default = "default_response_timeout")]
    pub response_timeout: f64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Deadline for response headers, or `None` when disabled.
    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout > 0.0).then(|| Duration::from_secs_f64(self.response_timeout))
    }
}

fn default_upstream_url() -> String {
    "https://repo.maven.apache.org/maven2".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_response_timeout() -> f64 {
    60.0
}

// ---------------------------------------------------------------------------
// Proxy listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Interface address to bind (e.g. `0.0.0.0`).
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            port: default_port(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the on-disk cache tree.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Also store 4xx/5xx upstream bodies as cache entries.
    #[serde(default)]
    pub cache_error_responses: bool,
    /// How long (seconds) a concurrent miss waits for the in-flight writer of
    /// the same key before streaming from upstream without caching.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            cache_error_responses: false,
            lock_wait_timeout: default_lock_wait_timeout(),
        }
    }
}

impl CacheConfig {
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout)
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_lock_wait_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    let url = reqwest::Url::parse(&config.upstream.url)
        .with_context(|| format!("invalid upstream url: {}", config.upstream.url))?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "upstream url must use http or https, got {}",
        url.scheme()
    );
    anyhow::ensure!(
        Duration::try_from_secs_f64(config.upstream.response_timeout).is_ok(),
        "upstream response_timeout must be a non-negative number of seconds, got {}",
        config.upstream.response_timeout
    );
    anyhow::ensure!(
        !config.cache.path.as_os_str().is_empty(),
        "cache path must not be empty"
    );
    Ok(())
}
