use config::ConfigError as ConfigLibError;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::common::auth::{AuthError, Credentials};
use crate::probe::payload::{self, ExpectMode, PayloadError};
use crate::probe::ProbeOptions;

/// Prefix of environment overrides, e.g. `UDP_PROBE_PROXY_ADDRESS`.
pub const ENV_PREFIX: &str = "UDP_PROBE";

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid credentials: {0}")]
    Credentials(#[from] AuthError),
    #[error("Invalid query name: {0}")]
    QueryName(#[from] PayloadError),
    #[error("Cannot resolve {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("Config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
}

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Proxy control endpoint
    #[serde(default = "default_proxy_address")]
    pub proxy_address: String,
    /// RFC 1929 username
    #[serde(default)]
    pub username: Option<String>,
    /// RFC 1929 password
    #[serde(default)]
    pub password: Option<String>,
    /// Offer username/password only
    #[serde(default)]
    pub force_auth: bool,
    /// Where the relayed datagram is addressed
    #[serde(default = "default_target_address")]
    pub target_address: String,
    /// Local UDP socket address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Name looked up by the probe query
    #[serde(default = "default_query_name")]
    pub query_name: String,
    /// How the reply is judged
    #[serde(default)]
    pub expect: ExpectMode,
    /// TCP connect timeout (seconds)
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,
    /// Control channel read/write timeout (seconds)
    #[serde(default = "default_timeout")]
    pub io_timeout: u64,
    /// UDP reply timeout (seconds)
    #[serde(default = "default_timeout")]
    pub receive_timeout: u64,
    /// Log configuration
    #[serde(default)]
    pub log: LoggerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path, empty for console only
    #[serde(default)]
    pub path: String,
    /// Log file archive pattern
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    /// Number of log files to keep
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    /// Size of each log file (MB)
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: String::new(),
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_address: default_proxy_address(),
            username: None,
            password: None,
            force_auth: false,
            target_address: default_target_address(),
            bind_address: default_bind_address(),
            query_name: default_query_name(),
            expect: ExpectMode::default(),
            connect_timeout: default_timeout(),
            io_timeout: default_timeout(),
            receive_timeout: default_timeout(),
            log: LoggerConfig::default(),
        }
    }
}

fn default_proxy_address() -> String {
    format!("127.0.0.1:{}", DEFAULT_SOCKS_PORT)
}

fn default_target_address() -> String {
    "8.8.8.8:53".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_query_name() -> String {
    "google.com".to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "Info".to_string()
}

fn default_archive_pattern() -> String {
    "logs/archive/udp-probe-{}.log".to_string()
}

fn default_file_count() -> u32 {
    5
}

/// Default file size in MB
fn default_file_size() -> u64 {
    10
}

fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::Resolve(addr.to_string(), e))?
        .min_by_key(|a| !a.is_ipv4())
        .ok_or_else(|| ConfigError::InvalidConfig(format!("{} resolved to no address", addr)))
}

impl Config {
    /// Layers the optional file, then `UDP_PROBE_*` environment variables.
    pub fn load<P: AsRef<Path>>(path: P, required: bool) -> Result<Self, ConfigError> {
        Self::load_with_env(path, required, None)
    }

    /// Same as [`Config::load`], reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env<P: AsRef<Path>>(
        path: P,
        required: bool,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(ConfigError::ConfigLibError)?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Applies `socks5://[user[:pass]@]host[:port]`.
    pub fn apply_proxy_url(&mut self, raw: &str) -> Result<(), ConfigError> {
        let url = url::Url::parse(raw)
            .map_err(|e| ConfigError::InvalidConfig(format!("Invalid proxy URL {}: {}", raw, e)))?;
        if url.scheme() != "socks5" {
            return Err(ConfigError::InvalidConfig(format!(
                "Unsupported proxy scheme '{}', expected socks5",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidConfig(format!("Proxy URL {} has no host", raw)))?;
        let port = url.port().unwrap_or(DEFAULT_SOCKS_PORT);
        self.proxy_address = format!("{}:{}", host, port);

        if !url.username().is_empty() {
            self.username = Some(url.username().to_string());
            self.password = url.password().map(str::to_string);
        }
        Ok(())
    }

    /// Validate if configuration is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("Proxy address", &self.proxy_address),
            ("Target address", &self.target_address),
            ("Bind address", &self.bind_address),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidConfig(format!("{} cannot be empty", name)));
            }
        }

        if let Err(_) = self.bind_address.parse::<SocketAddr>() {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid bind address format: {}",
                self.bind_address
            )));
        }

        for (name, secs) in [
            ("connect_timeout", self.connect_timeout),
            ("io_timeout", self.io_timeout),
            ("receive_timeout", self.receive_timeout),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{} must be at least 1 second",
                    name
                )));
            }
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::InvalidConfig(
                "Password given without a username".to_string(),
            ));
        }
        if self.force_auth && self.username.is_none() {
            return Err(ConfigError::InvalidConfig(
                "force_auth requires a username and password".to_string(),
            ));
        }
        self.credentials()?;

        payload::validate_query_name(&self.query_name)?;
        Ok(())
    }

    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        match &self.username {
            Some(username) => {
                let password = self.password.as_deref().unwrap_or_default();
                Ok(Some(Credentials::new(username, password)?))
            }
            None => Ok(None),
        }
    }

    /// Validates, resolves host names and produces the typed options for a run.
    pub fn probe_options(&self) -> Result<ProbeOptions, ConfigError> {
        self.validate()?;

        let target_addr = resolve(&self.target_address)?;
        if !target_addr.is_ipv4() {
            return Err(ConfigError::InvalidConfig(format!(
                "Target {} is not IPv4; only IPv4 envelopes are supported",
                self.target_address
            )));
        }

        Ok(ProbeOptions {
            proxy_addr: resolve(&self.proxy_address)?,
            credentials: self.credentials()?,
            force_auth: self.force_auth,
            target_addr,
            bind_addr: self
                .bind_address
                .parse()
                .map_err(|_| ConfigError::InvalidConfig(self.bind_address.clone()))?,
            query_name: self.query_name.clone(),
            expect: self.expect,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            io_timeout: Duration::from_secs(self.io_timeout),
            receive_timeout: Duration::from_secs(self.receive_timeout),
        })
    }
}
