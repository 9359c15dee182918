//! Server configuration loaded from a TOML file.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// HTTP behavior
    #[serde(default)]
    pub http: HttpConfig,

    /// Static-file mounts
    #[serde(default, rename = "mount")]
    pub mounts: Vec<MountConfig>,

    /// Optional framed-message listener
    #[serde(default)]
    pub framed: Option<FramedConfig>,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind to loopback only
    #[serde(default)]
    pub loopback_only: bool,

    /// Bind an IPv6 address instead of IPv4
    #[serde(default)]
    pub ipv6: bool,

    /// SO_REUSEADDR on the listener
    #[serde(default = "default_true")]
    pub reuse_addr: bool,

    /// SO_REUSEPORT on the listener
    #[serde(default)]
    pub reuse_port: bool,

    /// Number of I/O loop threads; 0 serves connections on the main loop
    #[serde(default = "default_io_loops")]
    pub io_loops: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
            loopback_only: false,
            ipv6: false,
            reuse_addr: true,
            reuse_port: false,
            io_loops: default_io_loops(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Idle seconds before a keep-alive connection is closed
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: u64,

    /// Requests served per connection before it is closed
    #[serde(default = "default_max_keep_alive_requests")]
    pub max_keep_alive_requests: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            keep_alive_timeout: default_keep_alive_timeout(),
            max_keep_alive_requests: default_max_keep_alive_requests(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    /// URL prefix, must start with '/'
    pub prefix: String,
    /// Filesystem directory served under the prefix
    pub dir: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FramedConfig {
    /// Listen port for the framed listener
    pub port: u16,

    /// Payload mode: "structured" (JSON) or "opaque"
    #[serde(default)]
    pub mode: FramedMode,

    /// Send a PING every this many seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Close the connection when no PONG arrives within this many seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FramedMode {
    #[default]
    Structured,
    Opaque,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty", "compact", or "json"
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log lines
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_port() -> u16 {
    8080
}

fn default_io_loops() -> usize {
    3
}

fn default_keep_alive_timeout() -> u64 {
    60
}

fn default_max_keep_alive_requests() -> u32 {
    10
}

fn default_ping_interval() -> u64 {
    10
}

fn default_ping_timeout() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.io_loops, 3);
        assert!(config.server.reuse_addr);
        assert_eq!(config.http.keep_alive_timeout, 60);
        assert_eq!(config.http.max_keep_alive_requests, 10);
        assert!(config.mounts.is_empty());
        assert!(config.framed.is_none());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [server]
            port = 9090
            loopback_only = true
            io_loops = 1

            [http]
            keep_alive_timeout = 5
            max_keep_alive_requests = 2

            [[mount]]
            prefix = "/"
            dir = "/var/www"

            [framed]
            port = 9091
            mode = "opaque"
            ping_interval = 2
            ping_timeout = 1

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.server.loopback_only);
        assert_eq!(config.mounts.len(), 1);
        let framed = config.framed.unwrap();
        assert_eq!(framed.mode, FramedMode::Opaque);
        assert_eq!(framed.ping_interval, 2);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = "[server]\nprot = 1\n";
        assert!(toml::from_str::<Config>(raw).is_err());
    }
}
