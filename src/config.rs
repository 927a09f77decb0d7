//! Gateway configuration.
//!
//! Read once at startup from a TOML file and shared read-only by every
//! connection. Every key is optional:
//!
//! ```toml
//! listen = "0.0.0.0"
//! port = 5280
//! origins = ["https://*.example.com", "http://localhost:*"]
//! max_frame_size = 1048576      # 0 = unlimited
//! max_message_size = 1048576    # 0 = unlimited
//! log_level = "info"
//! upstream = "xmpp.internal:5222" # skip the stream's `to` domain
//! upstream_port = 5222
//! resolve_srv = true
//! idle_timeout_secs = 300       # 0 = never
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jabsocket.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid origin pattern {pattern:?}: {source}")]
    Origin {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("unknown log level {0:?}")]
    LogLevel(String),

    #[error("invalid upstream {0:?}, expected host or host:port")]
    Upstream(String),
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5280
}

fn default_size_limit() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_upstream_port() -> u16 {
    5222
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the WebSocket listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shell-style patterns for the `Origin` header. Empty allows every origin.
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default = "default_size_limit")]
    pub max_frame_size: usize,
    #[serde(default = "default_size_limit")]
    pub max_message_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Fixed upstream server; when unset the stream header's `to` is used.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    #[serde(default = "default_true")]
    pub resolve_srv: bool,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(skip)]
    pub(crate) origin_set: Option<GlobSet>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            origins: Vec::new(),
            max_frame_size: default_size_limit(),
            max_message_size: default_size_limit(),
            log_level: default_log_level(),
            upstream: None,
            upstream_port: default_upstream_port(),
            resolve_srv: true,
            idle_timeout_secs: default_idle_timeout(),
            origin_set: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validated()
    }

    /// Check every field and compile the origin patterns. A config must pass
    /// through here before origins can match.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        log_filter(&self.log_level)?;
        if let Some(upstream) = &self.upstream {
            parse_host_port(upstream, self.upstream_port)?;
        }

        self.origins = self.origins.iter().map(|o| o.to_ascii_lowercase()).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.origins {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|source| ConfigError::Origin {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| ConfigError::Origin {
            pattern: self.origins.join(", "),
            source,
        })?;
        self.origin_set = Some(set);
        Ok(self)
    }

    /// Whether a browser `Origin` header value is accepted. Matching is
    /// case-insensitive.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        if self.origins.is_empty() {
            return true;
        }
        match &self.origin_set {
            Some(set) => set.is_match(origin.trim().to_ascii_lowercase()),
            None => false,
        }
    }

    /// Largest frame payload, `None` when unlimited (`0`).
    pub fn frame_limit(&self) -> Option<usize> {
        (self.max_frame_size > 0).then_some(self.max_frame_size)
    }

    /// Largest message, `None` when unlimited (`0`).
    pub fn message_limit(&self) -> Option<usize> {
        (self.max_message_size > 0).then_some(self.max_message_size)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// The configured fixed upstream as `(host, port)`.
    pub fn upstream_override(&self) -> Option<(String, u16)> {
        self.upstream
            .as_deref()
            .and_then(|u| parse_host_port(u, self.upstream_port).ok())
    }

    pub fn log_filter(&self) -> &'static str {
        log_filter(&self.log_level).unwrap_or("error")
    }
}

/// Map a configured level to a tracing filter directive. Syslog style names
/// (`LOG_ERR`, `LOG_DEBUG`, ...) are accepted as well.
fn log_filter(level: &str) -> Result<&'static str, ConfigError> {
    let filter = match level.to_ascii_lowercase().trim_start_matches("log_") {
        "emerg" | "alert" | "crit" | "err" | "error" => "error",
        "warning" | "warn" => "warn",
        "notice" | "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => return Err(ConfigError::LogLevel(level.to_string())),
    };
    Ok(filter)
}

/// Split `host[:port]`. IPv6 literals need brackets when a port is given.
pub fn parse_host_port(input: &str, default_port: u16) -> Result<(String, u16), ConfigError> {
    let trimmed = input.trim();
    let invalid = || ConfigError::Upstream(input.to_string());

    if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host, port.parse().map_err(|_| invalid())?)
        }
        _ => (trimmed, default_port),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_origins(patterns: &[&str]) -> Config {
        Config {
            origins: patterns.iter().map(|p| p.to_string()).collect(),
            ..Config::default()
        }
        .validated()
        .expect("valid origin patterns")
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.listen, "0.0.0.0");
        assert_eq!(config.port, 5280);
        assert_eq!(config.upstream_port, 5222);
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert!(config.resolve_srv);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.log_filter(), "error");
        assert!(config.origin_allowed("http://anything.example"));
    }

    #[test]
    fn test_full_file() {
        // Arrange
        let text = r#"
            listen = "127.0.0.1"
            port = 8080
            origins = ["HTTPS://*.Example.com"]
            max_frame_size = 0
            max_message_size = 4096
            log_level = "LOG_DEBUG"
            upstream = "xmpp.internal:5333"
            resolve_srv = false
            idle_timeout_secs = 0
        "#;

        // Act
        let config = Config::from_toml_str(text).unwrap();

        // Assert
        assert_eq!(config.listen, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.origins, vec!["https://*.example.com"]);
        assert_eq!(config.frame_limit(), None);
        assert_eq!(config.message_limit(), Some(4096));
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(
            config.upstream_override(),
            Some(("xmpp.internal".to_string(), 5333))
        );
        assert!(!config.resolve_srv);
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_origin_globs_are_case_insensitive() {
        let config = with_origins(&["*.example.com", "http://localhost:*"]);
        assert!(config.origin_allowed("http://chat.example.com"));
        assert!(config.origin_allowed("HTTPS://Chat.Example.COM"));
        assert!(config.origin_allowed("http://localhost:3000"));
        assert!(!config.origin_allowed("http://unlisted.example"));
        assert!(!config.origin_allowed("http://example.com.evil.org"));
    }

    #[test]
    fn test_unvalidated_origins_deny() {
        let config = Config {
            origins: vec!["*".to_string()],
            ..Config::default()
        };
        assert!(!config.origin_allowed("http://example.com"));
    }

    #[test]
    fn test_invalid_origin_pattern() {
        let err = Config::from_toml_str(r#"origins = ["http://[unclosed"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Origin { .. }), "{err}");
    }

    #[test]
    fn test_invalid_log_level() {
        let err = Config::from_toml_str(r#"log_level = "loud""#).unwrap_err();
        assert!(matches!(err, ConfigError::LogLevel(ref l) if l == "loud"));
    }

    #[test]
    fn test_type_mismatch_is_parse_error() {
        let err = Config::from_toml_str("port = \"eighty\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_parse_host_port_variants() {
        assert_eq!(
            parse_host_port("example.com", 5222).unwrap(),
            ("example.com".to_string(), 5222)
        );
        assert_eq!(
            parse_host_port("example.com:5269", 5222).unwrap(),
            ("example.com".to_string(), 5269)
        );
        assert_eq!(
            parse_host_port("[::1]:5223", 5222).unwrap(),
            ("::1".to_string(), 5223)
        );
        assert_eq!(parse_host_port("::1", 5222).unwrap(), ("::1".to_string(), 5222));
        assert!(parse_host_port("example.com:http", 5222).is_err());
        assert!(parse_host_port(":5222", 5222).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9090").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/jabsocket.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/jabsocket.toml"));
    }
}
