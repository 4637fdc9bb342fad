//! Runtime configuration.
//!
//! Defaults are usable as-is; a YAML file named by `BEACON_CONFIG` can
//! override any subset of fields, and `LISTEN` always wins for the bind
//! address.

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: Limits,
    pub sessions: SessionConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Number of blocking worker threads; 0 dispatches inline on the reactor.
    pub workers: usize,
    /// Close connections idle between requests for this long. Unset means never.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN.to_string(),
            workers: 0,
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Protocol limits enforced by the request parser.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub max_uri_length: usize,
    pub max_method_length: usize,
    pub max_protocol_length: usize,
    pub max_header_name_length: usize,
    pub max_header_value_length: usize,
    pub max_query_key_length: usize,
    pub max_query_value_length: usize,
    pub max_query_params: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_size: 8192,
            max_body_size: 2 * 1024 * 1024,
            max_uri_length: 8192,
            max_method_length: 16,
            max_protocol_length: 16,
            max_header_name_length: 256,
            max_header_value_length: 8192,
            max_query_key_length: 256,
            max_query_value_length: 4096,
            max_query_params: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Response/request header carrying the session id.
    pub header_name: String,
    pub timeout_secs: u64,
    pub max_sessions: usize,
    pub max_history: usize,
    pub resumable: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            header_name: "Mcp-Session-Id".to_string(),
            timeout_secs: 30 * 60,
            max_sessions: 1000,
            max_history: 100,
            resumable: true,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub expose_headers: String,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization, Last-Event-Id, Mcp-Session-Id".to_string(),
            expose_headers: "Mcp-Session-Id".to_string(),
            max_age: 86400,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("BEACON_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }

        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}
