/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Server configuration: a structure populated from JSON, with defaults for
//! every field so partial files load cleanly.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid configuration JSON: {}", e),
            ConfigError::Invalid(m) => write!(f, "invalid configuration: {}", m),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Rate limiter section. Absent (or `enabled: false`) means pass-through.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// One of "token_bucket", "fixed_window", "sliding_window".
    pub strategy: String,
    pub max_requests: u64,
    pub window_duration_seconds: u64,
    /// Token bucket capacity; ignored by the window algorithms.
    pub burst_capacity: u64,
    /// One of "ip", "api_key", "endpoint", "bearer", "ip_user_agent".
    pub key_strategy: String,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: "token_bucket".to_string(),
            max_requests: 100,
            window_duration_seconds: 60,
            burst_capacity: 100,
            key_strategy: "ip".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Network
    pub host: String,
    pub port: u16,
    pub enable_https: bool,
    pub https_port: u16,

    // TLS
    pub ssl_certificate_file: Option<PathBuf>,
    pub ssl_private_key_file: Option<PathBuf>,
    pub ssl_ca_file: Option<PathBuf>,
    /// Accepted for compatibility; rustls only offers ECDHE key exchange,
    /// so a DH parameter file is never consulted.
    pub ssl_dh_file: Option<PathBuf>,
    pub ssl_verify_client: bool,
    /// Colon- or comma-separated rustls cipher suite names; empty → defaults.
    pub ssl_cipher_list: Option<String>,

    // Limits
    pub max_connections: u64,
    /// Seconds of inactivity before an idle HTTP connection is dropped.
    pub keep_alive_timeout: u64,
    /// Pre-parse request buffer cap in bytes.
    pub max_request_size: usize,

    // Static files
    pub document_root: PathBuf,
    pub serve_static_files: bool,
    pub index_files: Vec<String>,
    /// Extension → MIME overlay on the built-in table.
    pub mime_types: HashMap<String, String>,

    // Compression
    pub enable_compression: bool,
    pub compression_min_size: usize,
    pub compression_level: u32,
    /// Content-type prefixes eligible for gzip; empty → built-in set.
    pub compressible_types: Vec<String>,

    // WebSocket
    pub websocket_max_frame_size: usize,

    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_https: false,
            https_port: 8443,
            ssl_certificate_file: None,
            ssl_private_key_file: None,
            ssl_ca_file: None,
            ssl_dh_file: None,
            ssl_verify_client: false,
            ssl_cipher_list: None,
            max_connections: 1024,
            keep_alive_timeout: 30,
            max_request_size: 1024 * 1024,
            document_root: PathBuf::from("./public"),
            serve_static_files: true,
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
            mime_types: HashMap::new(),
            enable_compression: true,
            compression_min_size: 1024,
            compression_level: 6,
            compressible_types: Vec::new(),
            websocket_max_frame_size: 1024 * 1024,
            rate_limit: None,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file. Missing fields fall back to defaults; malformed
    /// JSON is an error.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: ServerConfig = serde_json::from_str(&text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_https {
            if self.ssl_certificate_file.is_none() || self.ssl_private_key_file.is_none() {
                return Err(ConfigError::Invalid(
                    "enable_https requires ssl_certificate_file and ssl_private_key_file"
                        .to_string(),
                ));
            }
            if self.ssl_verify_client && self.ssl_ca_file.is_none() {
                return Err(ConfigError::Invalid(
                    "ssl_verify_client requires ssl_ca_file".to_string(),
                ));
            }
        }
        if let Some(rl) = &self.rate_limit {
            match rl.strategy.as_str() {
                "token_bucket" | "fixed_window" | "sliding_window" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown rate limit strategy: {}",
                        other
                    )))
                }
            }
            if rl.max_requests == 0 || rl.window_duration_seconds == 0 {
                return Err(ConfigError::Invalid(
                    "rate limit max_requests and window_duration_seconds must be positive"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}
