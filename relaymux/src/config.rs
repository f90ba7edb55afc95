// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server configuration, loaded from a JSON document
use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Per-stream idle timeout applied when none is configured
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HOPS: usize = 8;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed reading configuration from {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid configuration document: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Invalid byte size {value:?} for rate limit of {user:?}")]
  InvalidByteSize { user: String, value: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub mux: MuxConfig,
  pub rate_limit: RateLimitConfig,
  pub cipher: CipherConfig,
  pub proxy_limit: ProxyLimitConfig,
  pub hop: HopTransportConfig,
}

impl ServerConfig {
  pub fn from_json(document: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(document)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let path = path.into();
    let document =
      std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
    Self::from_json(&document)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    for (user, value) in self.rate_limit.limit.iter() {
      if parse_byte_size(value).is_none() {
        return Err(ConfigError::InvalidByteSize {
          user: user.clone(),
          value: value.clone(),
        });
      }
    }
    Ok(())
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
  /// Sessions without streams for this long are closed; zero disables reaping
  pub session_idle_timeout_secs: u64,
  /// Zero selects [`DEFAULT_STREAM_IDLE_TIMEOUT`]
  pub stream_idle_timeout_secs: u64,
  pub max_hops: usize,
  pub reaper_interval_secs: u64,
}

impl Default for MuxConfig {
  fn default() -> Self {
    Self {
      session_idle_timeout_secs: 0,
      stream_idle_timeout_secs: 0,
      max_hops: DEFAULT_MAX_HOPS,
      reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
    }
  }
}

impl MuxConfig {
  pub fn session_idle_timeout(&self) -> Option<Duration> {
    match self.session_idle_timeout_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }

  pub fn stream_idle_timeout(&self) -> Duration {
    match self.stream_idle_timeout_secs {
      0 => DEFAULT_STREAM_IDLE_TIMEOUT,
      secs => Duration::from_secs(secs),
    }
  }

  pub fn reaper_interval(&self) -> Duration {
    Duration::from_secs(self.reaper_interval_secs.max(1))
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  pub enabled: bool,
  /// Bytes per second by user; `*` applies to users without their own entry
  pub limit: HashMap<String, String>,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      limit: HashMap::new(),
    }
  }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
  pub method: String,
  /// Identity presented to further hops
  pub user: String,
  pub allowed_users: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyLimitConfig {
  pub allow: Vec<String>,
  pub deny: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HopTransportConfig {
  /// PEM bundle trusted when dialing further hops; hops are unavailable without it
  pub ca_cert: Option<PathBuf>,
  /// Overrides the TLS server name, which otherwise is the hop URL's host
  pub server_name: Option<String>,
}

/// Parses sizes such as `512`, `64K`, `10M`, `1GB` (powers of 1024)
pub fn parse_byte_size(value: &str) -> Option<u64> {
  let value = value.trim();
  let upper = value.to_ascii_uppercase();
  let digits = upper.strip_suffix('B').unwrap_or(&upper);
  let (digits, multiplier) = match digits.chars().last()? {
    'K' => (&digits[..digits.len() - 1], 1u64 << 10),
    'M' => (&digits[..digits.len() - 1], 1u64 << 20),
    'G' => (&digits[..digits.len() - 1], 1u64 << 30),
    _ => (digits, 1),
  };
  digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
  use super::{parse_byte_size, ConfigError, ServerConfig, DEFAULT_STREAM_IDLE_TIMEOUT};
  use std::time::Duration;

  #[test]
  fn byte_sizes() {
    assert_eq!(parse_byte_size("512"), Some(512));
    assert_eq!(parse_byte_size("64K"), Some(64 * 1024));
    assert_eq!(parse_byte_size("64kb"), Some(64 * 1024));
    assert_eq!(parse_byte_size("10M"), Some(10 * 1024 * 1024));
    assert_eq!(parse_byte_size("1GB"), Some(1024 * 1024 * 1024));
    assert_eq!(parse_byte_size(""), None);
    assert_eq!(parse_byte_size("K"), None);
    assert_eq!(parse_byte_size("-1K"), None);
    assert_eq!(parse_byte_size("fast"), None);
  }

  #[test]
  fn empty_document_uses_defaults() {
    let config = ServerConfig::from_json("{}").unwrap();
    assert_eq!(config.mux.session_idle_timeout(), None);
    assert_eq!(config.mux.stream_idle_timeout(), DEFAULT_STREAM_IDLE_TIMEOUT);
    assert_eq!(config.mux.max_hops, 8);
    assert_eq!(config.mux.reaper_interval(), Duration::from_secs(10));
    assert!(config.rate_limit.enabled);
    assert!(config.proxy_limit.allow.is_empty());
  }

  #[test]
  fn full_document() {
    let config = ServerConfig::from_json(
      r#"{
        "mux": { "session_idle_timeout_secs": 300, "stream_idle_timeout_secs": 30, "max_hops": 2 },
        "rate_limit": { "limit": { "*": "1M", "alice": "512K" } },
        "cipher": { "method": "chacha20poly1305", "user": "relay", "allowed_users": ["alice"] },
        "proxy_limit": { "deny": ["*.internal"] },
        "hop": { "server_name": "relay.example.com" }
      }"#,
    )
    .unwrap();
    assert_eq!(config.mux.session_idle_timeout(), Some(Duration::from_secs(300)));
    assert_eq!(config.mux.stream_idle_timeout(), Duration::from_secs(30));
    assert_eq!(config.rate_limit.limit["alice"], "512K");
    assert_eq!(config.cipher.user, "relay");
    assert_eq!(config.proxy_limit.deny, vec!["*.internal".to_string()]);
    assert_eq!(config.hop.server_name.as_deref(), Some("relay.example.com"));
  }

  #[test]
  fn invalid_rate_limits_are_rejected() {
    let res = ServerConfig::from_json(r#"{ "rate_limit": { "limit": { "bob": "lots" } } }"#);
    assert!(matches!(res, Err(ConfigError::InvalidByteSize { user, .. }) if user == "bob"));
  }
}
