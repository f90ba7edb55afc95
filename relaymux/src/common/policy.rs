// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Destination allow/deny policy
//!
//! Patterns are `*`, `*.suffix`, or an exact host, each optionally followed by `:port`.
//! A destination matching any deny pattern is refused; otherwise it must match an
//! allow pattern, unless the allow list is empty.
use crate::config::ProxyLimitConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
enum HostMatch {
  Any,
  Suffix(String),
  Exact(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPattern {
  host: HostMatch,
  port: Option<u16>,
}

impl HostPattern {
  pub fn parse(pattern: &str) -> Self {
    let (host, port) = split_host_port(pattern.trim());
    let host = host.to_ascii_lowercase();
    let host = if host == "*" || host.is_empty() {
      HostMatch::Any
    } else if let Some(suffix) = host.strip_prefix("*.") {
      HostMatch::Suffix(suffix.to_string())
    } else {
      HostMatch::Exact(host)
    };
    Self { host, port }
  }

  fn matches(&self, host: &str, port: Option<u16>) -> bool {
    if let Some(expected) = self.port {
      if port != Some(expected) {
        return false;
      }
    }
    match &self.host {
      HostMatch::Any => true,
      HostMatch::Exact(exact) => host.eq_ignore_ascii_case(exact),
      HostMatch::Suffix(suffix) => {
        let host = host.to_ascii_lowercase();
        host == *suffix
          || host
            .strip_suffix(suffix.as_str())
            .map_or(false, |rest| rest.ends_with('.'))
      }
    }
  }
}

/// Splits `host:port`, `[v6]:port`, or a bare host
fn split_host_port(addr: &str) -> (&str, Option<u16>) {
  if let Some(rest) = addr.strip_prefix('[') {
    if let Some((host, tail)) = rest.split_once(']') {
      let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
      return (host, port);
    }
  }
  match addr.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => match port.parse() {
      Ok(port) => (host, Some(port)),
      Err(_) => (addr, None),
    },
    _ => (addr, None),
  }
}

#[derive(Clone, Debug, Default)]
pub struct DestinationPolicy {
  allow: Vec<HostPattern>,
  deny: Vec<HostPattern>,
}

impl DestinationPolicy {
  pub fn allow_all() -> Self {
    Self::default()
  }

  pub fn from_config(config: &ProxyLimitConfig) -> Self {
    Self {
      allow: config.allow.iter().map(|p| HostPattern::parse(p)).collect(),
      deny: config.deny.iter().map(|p| HostPattern::parse(p)).collect(),
    }
  }

  pub fn allowed(&self, addr: &str) -> bool {
    let (host, port) = split_host_port(addr);
    if self.deny.iter().any(|p| p.matches(host, port)) {
      return false;
    }
    self.allow.is_empty() || self.allow.iter().any(|p| p.matches(host, port))
  }
}
