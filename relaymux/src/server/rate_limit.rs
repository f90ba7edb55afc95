// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-user byte-rate limiting for destination reads
use std::{
  collections::HashMap,
  num::NonZeroU64,
  sync::{Arc, Mutex},
};

use tokio::time::{Duration, Instant};

use crate::config::{parse_byte_size, RateLimitConfig};

/// Entry applied to users without an entry of their own
pub const WILDCARD_USER: &str = "*";

/// A token bucket refilled continuously at `rate` bytes per second, holding at most one second of tokens
///
/// Consumers may overdraw; the debt is paid back by sleeping, so concurrent
/// consumers sharing a bucket are delayed in proportion to what they took.
#[derive(Debug)]
pub struct TokenBucket {
  rate: NonZeroU64,
  state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
  tokens: f64,
  refilled_at: Instant,
}

impl TokenBucket {
  pub fn new(rate_per_second: NonZeroU64) -> Self {
    Self {
      rate: rate_per_second,
      state: Mutex::new(BucketState {
        tokens: rate_per_second.get() as f64,
        refilled_at: Instant::now(),
      }),
    }
  }

  pub fn rate(&self) -> u64 {
    self.rate.get()
  }

  /// Takes `amount` tokens, returning how long the caller must wait to honour the rate
  pub fn take(&self, amount: usize) -> Duration {
    let rate = self.rate.get() as f64;
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(state.refilled_at).as_secs_f64();
    state.tokens = (state.tokens + elapsed * rate).min(rate);
    state.refilled_at = now;
    state.tokens -= amount as f64;
    if state.tokens >= 0.0 {
      Duration::ZERO
    } else {
      Duration::from_secs_f64(-state.tokens / rate)
    }
  }

  /// Takes `amount` tokens and sleeps off any resulting debt
  pub async fn wait(&self, amount: usize) {
    let delay = self.take(amount);
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
  }
}

/// Lazily created buckets, one per configured user, shared for the life of the registry
#[derive(Debug)]
pub struct RateLimiterRegistry {
  config: RateLimitConfig,
  buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
  pub fn new(config: RateLimitConfig) -> Self {
    Self {
      config,
      buckets: Mutex::new(HashMap::new()),
    }
  }

  pub fn disabled() -> Self {
    Self::new(RateLimitConfig {
      enabled: false,
      limit: HashMap::new(),
    })
  }

  /// Returns the bucket governing `user`, or `None` if the user is not rate limited
  ///
  /// Users without an entry share the wildcard bucket.
  pub fn get_bucket(&self, user: &str) -> Option<Arc<TokenBucket>> {
    if !self.config.enabled {
      return None;
    }
    let (key, limit) = match self.config.limit.get(user) {
      Some(limit) => (user, limit),
      None => (WILDCARD_USER, self.config.limit.get(WILDCARD_USER)?),
    };
    let rate = parse_byte_size(limit).and_then(NonZeroU64::new)?;
    let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let bucket = buckets
      .entry(key.to_string())
      .or_insert_with(|| {
        tracing::debug!(user = key, rate = rate.get(), "Creating rate limit bucket");
        Arc::new(TokenBucket::new(rate))
      })
      .clone();
    Some(bucket)
  }
}

#[cfg(test)]
mod tests {
  use std::{collections::HashMap, num::NonZeroU64, sync::Arc};

  use tokio::time::{Duration, Instant};

  use super::{RateLimiterRegistry, TokenBucket};
  use crate::config::RateLimitConfig;

  fn registry(entries: &[(&str, &str)]) -> RateLimiterRegistry {
    RateLimiterRegistry::new(RateLimitConfig {
      enabled: true,
      limit: entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>(),
    })
  }

  #[test]
  fn lookup_falls_back_to_wildcard() {
    let limits = registry(&[("*", "1M"), ("alice", "2K"), ("bob", "0")]);
    let alice = limits.get_bucket("alice").unwrap();
    assert_eq!(alice.rate(), 2048);
    assert!(Arc::ptr_eq(&alice, &limits.get_bucket("alice").unwrap()));

    let carol = limits.get_bucket("carol").unwrap();
    let dave = limits.get_bucket("dave").unwrap();
    assert_eq!(carol.rate(), 1024 * 1024);
    assert!(Arc::ptr_eq(&carol, &dave));

    assert!(limits.get_bucket("bob").is_none());
  }

  #[test]
  fn unconfigured_users_are_unlimited() {
    assert!(registry(&[("alice", "1K")]).get_bucket("bob").is_none());
    assert!(RateLimiterRegistry::disabled().get_bucket("alice").is_none());
    let mut config = RateLimitConfig::default();
    config.enabled = false;
    config.limit.insert("*".into(), "1K".into());
    assert!(RateLimiterRegistry::new(config).get_bucket("alice").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn overdrawn_buckets_report_their_debt() {
    let bucket = TokenBucket::new(NonZeroU64::new(1).unwrap());
    assert_eq!(bucket.take(1), Duration::ZERO);
    assert_eq!(bucket.take(2), Duration::from_secs(2));
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(bucket.take(0), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn sustained_throughput_matches_rate() {
    let bucket = Arc::new(TokenBucket::new(NonZeroU64::new(1000).unwrap()));
    let started = Instant::now();
    // Two consumers sharing one bucket, 100 bytes at a time, 6000 bytes total
    let consumers: Vec<_> = (0..2)
      .map(|_| {
        let bucket = bucket.clone();
        tokio::spawn(async move {
          for _ in 0..30 {
            bucket.wait(100).await;
          }
        })
      })
      .collect();
    for consumer in consumers {
      consumer.await.unwrap();
    }
    // One second of burst capacity, then 1000 bytes per second
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(4900), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(5200), "{:?}", elapsed);
  }
}
