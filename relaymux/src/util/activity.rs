// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Shared last-activity timestamps for streams and sessions
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};
use tokio::time::{Duration, Instant};

/// A clonable handle to a monotonic "last I/O" instant
///
/// Clones observe and update the same timestamp, so a stream split into
/// read and write halves can still report a single latest I/O time.
#[derive(Clone)]
pub struct ActivityClock {
  inner: Arc<ActivityClockInner>,
}

struct ActivityClockInner {
  origin: Instant,
  // Nanoseconds since `origin`
  last: AtomicU64,
}

impl ActivityClock {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(ActivityClockInner {
        origin: Instant::now(),
        last: AtomicU64::new(0),
      }),
    }
  }

  /// Records activity at the current instant
  pub fn touch(&self) {
    let elapsed = self.inner.origin.elapsed().as_nanos() as u64;
    self.inner.last.fetch_max(elapsed, Ordering::AcqRel);
  }

  pub fn latest(&self) -> Instant {
    self.inner.origin + Duration::from_nanos(self.inner.last.load(Ordering::Acquire))
  }

  /// Time elapsed since the latest recorded activity
  pub fn idle_for(&self) -> Duration {
    Instant::now().saturating_duration_since(self.latest())
  }
}

impl Default for ActivityClock {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for ActivityClock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ActivityClock")
      .field("idle_for", &self.idle_for())
      .finish()
  }
}
