// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one accepted or dialed multiplexed session within this process
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SessionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "session#{}", self.0)
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Stream identifier as assigned by the transport; unique only within its session
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StreamId(u64);

impl StreamId {
  pub fn new(inner: u64) -> StreamId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Debug for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "stream#{}", self.0)
  }
}

impl std::fmt::Display for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> SessionId {
    SessionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}
