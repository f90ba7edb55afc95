// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The idle-candidate set: sessions with no active streams
//!
//! A context is a candidate exactly when its stream counter is zero and it is
//! not closed. Counter transitions, the closed flag, and set membership all
//! change together under one lock, so a session cannot be reaped while a
//! stream is registering on it.
use std::{
  collections::HashMap,
  sync::{atomic::Ordering, Arc, Mutex, MutexGuard},
};

use tokio::time::Duration;

use super::session::SessionContext;

type CandidateKey = usize;

fn key_of(ctx: &Arc<SessionContext>) -> CandidateKey {
  // Stable while the context is alive; candidates hold a strong reference
  Arc::as_ptr(ctx) as CandidateKey
}

#[derive(Default)]
pub struct IdleSessions {
  candidates: Mutex<HashMap<CandidateKey, Arc<SessionContext>>>,
}

impl std::fmt::Debug for IdleSessions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IdleSessions")
      .field("candidates", &self.lock().len())
      .finish()
  }
}

impl IdleSessions {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<CandidateKey, Arc<SessionContext>>> {
    self
      .candidates
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Starts tracking a new context; it is a candidate until its first stream starts
  pub fn register(&self, ctx: &Arc<SessionContext>) {
    let mut candidates = self.lock();
    if ctx.stream_counter.load(Ordering::Acquire) == 0 && !ctx.closed.load(Ordering::Acquire) {
      candidates.insert(key_of(ctx), Arc::clone(ctx));
    }
  }

  /// Counts a stream as active on `ctx` until the returned guard drops
  pub fn enter_stream(self: &Arc<Self>, ctx: &Arc<SessionContext>) -> StreamGuard {
    {
      let mut candidates = self.lock();
      ctx.stream_counter.fetch_add(1, Ordering::AcqRel);
      candidates.remove(&key_of(ctx));
    }
    StreamGuard {
      idle: Arc::clone(self),
      ctx: Arc::clone(ctx),
    }
  }

  fn leave_stream(&self, ctx: &Arc<SessionContext>) {
    let mut candidates = self.lock();
    let remaining = ctx.stream_counter.fetch_sub(1, Ordering::AcqRel) - 1;
    debug_assert!(remaining >= 0, "stream counter went negative");
    if remaining == 0 && !ctx.closed.load(Ordering::Acquire) {
      // The idle period starts when the last stream ends
      ctx.activity().touch();
      candidates.insert(key_of(ctx), Arc::clone(ctx));
    }
  }

  /// Closes `ctx` and releases its session; returns false if it was already closed
  pub fn close(&self, ctx: &Arc<SessionContext>) -> bool {
    {
      let mut candidates = self.lock();
      if ctx.closed.swap(true, Ordering::AcqRel) {
        return false;
      }
      candidates.remove(&key_of(ctx));
    }
    ctx.teardown();
    true
  }

  /// Closes every candidate idle for longer than `idle_timeout`, returning each with its idle time
  pub fn reap_expired(&self, idle_timeout: Duration) -> Vec<(Arc<SessionContext>, Duration)> {
    let expired: Vec<_> = {
      let mut candidates = self.lock();
      let keys: Vec<_> = candidates
        .iter()
        .filter(|(_, ctx)| ctx.activity().idle_for() > idle_timeout)
        .map(|(key, _)| *key)
        .collect();
      keys
        .into_iter()
        .filter_map(|key| candidates.remove(&key))
        .filter(|ctx| !ctx.closed.swap(true, Ordering::AcqRel))
        .map(|ctx| {
          let idle_for = ctx.activity().idle_for();
          (ctx, idle_for)
        })
        .collect()
    };
    for (ctx, _) in expired.iter() {
      ctx.teardown();
    }
    expired
  }

  pub fn is_candidate(&self, ctx: &Arc<SessionContext>) -> bool {
    self.lock().contains_key(&key_of(ctx))
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

/// Marks one active stream on a session; dropping it ends the stream's registration
#[must_use = "the stream is only counted while the guard is held"]
pub struct StreamGuard {
  idle: Arc<IdleSessions>,
  ctx: Arc<SessionContext>,
}

impl Drop for StreamGuard {
  fn drop(&mut self) {
    self.idle.leave_stream(&self.ctx);
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::sync::Arc;

  use tokio::time::Duration;

  use super::IdleSessions;
  use crate::{
    common::{
      peer_relay::InMemoryPeerRelayRegistry,
      protocol::tunnel::{duplex, MuxSession, SessionId},
    },
    server::session::SessionContext,
  };

  pub(crate) fn context(id: u64) -> (Arc<SessionContext>, duplex::DuplexSession) {
    let duplex::EntangledSessions {
      listener,
      connector,
    } = duplex::channel_with_ids(SessionId::new(id), SessionId::new(id + 1000));
    let ctx = SessionContext::new(
      Arc::new(listener),
      None,
      Arc::new(InMemoryPeerRelayRegistry::new()),
    );
    (Arc::new(ctx), connector)
  }

  fn assert_consistent(idle: &IdleSessions, ctx: &Arc<SessionContext>) {
    let count = ctx.stream_count();
    assert!(count >= 0, "negative stream counter on {:?}", ctx);
    assert_eq!(
      idle.is_candidate(ctx),
      count == 0 && !ctx.is_closed(),
      "candidate membership disagrees with {:?}",
      ctx
    );
  }

  #[tokio::test]
  async fn guards_toggle_membership() {
    let idle = Arc::new(IdleSessions::new());
    let (ctx, _remote) = context(1);
    idle.register(&ctx);
    assert!(idle.is_candidate(&ctx));

    let first = idle.enter_stream(&ctx);
    let second = idle.enter_stream(&ctx);
    assert_eq!(ctx.stream_count(), 2);
    assert!(!idle.is_candidate(&ctx));
    drop(first);
    assert!(!idle.is_candidate(&ctx));
    drop(second);
    assert!(idle.is_candidate(&ctx));
    assert_consistent(&idle, &ctx);
  }

  #[tokio::test]
  async fn closed_contexts_never_return() {
    let idle = Arc::new(IdleSessions::new());
    let (ctx, _remote) = context(1);
    idle.register(&ctx);
    let guard = idle.enter_stream(&ctx);
    assert!(idle.close(&ctx));
    assert!(!idle.close(&ctx), "close must happen exactly once");
    assert!(ctx.session().is_closed());
    drop(guard);
    assert!(!idle.is_candidate(&ctx));
    assert_eq!(ctx.stream_count(), 0);
    assert!(idle.is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_streams_keep_membership_consistent() {
    let idle = Arc::new(IdleSessions::new());
    let contexts: Vec<_> = (0..4).map(context).collect();
    for (ctx, _) in contexts.iter() {
      idle.register(ctx);
    }
    let mut tasks = Vec::new();
    for i in 0..400usize {
      let task_idle = idle.clone();
      let ctx = contexts[i % contexts.len()].0.clone();
      tasks.push(tokio::spawn(async move {
        for _ in 0..(i % 3) {
          tokio::task::yield_now().await;
        }
        let guard = task_idle.enter_stream(&ctx);
        for _ in 0..((i * 7) % 5) {
          tokio::task::yield_now().await;
          assert!(ctx.stream_count() > 0);
          assert!(!task_idle.is_candidate(&ctx));
        }
        drop(guard);
      }));
      if i == 200 {
        idle.close(&contexts[3].0);
      }
    }
    for task in tasks {
      task.await.unwrap();
    }
    for (ctx, _) in contexts.iter() {
      assert_eq!(ctx.stream_count(), 0);
      assert_consistent(&idle, ctx);
    }
    assert!(!idle.is_candidate(&contexts[3].0));
    assert_eq!(idle.len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn only_expired_candidates_are_reaped() {
    let idle = Arc::new(IdleSessions::new());
    let (quiet, _quiet_remote) = context(1);
    let (busy, _busy_remote) = context(2);
    idle.register(&quiet);
    idle.register(&busy);
    let _active = idle.enter_stream(&busy);

    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(idle.reap_expired(Duration::from_secs(30)).is_empty());

    tokio::time::advance(Duration::from_secs(20)).await;
    let reaped = idle.reap_expired(Duration::from_secs(30));
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].0.id(), quiet.id());
    assert_eq!(reaped[0].1, Duration::from_secs(40));
    assert!(quiet.session().is_closed());
    assert!(!busy.session().is_closed());
    assert!(!idle.close(&quiet));
  }
}
