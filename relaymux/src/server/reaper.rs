// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{Arc, Mutex};

use tokio::{task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

use super::idle::IdleSessions;

/// Background task closing sessions that have had no streams for longer than the idle timeout
///
/// Owned by the server lifecycle; nothing runs until [`start`](Self::start) is called.
pub struct IdleSessionReaper {
  idle: Arc<IdleSessions>,
  session_idle_timeout: Option<Duration>,
  interval: Duration,
  shutdown: CancellationToken,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl IdleSessionReaper {
  pub fn new(
    idle: Arc<IdleSessions>,
    session_idle_timeout: Option<Duration>,
    interval: Duration,
  ) -> Self {
    Self {
      idle,
      session_idle_timeout,
      interval,
      shutdown: CancellationToken::new(),
      task: Mutex::new(None),
    }
  }

  /// Spawns the scan loop; returns false if reaping is disabled or already running
  pub fn start(&self) -> bool {
    let idle_timeout = match self.session_idle_timeout {
      Some(timeout) if !timeout.is_zero() => timeout,
      _ => return false,
    };
    let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if task.is_some() || self.shutdown.is_cancelled() {
      return false;
    }
    let idle = Arc::clone(&self.idle);
    let interval = self.interval;
    let shutdown = self.shutdown.clone();
    *task = Some(tokio::task::spawn(async move {
      let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
      ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticks.tick() => {}
        }
        for (ctx, idle_for) in idle.reap_expired(idle_timeout) {
          tracing::info!(
            session = ?ctx.id(),
            idle_for = ?idle_for,
            "Closed session without streams for longer than the idle timeout"
          );
        }
      }
      tracing::debug!("Idle session reaper stopped");
    }));
    true
  }

  pub fn is_running(&self) -> bool {
    self
      .task
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .as_ref()
      .map_or(false, |task| !task.is_finished())
  }

  /// Stops the scan loop and waits for it to exit; the reaper cannot be restarted
  pub async fn stop(&self) {
    self.shutdown.cancel();
    let task = self
      .task
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(task) = task {
      if let Err(error) = task.await {
        tracing::warn!(?error, "Idle session reaper task failed");
      }
    }
  }
}

impl Drop for IdleSessionReaper {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
