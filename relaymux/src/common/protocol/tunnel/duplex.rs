// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory sessions backed by tokio duplex pipes, for embedding and tests
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc, Mutex,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::{BoxedMuxStream, MuxSession, SessionError, SessionId, StreamId};
use crate::{common::authentication::CipherReset, util::tunnel_stream::TrackedStream};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

pub struct DuplexSession {
  id: SessionId,
  channel_to_remote: UnboundedSender<BoxedMuxStream>,
  incoming: tokio::sync::Mutex<UnboundedReceiver<BoxedMuxStream>>,
  // Shared by both ends, like the state of a single connection
  closed: CancellationToken,
  next_stream_id: Arc<AtomicU64>,
  cipher_resets: Mutex<Vec<(String, u64)>>,
}

impl DuplexSession {
  /// Cipher resets requested on this end, oldest first
  pub fn cipher_resets(&self) -> Vec<(String, u64)> {
    self
      .cipher_resets
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }
}

impl std::fmt::Debug for DuplexSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DuplexSession")
      .field("id", &self.id)
      .field("closed", &self.closed.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl MuxSession for DuplexSession {
  fn id(&self) -> SessionId {
    self.id
  }

  fn accept_stream(&self) -> BoxFuture<'_, Result<BoxedMuxStream, SessionError>> {
    async move {
      let mut incoming = tokio::select! {
        biased;
        _ = self.closed.cancelled() => return Err(SessionError::Shutdown),
        incoming = self.incoming.lock() => incoming,
      };
      tokio::select! {
        biased;
        _ = self.closed.cancelled() => Err(SessionError::Shutdown),
        stream = incoming.recv() => stream.ok_or(SessionError::Shutdown),
      }
    }
    .boxed()
  }

  fn open_stream(&self) -> BoxFuture<'_, Result<BoxedMuxStream, SessionError>> {
    let opened = if self.closed.is_cancelled() {
      Err(SessionError::Shutdown)
    } else {
      let id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
      let (local, remote) = tokio::io::duplex(DEFAULT_PIPE_CAPACITY);
      let (local_r, local_w) = tokio::io::split(local);
      let (remote_r, remote_w) = tokio::io::split(remote);
      let remote: BoxedMuxStream = Box::new(TrackedStream::new(id, remote_r, remote_w));
      self
        .channel_to_remote
        .send(remote)
        .map_err(|_| SessionError::Shutdown)
        .map(|_| Box::new(TrackedStream::new(id, local_r, local_w)) as BoxedMuxStream)
    };
    futures::future::ready(opened).boxed()
  }

  fn close(&self) {
    self.closed.cancel();
  }

  fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  fn cipher_context(&self) -> Option<&dyn CipherReset> {
    Some(self)
  }
}

impl CipherReset for DuplexSession {
  fn reset_crypto_context(&self, cipher_method: &str, cipher_counter: u64) {
    self
      .cipher_resets
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push((cipher_method.to_string(), cipher_counter));
  }
}

/// Two entangled sessions; streams opened on one are accepted by the other
pub struct EntangledSessions {
  pub listener: DuplexSession,
  pub connector: DuplexSession,
}

impl From<EntangledSessions> for (DuplexSession, DuplexSession) {
  fn from(sessions: EntangledSessions) -> Self {
    (sessions.listener, sessions.connector)
  }
}

pub fn channel() -> EntangledSessions {
  channel_with_ids(SessionId::new(0), SessionId::new(1))
}

pub fn channel_with_ids(listener_id: SessionId, connector_id: SessionId) -> EntangledSessions {
  let closed = CancellationToken::new();
  let next_stream_id = Arc::new(AtomicU64::new(1));
  let session_for = |id: SessionId,
                     up: UnboundedSender<BoxedMuxStream>,
                     down: UnboundedReceiver<BoxedMuxStream>| DuplexSession {
    id,
    channel_to_remote: up,
    incoming: tokio::sync::Mutex::new(down),
    closed: closed.clone(),
    next_stream_id: Arc::clone(&next_stream_id),
    cipher_resets: Mutex::new(Vec::new()),
  };
  let (left_up, right_down) = mpsc::unbounded_channel::<BoxedMuxStream>();
  let (right_up, left_down) = mpsc::unbounded_channel::<BoxedMuxStream>();
  EntangledSessions {
    listener: session_for(listener_id, left_up, left_down),
    connector: session_for(connector_id, right_up, right_down),
  }
}
