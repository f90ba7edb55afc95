// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Peer relay rooms: sessions registered under a room are reachable by their connection id
//! from other sessions in the same room, without dialing any destination.
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use futures::{future::BoxFuture, FutureExt};
use tokio::{io::AsyncWriteExt, time::Duration};

use crate::{
  common::protocol::{
    messages::{read_connect_request, write_message, AuthRequest, MessageError},
    tunnel::{ArcSession, BoxedMuxStream, MuxStream, SessionError, SessionId},
  },
  util::activity::ActivityClock,
};

pub trait PeerRelayRegistry: std::fmt::Debug + Send + Sync {
  /// Registers `session` as `conn_id` in `room_id`; false if that id is held by another live session
  fn add_session(&self, room_id: &str, conn_id: &str, session: ArcSession) -> bool;

  /// Removes the registration, if it still belongs to `session`
  fn remove_session(&self, room_id: &str, conn_id: &str, session: &ArcSession);

  fn lookup(&self, room_id: &str, conn_id: &str) -> Option<ArcSession>;
}

#[derive(Default)]
pub struct InMemoryPeerRelayRegistry {
  rooms: DashMap<(String, String), ArcSession>,
}

impl InMemoryPeerRelayRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.rooms.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rooms.is_empty()
  }
}

impl std::fmt::Debug for InMemoryPeerRelayRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InMemoryPeerRelayRegistry")
      .field("registrations", &self.rooms.len())
      .finish()
  }
}

impl PeerRelayRegistry for InMemoryPeerRelayRegistry {
  fn add_session(&self, room_id: &str, conn_id: &str, session: ArcSession) -> bool {
    match self.rooms.entry((room_id.to_string(), conn_id.to_string())) {
      Entry::Occupied(mut occupied) => {
        let existing = occupied.get();
        if existing.id() != session.id() && !existing.is_closed() {
          tracing::warn!(
            room_id,
            conn_id,
            holder = ?existing.id(),
            "Peer relay connection id already registered"
          );
          return false;
        }
        occupied.insert(session);
        true
      }
      Entry::Vacant(vacant) => {
        vacant.insert(session);
        true
      }
    }
  }

  fn remove_session(&self, room_id: &str, conn_id: &str, session: &ArcSession) {
    let owner: SessionId = session.id();
    self
      .rooms
      .remove_if(&(room_id.to_string(), conn_id.to_string()), |_, registered| {
        registered.id() == owner
      });
  }

  fn lookup(&self, room_id: &str, conn_id: &str) -> Option<ArcSession> {
    self
      .rooms
      .get(&(room_id.to_string(), conn_id.to_string()))
      .map(|entry| Arc::clone(entry.value()))
      .filter(|session| !session.is_closed())
  }
}

#[derive(thiserror::Error, Debug)]
pub enum PeerRelayError {
  #[error("Session is not registered in a peer relay room")]
  NotInRoom,
  #[error("Failed to read peer connect request: {0}")]
  ReadRequestFailed(#[source] MessageError),
  #[error("No peer {conn_id} in room {room_id}")]
  PeerNotFound { room_id: String, conn_id: String },
  #[error("Failed to open stream to peer: {0}")]
  OpenStream(#[from] SessionError),
  #[error("Failed to forward connect request to peer: {0}")]
  ForwardRequest(#[source] MessageError),
  #[error("Peer relay I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

/// Handles streams on sessions that joined a peer relay room, in place of ordinary proxying
pub trait PeerRelayHandler: std::fmt::Debug + Send + Sync {
  fn handle_stream<'a>(
    &'a self,
    stream: BoxedMuxStream,
    auth: &'a AuthRequest,
  ) -> BoxFuture<'a, Result<(), PeerRelayError>>;
}

/// Splices each stream onto a fresh stream of the peer named by the connect request's address
///
/// A splice is closed once neither side has moved a byte for `idle_timeout`.
#[derive(Debug)]
pub struct RoomSplicer {
  registry: Arc<dyn PeerRelayRegistry>,
  idle_timeout: Duration,
}

impl RoomSplicer {
  pub fn new(registry: Arc<dyn PeerRelayRegistry>, idle_timeout: Duration) -> Self {
    Self {
      registry,
      idle_timeout,
    }
  }
}

/// Resolves once both clocks have been quiet for `idle_timeout`, yielding the quiet period
async fn until_idle(a: &ActivityClock, b: &ActivityClock, idle_timeout: Duration) -> Duration {
  loop {
    let quiet = a.idle_for().min(b.idle_for());
    if quiet >= idle_timeout {
      return quiet;
    }
    tokio::time::sleep(idle_timeout - quiet).await;
  }
}

impl PeerRelayHandler for RoomSplicer {
  fn handle_stream<'a>(
    &'a self,
    mut stream: BoxedMuxStream,
    auth: &'a AuthRequest,
  ) -> BoxFuture<'a, Result<(), PeerRelayError>> {
    async move {
      let (room_id, _) = auth.peer_relay_ids().ok_or(PeerRelayError::NotInRoom)?;
      let request = read_connect_request(&mut stream)
        .await
        .map_err(PeerRelayError::ReadRequestFailed)?;
      let peer = self
        .registry
        .lookup(room_id, &request.addr)
        .ok_or_else(|| PeerRelayError::PeerNotFound {
          room_id: room_id.to_string(),
          conn_id: request.addr.clone(),
        })?;
      let mut peer_stream = peer.open_stream().await?;
      write_message(&mut peer_stream, &request)
        .await
        .map_err(PeerRelayError::ForwardRequest)?;
      tracing::debug!(peer = ?peer.id(), conn_id = %request.addr, "Splicing peer relay stream");
      let stream_activity = stream.activity().clone();
      let peer_activity = peer_stream.activity().clone();
      tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut stream, &mut peer_stream) => {
          let (up, down) = copied?;
          tracing::debug!(up, down, "Peer relay stream finished");
        }
        quiet = until_idle(&stream_activity, &peer_activity, self.idle_timeout) => {
          tracing::debug!(idle_for = ?quiet, "Peer relay stream idle, closing");
          if let Err(error) = stream.shutdown().await {
            tracing::trace!(?error, "Stream already closed");
          }
          if let Err(error) = peer_stream.shutdown().await {
            tracing::trace!(?error, "Peer stream already closed");
          }
        }
      }
      Ok(())
    }
    .boxed()
  }
}
