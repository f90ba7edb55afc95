// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{
  atomic::{AtomicBool, AtomicI64, Ordering},
  Arc, OnceLock,
};

use crate::{
  common::{
    peer_relay::PeerRelayRegistry,
    protocol::{
      messages::AuthRequest,
      tunnel::{ArcSession, SessionId},
    },
  },
  util::activity::ActivityClock,
};

/// State of one accepted session, shared by its accept loop and its stream handlers
///
/// The stream counter and closed flag are only written by [`super::idle::IdleSessions`],
/// which keeps them consistent with idle-candidate membership.
pub struct SessionContext {
  session: ArcSession,
  auth: OnceLock<AuthRequest>,
  activity: ActivityClock,
  pub(super) stream_counter: AtomicI64,
  pub(super) closed: AtomicBool,
  peer_relay: AtomicBool,
  peer_registry: Arc<dyn PeerRelayRegistry>,
}

impl SessionContext {
  pub fn new(
    session: ArcSession,
    auth: Option<AuthRequest>,
    peer_registry: Arc<dyn PeerRelayRegistry>,
  ) -> Self {
    let auth_cell = OnceLock::new();
    if let Some(auth) = auth {
      let _ = auth_cell.set(auth);
    }
    Self {
      session,
      auth: auth_cell,
      activity: ActivityClock::new(),
      stream_counter: AtomicI64::new(0),
      closed: AtomicBool::new(false),
      peer_relay: AtomicBool::new(false),
      peer_registry,
    }
  }

  pub fn id(&self) -> SessionId {
    self.session.id()
  }

  pub fn session(&self) -> &ArcSession {
    &self.session
  }

  /// `None` until the handshake completes; immutable afterwards
  pub fn auth(&self) -> Option<&AuthRequest> {
    self.auth.get()
  }

  /// Returns false if the session was already authenticated
  pub(super) fn set_auth(&self, auth: AuthRequest) -> bool {
    self.auth.set(auth).is_ok()
  }

  /// Refreshed by relay loops; read by the idle reaper
  pub fn activity(&self) -> &ActivityClock {
    &self.activity
  }

  pub fn stream_count(&self) -> i64 {
    self.stream_counter.load(Ordering::Acquire)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub fn is_peer_relay(&self) -> bool {
    self.peer_relay.load(Ordering::Acquire)
  }

  pub(super) fn mark_peer_relay(&self) {
    self.peer_relay.store(true, Ordering::Release);
  }

  /// Releases the session's external resources; runs once, after the context is marked closed
  pub(super) fn teardown(&self) {
    if self.is_peer_relay() {
      if let Some((room_id, conn_id)) = self.auth().and_then(AuthRequest::peer_relay_ids) {
        self
          .peer_registry
          .remove_session(room_id, conn_id, &self.session);
      }
    }
    self.session.close();
  }
}

impl std::fmt::Debug for SessionContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionContext")
      .field("id", &self.id())
      .field("authenticated", &self.auth().is_some())
      .field("streams", &self.stream_count())
      .field("closed", &self.is_closed())
      .field("peer_relay", &self.is_peer_relay())
      .finish()
  }
}
