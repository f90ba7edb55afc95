// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outbound multiplexed sessions to further proxy hops
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use url::Url;

use crate::common::{
  authentication::{authenticate_session, HandshakeError, HopIdentity},
  protocol::{
    messages::MessageError,
    tunnel::{
      quinn_tunnel::QuinnSession, ArcSession, BoxedMuxStream, MonotonicAtomicGenerator,
      SessionError,
    },
  },
};

pub const HOP_SCHEME_QUIC: &str = "quic";

#[derive(thiserror::Error, Debug)]
pub enum HopError {
  #[error("Unsupported hop scheme {0:?}")]
  UnsupportedScheme(String),
  #[error("Hop URL {0} lacks a host or port")]
  MissingAddress(Url),
  #[error("Failed to resolve hop address: {0}")]
  Resolve(#[source] std::io::Error),
  #[error("Failed to connect to hop: {0}")]
  Connect(String),
  #[error("Hop rejected this server's handshake: {0}")]
  Handshake(#[from] HandshakeError),
  #[error("Failed to open a stream to the hop: {0}")]
  OpenStream(#[from] SessionError),
  #[error("Failed to forward the connect request to the hop: {0}")]
  Forward(#[source] MessageError),
}

/// Establishes transport sessions to hop URLs; authentication is layered on by [`MuxSessionPool`]
pub trait SessionDialer: std::fmt::Debug + Send + Sync {
  fn dial<'a>(&'a self, hop: &'a Url) -> BoxFuture<'a, Result<ArcSession, HopError>>;
}

/// Dials `quic://host:port` hops from a client endpoint
pub struct QuinnDialer {
  endpoint: quinn::Endpoint,
  server_name: Option<String>,
  ids: Arc<MonotonicAtomicGenerator>,
}

impl QuinnDialer {
  /// `server_name` overrides the TLS name checked against the hop's certificate
  pub fn new(
    endpoint: quinn::Endpoint,
    server_name: Option<String>,
    ids: Arc<MonotonicAtomicGenerator>,
  ) -> Self {
    Self {
      endpoint,
      server_name,
      ids,
    }
  }
}

impl std::fmt::Debug for QuinnDialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuinnDialer")
      .field("server_name", &self.server_name)
      .finish_non_exhaustive()
  }
}

impl SessionDialer for QuinnDialer {
  fn dial<'a>(&'a self, hop: &'a Url) -> BoxFuture<'a, Result<ArcSession, HopError>> {
    async move {
      if hop.scheme() != HOP_SCHEME_QUIC {
        return Err(HopError::UnsupportedScheme(hop.scheme().to_string()));
      }
      let (host, port) = match (hop.host_str(), hop.port()) {
        (Some(host), Some(port)) => (host, port),
        _ => return Err(HopError::MissingAddress(hop.clone())),
      };
      let host = host.trim_start_matches('[').trim_end_matches(']');
      let remote = tokio::net::lookup_host((host, port))
        .await
        .map_err(HopError::Resolve)?
        .next()
        .ok_or_else(|| HopError::MissingAddress(hop.clone()))?;
      let server_name = self.server_name.as_deref().unwrap_or(host);
      let connection = self
        .endpoint
        .connect(remote, server_name)
        .map_err(|e| HopError::Connect(e.to_string()))?
        .await
        .map_err(|e| HopError::Connect(e.to_string()))?;
      tracing::debug!(%hop, %remote, "Connected to hop");
      Ok(Arc::new(QuinnSession::new(self.ids.next(), connection)) as ArcSession)
    }
    .boxed()
  }
}

/// Authenticated outbound sessions, one per hop URL, reused across streams
pub struct MuxSessionPool {
  dialer: Arc<dyn SessionDialer>,
  identity: HopIdentity,
  sessions: DashMap<String, ArcSession>,
  // Held while a hop is dialed, so concurrent cold opens share one session
  dialing: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
  closed: AtomicBool,
}

impl std::fmt::Debug for MuxSessionPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxSessionPool")
      .field("dialer", &self.dialer)
      .field("sessions", &self.sessions.len())
      .field("closed", &self.closed.load(Ordering::Acquire))
      .finish()
  }
}

impl MuxSessionPool {
  pub fn new(dialer: Arc<dyn SessionDialer>, identity: HopIdentity) -> Self {
    Self {
      dialer,
      identity,
      sessions: DashMap::new(),
      dialing: DashMap::new(),
      closed: AtomicBool::new(false),
    }
  }

  fn cached(&self, key: &str) -> Option<ArcSession> {
    self
      .sessions
      .get(key)
      .map(|entry| Arc::clone(entry.value()))
      .filter(|session| !session.is_closed())
  }

  async fn dial_authenticated(&self, hop: &Url) -> Result<ArcSession, HopError> {
    let session = self.dialer.dial(hop).await?;
    if let Err(error) = authenticate_session(session.as_ref(), &self.identity.auth_request()).await {
      session.close();
      return Err(error.into());
    }
    self.sessions.insert(hop.to_string(), Arc::clone(&session));
    // A dial racing `close_all` must not leave a session behind
    if self.closed.load(Ordering::Acquire) {
      self
        .sessions
        .remove_if(&hop.to_string(), |_, current| current.id() == session.id());
      session.close();
      return Err(HopError::OpenStream(SessionError::Shutdown));
    }
    Ok(session)
  }

  /// The live session for `hop`, dialing one if needed; true when freshly dialed
  async fn session_for(&self, hop: &Url) -> Result<(ArcSession, bool), HopError> {
    let key = hop.to_string();
    if let Some(session) = self.cached(&key) {
      return Ok((session, false));
    }
    let gate = Arc::clone(self.dialing.entry(key.clone()).or_default().value());
    let _dialing = gate.lock().await;
    if let Some(session) = self.cached(&key) {
      return Ok((session, false));
    }
    if self.closed.load(Ordering::Acquire) {
      return Err(HopError::OpenStream(SessionError::Shutdown));
    }
    Ok((self.dial_authenticated(hop).await?, true))
  }

  fn evict(&self, hop: &Url, session: &ArcSession) {
    self
      .sessions
      .remove_if(&hop.to_string(), |_, current| current.id() == session.id());
    session.close();
  }

  /// Opens a stream to `hop`, reusing its cached session; a stale session is replaced once
  pub async fn open_stream(&self, hop: &Url) -> Result<BoxedMuxStream, HopError> {
    let (session, fresh) = self.session_for(hop).await?;
    match session.open_stream().await {
      Ok(stream) => Ok(stream),
      Err(error) if fresh => Err(error.into()),
      Err(error) => {
        tracing::debug!(%hop, ?error, "Evicting hop session after failed stream open");
        self.evict(hop, &session);
        let (session, _) = self.session_for(hop).await?;
        Ok(session.open_stream().await?)
      }
    }
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }

  /// Closes every cached session; later opens fail with [`SessionError::Shutdown`]
  pub fn close_all(&self) {
    self.closed.store(true, Ordering::Release);
    for entry in self.sessions.iter() {
      entry.value().close();
    }
    self.sessions.clear();
  }
}
