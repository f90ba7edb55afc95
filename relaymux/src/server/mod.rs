// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types for accepting, authenticating, and serving multiplexed sessions
//!
//! [`SessionServer::serve_session`] owns one session from acceptance to teardown:
//! the first stream of an unauthenticated session carries the handshake, and every
//! later stream is handed to the [`StreamDispatcher`] or the peer relay handler on
//! a task of its own.
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing_futures::Instrument;

use crate::{
  common::{
    authentication::{CredentialVerifier, HopIdentity},
    peer_relay::{InMemoryPeerRelayRegistry, PeerRelayHandler, PeerRelayRegistry, RoomSplicer},
    policy::DestinationPolicy,
    protocol::{
      messages::{read_auth_request, write_message, AuthCode, AuthRequest, AuthResponse},
      tunnel::{ArcSession, BoxedMuxStream, MuxStream, SessionError},
    },
  },
  config::{MuxConfig, ServerConfig},
};

pub mod dial;
pub mod dispatcher;
pub mod hop;
pub mod idle;
pub mod rate_limit;
pub mod reaper;
pub mod relay;
pub mod session;

use self::{
  dial::DestinationDialer,
  dispatcher::StreamDispatcher,
  hop::{MuxSessionPool, SessionDialer},
  idle::IdleSessions,
  rate_limit::RateLimiterRegistry,
  reaper::IdleSessionReaper,
  session::SessionContext,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
  #[error("User {0:?} is not permitted")]
  UnknownUser(String),
  #[error("Compression method {0:?} is not supported")]
  UnsupportedCompressor(String),
  #[error("Connection id {conn_id:?} is already registered in room {room_id:?}")]
  PeerRelayRegistration { room_id: String, conn_id: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
  #[error("Stream accept failed: {0}")]
  Accept(#[source] SessionError),
  #[error("Authentication failed: {0}")]
  AuthFailed(#[from] AuthFailure),
}

impl ServeError {
  /// Returns `true` if the session ended because it was shut down, rather than by a failure
  pub fn is_shutdown(&self) -> bool {
    matches!(self, Self::Accept(error) if error.is_shutdown())
  }
}

/// Owns the registries shared by every session this process serves
pub struct SessionServer {
  mux: MuxConfig,
  verifier: Arc<dyn CredentialVerifier>,
  peer_registry: Arc<dyn PeerRelayRegistry>,
  peer_handler: Arc<dyn PeerRelayHandler>,
  dispatcher: Arc<StreamDispatcher>,
  idle: Arc<IdleSessions>,
}

impl std::fmt::Debug for SessionServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionServer")
      .field("verifier", &self.verifier)
      .field("dispatcher", &self.dispatcher)
      .field("idle", &self.idle)
      .finish_non_exhaustive()
  }
}

impl SessionServer {
  /// Builds a server whose direct destinations are reached through `dialer`
  /// and whose hops are reached through `hop_dialer`
  pub fn new(
    config: &ServerConfig,
    dialer: Arc<dyn DestinationDialer>,
    hop_dialer: Arc<dyn SessionDialer>,
  ) -> Self {
    let identity = HopIdentity::from_config(&config.cipher);
    let hops = Arc::new(MuxSessionPool::new(hop_dialer, identity));
    let dispatcher = StreamDispatcher::new(
      DestinationPolicy::from_config(&config.proxy_limit),
      dialer,
      hops,
      Arc::new(RateLimiterRegistry::new(config.rate_limit.clone())),
      &config.mux,
    );
    let peer_registry: Arc<dyn PeerRelayRegistry> = Arc::new(InMemoryPeerRelayRegistry::new());
    Self {
      mux: config.mux.clone(),
      verifier: Arc::new(config.cipher.clone()),
      peer_handler: Arc::new(RoomSplicer::new(
        Arc::clone(&peer_registry),
        config.mux.stream_idle_timeout(),
      )),
      peer_registry,
      dispatcher: Arc::new(dispatcher),
      idle: Arc::new(IdleSessions::new()),
    }
  }

  pub fn idle_sessions(&self) -> &Arc<IdleSessions> {
    &self.idle
  }

  pub fn peer_registry(&self) -> &Arc<dyn PeerRelayRegistry> {
    &self.peer_registry
  }

  /// A reaper over this server's sessions; it must be started by the caller
  pub fn reaper(&self) -> IdleSessionReaper {
    IdleSessionReaper::new(
      Arc::clone(&self.idle),
      self.mux.session_idle_timeout(),
      self.mux.reaper_interval(),
    )
  }

  /// Closes outbound hop sessions; sessions being served end as their transports close
  pub fn shutdown(&self) {
    self.dispatcher.hops().close_all();
  }

  /// Serves `session` until it closes or fails, then tears it down
  ///
  /// `auth` may carry an identity established out of band, in which case no
  /// handshake stream is expected.
  pub async fn serve_session(
    &self,
    session: ArcSession,
    auth: Option<AuthRequest>,
  ) -> Result<(), ServeError> {
    let ctx = Arc::new(SessionContext::new(
      session,
      auth,
      Arc::clone(&self.peer_registry),
    ));
    self.idle.register(&ctx);
    let span = tracing::info_span!("session", id = ?ctx.id());
    let result = self.accept_streams(&ctx).instrument(span.clone()).await;
    span.in_scope(|| match &result {
      Err(error) if error.is_shutdown() => tracing::debug!("Session shut down"),
      Err(error) => tracing::warn!(%error, "Session terminated"),
      Ok(()) => {}
    });
    self.idle.close(&ctx);
    result
  }

  async fn accept_streams(&self, ctx: &Arc<SessionContext>) -> Result<(), ServeError> {
    loop {
      let stream = ctx
        .session()
        .accept_stream()
        .await
        .map_err(ServeError::Accept)?;
      if ctx.auth().is_none() {
        self.handshake(ctx, stream).await?;
        continue;
      }
      self.dispatch(ctx, stream);
    }
  }

  #[tracing::instrument(skip_all, fields(stream = ?stream.id()))]
  async fn handshake(
    &self,
    ctx: &SessionContext,
    mut stream: BoxedMuxStream,
  ) -> Result<(), ServeError> {
    let request = match read_auth_request(&mut stream).await {
      Ok(request) => request,
      Err(error) => {
        tracing::warn!(%error, "Malformed auth request; awaiting another handshake");
        return Ok(());
      }
    };
    let (cipher_method, cipher_counter) = (request.cipher_method.clone(), request.cipher_counter);
    let user = request.user.clone();
    if let Err(failure) = self.admit(ctx, request) {
      let rejection = AuthResponse {
        code: AuthCode::Rejected,
      };
      if let Err(error) = write_message(&mut stream, &rejection).await {
        tracing::trace!(%error, "Failed to deliver rejection");
      }
      return Err(failure.into());
    }

    if let Err(error) = write_message(&mut stream, &AuthResponse::ok()).await {
      tracing::warn!(%error, "Failed to acknowledge handshake");
    }
    if let Err(error) = stream.shutdown().await {
      tracing::trace!(?error, "Handshake stream already closed");
    }
    if let Some(cipher) = ctx.session().cipher_context() {
      cipher.reset_crypto_context(&cipher_method, cipher_counter);
    }
    tracing::info!(%user, peer_relay = ctx.is_peer_relay(), "Session authenticated");
    Ok(())
  }

  /// Verifies the request and records it as the session's identity
  fn admit(&self, ctx: &SessionContext, request: AuthRequest) -> Result<(), AuthFailure> {
    if !self.verifier.verify_user(&request.user) {
      return Err(AuthFailure::UnknownUser(request.user));
    }
    if !self.verifier.is_valid_compressor(&request.compress_method) {
      return Err(AuthFailure::UnsupportedCompressor(request.compress_method));
    }
    let peer_ids = request
      .peer_relay_ids()
      .map(|(room_id, conn_id)| (room_id.to_string(), conn_id.to_string()));
    if !ctx.set_auth(request) {
      tracing::warn!("Session was already authenticated");
    }
    if let Some((room_id, conn_id)) = peer_ids {
      if !self
        .peer_registry
        .add_session(&room_id, &conn_id, Arc::clone(ctx.session()))
      {
        return Err(AuthFailure::PeerRelayRegistration { room_id, conn_id });
      }
      ctx.mark_peer_relay();
    }
    Ok(())
  }

  /// Runs the stream on its own task, counted as active on the session until it ends
  fn dispatch(&self, ctx: &Arc<SessionContext>, stream: BoxedMuxStream) {
    let guard = self.idle.enter_stream(ctx);
    let ctx = Arc::clone(ctx);
    if ctx.is_peer_relay() {
      let handler = Arc::clone(&self.peer_handler);
      let span = tracing::debug_span!("peer_stream", stream = ?stream.id());
      tokio::task::spawn(
        async move {
          let _guard = guard;
          if let Some(auth) = ctx.auth() {
            if let Err(error) = handler.handle_stream(stream, auth).await {
              tracing::warn!(%error, "Peer relay stream failed");
            }
          }
        }
        .instrument(span),
      );
    } else {
      let dispatcher = Arc::clone(&self.dispatcher);
      tokio::task::spawn(
        async move {
          let _guard = guard;
          if let Err(error) = dispatcher.handle_proxy_stream(stream, &ctx).await {
            tracing::warn!(%error, "Proxy stream aborted");
          }
        }
        .in_current_span(),
      );
    }
  }
}
