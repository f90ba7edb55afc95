// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

use crate::{
  common::protocol::{
    compression::CompressMethod,
    messages::{read_auth_response, write_message, AuthCode, AuthRequest, MessageError},
    tunnel::{MuxSession, SessionError},
  },
  config::CipherConfig,
};

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("Failed to open handshake stream: {0}")]
  OpenStream(#[source] SessionError),
  #[error("Handshake message failure: {0}")]
  Message(#[from] MessageError),
  #[error("Remote rejected authentication with {0:?}")]
  Rejected(AuthCode),
}

/// The identity this server presents when it dials further hops
#[derive(Debug)]
pub struct HopIdentity {
  user: String,
  cipher_method: String,
  next_counter: AtomicU64,
}

impl HopIdentity {
  pub fn new(user: impl Into<String>, cipher_method: impl Into<String>, counter_seed: u64) -> Self {
    Self {
      user: user.into(),
      cipher_method: cipher_method.into(),
      next_counter: AtomicU64::new(counter_seed),
    }
  }

  /// Seeds cipher counters from the wall clock so restarts do not reuse them
  pub fn from_config(config: &CipherConfig) -> Self {
    let seed = std::time::SystemTime::now()
      .duration_since(std::time::SystemTime::UNIX_EPOCH)
      .map(|since| since.as_millis() as u64)
      .unwrap_or_default();
    Self::new(config.user.clone(), config.method.clone(), seed)
  }

  /// Builds a handshake request with a counter never handed out before by this identity
  pub fn auth_request(&self) -> AuthRequest {
    AuthRequest {
      user: self.user.clone(),
      compress_method: CompressMethod::None.name().to_string(),
      cipher_method: self.cipher_method.clone(),
      cipher_counter: self.next_counter.fetch_add(1, Ordering::Relaxed),
      p2sp_room_id: None,
      p2sp_conn_id: None,
    }
  }
}

/// Client side of the handshake: one dedicated stream, one request, one response
#[tracing::instrument(skip_all, fields(session = ?session.id(), user = %request.user), err)]
pub async fn authenticate_session(
  session: &dyn MuxSession,
  request: &AuthRequest,
) -> Result<(), HandshakeError> {
  let mut stream = session
    .open_stream()
    .await
    .map_err(HandshakeError::OpenStream)?;
  write_message(&mut stream, request).await?;
  let response = read_auth_response(&mut stream).await?;
  if let Err(error) = stream.shutdown().await {
    tracing::trace!(?error, "handshake stream already closed by remote");
  }
  match response.code {
    AuthCode::Ok => Ok(()),
    code => Err(HandshakeError::Rejected(code)),
  }
}
