// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::{future::BoxFuture, FutureExt};

use super::{BoxedMuxStream, MuxSession, SessionError, SessionId, StreamId};
use crate::util::tunnel_stream::TrackedStream;

/// A QUIC connection acting as a multiplexed session; each bidirectional stream is one proxy stream
pub struct QuinnSession {
  id: SessionId,
  connection: quinn::Connection,
}

impl QuinnSession {
  pub fn new(id: SessionId, connection: quinn::Connection) -> Self {
    Self { id, connection }
  }
}

impl std::fmt::Debug for QuinnSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuinnSession")
      .field("id", &self.id)
      .field("remote", &self.connection.remote_address())
      .finish()
  }
}

fn wrap_bi(send: quinn::SendStream, recv: quinn::RecvStream) -> BoxedMuxStream {
  let id = StreamId::new(send.id().index());
  Box::new(TrackedStream::new(id, recv, send))
}

impl MuxSession for QuinnSession {
  fn id(&self) -> SessionId {
    self.id
  }

  fn accept_stream(&self) -> BoxFuture<'_, Result<BoxedMuxStream, SessionError>> {
    self
      .connection
      .accept_bi()
      .map(|result| match result {
        Ok((send, recv)) => Ok(wrap_bi(send, recv)),
        Err(e) => Err(e.into()),
      })
      .boxed()
  }

  fn open_stream(&self) -> BoxFuture<'_, Result<BoxedMuxStream, SessionError>> {
    self
      .connection
      .open_bi()
      .map(|result| match result {
        Ok((send, recv)) => Ok(wrap_bi(send, recv)),
        Err(e) => Err(e.into()),
      })
      .boxed()
  }

  fn close(&self) {
    self.connection.close(0u32.into(), b"closed");
  }

  fn is_closed(&self) -> bool {
    self.connection.close_reason().is_some()
  }
}

impl From<quinn::ConnectionError> for SessionError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::ConnectionClosed(_)
      | quinn::ConnectionError::ApplicationClosed(_)
      | quinn::ConnectionError::LocallyClosed => Self::Shutdown,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      other => Self::Transport(other.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::super::SessionError;

  #[test]
  fn connection_errors_map_to_session_errors() {
    assert_eq!(
      SessionError::from(quinn::ConnectionError::LocallyClosed),
      SessionError::Shutdown
    );
    assert_eq!(
      SessionError::from(quinn::ConnectionError::TimedOut),
      SessionError::TimedOut
    );
    assert!(matches!(
      SessionError::from(quinn::ConnectionError::Reset),
      SessionError::Transport(_)
    ));
  }
}
