// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multiplexed session and stream abstractions consumed by the server core

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::{common::authentication::CipherReset, util::activity::ActivityClock};

pub mod duplex;
pub mod id;
pub mod quinn_tunnel;

pub use self::id::{MonotonicAtomicGenerator, SessionId, StreamId};

pub type BoxedMuxStream = Box<dyn MuxStream + 'static>;
pub type ArcSession = Arc<dyn MuxSession + 'static>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
  /// The session was closed, locally or by the remote; no further streams will arrive
  #[error("Session shut down")]
  Shutdown,
  #[error("Session timed out")]
  TimedOut,
  #[error("Transport error encountered: {0}")]
  Transport(String),
}

impl SessionError {
  /// Returns `true` if the error is a clean [`Shutdown`].
  ///
  /// [`Shutdown`]: SessionError::Shutdown
  #[must_use]
  pub fn is_shutdown(&self) -> bool {
    matches!(self, Self::Shutdown)
  }
}

/// One logical, independently flow-controlled stream carried by a session
pub trait MuxStream: AsyncRead + AsyncWrite + Send + Unpin {
  fn id(&self) -> StreamId;

  /// Shared clock refreshed by every read or write on this stream
  fn activity(&self) -> &ActivityClock;

  fn latest_io_time(&self) -> Instant {
    self.activity().latest()
  }
}

impl<T: MuxStream + ?Sized> MuxStream for Box<T> {
  fn id(&self) -> StreamId {
    (**self).id()
  }

  fn activity(&self) -> &ActivityClock {
    (**self).activity()
  }
}

/// A multiplexed transport connection able to carry many streams
pub trait MuxSession: Send + Sync {
  fn id(&self) -> SessionId;

  /// Waits for the remote to open a stream; fails with [`SessionError::Shutdown`] once closed
  fn accept_stream(&self) -> BoxFuture<'_, Result<BoxedMuxStream, SessionError>>;

  fn open_stream(&self) -> BoxFuture<'_, Result<BoxedMuxStream, SessionError>>;

  /// Closes the session; idempotent. In-flight streams observe errors on their next I/O.
  fn close(&self);

  fn is_closed(&self) -> bool;

  /// Symmetric-cipher keystream control, for transports which expose it
  fn cipher_context(&self) -> Option<&dyn CipherReset> {
    None
  }
}
