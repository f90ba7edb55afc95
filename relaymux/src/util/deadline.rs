// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Read deadlines for destination connections
use std::{
  future::Future,
  io::Error as IOError,
  pin::Pin,
  sync::{Arc, Mutex},
  task::{Context, Poll},
};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  time::{Instant, Sleep},
};

/// Capability of a connection whose pending and future reads can be bounded by an instant
///
/// Reads that have not completed by the deadline fail with [`std::io::ErrorKind::TimedOut`].
pub trait ReadDeadline: Send + Sync {
  fn set_read_deadline(&self, deadline: Instant);
}

/// Deadline shared between a [`DeadlineStream`] and the holders of its handle
#[derive(Debug, Default)]
pub struct SharedDeadline {
  at: Mutex<Option<Instant>>,
}

impl SharedDeadline {
  fn get(&self) -> Option<Instant> {
    *self.at.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl ReadDeadline for SharedDeadline {
  fn set_read_deadline(&self, deadline: Instant) {
    *self.at.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(deadline);
  }
}

/// Wraps a byte stream so that reads honour a [`ReadDeadline`]
///
/// The deadline handle survives `tokio::io::split`, which is why it is
/// handed out as an `Arc` rather than set through `&mut self`.
pub struct DeadlineStream<T> {
  inner: T,
  deadline: Arc<SharedDeadline>,
  timer: Pin<Box<Sleep>>,
  armed_for: Option<Instant>,
}

impl<T> DeadlineStream<T> {
  pub fn new(inner: T) -> Self {
    Self {
      inner,
      deadline: Arc::new(SharedDeadline::default()),
      timer: Box::pin(tokio::time::sleep_until(Instant::now())),
      armed_for: None,
    }
  }

  pub fn deadline_handle(&self) -> Arc<dyn ReadDeadline> {
    self.deadline.clone()
  }
}

impl<T: AsyncRead + Unpin> AsyncRead for DeadlineStream<T> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_read(cx, buf) {
      return Poll::Ready(res);
    }
    let deadline = match this.deadline.get() {
      None => return Poll::Pending,
      Some(deadline) => deadline,
    };
    if this.armed_for != Some(deadline) {
      this.timer.as_mut().reset(deadline);
      this.armed_for = Some(deadline);
    }
    match this.timer.as_mut().poll(cx) {
      Poll::Ready(()) => Poll::Ready(Err(IOError::new(
        std::io::ErrorKind::TimedOut,
        "read deadline exceeded",
      ))),
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<T> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
