// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::protocol::tunnel::{MuxStream, StreamId};
use crate::util::activity::ActivityClock;

/// A transport stream assembled from separate receive and send halves
///
/// Every read or write that moves at least one byte refreshes the stream's
/// [`ActivityClock`], which is what `latest_io_time` reports.
pub struct TrackedStream<R, W> {
  id: StreamId,
  recv: R,
  send: W,
  activity: ActivityClock,
}

impl<R, W> TrackedStream<R, W> {
  pub fn new(id: StreamId, recv: R, send: W) -> Self {
    Self {
      id,
      recv,
      send,
      activity: ActivityClock::new(),
    }
  }
}

impl<R, W> AsyncRead for TrackedStream<R, W>
where
  R: AsyncRead + Unpin,
  W: Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    let before = buf.filled().len();
    let res = futures::ready!(Pin::new(&mut this.recv).poll_read(cx, buf));
    if res.is_ok() && buf.filled().len() > before {
      this.activity.touch();
    }
    Poll::Ready(res)
  }
}

impl<R, W> AsyncWrite for TrackedStream<R, W>
where
  R: Unpin,
  W: AsyncWrite + Unpin,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.get_mut();
    let res = futures::ready!(Pin::new(&mut this.send).poll_write(cx, buf));
    if let Ok(written) = res {
      if written > 0 {
        this.activity.touch();
      }
    }
    Poll::Ready(res)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    Pin::new(&mut self.get_mut().send).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    Pin::new(&mut self.get_mut().send).poll_shutdown(cx)
  }
}

impl<R, W> MuxStream for TrackedStream<R, W>
where
  R: AsyncRead + Send + Unpin,
  W: AsyncWrite + Send + Unpin,
{
  fn id(&self) -> StreamId {
    self.id
  }

  fn activity(&self) -> &ActivityClock {
    &self.activity
  }
}
