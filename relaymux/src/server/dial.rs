// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Direct connections to proxy destinations
use std::{net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpStream,
  time::Duration,
};

use crate::{
  common::protocol::tunnel::BoxedMuxStream,
  util::deadline::{DeadlineStream, ReadDeadline},
};

/// The far side of a relayed stream: a dialed socket, or a stream on a further hop
pub trait DestinationConn: AsyncRead + AsyncWrite + Send + Unpin {
  /// Deadline control, for connections which support bounding their reads
  fn read_deadline(&self) -> Option<Arc<dyn ReadDeadline>> {
    None
  }
}

pub type BoxedDestination = Box<dyn DestinationConn + 'static>;

impl<T> DestinationConn for DeadlineStream<T>
where
  T: AsyncRead + AsyncWrite + Send + Unpin,
{
  fn read_deadline(&self) -> Option<Arc<dyn ReadDeadline>> {
    Some(self.deadline_handle())
  }
}

impl DestinationConn for BoxedMuxStream {}

pub trait DestinationDialer: std::fmt::Debug + Send + Sync {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    addr: &'a str,
    timeout: Duration,
  ) -> BoxFuture<'a, std::io::Result<BoxedDestination>>;
}

/// Dials `tcp`, `tcp4`, and `tcp6` destinations, bounding reads with a [`DeadlineStream`]
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

fn family_filter(network: &str) -> std::io::Result<fn(&SocketAddr) -> bool> {
  let accept: fn(&SocketAddr) -> bool = match network {
    "tcp" => |_| true,
    "tcp4" => SocketAddr::is_ipv4,
    "tcp6" => SocketAddr::is_ipv6,
    other => {
      return Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("unsupported network {:?}", other),
      ))
    }
  };
  Ok(accept)
}

impl TcpDialer {
  async fn connect(network: &str, addr: &str) -> std::io::Result<TcpStream> {
    let accept = family_filter(network)?;
    let mut last_error = None;
    for candidate in tokio::net::lookup_host(addr).await?.filter(|a| accept(a)) {
      match TcpStream::connect(candidate).await {
        Ok(stream) => return Ok(stream),
        Err(error) => {
          tracing::trace!(%candidate, ?error, "Destination candidate failed");
          last_error = Some(error);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        format!("no {} address for {}", network, addr),
      )
    }))
  }
}

impl DestinationDialer for TcpDialer {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    addr: &'a str,
    timeout: Duration,
  ) -> BoxFuture<'a, std::io::Result<BoxedDestination>> {
    async move {
      let stream = tokio::time::timeout(timeout, Self::connect(network, addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??;
      if let Err(error) = stream.set_nodelay(true) {
        tracing::trace!(?error, "Failed to disable Nagle on destination");
      }
      Ok(Box::new(DeadlineStream::new(stream)) as BoxedDestination)
    }
    .boxed()
  }
}
