// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The bidirectional copy between a proxy stream and its destination
use std::sync::Arc;

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use super::{dial::BoxedDestination, rate_limit::TokenBucket};
use crate::{
  common::protocol::{
    compression::{CompressMethod, CompressedReader, CompressedWriter, MAX_CHUNK_LENGTH},
    tunnel::{BoxedMuxStream, MuxStream},
  },
  util::{activity::ActivityClock, is_timeout_error},
};

/// How long teardown waits for the stream-to-destination copy before abandoning it
pub const UPSTREAM_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayOptions {
  pub compress: CompressMethod,
  /// A destination read timing out is retried while the stream itself saw I/O within this window
  pub idle_timeout: Duration,
  /// Throttles destination reads when present
  pub bucket: Option<Arc<TokenBucket>>,
  /// Refreshed on every relayed chunk so the session is not considered idle
  pub session_activity: ActivityClock,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
  pub upstream_bytes: u64,
  pub downstream_bytes: u64,
  pub timeout_retries: u32,
}

enum CopyError {
  Read(std::io::Error),
  Write(std::io::Error),
}

/// Relays until either side fails or the stream goes idle, then closes both
///
/// The stream-to-destination direction runs on its own task and is joined,
/// with a bound, before this returns.
pub async fn relay(
  stream: BoxedMuxStream,
  destination: BoxedDestination,
  options: RelayOptions,
) -> RelayStats {
  let stream_activity = stream.activity().clone();
  let deadline = destination.read_deadline();
  let (stream_read, stream_write) = tokio::io::split(stream);
  let (reader, mut writer) = options.compress.wrap_stream(stream_read, stream_write);
  let (mut dest_read, dest_write) = tokio::io::split(destination);

  let cancel = CancellationToken::new();
  let mut upstream = tokio::task::spawn(copy_upstream(
    reader,
    dest_write,
    cancel.clone(),
    options.session_activity.clone(),
  ));

  let mut stats = RelayStats::default();
  let mut buf = vec![0u8; MAX_CHUNK_LENGTH];
  let outcome = loop {
    if let Some(deadline) = deadline.as_ref() {
      deadline.set_read_deadline(Instant::now() + options.idle_timeout);
    }
    match copy_downstream(&mut dest_read, &mut writer, &options, &mut buf, &mut stats).await {
      Err(CopyError::Read(error))
        if is_timeout_error(&error) && stream_activity.idle_for() < options.idle_timeout =>
      {
        stats.timeout_retries += 1;
        continue;
      }
      other => break other,
    }
  };
  match outcome {
    Ok(()) => tracing::debug!("Destination closed"),
    Err(CopyError::Read(error)) if is_timeout_error(&error) => {
      tracing::debug!(idle_for = ?stream_activity.idle_for(), "Stream idle, closing")
    }
    Err(CopyError::Read(error)) => tracing::debug!(?error, "Destination read failed"),
    Err(CopyError::Write(error)) => tracing::debug!(?error, "Stream write failed"),
  }

  if let Err(error) = writer.shutdown().await {
    tracing::trace!(?error, "Stream already closed");
  }
  cancel.cancel();
  match tokio::time::timeout(UPSTREAM_JOIN_TIMEOUT, &mut upstream).await {
    Ok(Ok(upstream_bytes)) => stats.upstream_bytes = upstream_bytes,
    Ok(Err(error)) => tracing::warn!(?error, "Upstream copy task failed"),
    Err(_) => {
      tracing::warn!("Upstream copy did not finish in time; aborting it");
      upstream.abort();
    }
  }
  stats
}

async fn copy_downstream<R, W>(
  dest_read: &mut R,
  writer: &mut CompressedWriter<W>,
  options: &RelayOptions,
  buf: &mut [u8],
  stats: &mut RelayStats,
) -> Result<(), CopyError>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  loop {
    let read = dest_read.read(buf).await.map_err(CopyError::Read)?;
    if read == 0 {
      return Ok(());
    }
    if let Some(bucket) = options.bucket.as_ref() {
      bucket.wait(read).await;
    }
    writer
      .write_chunk(&buf[..read])
      .await
      .map_err(CopyError::Write)?;
    stats.downstream_bytes += read as u64;
    options.session_activity.touch();
  }
}

async fn copy_upstream<R, W>(
  mut reader: CompressedReader<R>,
  mut dest_write: W,
  cancel: CancellationToken,
  session_activity: ActivityClock,
) -> u64
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = Vec::with_capacity(MAX_CHUNK_LENGTH);
  let mut total = 0u64;
  loop {
    let step = async {
      let read = reader.read_chunk(&mut buf).await?;
      if read > 0 {
        dest_write.write_all(&buf[..read]).await?;
      }
      Ok::<usize, std::io::Error>(read)
    };
    let copied = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      copied = step => copied,
    };
    match copied {
      Ok(0) => break,
      Ok(read) => {
        total += read as u64;
        session_activity.touch();
      }
      Err(error) => {
        tracing::debug!(?error, "Upstream copy failed");
        break;
      }
    }
  }
  if let Err(error) = dest_write.shutdown().await {
    tracing::trace!(?error, "Destination already closed");
  }
  total
}
