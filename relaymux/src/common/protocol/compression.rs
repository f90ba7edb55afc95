// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Compression layered over the proxy side of a stream
//!
//! `none` passes bytes through unchanged. `deflate` carries each relayed chunk
//! as one length-prefixed frame holding an independently deflated block.
use std::io::{Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::framed::{read_frame_into, write_frame};

/// Largest chunk handed to or produced by a compressed stream
pub const MAX_CHUNK_LENGTH: usize = 128 * 1024;

// Deflate can expand incompressible input slightly
const MAX_COMPRESSED_FRAME_LENGTH: usize = MAX_CHUNK_LENGTH + 1024;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CompressMethod {
  None,
  Deflate,
}

impl CompressMethod {
  pub const SUPPORTED: &'static [CompressMethod] = &[CompressMethod::None, CompressMethod::Deflate];

  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "none" | "" => Some(Self::None),
      "deflate" => Some(Self::Deflate),
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::None => "none",
      Self::Deflate => "deflate",
    }
  }

  /// Layers this method over the two halves of a stream
  pub fn wrap_stream<R, W>(&self, reader: R, writer: W) -> (CompressedReader<R>, CompressedWriter<W>)
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    (
      CompressedReader {
        method: *self,
        inner: reader,
        frame: Vec::new(),
      },
      CompressedWriter {
        method: *self,
        inner: writer,
      },
    )
  }
}

impl std::fmt::Display for CompressMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Decompressing half; yields plain bytes chunk by chunk
pub struct CompressedReader<R> {
  method: CompressMethod,
  inner: R,
  frame: Vec<u8>,
}

impl<R: AsyncRead + Unpin> CompressedReader<R> {
  /// Replaces the content of `out` with the next chunk; returns its length, zero at end of stream
  pub async fn read_chunk(&mut self, out: &mut Vec<u8>) -> std::io::Result<usize> {
    out.clear();
    match self.method {
      CompressMethod::None => {
        out.resize(MAX_CHUNK_LENGTH, 0);
        let read = self.inner.read(out.as_mut_slice()).await?;
        out.truncate(read);
        Ok(read)
      }
      CompressMethod::Deflate => {
        let more = read_frame_into(
          &mut self.inner,
          &mut self.frame,
          Some(MAX_COMPRESSED_FRAME_LENGTH),
        )
        .await
        .map_err(|e| e.into_io_error())?;
        if !more {
          return Ok(0);
        }
        DeflateDecoder::new(self.frame.as_slice())
          .take(MAX_CHUNK_LENGTH as u64 + 1)
          .read_to_end(out)?;
        if out.len() > MAX_CHUNK_LENGTH {
          return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed chunk exceeds maximum length",
          ));
        }
        if out.is_empty() {
          return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty compressed chunk",
          ));
        }
        Ok(out.len())
      }
    }
  }
}

/// Compressing half
pub struct CompressedWriter<W> {
  method: CompressMethod,
  inner: W,
}

impl<W: AsyncWrite + Unpin> CompressedWriter<W> {
  pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
    if chunk.is_empty() {
      return Ok(());
    }
    match self.method {
      CompressMethod::None => {
        self.inner.write_all(chunk).await?;
        self.inner.flush().await
      }
      CompressMethod::Deflate => {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(chunk.len() / 2), Compression::fast());
        encoder.write_all(chunk)?;
        let compressed = encoder.finish()?;
        write_frame(&mut self.inner, &compressed).await
      }
    }
  }

  /// Flushes and closes the write direction of the underlying stream
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    self.inner.shutdown().await
  }
}

#[cfg(test)]
mod tests {
  use super::{CompressMethod, MAX_CHUNK_LENGTH};

  async fn round_trip(method: CompressMethod, chunks: &[Vec<u8>]) -> Vec<u8> {
    let (near, far) = tokio::io::duplex(1024 * 1024);
    let (_near_r, near_w) = tokio::io::split(near);
    let (far_r, _far_w) = tokio::io::split(far);
    let (_, mut writer) = method.wrap_stream(tokio::io::empty(), near_w);
    let (mut reader, _) = method.wrap_stream(far_r, tokio::io::sink());
    for chunk in chunks {
      writer.write_chunk(chunk).await.unwrap();
    }
    writer.shutdown().await.unwrap();
    drop(writer);

    let mut received = Vec::new();
    let mut buf = Vec::new();
    while reader.read_chunk(&mut buf).await.unwrap() > 0 {
      received.extend_from_slice(&buf);
    }
    received
  }

  fn sample_chunks() -> Vec<Vec<u8>> {
    vec![
      b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec(),
      (0u32..MAX_CHUNK_LENGTH as u32).map(|x| (x * 7 % 251) as u8).collect(),
      vec![0u8; 4096],
      b"tail".to_vec(),
    ]
  }

  #[tokio::test]
  async fn bytes_survive_every_method() {
    let chunks = sample_chunks();
    let expected: Vec<u8> = chunks.concat();
    for method in CompressMethod::SUPPORTED {
      assert_eq!(round_trip(*method, &chunks).await, expected, "method {}", method);
    }
  }

  #[tokio::test]
  async fn deflate_frames_are_smaller_for_redundant_data() {
    let (near, mut far) = tokio::io::duplex(1024 * 1024);
    let (_, mut writer) = CompressMethod::Deflate.wrap_stream(tokio::io::empty(), near);
    writer.write_chunk(&vec![b'a'; 64 * 1024]).await.unwrap();
    drop(writer);
    let mut raw = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut far, &mut raw)
      .await
      .unwrap();
    assert!(raw.len() < 4096, "compressed to {} bytes", raw.len());
  }

  #[test]
  fn method_names() {
    assert_eq!(CompressMethod::from_name("deflate"), Some(CompressMethod::Deflate));
    assert_eq!(CompressMethod::from_name("none"), Some(CompressMethod::None));
    assert_eq!(CompressMethod::from_name("snappy"), None);
  }
}
