// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames: a big-endian u32 length followed by that many bytes
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for control messages (auth and connect requests)
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

const U32_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
}

impl ReadError {
  /// Converts the failure back into an I/O error, keeping the underlying error kind
  pub fn into_io_error(self) -> std::io::Error {
    match self {
      ReadError::UnexpectedEnd { error, .. } => error,
      e @ ReadError::MaxLengthExceeded { .. } => {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
      }
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Frame write failure: {0}")]
  Write(#[from] std::io::Error),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Nothing is written when the serialized frame would be too long.
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

/// Reads one frame into `buffer`, replacing its previous content
///
/// Returns `Ok(false)` if the stream ended cleanly before a length prefix.
pub async fn read_frame_into<T: AsyncRead + Unpin>(
  mut s: T,
  buffer: &mut Vec<u8>,
  max_length: Option<usize>,
) -> Result<bool, ReadError> {
  let mut prefix = [0u8; U32_SIZE];
  let mut filled = 0;
  while filled < U32_SIZE {
    let read = s
      .read(&mut prefix[filled..])
      .await
      .map_err(|error| ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      })?;
    if read == 0 {
      if filled == 0 {
        return Ok(false);
      }
      return Err(ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error: std::io::ErrorKind::UnexpectedEof.into(),
      });
    }
    filled += read;
  }
  let length = u32::from_be_bytes(prefix) as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  buffer.clear();
  buffer.resize(length, 0);
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(true)
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  let mut buffer = Vec::new();
  if read_frame_into(s, &mut buffer, max_length).await? {
    Ok(buffer)
  } else {
    Err(ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error: std::io::ErrorKind::UnexpectedEof.into(),
    })
  }
}

pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> std::io::Result<()> {
  let length = u32::try_from(buffer.len())
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
  // Single write keeps the prefix and body together on message-oriented transports
  let mut framed = Vec::with_capacity(U32_SIZE + buffer.len());
  framed.extend_from_slice(&length.to_be_bytes());
  framed.extend_from_slice(buffer);
  s.write_all(&framed).await?;
  s.flush().await
}

pub async fn read_framed_json<TStream, TOutput>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError>
where
  TStream: AsyncRead + Unpin,
  TOutput: serde::de::DeserializeOwned,
{
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

pub async fn write_framed_json<TStream: AsyncWrite + Unpin, TInput: serde::Serialize>(
  s: TStream,
  value: TInput,
  max_length: Option<usize>,
) -> Result<(), JsonWriteError> {
  let buffer = serde_json::to_vec(&value)?;
  if let Some(max_length) = max_length {
    if buffer.len() + U32_SIZE > max_length {
      return Err(JsonWriteError::MaxLengthExceeded {
        expected: max_length,
        produced: buffer.len() + U32_SIZE,
      });
    }
  }
  Ok(write_frame(s, &buffer).await?)
}
