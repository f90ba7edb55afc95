// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Control messages exchanged at the head of a stream
//!
//! Every message is a single length-prefixed JSON frame; see [`crate::util::framed`].
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::util::framed::{
  read_framed_json, write_framed_json, JsonReadError, JsonWriteError, MAX_MESSAGE_LENGTH,
};

/// Sent by the client on the first stream of a session
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AuthRequest {
  pub user: String,
  pub compress_method: String,
  #[serde(default)]
  pub cipher_method: String,
  #[serde(default)]
  pub cipher_counter: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub p2sp_room_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub p2sp_conn_id: Option<String>,
}

impl AuthRequest {
  /// Room and connection ids, if the client asked to join a peer relay room
  pub fn peer_relay_ids(&self) -> Option<(&str, &str)> {
    match (self.p2sp_room_id.as_deref(), self.p2sp_conn_id.as_deref()) {
      (Some(room), conn) if !room.is_empty() => Some((room, conn.unwrap_or_default())),
      _ => None,
    }
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthCode {
  Ok,
  Rejected,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AuthResponse {
  pub code: AuthCode,
}

impl AuthResponse {
  pub fn ok() -> Self {
    Self { code: AuthCode::Ok }
  }
}

/// Per-connection options carried alongside a destination address
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct StreamOptions {
  /// Milliseconds; zero selects the server default
  #[serde(default)]
  pub dial_timeout_ms: u64,
  /// Milliseconds; zero leaves the server's stream idle timeout in effect
  #[serde(default)]
  pub read_timeout_ms: u64,
  /// Proxy nodes to traverse, nearest first
  #[serde(default)]
  pub hops: Vec<String>,
}

/// Sent by the client at the head of every proxy stream
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
  pub network: String,
  pub addr: String,
  #[serde(flatten)]
  pub options: StreamOptions,
}

impl ConnectRequest {
  pub fn new(network: impl Into<String>, addr: impl Into<String>, options: StreamOptions) -> Self {
    Self {
      network: network.into(),
      addr: addr.into(),
      options,
    }
  }

  /// The request to forward to the first hop, or `None` if there are no hops
  pub fn next_hop(&self) -> Option<(&str, ConnectRequest)> {
    let (first, rest) = self.options.hops.split_first()?;
    let forwarded = ConnectRequest {
      network: self.network.clone(),
      addr: self.addr.clone(),
      options: StreamOptions {
        dial_timeout_ms: self.options.dial_timeout_ms,
        read_timeout_ms: self.options.read_timeout_ms,
        hops: rest.to_vec(),
      },
    };
    Some((first.as_str(), forwarded))
  }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
  #[error("Failed to read message: {0}")]
  Read(#[from] JsonReadError),
  #[error("Failed to write message: {0}")]
  Write(#[from] JsonWriteError),
}

pub async fn read_auth_request<S: AsyncRead + Unpin>(s: S) -> Result<AuthRequest, MessageError> {
  Ok(read_framed_json(s, Some(MAX_MESSAGE_LENGTH)).await?)
}

pub async fn read_auth_response<S: AsyncRead + Unpin>(s: S) -> Result<AuthResponse, MessageError> {
  Ok(read_framed_json(s, Some(MAX_MESSAGE_LENGTH)).await?)
}

pub async fn read_connect_request<S: AsyncRead + Unpin>(
  s: S,
) -> Result<ConnectRequest, MessageError> {
  Ok(read_framed_json(s, Some(MAX_MESSAGE_LENGTH)).await?)
}

pub async fn write_message<S, M>(s: S, message: &M) -> Result<(), MessageError>
where
  S: AsyncWrite + Unpin,
  M: Serialize,
{
  Ok(write_framed_json(s, message, Some(MAX_MESSAGE_LENGTH)).await?)
}

/// Issues a connect on a freshly opened stream, making it a relay to `addr`
pub async fn connect<S: AsyncWrite + Unpin>(
  s: S,
  network: &str,
  addr: &str,
  options: StreamOptions,
) -> Result<(), MessageError> {
  write_message(s, &ConnectRequest::new(network, addr, options)).await
}
