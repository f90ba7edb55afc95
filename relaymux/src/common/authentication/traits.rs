// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::common::protocol::compression::CompressMethod;

/// Decides which identities and compression methods a session may use
pub trait CredentialVerifier: std::fmt::Debug + Send + Sync {
  fn verify_user(&self, user: &str) -> bool;

  fn is_valid_compressor(&self, method: &str) -> bool {
    CompressMethod::from_name(method).is_some()
  }
}

/// Resets the symmetric-cipher keystream of a session from client-supplied parameters
///
/// Invoked once per session, right after a successful handshake.
pub trait CipherReset: Send + Sync {
  fn reset_crypto_context(&self, cipher_method: &str, cipher_counter: u64);
}
