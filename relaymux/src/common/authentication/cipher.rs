// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::CredentialVerifier;
use crate::config::CipherConfig;

/// Users are accepted if `allowed_users` is empty, contains `*`, or names them
impl CredentialVerifier for CipherConfig {
  fn verify_user(&self, user: &str) -> bool {
    self.allowed_users.is_empty()
      || self
        .allowed_users
        .iter()
        .any(|allowed| allowed == "*" || allowed == user)
  }
}
