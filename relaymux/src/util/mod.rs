// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod activity;
pub mod deadline;
pub mod framed;
pub mod tunnel_stream;
pub mod validators;

// ALPN protocol name for the relaymux session protocol
pub const ALPN_RELAYMUX_1: &[u8] = b"relaymux-1";

/// Returns true if the error represents an expired read deadline or transport timeout
pub fn is_timeout_error(error: &std::io::Error) -> bool {
  error.kind() == std::io::ErrorKind::TimedOut
}

#[cfg(test)]
mod tests {
  use std::io::{Error, ErrorKind};

  #[test]
  fn timeout_classification() {
    assert!(super::is_timeout_error(&Error::new(
      ErrorKind::TimedOut,
      "deadline"
    )));
    assert!(!super::is_timeout_error(&Error::new(
      ErrorKind::ConnectionReset,
      "reset"
    )));
    assert!(!super::is_timeout_error(&Error::new(
      ErrorKind::BrokenPipe,
      "closed"
    )));
  }
}
