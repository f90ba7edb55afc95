// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types supporting authentication of relaymux sessions
mod traits;
pub use traits::*;

mod cipher;

mod handshake;
pub use handshake::{authenticate_session, HandshakeError, HopIdentity};
