// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod authentication;
pub mod peer_relay;
pub mod policy;
pub mod protocol;
