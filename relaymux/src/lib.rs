// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server core of a multiplexed tunnel proxy
//!
//! One authenticated transport session carries many proxy streams, each relayed to
//! a destination dialed directly or reached through a chain of further relaymux hops.

pub mod common;
pub mod config;
pub mod util;

pub mod server;
