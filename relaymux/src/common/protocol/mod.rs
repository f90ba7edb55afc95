// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod compression;
pub mod messages;
pub mod tunnel;
