// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::module_inception)]
pub mod heartbeat;
pub mod http;
pub mod registry;

/// Request header a server registers itself under (POST).
pub const SERVER_HEADER: &str = "X-Namirpc-Server";
/// Response header carrying the comma-separated live endpoint list (GET).
pub const SERVERS_HEADER: &str = "X-Namirpc-Servers";
