// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Network utility functions

use std::net::{IpAddr, SocketAddr};

/// Check if a host is a loopback address (127.0.0.0/8, ::1 or localhost)
pub fn is_loopback_address(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Check if a `host:port` bind address only listens on loopback
///
/// Unparseable input counts as non-loopback.
pub fn is_loopback_bind_address(bind_address: &str) -> bool {
    if let Ok(addr) = bind_address.parse::<SocketAddr>() {
        return addr.ip().is_loopback();
    }

    match bind_address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => is_loopback_address(host),
        _ => false,
    }
}
