//! Shared types for the tunnel orchestrator: packet marks, the router
//! configuration record and the status codes reported to the host.

pub mod marks;

mod config;

pub use config::RouterConfig;

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::OnceLock;

/// Status codes forwarded to the host process through the registered
/// callback. The numeric values are part of the FFI contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Healthy = 0,
    HandshakeFailure = 1,
    ResolvingDns = 2,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Whether the host has a working IPv6 stack.
///
/// Probed once per process by binding a v6 UDP socket on loopback, the same
/// check `nettest.SupportsIPv6` performs. Hosts without IPv6 skip AAAA
/// resolution, `ip6` firewall tables and v6 routing rules.
pub fn supports_ipv6() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();

    *SUPPORTED.get_or_init(|| {
        let Ok(socket) = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        ) else {
            return false;
        };

        let loopback = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0);
        socket.bind(&loopback.into()).is_ok()
    })
}
