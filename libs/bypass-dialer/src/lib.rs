//! Socket factories whose sockets escape both the tunnel and the kill
//! switch, so the bootstrap resolver can look up peer endpoints while the
//! tunnel it is establishing owns the default route.
//!
//! The escape mechanism differs per platform:
//!
//! - Linux: `SO_MARK` is set to the bootstrap mark before any traffic; a
//!   policy rule routes marked packets through the main table and the kill
//!   switch accepts them.
//! - Windows: the socket is pinned to a physical adapter via
//!   `IP_UNICAST_IF` / `IPV6_UNICAST_IF`. An adapter index of 0 degrades to
//!   a plain socket, the supported desktop mode; the firewall already
//!   pin-holes the daemon process by app id.
//! - macOS: plain sockets; the PF anchor carries the bypass.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpStream, UdpSocket};

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "windows")]
#[path = "windows.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

/// Factory for sockets that bypass the tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct BypassDialer {
    /// Physical adapter to pin sockets to. Ignored outside Windows; 0 means
    /// "do not pin".
    pub adapter_index: u32,
}

impl BypassDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A UDP socket connected to `remote`, marked/pinned per platform.
    pub async fn udp(&self, remote: SocketAddr) -> io::Result<UdpSocket> {
        let domain = if remote.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        platform::apply_bypass(&socket, self.adapter_index, remote.is_ipv4())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::try_from(std::net::UdpSocket::from(socket))?;
        socket.connect(remote).await?;

        Ok(socket)
    }

    /// A TCP stream connected to `remote`, marked/pinned per platform.
    pub async fn tcp(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        let domain = if remote.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        platform::apply_bypass(&socket, self.adapter_index, remote.is_ipv4())?;
        socket.set_nonblocking(true)?;
        socket.set_tcp_nodelay(true)?;

        let socket = tokio::net::TcpSocket::from_std_stream(socket.into());
        socket.connect(remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Loopback traffic is accepted by the kill switch on every platform, so
    // exercising the factory against loopback is safe in CI.
    #[tokio::test]
    async fn udp_socket_connects_to_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap();

        let dialer = BypassDialer::new();
        let socket = match dialer.udp(remote).await {
            Ok(socket) => socket,
            // Marking requires CAP_NET_ADMIN; unprivileged test runs skip.
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return,
            Err(e) => panic!("failed to create bypass socket: {e}"),
        };
        socket.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, socket.local_addr().unwrap());
    }
}
