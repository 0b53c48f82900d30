use std::io;
use std::os::windows::io::AsRawSocket;

use windows::Win32::Networking::WinSock::{
    IPPROTO_IP, IPPROTO_IPV6, IPV6_UNICAST_IF, IP_UNICAST_IF, SOCKET, setsockopt,
};

/// Pins the socket to the given physical adapter so its traffic never enters
/// the tunnel interface. Index 0 leaves the socket alone; in that mode the
/// WFP daemon pin-hole is the bypass.
pub(crate) fn apply_bypass(
    socket: &socket2::Socket,
    adapter_index: u32,
    is_v4: bool,
) -> io::Result<()> {
    if adapter_index == 0 {
        return Ok(());
    }

    let raw = SOCKET(socket.as_raw_socket() as usize);

    let result = if is_v4 {
        // IP_UNICAST_IF wants the index in network byte order.
        let value = adapter_index.to_be().to_ne_bytes();
        unsafe { setsockopt(raw, IPPROTO_IP.0, IP_UNICAST_IF, Some(&value)) }
    } else {
        // IPV6_UNICAST_IF wants host byte order.
        let value = adapter_index.to_ne_bytes();
        unsafe { setsockopt(raw, IPPROTO_IPV6.0, IPV6_UNICAST_IF, Some(&value)) }
    };

    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    tracing::trace!(adapter_index, "Pinned bootstrap socket to adapter");
    Ok(())
}
