use std::io;

use tunnel_types::marks::BOOTSTRAP_MARK;

/// Marks the socket with the bootstrap mark before it carries any traffic.
///
/// Requires CAP_NET_ADMIN. A failure here is fatal: an unmarked resolver
/// socket would be dropped by the kill switch (full tunnel) or worse, leak
/// into the tunnel itself.
pub(crate) fn apply_bypass(
    socket: &socket2::Socket,
    _adapter_index: u32,
    _is_v4: bool,
) -> io::Result<()> {
    socket.set_mark(BOOTSTRAP_MARK)?;
    tracing::trace!(mark = BOOTSTRAP_MARK, "Marked bootstrap socket");
    Ok(())
}
