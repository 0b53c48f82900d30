use std::io;

/// No socket-level bypass on macOS; the PF anchor passes the resolver's
/// traffic instead.
#[allow(clippy::unnecessary_wraps)]
pub(crate) fn apply_bypass(
    _socket: &socket2::Socket,
    _adapter_index: u32,
    _is_v4: bool,
) -> io::Result<()> {
    Ok(())
}
