//! TCP and UDP sockets over the module's internal stack.
//!
//! The module multiplexes up to [`NUM_SOCKETS`] sockets behind single-digit
//! ids. Payload crosses the AT link as upper-case hex; received data is
//! staged in a per-socket [`buffer::SocketBuffer`] so short reads do not
//! re-issue commands.

use crate::services::parse;

pub(crate) mod buffer;
pub mod server;
pub mod tcp;
pub mod udp;

/// Concurrent socket limit of the module.
pub const NUM_SOCKETS: usize = 7;

/// Socket data transfers and closes get a generous fixed deadline.
pub(crate) const SOCKET_IO_TIMEOUT_MS: u32 = 10_000;

/// Module-side socket id, a single decimal digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketHandle(pub u8);

/// Parses a socket id from the leading field of `s`, rejecting ids the
/// module cannot have issued.
pub(crate) fn socket_from_field(s: &str) -> Option<SocketHandle> {
    let id: u8 = parse::first_field(s).trim().parse().ok()?;
    if usize::from(id) < NUM_SOCKETS {
        Some(SocketHandle(id))
    } else {
        None
    }
}
