//! A [debuggable::Debuggable] implementation that drives a remote gdbstub over TCP using the GDB
//! remote serial protocol.
//!
//! The same client talks to the probe-side gdb server in front of the physical target and to an
//! emulator's gdb server, which is what lets the state transfer protocol treat both sides alike.
//!
//! Only the packets needed for a handoff are used: `?`, `Z0`/`z0`, `c`, `p`/`P`, `m`/`M` and `D`.
//! Packets are acknowledged with `+`/`-` and replies may be run-length encoded.

mod error;
mod registers;
mod reply;
mod target;

/// Packet framing shared by the client and by test stubs.
pub mod packet;

pub use error::*;
pub use registers::*;
pub use reply::*;
pub use target::*;
