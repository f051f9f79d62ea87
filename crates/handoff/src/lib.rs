//! Hybrid firmware execution: run boot code on a physical target, then move the live register
//! state into an emulator that continues from the same instruction.
//!
//! ### Session
//!
//! A [Session] owns a source and a destination [debuggable::Debuggable]. It resets the source,
//! runs it to the handoff symbol, copies the configured register set to the destination, applies
//! the stack pointer override and runs the destination to the termination symbol. Teardown of
//! both targets happens exactly once on every exit path.
//!
//! ### Configuration
//!
//! [orchestrator::run] builds a complete session from a [config::SessionConfig]: symbols come
//! from the ELF image, both targets are gdb remote endpoints and forwarded memory ranges are
//! served by a [memfwd::ForwardingChannel].

mod error;
mod probe;
mod session;
mod symbols;

/// JSON session configuration.
pub mod config;

pub mod orchestrator;

/// Register snapshot and restore.
pub mod transfer;

pub use error::*;
pub use probe::*;
pub use session::*;
pub use symbols::*;

#[cfg(test)]
mod tests;
