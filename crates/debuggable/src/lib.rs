//! This crate defines the capability set shared by every execution unit taking part in a hybrid
//! firmware run: a physical target reached through a debug probe and a software emulator that
//! continues execution after the handoff.
//!
//! ### Debuggable
//!
//! The [Debuggable] trait exposes breakpoints, resumption, blocking waits for a stop, register
//! access and memory access. The state transfer protocol is written once against this trait so
//! the same logic drives hardware and emulator alike.
//!
//! ### Simulated execution unit
//!
//! The [sim] module provides [sim::SimTarget], a deterministic in-process execution unit driven
//! by a scripted program. Accesses outside of its local memory regions can be routed through a
//! [sim::MemoryBus], which is how the memory forwarding channel is attached to it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

mod breakpoint;
mod error;
mod registers;

/// Deterministic in-process execution unit.
pub mod sim;

pub use breakpoint::*;
pub use error::*;
pub use registers::*;

/// Capabilities required from an execution unit by the state transfer protocol.
///
/// Implementations exist for remote gdbstub targets (hardware behind a probe, emulators) and for
/// the simulated execution unit in [sim].
pub trait Debuggable {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Establish the underlying connection. The unit is left suspended.
    fn start(&mut self) -> Result<()>;

    /// Arm a breakpoint at `address`. Fails with [Error::InvalidAddress] if the address is outside
    /// any region mapped by this unit.
    fn set_breakpoint(&mut self, address: u64) -> Result<Breakpoint>;

    /// Remove a breakpoint previously returned by [Self::set_breakpoint].
    fn clear_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> Result<()>;

    /// Resume execution. This does not block; use [Self::wait_for_stop] to observe the stop.
    fn continue_execution(&mut self) -> Result<()>;

    /// Block until the unit stops with its program counter equal to the breakpoint address. The
    /// breakpoint transitions to [BreakpointState::Hit] on success.
    fn wait_for_stop(&mut self, breakpoint: &mut Breakpoint, timeout: Duration) -> Result<()>;

    fn read_register(&mut self, name: &str) -> Result<u64>;
    fn write_register(&mut self, name: &str, value: u64) -> Result<()>;

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>>;
    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Release the underlying connection. Must be idempotent and safe to call on a unit that never
    /// started cleanly.
    fn stop(&mut self) -> Result<()>;

    /// Whether [Self::stop] has completed.
    fn is_stopped(&self) -> bool;
}

impl<D: Debuggable + ?Sized> Debuggable for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<Breakpoint> {
        (**self).set_breakpoint(address)
    }

    fn clear_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> Result<()> {
        (**self).clear_breakpoint(breakpoint)
    }

    fn continue_execution(&mut self) -> Result<()> {
        (**self).continue_execution()
    }

    fn wait_for_stop(&mut self, breakpoint: &mut Breakpoint, timeout: Duration) -> Result<()> {
        (**self).wait_for_stop(breakpoint, timeout)
    }

    fn read_register(&mut self, name: &str) -> Result<u64> {
        (**self).read_register(name)
    }

    fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        (**self).write_register(name, value)
    }

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        (**self).read_memory(address, length)
    }

    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        (**self).write_memory(address, bytes)
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn is_stopped(&self) -> bool {
        (**self).is_stopped()
    }
}

/// A [Debuggable] shared between the session and other consumers, such as a memory forwarding
/// provider that needs hardware memory access while the session owns the unit.
pub struct SharedTarget<D> {
    name: String,
    inner: Arc<Mutex<D>>,
}

impl<D> Clone for SharedTarget<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Debuggable> SharedTarget<D> {
    pub fn new(target: D) -> Self {
        Self {
            name: target.name().to_string(),
            inner: Arc::new(Mutex::new(target)),
        }
    }

    /// Lock the underlying unit. A poisoned lock is recovered since every operation on the unit
    /// leaves it in a consistent state or reports an error.
    pub fn lock(&self) -> MutexGuard<'_, D> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<D: Debuggable> Debuggable for SharedTarget<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        self.lock().start()
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<Breakpoint> {
        self.lock().set_breakpoint(address)
    }

    fn clear_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> Result<()> {
        self.lock().clear_breakpoint(breakpoint)
    }

    fn continue_execution(&mut self) -> Result<()> {
        self.lock().continue_execution()
    }

    fn wait_for_stop(&mut self, breakpoint: &mut Breakpoint, timeout: Duration) -> Result<()> {
        self.lock().wait_for_stop(breakpoint, timeout)
    }

    fn read_register(&mut self, name: &str) -> Result<u64> {
        self.lock().read_register(name)
    }

    fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.lock().write_register(name, value)
    }

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        self.lock().read_memory(address, length)
    }

    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.lock().write_memory(address, bytes)
    }

    fn stop(&mut self) -> Result<()> {
        self.lock().stop()
    }

    fn is_stopped(&self) -> bool {
        self.lock().is_stopped()
    }
}

#[cfg(test)]
mod tests;
