//! Register state transfer between two [Debuggable] units.
//!
//! A transfer is all-or-nothing. The destination's previous values are read before anything is
//! written so a failed write can be undone, and the destination is never left with a mix of old
//! and transferred registers.

use debuggable::{Debuggable, Error, RegisterSet, RegisterSnapshot, Result};
use tracing::{debug, info, warn};

/// Read every register of `set` from `source`, in set order.
pub fn snapshot(
    source: &mut (impl Debuggable + ?Sized),
    set: &RegisterSet,
) -> Result<RegisterSnapshot> {
    let values = set
        .names()
        .map(|name| source.read_register(name))
        .collect::<Result<Vec<_>>>()?;

    let snapshot = RegisterSnapshot::from_values(set, values)?;
    debug!(target = source.name(), "register snapshot\n{snapshot}");
    Ok(snapshot)
}

/// Write `snapshot` into `destination` in set order.
///
/// Fails without touching the destination when the snapshot was not taken with `set`. If a write
/// fails, the registers written so far are restored to their previous values before the error is
/// returned.
pub fn restore(
    destination: &mut (impl Debuggable + ?Sized),
    set: &RegisterSet,
    snapshot: &RegisterSnapshot,
) -> Result<()> {
    if snapshot.len() != set.len() {
        return Err(Error::RegisterSetMismatch {
            expected: set.len(),
            actual: snapshot.len(),
        });
    }

    if !snapshot.matches(set) {
        return Err(Error::InvalidRegisterSet(format!(
            "snapshot order {:?} differs from {:?}",
            snapshot.names().collect::<Vec<_>>(),
            set.names().collect::<Vec<_>>()
        )));
    }

    let previous = set
        .names()
        .map(|name| destination.read_register(name))
        .collect::<Result<Vec<_>>>()?;

    for (written, (name, value)) in snapshot.iter().enumerate() {
        if let Err(err) = destination.write_register(name, value) {
            warn!(
                target = destination.name(),
                register = name,
                "register transfer failed, rolling back {written} registers"
            );
            rollback(destination, set, &previous[..written]);
            return Err(err);
        }
    }

    Ok(())
}

fn rollback(destination: &mut (impl Debuggable + ?Sized), set: &RegisterSet, previous: &[u64]) {
    for (name, &value) in set.names().zip(previous) {
        if let Err(err) = destination.write_register(name, value) {
            warn!(target = destination.name(), register = name, "rollback failed: {err}");
        }
    }
}

/// Destination-specific override of the stack pointer applied after the transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackPointerFixup {
    pub register: String,
    pub value: u64,
}

impl StackPointerFixup {
    pub fn new(register: impl Into<String>, value: u64) -> Self {
        Self {
            register: register.into(),
            value,
        }
    }

    /// Overwrite the stack pointer of `destination`. Returns the transferred value and the value
    /// now in place.
    pub fn apply(&self, destination: &mut (impl Debuggable + ?Sized)) -> Result<(u64, u64)> {
        let transferred = destination.read_register(&self.register)?;
        destination.write_register(&self.register, self.value)?;
        info!(
            target = destination.name(),
            register = %self.register,
            transferred = %format_args!("{transferred:#x}"),
            value = %format_args!("{:#x}", self.value),
            "overriding stack pointer"
        );

        Ok((transferred, self.value))
    }
}
