use crate::error::{Error, Result};

/// Lifecycle of a [Breakpoint].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BreakpointState {
    /// Installed and waiting to be hit.
    Armed,

    /// The owning target reported a stop at the breakpoint address.
    Hit,

    /// Consumed or removed during teardown.
    Cleared,
}

/// A breakpoint owned by a single target. Only the address is compared when matching stops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    address: u64,
    owner: String,
    state: BreakpointState,
}

impl Breakpoint {
    pub fn new(owner: impl Into<String>, address: u64) -> Self {
        Self {
            address,
            owner: owner.into(),
            state: BreakpointState::Armed,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn state(&self) -> BreakpointState {
        self.state
    }

    /// Whether a stop at `pc` satisfies this breakpoint.
    pub fn matches(&self, pc: u64) -> bool {
        self.address == pc
    }

    /// Record that the owning target stopped here. Only an armed breakpoint can be hit.
    pub fn mark_hit(&mut self) -> Result<()> {
        match self.state {
            BreakpointState::Armed => {
                self.state = BreakpointState::Hit;
                Ok(())
            }
            state => Err(Error::InvalidState {
                target: self.owner.clone(),
                message: format!(
                    "breakpoint at {address:#x} cannot be hit while {state:?}",
                    address = self.address
                ),
            }),
        }
    }

    pub fn mark_cleared(&mut self) {
        self.state = BreakpointState::Cleared;
    }

    /// Ensure the breakpoint is armed and owned by `target` before waiting on it.
    pub fn require_armed(&self, target: &str) -> Result<()> {
        if self.owner != target {
            return Err(Error::InvalidState {
                target: target.to_string(),
                message: format!(
                    "breakpoint at {address:#x} is owned by {owner}",
                    address = self.address,
                    owner = self.owner
                ),
            });
        }

        if self.state != BreakpointState::Armed {
            return Err(Error::InvalidState {
                target: target.to_string(),
                message: format!(
                    "breakpoint at {address:#x} is {state:?}",
                    address = self.address,
                    state = self.state
                ),
            });
        }

        Ok(())
    }
}
