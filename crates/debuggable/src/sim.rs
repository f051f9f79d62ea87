use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::{Breakpoint, BreakpointState, Debuggable, Error, RegisterSet, Result};

/// A single step of a scripted program executed by [SimTarget].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Transfer control to the address. This is the only step that can hit a breakpoint.
    Goto(u64),

    /// Load `length` bytes from `address` into `register`.
    Load {
        register: String,
        address: u64,
        length: usize,
    },

    /// Store the low `length` bytes of `register` to `address`.
    Store {
        register: String,
        address: u64,
        length: usize,
    },

    /// Fetch an instruction word from `address`.
    Fetch { address: u64 },

    /// Spend wall-clock time without changing state.
    Delay(Duration),

    /// Execution never reaches another stop point.
    Stall,

    /// The connection to the execution unit drops.
    Disconnect,
}

/// Failure of a [MemoryBus] access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusError {
    /// The access faulted. The program observes an abort and keeps running.
    Fault,

    /// The bus connection dropped.
    Lost(String),
}

pub type BusResult<T> = std::result::Result<T, BusError>;

/// External memory attached to a [SimTarget]. Values are little-endian and at most 8 bytes wide.
pub trait MemoryBus: Send {
    /// Whether the bus services this access even when local memory covers it.
    fn claims(&self, address: u64, length: usize) -> bool;

    fn load(&mut self, address: u64, length: usize) -> BusResult<u64>;
    fn store(&mut self, address: u64, length: usize, value: u64) -> BusResult<()>;
    fn fetch(&mut self, address: u64, length: usize) -> BusResult<u64>;

    /// Release the connection backing the bus.
    fn close(&mut self) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortKind {
    /// Faulted load or store.
    Data,

    /// Faulted instruction fetch.
    Prefetch,
}

/// Memory-access fault delivered to the simulated program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Abort {
    pub kind: AbortKind,
    pub address: u64,
    pub pc: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimState {
    /// Not yet started.
    Idle,
    Halted,
    Running,
    /// The connection dropped while running.
    Lost,
    Stopped,
}

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn offset(&self, address: u64, length: usize) -> Option<usize> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = offset.checked_add(length)?;
        (end <= self.bytes.len()).then_some(offset)
    }
}

const INSTRUCTION_SIZE: usize = 4;

/// Deterministic execution unit running a scripted program.
///
/// The unit owns a register file shaped by a [RegisterSet] and a set of local memory regions.
/// Accesses the attached [MemoryBus] claims, and accesses outside local memory, go to the bus.
pub struct SimTarget {
    name: String,
    registers: RegisterSet,
    values: Vec<u64>,
    pc_index: usize,
    regions: Vec<Region>,
    /// Installed breakpoints per address.
    breakpoints: BTreeMap<u64, usize>,
    program: VecDeque<Step>,
    bus: Option<Box<dyn MemoryBus>>,
    state: SimState,
    aborts: Vec<Abort>,
}

impl SimTarget {
    /// Create a unit whose program counter is the `pc` register of `registers`.
    pub fn new(name: impl Into<String>, registers: RegisterSet) -> Result<Self> {
        Self::with_pc_register(name, registers, "pc")
    }

    pub fn with_pc_register(
        name: impl Into<String>,
        registers: RegisterSet,
        pc_register: &str,
    ) -> Result<Self> {
        let pc_index = registers.position(pc_register).ok_or_else(|| {
            Error::InvalidRegisterSet(format!(
                "program counter `{pc_register}` is not in the register set"
            ))
        })?;

        Ok(Self {
            name: name.into(),
            values: vec![0; registers.len()],
            registers,
            pc_index,
            regions: Vec::new(),
            breakpoints: BTreeMap::new(),
            program: VecDeque::new(),
            bus: None,
            state: SimState::Idle,
            aborts: Vec::new(),
        })
    }

    /// Map a zero-filled local region.
    pub fn with_region(mut self, base: u64, size: usize) -> Self {
        self.regions.push(Region {
            base,
            bytes: vec![0; size],
        });
        self
    }

    /// Map a local region holding `bytes`.
    pub fn with_memory(mut self, base: u64, bytes: impl Into<Vec<u8>>) -> Self {
        self.regions.push(Region {
            base,
            bytes: bytes.into(),
        });
        self
    }

    pub fn with_program(mut self, program: impl IntoIterator<Item = Step>) -> Self {
        self.program.extend(program);
        self
    }

    pub fn with_bus(mut self, bus: impl MemoryBus + 'static) -> Self {
        self.bus = Some(Box::new(bus));
        self
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    pub fn pc(&self) -> u64 {
        self.values[self.pc_index]
    }

    /// Aborts delivered to the program so far.
    pub fn aborts(&self) -> &[Abort] {
        &self.aborts
    }

    /// Steps not yet executed.
    pub fn remaining_steps(&self) -> usize {
        self.program.len()
    }

    fn region(&self, address: u64, length: usize) -> Option<(usize, usize)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, region)| region.offset(address, length).map(|offset| (i, offset)))
    }

    fn is_mapped(&self, address: u64) -> bool {
        self.region(address, 1).is_some()
            || self
                .bus
                .as_ref()
                .is_some_and(|bus| bus.claims(address, 1))
    }

    fn bus_claims(&self, address: u64, length: usize) -> bool {
        self.bus
            .as_ref()
            .is_some_and(|bus| bus.claims(address, length))
    }

    fn lost(&mut self, reason: impl Into<String>) -> Error {
        self.state = SimState::Lost;
        Error::TargetLost {
            target: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn abort(&mut self, kind: AbortKind, address: u64) {
        let pc = self.pc();
        debug!(
            target = %self.name,
            ?kind,
            address = %format_args!("{address:#x}"),
            pc = %format_args!("{pc:#x}"),
            "abort delivered to program"
        );
        self.aborts.push(Abort { kind, address, pc });
    }

    /// Perform a program-level load or fetch. `Ok(None)` means the access aborted.
    fn program_load(&mut self, address: u64, length: usize, fetch: bool) -> Result<Option<u64>> {
        let kind = if fetch {
            AbortKind::Prefetch
        } else {
            AbortKind::Data
        };

        let local = if self.bus_claims(address, length) {
            None
        } else {
            self.region(address, length)
        };

        let result = match (local, self.bus.as_mut()) {
            (Some((i, offset)), _) => {
                let mut bytes = [0u8; 8];
                bytes[..length].copy_from_slice(&self.regions[i].bytes[offset..offset + length]);
                Ok(u64::from_le_bytes(bytes))
            }
            (None, Some(bus)) if fetch => bus.fetch(address, length),
            (None, Some(bus)) => bus.load(address, length),
            (None, None) => Err(BusError::Fault),
        };

        match result {
            Ok(value) => Ok(Some(value)),
            Err(BusError::Fault) => {
                self.abort(kind, address);
                Ok(None)
            }
            Err(BusError::Lost(reason)) => Err(self.lost(reason)),
        }
    }

    fn program_store(&mut self, address: u64, length: usize, value: u64) -> Result<()> {
        let local = if self.bus_claims(address, length) {
            None
        } else {
            self.region(address, length)
        };

        let result = match (local, self.bus.as_mut()) {
            (Some((i, offset)), _) => {
                self.regions[i].bytes[offset..offset + length]
                    .copy_from_slice(&value.to_le_bytes()[..length]);
                Ok(())
            }
            (None, Some(bus)) => bus.store(address, length, value),
            (None, None) => Err(BusError::Fault),
        };

        match result {
            Ok(()) => Ok(()),
            Err(BusError::Fault) => {
                self.abort(AbortKind::Data, address);
                Ok(())
            }
            Err(BusError::Lost(reason)) => Err(self.lost(reason)),
        }
    }

    fn check_width(&self, length: usize) -> Result<()> {
        if (1..=8).contains(&length) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                target: self.name.clone(),
                message: format!("program access width {length} is not between 1 and 8"),
            })
        }
    }

    fn execute(&mut self, step: Step) -> Result<()> {
        trace!(target = %self.name, ?step, "executing step");
        match step {
            Step::Goto(pc) => {
                self.values[self.pc_index] = pc;
            }
            Step::Load {
                register,
                address,
                length,
            } => {
                self.check_width(length)?;
                let index = self.registers.require(&register)?;
                if let Some(value) = self.program_load(address, length, false)? {
                    self.values[index] = value;
                }
            }
            Step::Store {
                register,
                address,
                length,
            } => {
                self.check_width(length)?;
                let index = self.registers.require(&register)?;
                let value = self.values[index];
                self.program_store(address, length, value)?;
            }
            Step::Fetch { address } => {
                self.program_load(address, INSTRUCTION_SIZE, true)?;
            }
            Step::Delay(duration) => thread::sleep(duration),
            Step::Stall => (),
            Step::Disconnect => return Err(self.lost("connection closed by peer")),
        }

        Ok(())
    }

    fn timeout(&self, breakpoint: &Breakpoint, timeout: Duration) -> Error {
        Error::Timeout {
            target: self.name.clone(),
            address: breakpoint.address(),
            timeout,
        }
    }
}

impl Debuggable for SimTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            SimState::Idle => {
                self.state = SimState::Halted;
                Ok(())
            }
            SimState::Stopped => Err(Error::InvalidState {
                target: self.name.clone(),
                message: "cannot start a stopped target".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<Breakpoint> {
        if matches!(self.state, SimState::Stopped | SimState::Lost) {
            return Err(Error::InvalidState {
                target: self.name.clone(),
                message: format!("cannot set breakpoint while {:?}", self.state),
            });
        }

        if !self.is_mapped(address) {
            return Err(Error::InvalidAddress {
                target: self.name.clone(),
                address,
            });
        }

        *self.breakpoints.entry(address).or_default() += 1;
        Ok(Breakpoint::new(self.name.clone(), address))
    }

    fn clear_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> Result<()> {
        if breakpoint.state() != BreakpointState::Cleared {
            let address = breakpoint.address();
            if let Some(count) = self.breakpoints.get_mut(&address) {
                *count -= 1;
                if *count == 0 {
                    self.breakpoints.remove(&address);
                }
            }
        }

        breakpoint.mark_cleared();
        Ok(())
    }

    fn continue_execution(&mut self) -> Result<()> {
        match self.state {
            SimState::Halted => {
                self.state = SimState::Running;
                Ok(())
            }
            SimState::Lost => Err(Error::TargetLost {
                target: self.name.clone(),
                reason: "connection already lost".to_string(),
            }),
            state => Err(Error::InvalidState {
                target: self.name.clone(),
                message: format!("cannot continue while {state:?}"),
            }),
        }
    }

    fn wait_for_stop(&mut self, breakpoint: &mut Breakpoint, timeout: Duration) -> Result<()> {
        breakpoint.require_armed(&self.name)?;
        match self.state {
            SimState::Running => (),
            SimState::Lost => {
                return Err(Error::TargetLost {
                    target: self.name.clone(),
                    reason: "connection already lost".to_string(),
                })
            }
            state => {
                return Err(Error::InvalidState {
                    target: self.name.clone(),
                    message: format!("cannot wait for a stop while {state:?}"),
                })
            }
        }

        let deadline = Instant::now() + timeout;
        while let Some(step) = self.program.pop_front() {
            let stalled = step == Step::Stall;
            self.execute(step)?;
            if stalled {
                break;
            }

            let pc = self.pc();
            if self.breakpoints.contains_key(&pc) {
                if breakpoint.matches(pc) {
                    self.state = SimState::Halted;
                    breakpoint.mark_hit()?;
                    debug!(
                        target = %self.name,
                        pc = %format_args!("{pc:#x}"),
                        "breakpoint hit"
                    );
                    return Ok(());
                }

                debug!(
                    target = %self.name,
                    pc = %format_args!("{pc:#x}"),
                    "stopped at unrelated breakpoint, resuming"
                );
            }

            if Instant::now() >= deadline {
                return Err(self.timeout(breakpoint, timeout));
            }
        }

        // Nothing left to execute will ever reach the breakpoint
        thread::sleep(deadline.saturating_duration_since(Instant::now()));
        warn!(target = %self.name, "execution stalled before reaching breakpoint");
        Err(self.timeout(breakpoint, timeout))
    }

    fn read_register(&mut self, name: &str) -> Result<u64> {
        let index = self.registers.require(name)?;
        Ok(self.values[index])
    }

    fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        let index = self.registers.require(name)?;
        self.values[index] = value;
        Ok(())
    }

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        let (i, offset) = self
            .region(address, length)
            .ok_or_else(|| Error::InaccessibleMemory {
                target: self.name.clone(),
                address,
                length,
            })?;

        Ok(self.regions[i].bytes[offset..offset + length].to_vec())
    }

    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let (i, offset) =
            self.region(address, bytes.len())
                .ok_or_else(|| Error::InaccessibleMemory {
                    target: self.name.clone(),
                    address,
                    length: bytes.len(),
                })?;

        self.regions[i].bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state != SimState::Stopped {
            if let Some(bus) = self.bus.as_mut() {
                bus.close();
            }

            self.bus = None;
            self.breakpoints.clear();
            self.state = SimState::Stopped;
        }

        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.state == SimState::Stopped
    }
}
