use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use debuggable::{Breakpoint, BreakpointState, Debuggable};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::packet::{hex_decode, hex_encode, Connection, INTERRUPT};
use crate::registers::RegisterMap;
use crate::reply::{data_reply, ok_reply, parse_stop_reply, StopReply};

/// Largest memory transfer carried by a single `m` or `M` packet.
const MEMORY_CHUNK: usize = 0x400;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetState {
    /// [Debuggable::start] has not connected yet.
    Disconnected,
    Halted,
    Running,
    /// The connection dropped or the remote process exited.
    Lost,
    Stopped,
}

/// [Debuggable] backed by a gdbstub reachable over TCP, such as OpenOCD in front of a debug probe
/// or an emulator exposing a gdb server.
pub struct GdbTarget {
    name: String,
    address: String,
    registers: RegisterMap,
    pc_register: String,
    breakpoint_kind: u32,
    reply_timeout: Duration,
    connection: Option<Connection>,
    state: TargetState,
    /// Breakpoint handles per address. The remote holds one `Z0` per address.
    breakpoints: BTreeMap<u64, usize>,
}

impl GdbTarget {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            registers: RegisterMap::arm(),
            pc_register: "pc".to_string(),
            breakpoint_kind: 4,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            connection: None,
            state: TargetState::Disconnected,
            breakpoints: BTreeMap::new(),
        }
    }

    pub fn with_registers(mut self, registers: RegisterMap) -> Self {
        self.registers = registers;
        self
    }

    pub fn with_pc_register(mut self, name: impl Into<String>) -> Self {
        self.pc_register = name.into();
        self
    }

    /// Kind argument of `Z0` packets. On ARM this is the instruction size, 2 for Thumb.
    pub fn with_breakpoint_kind(mut self, kind: u32) -> Self {
        self.breakpoint_kind = kind;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    fn invalid_state(&self, message: impl Into<String>) -> debuggable::Error {
        debuggable::Error::InvalidState {
            target: self.name.clone(),
            message: message.into(),
        }
    }

    fn lost(&mut self, reason: impl Into<String>) -> debuggable::Error {
        self.state = TargetState::Lost;
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }

        let reason = reason.into();
        warn!(target = %self.name, "connection lost: {reason}");
        debuggable::Error::TargetLost {
            target: self.name.clone(),
            reason,
        }
    }

    /// Convert a protocol failure. Connection-level failures leave the target lost.
    fn protocol_error(&mut self, err: Error) -> debuggable::Error {
        if err.is_connection_loss() {
            self.lost(err.to_string())
        } else {
            self.invalid_state(err.to_string())
        }
    }

    fn require_halted(&self) -> debuggable::Result<()> {
        match self.state {
            TargetState::Halted => Ok(()),
            TargetState::Lost => Err(debuggable::Error::TargetLost {
                target: self.name.clone(),
                reason: "connection already lost".to_string(),
            }),
            state => Err(self.invalid_state(format!("target must be halted, it is {state:?}"))),
        }
    }

    fn connection(&mut self) -> debuggable::Result<&mut Connection> {
        let state = self.state;
        match self.connection.as_mut() {
            Some(connection) => Ok(connection),
            None => Err(debuggable::Error::InvalidState {
                target: self.name.clone(),
                message: format!("not connected while {state:?}"),
            }),
        }
    }

    /// Send a command and wait for its reply.
    fn exchange(&mut self, command: &str) -> debuggable::Result<Vec<u8>> {
        let timeout = self.reply_timeout;
        let result = self.connection()?.command(command.as_bytes(), timeout);
        result.map_err(|err| self.protocol_error(err))
    }

    fn program_counter(&mut self, registers: &[(u32, Vec<u8>)]) -> debuggable::Result<u64> {
        let pc_number = self.registers.number(&self.pc_register);
        let expedited = registers
            .iter()
            .find(|(number, _)| Some(*number) == pc_number)
            .map(|(_, value)| self.registers.decode(value));

        match expedited {
            Some(Ok(pc)) => Ok(pc),
            _ => {
                let pc_register = self.pc_register.clone();
                self.read_register(&pc_register)
            }
        }
    }

    /// Halt a target that did not stop in time. The wait still fails with a timeout.
    fn interrupt(&mut self) {
        let timeout = self.reply_timeout;
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let halted = connection
            .write_raw(&[INTERRUPT])
            .and_then(|_| connection.receive(Some(timeout)));

        match halted {
            Ok(reply) => {
                debug!(
                    target = %self.name,
                    reply = %String::from_utf8_lossy(&reply),
                    "interrupted running target"
                );
                self.state = TargetState::Halted;
            }
            Err(err) => warn!(target = %self.name, "failed to interrupt target: {err}"),
        }
    }

    fn chunks(address: u64, length: usize) -> impl Iterator<Item = (u64, usize, usize)> {
        (0..length).step_by(MEMORY_CHUNK).map(move |offset| {
            (
                address.wrapping_add(offset as u64),
                offset,
                MEMORY_CHUNK.min(length - offset),
            )
        })
    }

    fn inaccessible(&self, address: u64, length: usize) -> debuggable::Error {
        debuggable::Error::InaccessibleMemory {
            target: self.name.clone(),
            address,
            length,
        }
    }
}

impl Debuggable for GdbTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> debuggable::Result<()> {
        match self.state {
            TargetState::Disconnected => (),
            TargetState::Halted | TargetState::Running => return Ok(()),
            TargetState::Lost => {
                return Err(debuggable::Error::TargetLost {
                    target: self.name.clone(),
                    reason: "connection already lost".to_string(),
                })
            }
            TargetState::Stopped => return Err(self.invalid_state("cannot start a stopped target")),
        }

        let connection = Connection::connect(self.address.as_str())
            .map_err(|err| self.lost(format!("failed to connect to {}: {err}", self.address)))?;
        self.connection = Some(connection);
        info!(target = %self.name, address = %self.address, "connected to gdb remote");

        let reply = self.exchange("?")?;
        match parse_stop_reply(&reply) {
            Ok(StopReply::Signal { .. }) => {
                self.state = TargetState::Halted;
                Ok(())
            }
            Ok(StopReply::Exited(code) | StopReply::Terminated(code)) => {
                Err(self.lost(format!("remote process is not running ({code:#04x})")))
            }
            Ok(StopReply::Output(_)) => Err(self.invalid_state("unexpected console output")),
            Err(err) => Err(self.protocol_error(err)),
        }
    }

    fn set_breakpoint(&mut self, address: u64) -> debuggable::Result<Breakpoint> {
        self.require_halted()?;

        if let Some(count) = self.breakpoints.get_mut(&address) {
            *count += 1;
            return Ok(Breakpoint::new(self.name.clone(), address));
        }

        let command = format!("Z0,{address:x},{:x}", self.breakpoint_kind);
        let reply = self.exchange(&command)?;
        match ok_reply(&command, &reply) {
            Ok(()) => {
                self.breakpoints.insert(address, 1);
                debug!(
                    target = %self.name,
                    address = %format_args!("{address:#x}"),
                    "breakpoint armed"
                );
                Ok(Breakpoint::new(self.name.clone(), address))
            }
            Err(Error::Remote(code)) => {
                debug!(target = %self.name, code, "breakpoint refused");
                Err(debuggable::Error::InvalidAddress {
                    target: self.name.clone(),
                    address,
                })
            }
            Err(err) => Err(self.protocol_error(err)),
        }
    }

    fn clear_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> debuggable::Result<()> {
        let address = breakpoint.address();
        let last = match self.breakpoints.get_mut(&address) {
            Some(count) if breakpoint.state() != BreakpointState::Cleared => {
                *count -= 1;
                *count == 0
            }
            _ => false,
        };

        if last {
            self.breakpoints.remove(&address);
        }

        if last && self.state == TargetState::Halted {
            let command = format!("z0,{address:x},{:x}", self.breakpoint_kind);
            let reply = self.exchange(&command)?;
            ok_reply(&command, &reply).map_err(|err| self.protocol_error(err))?;
        }

        breakpoint.mark_cleared();
        Ok(())
    }

    fn continue_execution(&mut self) -> debuggable::Result<()> {
        self.require_halted()?;
        let result = self.connection()?.send(b"c");
        result.map_err(|err| self.protocol_error(err))?;
        self.state = TargetState::Running;
        Ok(())
    }

    fn wait_for_stop(
        &mut self,
        breakpoint: &mut Breakpoint,
        timeout: Duration,
    ) -> debuggable::Result<()> {
        breakpoint.require_armed(&self.name)?;
        match self.state {
            TargetState::Running => (),
            TargetState::Lost => {
                return Err(debuggable::Error::TargetLost {
                    target: self.name.clone(),
                    reason: "connection already lost".to_string(),
                })
            }
            state => {
                return Err(self.invalid_state(format!("cannot wait for a stop while {state:?}")))
            }
        }

        let address = breakpoint.address();
        let timed_out = |target: &str| debuggable::Error::Timeout {
            target: target.to_string(),
            address,
            timeout,
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.interrupt();
                return Err(timed_out(&self.name));
            }

            let received = self.connection()?.receive(Some(remaining));
            let packet = match received {
                Ok(packet) => packet,
                Err(Error::Timeout(_)) => {
                    self.interrupt();
                    return Err(timed_out(&self.name));
                }
                Err(err) => return Err(self.protocol_error(err)),
            };

            match parse_stop_reply(&packet) {
                Ok(StopReply::Output(text)) => {
                    debug!(target = %self.name, output = %text.trim_end(), "console output");
                }
                Ok(StopReply::Exited(code) | StopReply::Terminated(code)) => {
                    return Err(self.lost(format!(
                        "remote process ended with status {code:#04x} before reaching {address:#x}"
                    )));
                }
                Ok(StopReply::Signal { signal, registers }) => {
                    self.state = TargetState::Halted;
                    let pc = self.program_counter(&registers)?;
                    if breakpoint.matches(pc) {
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
                        signal,
                        pc = %format_args!("{pc:#x}"),
                        "stopped away from breakpoint, resuming"
                    );
                    self.continue_execution()?;
                }
                Err(err) => return Err(self.protocol_error(err)),
            }
        }
    }

    fn read_register(&mut self, name: &str) -> debuggable::Result<u64> {
        let number = self
            .registers
            .number(name)
            .ok_or_else(|| debuggable::Error::UnknownRegister(name.to_string()))?;
        self.require_halted()?;

        let reply = self.exchange(&format!("p{number:x}"))?;
        let value = match data_reply(&reply) {
            Ok(b"") => Err(Error::Unsupported("p".to_string())),
            Ok(data) => self.registers.decode(data),
            Err(Error::Remote(_)) => {
                return Err(debuggable::Error::UnknownRegister(name.to_string()))
            }
            Err(err) => Err(err),
        };

        value.map_err(|err| self.protocol_error(err))
    }

    fn write_register(&mut self, name: &str, value: u64) -> debuggable::Result<()> {
        let number = self
            .registers
            .number(name)
            .ok_or_else(|| debuggable::Error::UnknownRegister(name.to_string()))?;
        self.require_halted()?;

        let command = format!("P{number:x}={}", self.registers.encode(value));
        let reply = self.exchange(&command)?;
        match ok_reply(&command, &reply) {
            Ok(()) => Ok(()),
            Err(Error::Remote(_)) => Err(debuggable::Error::UnknownRegister(name.to_string())),
            Err(err) => Err(self.protocol_error(err)),
        }
    }

    fn read_memory(&mut self, address: u64, length: usize) -> debuggable::Result<Vec<u8>> {
        self.require_halted()?;

        let mut bytes = Vec::with_capacity(length);
        for (chunk_address, _, chunk_length) in Self::chunks(address, length) {
            let reply = self.exchange(&format!("m{chunk_address:x},{chunk_length:x}"))?;
            let chunk = match data_reply(&reply).and_then(hex_decode) {
                Ok(chunk) => chunk,
                Err(Error::Remote(_)) => return Err(self.inaccessible(address, length)),
                Err(err) => return Err(self.protocol_error(err)),
            };

            // Stubs may answer short reads when the range crosses into unmapped memory
            if chunk.len() != chunk_length {
                return Err(self.inaccessible(address, length));
            }

            bytes.extend_from_slice(&chunk);
        }

        Ok(bytes)
    }

    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> debuggable::Result<()> {
        self.require_halted()?;

        for (chunk_address, offset, chunk_length) in Self::chunks(address, bytes.len()) {
            let command = format!(
                "M{chunk_address:x},{chunk_length:x}:{}",
                hex_encode(&bytes[offset..offset + chunk_length])
            );
            let reply = self.exchange(&command)?;
            match ok_reply("M", &reply) {
                Ok(()) => (),
                Err(Error::Remote(_)) => return Err(self.inaccessible(address, bytes.len())),
                Err(err) => return Err(self.protocol_error(err)),
            }
        }

        Ok(())
    }

    fn stop(&mut self) -> debuggable::Result<()> {
        if self.state == TargetState::Stopped {
            return Ok(());
        }

        let timeout = self.reply_timeout;
        if let Some(mut connection) = self.connection.take() {
            if self.state == TargetState::Running {
                let _ = connection
                    .write_raw(&[INTERRUPT])
                    .and_then(|_| connection.receive(Some(timeout)));
            }

            for address in std::mem::take(&mut self.breakpoints).into_keys() {
                let command = format!("z0,{address:x},{:x}", self.breakpoint_kind);
                if let Err(err) = connection.command(command.as_bytes(), timeout) {
                    debug!(target = %self.name, "failed to remove breakpoint: {err}");
                }
            }

            if let Err(err) = connection.command(b"D", timeout) {
                debug!(target = %self.name, "detach failed: {err}");
            }

            connection.shutdown();
        }

        self.breakpoints.clear();
        self.state = TargetState::Stopped;
        info!(target = %self.name, "disconnected from gdb remote");
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.state == TargetState::Stopped
    }
}

impl Drop for GdbTarget {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
