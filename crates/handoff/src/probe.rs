use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Telnet "interpret as command" escape.
const IAC: u8 = 0xff;

const PROMPT: &[u8] = b"> ";

/// Control plane of the debug probe, used once before a session to put the source target in a
/// known state.
pub trait ProbeControl {
    /// Reset the target and leave it halted at the reset vector.
    fn reset_halt(&mut self) -> Result<()>;
}

impl<P: ProbeControl + ?Sized> ProbeControl for Box<P> {
    fn reset_halt(&mut self) -> Result<()> {
        (**self).reset_halt()
    }
}

/// For sources that need no reset, such as an emulator or a target reset by other means.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoProbe;

impl ProbeControl for NoProbe {
    fn reset_halt(&mut self) -> Result<()> {
        debug!("no probe control plane configured, skipping reset");
        Ok(())
    }
}

/// Probe driven through its telnet command port, as offered by OpenOCD.
#[derive(Clone, Debug)]
pub struct TelnetProbe {
    address: String,
    command: String,
    timeout: Duration,
}

/// Remove telnet option negotiation from `data`.
fn strip_telnet_commands(data: &[u8]) -> Vec<u8> {
    let mut text = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte == IAC {
            // Command and option byte
            bytes.next();
            bytes.next();
            continue;
        }

        text.push(byte);
    }

    text
}

impl TelnetProbe {
    pub fn new(address: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            command: command.into(),
            timeout,
        }
    }

    /// Read until the command prompt appears and return the text before it.
    fn read_prompt(&self, stream: &mut TcpStream, deadline: Instant) -> Result<String> {
        let mut received = Vec::new();
        let mut buffer = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Probe(format!(
                    "no prompt from {} within {:?}",
                    self.address, self.timeout
                )));
            }

            stream.set_read_timeout(Some(remaining))?;
            let count = match stream.read(&mut buffer) {
                Ok(0) => {
                    return Err(Error::Probe(format!(
                        "{} closed the connection",
                        self.address
                    )))
                }
                Ok(count) => count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Probe(format!("{}: {err}", self.address))),
            };

            received.extend_from_slice(&buffer[..count]);
            let text = strip_telnet_commands(&received);
            if text.ends_with(PROMPT) {
                let output = &text[..text.len() - PROMPT.len()];
                return Ok(String::from_utf8_lossy(output).trim().to_string());
            }
        }
    }
}

impl ProbeControl for TelnetProbe {
    fn reset_halt(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = TcpStream::connect(&self.address)
            .map_err(|err| Error::Probe(format!("failed to connect to {}: {err}", self.address)))?;

        let banner = self.read_prompt(&mut stream, deadline)?;
        debug!(probe = %self.address, %banner, "connected to probe");

        stream.write_all(self.command.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        let output = self.read_prompt(&mut stream, deadline)?;
        info!(probe = %self.address, command = %self.command, %output, "probe command completed");
        Ok(())
    }
}
