use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Out-of-band byte asking a running remote to halt.
pub const INTERRUPT: u8 = 0x03;

/// Attempts made to deliver a packet the remote rejects with `-`.
const MAX_TRANSMISSIONS: usize = 3;

/// How long to wait for the `+` acknowledging a sent packet.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Modulo-256 sum of the payload bytes.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Wrap a payload as `$payload#cc`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let sum = checksum(payload);
    let mut packet = Vec::with_capacity(payload.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(payload);
    packet.push(b'#');
    packet.push(HEX[(sum >> 4) as usize]);
    packet.push(HEX[(sum & 0xf) as usize]);
    packet
}

fn from_hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + b - b'a'),
        b'A'..=b'F' => Some(10 + b - b'A'),
        _ => None,
    }
}

pub fn parse_hex_u64(buf: &[u8]) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }

    buf.iter().try_fold(0u64, |value, &b| {
        value
            .checked_mul(16)?
            .checked_add(u64::from(from_hex_digit(b)?))
    })
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        encoded.push(HEX[(b >> 4) as usize] as char);
        encoded.push(HEX[(b & 0xf) as usize] as char);
    }

    encoded
}

pub fn hex_decode(src: &[u8]) -> Result<Vec<u8>> {
    if src.len() % 2 != 0 {
        return Err(Error::Malformed(format!(
            "odd number of hex digits in `{}`",
            String::from_utf8_lossy(src)
        )));
    }

    src.chunks_exact(2)
        .map(|pair| {
            let hi = from_hex_digit(pair[0]);
            let lo = from_hex_digit(pair[1]);
            hi.zip(lo).map(|(hi, lo)| (hi << 4) | lo).ok_or_else(|| {
                Error::Malformed(format!(
                    "invalid hex digits `{}`",
                    String::from_utf8_lossy(pair)
                ))
            })
        })
        .collect()
}

/// Expand run-length encoded reply data. `X*n` stands for `X` followed by `n - 29` more copies.
pub fn expand_run_length(data: &[u8]) -> Result<Vec<u8>> {
    let mut expanded = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != b'*' {
            expanded.push(byte);
            continue;
        }

        let repeated = *expanded
            .last()
            .ok_or_else(|| Error::Malformed("run-length marker at start of packet".to_string()))?;
        let count = bytes
            .next()
            .and_then(|count| count.checked_sub(29))
            .ok_or_else(|| Error::Malformed("invalid run-length count".to_string()))?;

        expanded.extend(std::iter::repeat(repeated).take(count as usize));
    }

    Ok(expanded)
}

/// Something read from the remote between packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    Packet(Vec<u8>),

    /// The peer sent [INTERRUPT].
    Interrupt,
}

/// Packet-level connection to a remote serial protocol peer. Used by the client side of
/// [crate::GdbTarget] and equally usable as the server side of a stub.
pub struct Connection {
    reader: BufReader<TcpStream>,
    stream: TcpStream,
    peer: String,
}

impl Connection {
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self> {
        Self::new(TcpStream::connect(address)?)
    }

    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            stream,
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // A zero timeout is rejected by the socket layer
        let timeout = timeout.map(|timeout| timeout.max(Duration::from_millis(1)));
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Option<Duration>) -> Result<u8> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte) {
            Ok(0) => Err(Error::Closed),
            Ok(_) => Ok(byte[0]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(Error::Timeout(timeout.unwrap_or_default()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write bytes without framing, such as [INTERRUPT] or acknowledgements.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Send a packet and wait for the peer to acknowledge it, retransmitting on `-`.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let packet = frame(payload);
        trace!(peer = %self.peer, packet = %String::from_utf8_lossy(payload), "send");

        self.set_timeout(Some(ACK_TIMEOUT))?;
        for attempt in 1..=MAX_TRANSMISSIONS {
            self.write_raw(&packet)?;
            loop {
                match self.read_byte(Some(ACK_TIMEOUT))? {
                    b'+' => return Ok(()),
                    b'-' => break,
                    _ => continue,
                }
            }

            debug!(peer = %self.peer, attempt, "packet rejected, retransmitting");
        }

        Err(Error::NotAcknowledged(
            String::from_utf8_lossy(payload).into_owned(),
        ))
    }

    /// Receive the next packet or interrupt. Packets with a bad checksum are rejected with `-` so
    /// the peer retransmits them; valid packets are acknowledged with `+`.
    pub fn receive_incoming(&mut self, timeout: Option<Duration>) -> Result<Incoming> {
        self.set_timeout(timeout)?;
        loop {
            match self.read_byte(timeout)? {
                b'$' => (),
                INTERRUPT => return Ok(Incoming::Interrupt),
                _ => continue,
            }

            let mut payload = Vec::new();
            loop {
                match self.read_byte(timeout)? {
                    b'#' => break,
                    b => payload.push(b),
                }
            }

            let digits = [self.read_byte(timeout)?, self.read_byte(timeout)?];
            let expected = parse_hex_u64(&digits)
                .and_then(|sum| u8::try_from(sum).ok())
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "invalid checksum `{}`",
                        String::from_utf8_lossy(&digits)
                    ))
                })?;

            let actual = checksum(&payload);
            if expected != actual {
                debug!(
                    peer = %self.peer,
                    "{}",
                    Error::Checksum { expected, actual }
                );
                self.write_raw(b"-")?;
                continue;
            }

            self.write_raw(b"+")?;
            trace!(peer = %self.peer, packet = %String::from_utf8_lossy(&payload), "receive");
            return Ok(Incoming::Packet(payload));
        }
    }

    /// Receive the next packet, skipping interrupts.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        loop {
            if let Incoming::Packet(payload) = self.receive_incoming(timeout)? {
                return Ok(payload);
            }
        }
    }

    /// Send a command and return its reply with run-length encoding expanded.
    pub fn command(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.send(payload)?;
        let reply = self.receive(Some(timeout))?;
        expand_run_length(&reply)
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
