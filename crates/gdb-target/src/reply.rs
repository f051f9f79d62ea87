use crate::error::{Error, Result};
use crate::packet::{hex_decode, parse_hex_u64};

/// Stop reply sent after `?`, `c` or an interrupt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReply {
    /// `Sxx` or `Txx n:r;...`. Only numbered registers of a `T` reply are kept.
    Signal {
        signal: u8,
        registers: Vec<(u32, Vec<u8>)>,
    },

    /// `Wxx`: the process exited.
    Exited(u8),

    /// `Xxx`: the process was terminated by a signal.
    Terminated(u8),

    /// `O...`: console output while the target runs.
    Output(String),
}

fn parse_u8(packet: &[u8], digits: &[u8]) -> Result<u8> {
    parse_hex_u64(digits)
        .and_then(|value| u8::try_from(value).ok())
        .ok_or_else(|| malformed(packet))
}

fn malformed(packet: &[u8]) -> Error {
    Error::Malformed(format!(
        "unexpected stop reply `{}`",
        String::from_utf8_lossy(packet)
    ))
}

pub fn parse_stop_reply(packet: &[u8]) -> Result<StopReply> {
    let (kind, body) = packet.split_first().ok_or_else(|| malformed(packet))?;
    match kind {
        b'S' => Ok(StopReply::Signal {
            signal: parse_u8(packet, body.get(..2).ok_or_else(|| malformed(packet))?)?,
            registers: Vec::new(),
        }),
        b'T' => {
            let signal = parse_u8(packet, body.get(..2).ok_or_else(|| malformed(packet))?)?;
            let registers = body[2..]
                .split(|&b| b == b';')
                .filter_map(|pair| {
                    let colon = pair.iter().position(|&b| b == b':')?;
                    let number = parse_hex_u64(&pair[..colon])?;
                    Some((u32::try_from(number).ok()?, pair[colon + 1..].to_vec()))
                })
                .collect();

            Ok(StopReply::Signal { signal, registers })
        }
        b'W' => Ok(StopReply::Exited(parse_u8(
            packet,
            body.get(..2).ok_or_else(|| malformed(packet))?,
        )?)),
        b'X' => Ok(StopReply::Terminated(parse_u8(
            packet,
            body.get(..2).ok_or_else(|| malformed(packet))?,
        )?)),
        b'O' => Ok(StopReply::Output(
            String::from_utf8_lossy(&hex_decode(body)?).into_owned(),
        )),
        _ => Err(malformed(packet)),
    }
}

/// Interpret a command reply that carries data, surfacing `Enn` errors.
pub fn data_reply(reply: &[u8]) -> Result<&[u8]> {
    match reply {
        [b'E', code @ ..] if code.len() == 2 => {
            let code = parse_hex_u64(code).ok_or_else(|| malformed(reply))?;
            Err(Error::Remote(code as u8))
        }
        _ => Ok(reply),
    }
}

/// Interpret a reply that must be `OK`.
pub fn ok_reply(command: &str, reply: &[u8]) -> Result<()> {
    match data_reply(reply)? {
        b"OK" => Ok(()),
        b"" => Err(Error::Unsupported(command.to_string())),
        other => Err(Error::Malformed(format!(
            "`{command}` answered `{}`",
            String::from_utf8_lossy(other)
        ))),
    }
}
