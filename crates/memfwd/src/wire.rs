//! Every message is a single JSON object terminated by a newline. A request carries an `id` that
//! the matching response echoes back:
//!
//! ```text
//! {"id":7,"op":"read","address":3892314112,"length":4}
//! {"id":7,"status":"ok","value":1}
//! ```

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest access carried by a single request, in bytes.
pub const MAX_ACCESS_SIZE: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Execute,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Operation,
    pub address: u64,
    pub length: usize,

    /// Little-endian value for writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

impl Request {
    pub fn read(id: u64, address: u64, length: usize) -> Self {
        Self {
            id,
            op: Operation::Read,
            address,
            length,
            value: None,
        }
    }

    pub fn write(id: u64, address: u64, length: usize, value: u64) -> Self {
        Self {
            id,
            op: Operation::Write,
            address,
            length,
            value: Some(value),
        }
    }

    pub fn execute(id: u64, address: u64, length: usize) -> Self {
        Self {
            id,
            op: Operation::Execute,
            address,
            length,
            value: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,

    /// The access is surfaced to the emulated program as a memory-access fault.
    Fault,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: Status,

    /// Value produced by reads and executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

impl Response {
    pub fn ok(id: u64, value: Option<u64>) -> Self {
        Self {
            id,
            status: Status::Ok,
            value,
        }
    }

    pub fn fault(id: u64) -> Self {
        Self {
            id,
            status: Status::Fault,
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Write a message followed by a newline and flush.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn read_line(reader: &mut impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        if !line.trim().is_empty() {
            return Ok(Some(line.trim_end().to_string()));
        }
    }
}

/// Read the next message. Returns `Ok(None)` when the peer closed the connection cleanly.
pub fn read_message<T: DeserializeOwned>(reader: &mut impl BufRead) -> Result<Option<T>> {
    match read_line(reader)? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(Error::from),
        None => Ok(None),
    }
}

/// A request line that is valid JSON but not a valid [Request], or not JSON at all.
#[derive(Debug)]
pub struct MalformedRequest {
    /// Identifier the sender is waiting on, when the line carries one.
    pub id: Option<u64>,
    pub error: serde_json::Error,
}

/// Read the next request. Decoding failures are returned as [MalformedRequest] so the caller can
/// still answer a sender that is blocked on the id.
pub fn read_request(
    reader: &mut impl BufRead,
) -> Result<Option<std::result::Result<Request, MalformedRequest>>> {
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };

    let value: serde_json::Value = match serde_json::from_str(&line) {
        Ok(value) => value,
        Err(error) => return Ok(Some(Err(MalformedRequest { id: None, error }))),
    };

    let id = value.get("id").and_then(serde_json::Value::as_u64);
    Ok(Some(
        Request::deserialize(&value).map_err(|error| MalformedRequest { id, error }),
    ))
}
