use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use debuggable::sim::{BusError, BusResult, MemoryBus};
use tracing::debug;

use crate::error::{Error, Result};
use crate::range::RangeMap;
use crate::wire::{self, Request, Response};

/// Emulator side of the forwarding channel. Every request blocks until its response arrives.
pub struct ForwardingClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    next_id: u64,
    io_ranges: RangeMap,
}

impl ForwardingClient {
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            next_id: 1,
            io_ranges: RangeMap::default(),
        })
    }

    /// Ranges whose accesses are always forwarded, even if the emulator maps them locally. Only
    /// ranges with [crate::Access::Io] are kept.
    pub fn with_io_ranges(mut self, ranges: &RangeMap) -> Self {
        self.io_ranges = RangeMap::new(ranges.iter().filter(|range| range.is_io()).cloned())
            .unwrap_or_default();
        self
    }

    /// Send a request built from the next id and wait for its response.
    pub fn request(&mut self, build: impl FnOnce(u64) -> Request) -> Result<Response> {
        let request = build(self.next_id);
        self.next_id += 1;

        wire::write_message(&mut self.writer, &request)?;
        let response: Response = wire::read_message(&mut self.reader)?.ok_or_else(|| {
            Error::TargetLost("forwarding channel closed the connection".to_string())
        })?;

        if response.id != request.id {
            return Err(Error::UnexpectedResponse {
                expected: request.id,
                actual: response.id,
            });
        }

        Ok(response)
    }

    pub fn read(&mut self, address: u64, length: usize) -> Result<Response> {
        self.request(|id| Request::read(id, address, length))
    }

    pub fn write(&mut self, address: u64, length: usize, value: u64) -> Result<Response> {
        self.request(|id| Request::write(id, address, length, value))
    }

    pub fn execute(&mut self, address: u64, length: usize) -> Result<Response> {
        self.request(|id| Request::execute(id, address, length))
    }

    pub fn close(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

fn bus_value(response: Result<Response>) -> BusResult<u64> {
    match response {
        Ok(response) if response.is_ok() => Ok(response.value.unwrap_or_default()),
        Ok(_) => Err(BusError::Fault),
        Err(err) => {
            debug!("forwarding request failed: {err}");
            Err(BusError::Lost(err.to_string()))
        }
    }
}

impl MemoryBus for ForwardingClient {
    fn claims(&self, address: u64, length: usize) -> bool {
        self.io_ranges.lookup(address, length).is_some()
    }

    fn load(&mut self, address: u64, length: usize) -> BusResult<u64> {
        bus_value(self.read(address, length))
    }

    fn store(&mut self, address: u64, length: usize, value: u64) -> BusResult<()> {
        bus_value(self.write(address, length, value)).map(|_| ())
    }

    fn fetch(&mut self, address: u64, length: usize) -> BusResult<u64> {
        bus_value(self.execute(address, length))
    }

    fn close(&mut self) {
        ForwardingClient::close(self);
    }
}
