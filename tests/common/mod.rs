use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use debuggable::sim::{BusResult, MemoryBus, SimTarget};
use debuggable::{Breakpoint, Debuggable, RegisterSet};
use gdb_target::packet::{hex_decode, hex_encode, parse_hex_u64, Connection, Incoming};
use gdb_target::ARM_REGISTER_NUMBERS;
use memfwd::{ForwardingClient, RangeMap};
use tracing_subscriber::EnvFilter;

static LOGGER: Once = Once::new();

/// Install a test-writer subscriber once per test binary. `RUST_LOG` selects the level.
pub fn initialize_logger() {
    LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Simulated ARM unit with 64 KiB of memory at `base`.
pub fn arm_sim(name: &str, base: u64) -> SimTarget {
    SimTarget::new(name, RegisterSet::arm())
        .expect("arm register set has a pc")
        .with_region(base, 0x1_0000)
}

/// A port that was free a moment ago.
pub fn free_address() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("free port")
}

/// Forwarding client that connects on first use, for emulators created before the channel
/// is listening.
pub struct LazyBus {
    address: SocketAddr,
    ranges: RangeMap,
    client: Option<ForwardingClient>,
}

impl LazyBus {
    pub fn new(address: SocketAddr, ranges: RangeMap) -> Self {
        Self {
            address,
            ranges,
            client: None,
        }
    }

    fn client(&mut self) -> BusResult<&mut ForwardingClient> {
        if self.client.is_none() {
            let client = ForwardingClient::connect(self.address)
                .map_err(|err| debuggable::sim::BusError::Lost(err.to_string()))?
                .with_io_ranges(&self.ranges);
            self.client = Some(client);
        }

        self.client
            .as_mut()
            .ok_or_else(|| debuggable::sim::BusError::Lost("not connected".to_string()))
    }
}

impl MemoryBus for LazyBus {
    fn claims(&self, address: u64, length: usize) -> bool {
        self.ranges
            .lookup(address, length)
            .is_some_and(|(_, range)| range.is_io())
    }

    fn load(&mut self, address: u64, length: usize) -> BusResult<u64> {
        self.client()?.load(address, length)
    }

    fn store(&mut self, address: u64, length: usize, value: u64) -> BusResult<()> {
        self.client()?.store(address, length, value)
    }

    fn fetch(&mut self, address: u64, length: usize) -> BusResult<u64> {
        self.client()?.fetch(address, length)
    }

    fn close(&mut self) {
        if let Some(client) = self.client.as_mut() {
            MemoryBus::close(client);
        }
    }
}

/// How long the server lets a continued unit run before reporting it killed.
const RUN_LIMIT: Duration = Duration::from_secs(30);

/// Serves a [SimTarget] over the gdb remote serial protocol, standing in for the probe's gdb
/// server or an emulator's gdbstub.
pub struct GdbServer {
    address: SocketAddr,
    handle: JoinHandle<SimTarget>,
}

struct Served {
    target: SimTarget,
    names: HashMap<u32, &'static str>,
    breakpoints: Vec<Breakpoint>,
}

enum Reply {
    Packet(String),
    Detach,
    Close,
}

fn address_length(args: &str) -> Option<(u64, usize)> {
    let (address, length) = args.split_once(',')?;
    let address = parse_hex_u64(address.as_bytes())?;
    let length = parse_hex_u64(length.as_bytes())?;
    Some((address, usize::try_from(length).ok()?))
}

fn breakpoint_address(args: &str) -> Option<u64> {
    let address = args.strip_prefix("0,")?.split(',').next()?;
    parse_hex_u64(address.as_bytes())
}

impl Served {
    fn register(&self, number: &str) -> Option<&'static str> {
        let number = u32::try_from(parse_hex_u64(number.as_bytes())?).ok()?;
        self.names.get(&number).copied()
    }

    fn resume(&mut self) -> Reply {
        if self.target.continue_execution().is_err() {
            return Reply::Close;
        }

        let Some(breakpoint) = self.breakpoints.last_mut() else {
            return Reply::Packet("W00".to_string());
        };

        match self.target.wait_for_stop(breakpoint, RUN_LIMIT) {
            Ok(()) => {
                let pc = hex_encode(&(self.target.pc() as u32).to_le_bytes());
                Reply::Packet(format!("T05thread:01;0f:{pc};"))
            }
            Err(err) if err.is_timeout() => Reply::Packet("X09".to_string()),
            Err(_) => Reply::Close,
        }
    }

    fn handle(&mut self, packet: &str) -> Reply {
        let (kind, args) = packet.split_at(packet.len().min(1));
        let reply = match kind {
            "?" => "S05".to_string(),
            "c" => return self.resume(),
            "D" => return Reply::Detach,
            "Z" => match breakpoint_address(args).map(|at| self.target.set_breakpoint(at)) {
                Some(Ok(breakpoint)) => {
                    self.breakpoints.push(breakpoint);
                    "OK".to_string()
                }
                _ => "E01".to_string(),
            },
            "z" => {
                let address = breakpoint_address(args);
                if let Some(i) = self
                    .breakpoints
                    .iter()
                    .position(|breakpoint| Some(breakpoint.address()) == address)
                {
                    let mut breakpoint = self.breakpoints.remove(i);
                    let _ = self.target.clear_breakpoint(&mut breakpoint);
                }
                "OK".to_string()
            }
            "p" => self
                .register(args)
                .and_then(|name| self.target.read_register(name).ok())
                .map(|value| hex_encode(&(value as u32).to_le_bytes()))
                .unwrap_or_else(|| "E45".to_string()),
            "P" => {
                let written = args.split_once('=').and_then(|(number, value)| {
                    let name = self.register(number)?;
                    let bytes: [u8; 4] = hex_decode(value.as_bytes()).ok()?.try_into().ok()?;
                    self.target
                        .write_register(name, u64::from(u32::from_le_bytes(bytes)))
                        .ok()
                });

                match written {
                    Some(()) => "OK".to_string(),
                    None => "E45".to_string(),
                }
            }
            "m" => address_length(args)
                .and_then(|(address, length)| self.target.read_memory(address, length).ok())
                .map(|bytes| hex_encode(&bytes))
                .unwrap_or_else(|| "E14".to_string()),
            "M" => {
                let written = args.split_once(':').and_then(|(range, data)| {
                    let (address, length) = address_length(range)?;
                    let bytes = hex_decode(data.as_bytes()).ok()?;
                    (bytes.len() == length).then_some(())?;
                    self.target.write_memory(address, &bytes).ok()
                });

                match written {
                    Some(()) => "OK".to_string(),
                    None => "E14".to_string(),
                }
            }
            _ => String::new(),
        };

        Reply::Packet(reply)
    }
}

impl GdbServer {
    /// Serve a single client connection on a background thread.
    pub fn spawn(target: SimTarget) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind gdb server");
        let address = listener.local_addr().expect("gdb server address");

        let handle = thread::spawn(move || {
            let mut served = Served {
                target,
                names: ARM_REGISTER_NUMBERS
                    .iter()
                    .map(|&(name, number)| (number, name))
                    .collect(),
                breakpoints: Vec::new(),
            };

            let Ok((stream, _)) = listener.accept() else {
                return served.target;
            };
            let Ok(mut connection) = Connection::new(stream) else {
                return served.target;
            };

            // The client may connect without issuing anything else
            let _ = served.target.start();
            loop {
                let packet = match connection.receive_incoming(None) {
                    Ok(Incoming::Packet(packet)) => String::from_utf8_lossy(&packet).into_owned(),
                    Ok(Incoming::Interrupt) => "S02".to_string(),
                    Err(_) => break,
                };

                match served.handle(&packet) {
                    Reply::Packet(reply) if connection.send(reply.as_bytes()).is_ok() => (),
                    Reply::Detach => {
                        let _ = connection.send(b"OK");
                        break;
                    }
                    Reply::Packet(_) | Reply::Close => break,
                }
            }

            connection.shutdown();
            let _ = served.target.stop();
            served.target
        });

        Self { address, handle }
    }

    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Wait for the client to disconnect and return the served unit.
    pub fn finish(self) -> SimTarget {
        self.handle.join().expect("gdb server thread")
    }
}

const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STB_GLOBAL: u8 = 1;
const SHN_ABS: u16 = 0xfff1;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;

struct ElfSymbol {
    name: String,
    value: u32,
    kind: u8,
    defined: bool,
}

/// Builds little-endian ELF32 images holding only a symbol table.
pub struct ElfImage {
    machine: u16,
    symbols: Vec<ElfSymbol>,
}

impl ElfImage {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            symbols: Vec::new(),
        }
    }

    pub fn arm() -> Self {
        Self::new(EM_ARM)
    }

    fn symbol(mut self, name: &str, value: u32, kind: u8, defined: bool) -> Self {
        self.symbols.push(ElfSymbol {
            name: name.to_string(),
            value,
            kind,
            defined,
        });
        self
    }

    /// Function symbol. On ARM set the low bit for Thumb code.
    pub fn function(self, name: &str, value: u32) -> Self {
        self.symbol(name, value, STT_FUNC, true)
    }

    pub fn object(self, name: &str, value: u32) -> Self {
        self.symbol(name, value, STT_OBJECT, true)
    }

    pub fn undefined(self, name: &str) -> Self {
        self.symbol(name, 0, STT_FUNC, false)
    }

    pub fn build(&self) -> Vec<u8> {
        const HEADER_SIZE: usize = 52;
        const SECTION_HEADER_SIZE: u16 = 40;
        const SHSTRTAB: &[u8] = b"\0.symtab\0.strtab\0.shstrtab\0";

        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 16];
        for symbol in &self.symbols {
            let name = strtab.len() as u32;
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);

            let shndx = if symbol.defined { SHN_ABS } else { 0 };
            symtab.extend_from_slice(&name.to_le_bytes());
            symtab.extend_from_slice(&symbol.value.to_le_bytes());
            symtab.extend_from_slice(&0u32.to_le_bytes());
            symtab.push((STB_GLOBAL << 4) | symbol.kind);
            symtab.push(0);
            symtab.extend_from_slice(&shndx.to_le_bytes());
        }

        let symtab_offset = HEADER_SIZE;
        let strtab_offset = symtab_offset + symtab.len();
        let shstrtab_offset = strtab_offset + strtab.len();
        let section_offset = (shstrtab_offset + SHSTRTAB.len() + 3) & !3;

        let mut image = Vec::new();
        image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        image.extend_from_slice(&[0; 8]);
        image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image.extend_from_slice(&self.machine.to_le_bytes());
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // entry
        image.extend_from_slice(&0u32.to_le_bytes()); // phoff
        image.extend_from_slice(&(section_offset as u32).to_le_bytes());
        image.extend_from_slice(&0x0500_0000u32.to_le_bytes());
        image.extend_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&32u16.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&SECTION_HEADER_SIZE.to_le_bytes());
        image.extend_from_slice(&4u16.to_le_bytes());
        image.extend_from_slice(&3u16.to_le_bytes());

        image.extend_from_slice(&symtab);
        image.extend_from_slice(&strtab);
        image.extend_from_slice(SHSTRTAB);
        image.resize(section_offset, 0);

        // name, type, flags, addr, offset, size, link, info, addralign, entsize
        let sections: [[u32; 10]; 4] = [
            [0; 10],
            [1, 2, 0, 0, symtab_offset as u32, symtab.len() as u32, 2, 1, 4, 16],
            [9, 3, 0, 0, strtab_offset as u32, strtab.len() as u32, 0, 0, 1, 0],
            [17, 3, 0, 0, shstrtab_offset as u32, SHSTRTAB.len() as u32, 0, 0, 1, 0],
        ];

        for field in sections.iter().flatten() {
            image.extend_from_slice(&field.to_le_bytes());
        }

        image
    }

    pub fn write(&self, dir: &assert_fs::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, self.build()).expect("write elf image");
        path
    }
}
