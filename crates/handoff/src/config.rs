//! Session configuration read from a JSON file.
//!
//! Addresses and sizes accept either JSON integers or `"0x…"` strings:
//!
//! ```json
//! {
//!   "binary": "firmware.elf",
//!   "stack_pointer": "0x114514",
//!   "source": { "address": "localhost:3333" },
//!   "destination": { "address": "localhost:1234" },
//!   "probe": { "address": "localhost:4444" },
//!   "forwarding": {
//!     "listen_address": "127.0.0.1:9998",
//!     "ranges": [
//!       {
//!         "name": "peripherals",
//!         "address": "0xe8000000",
//!         "size": "0x17ffffff",
//!         "access": ["read", "write", "io"],
//!         "provider": "source",
//!         "write_back": false
//!       }
//!     ]
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use debuggable::{RegisterSet, ARM_REGISTERS};
use memfwd::{Access, MemoryRange, RangeMap};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Name of the provider backed by the source target's memory.
pub const SOURCE_PROVIDER: &str = "source";

/// Name of the provider backed by plain host memory.
pub const RAM_PROVIDER: &str = "ram";

fn parse_number(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim().replace('_', "");
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };

    parsed.map_err(|err| format!("invalid number `{text}`: {err}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Integer(u64),
    Text(String),
}

impl Number {
    fn value<E: serde::de::Error>(self) -> std::result::Result<u64, E> {
        match self {
            Number::Integer(value) => Ok(value),
            Number::Text(text) => parse_number(&text).map_err(E::custom),
        }
    }
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    Number::deserialize(deserializer)?.value()
}

fn optional_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    Option::<Number>::deserialize(deserializer)?
        .map(Number::value)
        .transpose()
}

fn default_registers() -> Vec<String> {
    ARM_REGISTERS.iter().map(|name| name.to_string()).collect()
}

fn default_handoff_symbol() -> String {
    "main".to_string()
}

fn default_termination_symbol() -> String {
    "_Z3finv".to_string()
}

fn default_termination_fallbacks() -> Vec<String> {
    vec!["__libc_fini_array".to_string()]
}

fn default_stack_pointer_register() -> String {
    "sp".to_string()
}

fn default_handoff_timeout_ms() -> u64 {
    30_000
}

fn default_destination_timeout_ms() -> u64 {
    600_000
}

fn default_listen_address() -> String {
    "127.0.0.1:9998".to_string()
}

fn default_register_width() -> usize {
    4
}

fn default_breakpoint_kind() -> u32 {
    4
}

fn default_reset_command() -> String {
    "reset halt".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// ELF image whose symbol table provides the handoff and termination addresses.
    pub binary: PathBuf,

    /// Registers transferred at handoff, in transfer order.
    #[serde(default = "default_registers")]
    pub registers: Vec<String>,

    #[serde(default = "default_handoff_symbol")]
    pub handoff_symbol: String,

    #[serde(default = "default_termination_symbol")]
    pub termination_symbol: String,

    /// Tried in order when the termination symbol is missing.
    #[serde(default = "default_termination_fallbacks")]
    pub termination_fallbacks: Vec<String>,

    /// Value written to the destination's stack pointer after the register transfer. Must be
    /// present; `null` keeps the transferred value.
    #[serde(deserialize_with = "optional_number")]
    pub stack_pointer: Option<u64>,

    #[serde(default = "default_stack_pointer_register")]
    pub stack_pointer_register: String,

    #[serde(default = "default_handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,

    #[serde(default = "default_destination_timeout_ms")]
    pub destination_timeout_ms: u64,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    pub source: EndpointConfig,
    pub destination: EndpointConfig,

    /// Probe control plane. Without it the source is assumed to be halted at reset already.
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default)]
    pub ranges: Vec<RangeConfig>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            ranges: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub name: String,

    #[serde(deserialize_with = "number")]
    pub address: u64,

    #[serde(deserialize_with = "number")]
    pub size: u64,

    pub access: Vec<Access>,

    /// Either [SOURCE_PROVIDER] or [RAM_PROVIDER].
    pub provider: String,

    /// Whether emulator writes reach the provider. There is no default.
    pub write_back: bool,
}

impl RangeConfig {
    pub fn to_range(&self) -> Result<MemoryRange> {
        Ok(MemoryRange::new(
            self.name.clone(),
            self.address,
            self.size,
            self.access.iter().copied(),
            self.provider.clone(),
            self.write_back,
        )?)
    }
}

/// A gdb remote endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub address: String,

    /// Remote register numbers by name. Defaults to the ARM numbering.
    #[serde(default)]
    pub register_numbers: Option<BTreeMap<String, u32>>,

    #[serde(default = "default_register_width")]
    pub register_width: usize,

    #[serde(default = "default_breakpoint_kind")]
    pub breakpoint_kind: u32,
}

/// Telnet command port of the probe control plane.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    pub address: String,

    #[serde(default = "default_reset_command")]
    pub reset_command: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

impl SessionConfig {
    /// Read and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let registers = self.register_set()?;

        if self.stack_pointer.is_some() && !registers.contains(&self.stack_pointer_register) {
            return Err(Error::Config(format!(
                "stack pointer register `{}` is not in the register list",
                self.stack_pointer_register
            )));
        }

        if self.handoff_symbol.is_empty() || self.termination_symbol.is_empty() {
            return Err(Error::Config("symbol names must not be empty".to_string()));
        }

        if self.handoff_timeout_ms == 0 || self.destination_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }

        for range in &self.forwarding.ranges {
            if range.provider != SOURCE_PROVIDER && range.provider != RAM_PROVIDER {
                return Err(Error::Config(format!(
                    "range `{}` uses unknown provider `{}`; \
                     expected `{SOURCE_PROVIDER}` or `{RAM_PROVIDER}`",
                    range.name, range.provider
                )));
            }
        }

        self.range_map()?;
        Ok(())
    }

    pub fn register_set(&self) -> Result<RegisterSet> {
        Ok(RegisterSet::new(self.registers.iter().cloned())?)
    }

    pub fn range_map(&self) -> Result<RangeMap> {
        let ranges = self
            .forwarding
            .ranges
            .iter()
            .map(RangeConfig::to_range)
            .collect::<Result<Vec<_>>>()?;

        Ok(RangeMap::new(ranges)?)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn destination_timeout(&self) -> Duration {
        Duration::from_millis(self.destination_timeout_ms)
    }
}
