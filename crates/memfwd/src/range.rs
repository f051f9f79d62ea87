use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::wire::Operation;

/// Permission attached to a [MemoryRange].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
    Execute,

    /// Memory-mapped I/O. Accesses are always forwarded, even if the emulator maps the range.
    Io,

    /// Plain memory backed by the provider.
    Memory,

    /// Values are fixed numeric data and may be cached once observed.
    ConcreteValue,

    /// Addresses are fixed numeric data and may be cached once observed.
    ConcreteAddress,
}

/// An address range `[base, base + size)` serviced by a named backing provider. Ranges are
/// immutable once a session starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    name: String,
    base: u64,
    size: u64,
    access: BTreeSet<Access>,
    provider: String,
    write_back: bool,
}

impl MemoryRange {
    pub fn new(
        name: impl Into<String>,
        base: u64,
        size: u64,
        access: impl IntoIterator<Item = Access>,
        provider: impl Into<String>,
        write_back: bool,
    ) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(Error::InvalidRange(format!("range `{name}` is empty")));
        }

        if base.checked_add(size - 1).is_none() {
            return Err(Error::InvalidRange(format!(
                "range `{name}` at {base:#x} with size {size:#x} exceeds the address space"
            )));
        }

        Ok(Self {
            name,
            base,
            size,
            access: access.into_iter().collect(),
            provider: provider.into(),
            write_back,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last address inside the range.
    pub fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }

    pub fn access(&self) -> &BTreeSet<Access> {
        &self.access
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether emulator writes propagate to the backing provider.
    pub fn write_back(&self) -> bool {
        self.write_back
    }

    /// Whether `[address, address + length)` lies entirely within the range.
    pub fn contains(&self, address: u64, length: usize) -> bool {
        let Some(last_offset) = u64::try_from(length)
            .ok()
            .and_then(|length| length.checked_sub(1))
        else {
            return false;
        };

        address
            .checked_sub(self.base)
            .and_then(|offset| offset.checked_add(last_offset))
            .is_some_and(|end| end < self.size)
    }

    fn overlaps(&self, other: &MemoryRange) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }

    pub fn permits(&self, operation: Operation) -> bool {
        let required = match operation {
            Operation::Read => Access::Read,
            Operation::Write => Access::Write,
            Operation::Execute => Access::Execute,
        };

        self.access.contains(&required)
    }

    pub fn is_concrete(&self) -> bool {
        self.access.contains(&Access::ConcreteValue)
            || self.access.contains(&Access::ConcreteAddress)
    }

    pub fn is_io(&self) -> bool {
        self.access.contains(&Access::Io)
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{name} [{base:#x}, {base:#x}+{size:#x}) -> {provider}",
            name = self.name,
            base = self.base,
            size = self.size,
            provider = self.provider
        )
    }
}

/// Validated, address-ordered collection of [MemoryRange].
#[derive(Clone, Debug, Default)]
pub struct RangeMap {
    ranges: Vec<MemoryRange>,
}

impl RangeMap {
    /// Build the map. Range names must be unique and overlapping ranges must share a provider.
    pub fn new(ranges: impl IntoIterator<Item = MemoryRange>) -> Result<Self> {
        let mut ranges: Vec<MemoryRange> = ranges.into_iter().collect();
        ranges.sort_by_key(|range| range.base);

        for (i, range) in ranges.iter().enumerate() {
            for other in &ranges[..i] {
                if other.name == range.name {
                    return Err(Error::InvalidRange(format!(
                        "range name `{name}` is used more than once",
                        name = range.name
                    )));
                }

                if other.overlaps(range) {
                    if other.provider != range.provider {
                        return Err(Error::InvalidRange(format!(
                            "ranges {other} and {range} overlap with different providers"
                        )));
                    }

                    warn!(
                        "ranges `{}` and `{}` overlap; the lower range takes precedence",
                        other.name, range.name
                    );
                }
            }
        }

        Ok(Self { ranges })
    }

    /// Find the range containing the entire access.
    pub fn lookup(&self, address: u64, length: usize) -> Option<(usize, &MemoryRange)> {
        self.ranges
            .iter()
            .enumerate()
            .find(|(_, range)| range.contains(address, length))
    }

    pub fn get(&self, index: usize) -> Option<&MemoryRange> {
        self.ranges.get(index)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &MemoryRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
