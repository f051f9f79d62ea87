use std::fmt;

use crate::error::{Error, Result};

/// Registers transferred at handoff on 32-bit ARM targets, in transfer order.
pub const ARM_REGISTERS: [&str; 17] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "cpsr",
];

/// Ordered sequence of architectural register names used for snapshot and restore. The order is
/// the transfer order and is identical on both sides of a handoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSet {
    names: Vec<String>,
}

impl RegisterSet {
    /// Build a register set. Names must be unique and the set must not be empty.
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::InvalidRegisterSet(
                "register set is empty".to_string(),
            ));
        }

        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::InvalidRegisterSet(format!(
                    "register `{name}` listed more than once"
                )));
            }
        }

        Ok(Self { names })
    }

    pub fn arm() -> Self {
        Self {
            names: ARM_REGISTERS.iter().map(|&name| name.to_string()).collect(),
        }
    }

    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Same as [Self::position] but reports an unknown register as an error.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| Error::UnknownRegister(name.to_string()))
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self::arm()
    }
}

/// Register values captured in [RegisterSet] order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSnapshot {
    registers: Vec<(String, u64)>,
}

impl RegisterSnapshot {
    /// Pair `values` with the names of `set`. The number of values must match the set exactly.
    pub fn from_values(set: &RegisterSet, values: Vec<u64>) -> Result<Self> {
        if values.len() != set.len() {
            return Err(Error::RegisterSetMismatch {
                expected: set.len(),
                actual: values.len(),
            });
        }

        Ok(Self {
            registers: set
                .names()
                .map(str::to_string)
                .zip(values)
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.registers
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, value)| value)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, u64)> {
        self.registers
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
    }

    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> {
        self.registers.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> Vec<u64> {
        self.registers.iter().map(|&(_, value)| value).collect()
    }

    /// Whether this snapshot was taken with exactly `set`, position by position.
    pub fn matches(&self, set: &RegisterSet) -> bool {
        self.registers.len() == set.len() && self.names().zip(set.names()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "${name} = {value:#x}")?;
        }

        Ok(())
    }
}
