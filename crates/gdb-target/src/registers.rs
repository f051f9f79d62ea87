use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::packet::{hex_decode, hex_encode};

/// Register numbering used by gdbstubs for 32-bit ARM targets.
pub const ARM_REGISTER_NUMBERS: [(&str, u32); 17] = [
    ("r0", 0),
    ("r1", 1),
    ("r2", 2),
    ("r3", 3),
    ("r4", 4),
    ("r5", 5),
    ("r6", 6),
    ("r7", 7),
    ("r8", 8),
    ("r9", 9),
    ("r10", 10),
    ("r11", 11),
    ("r12", 12),
    ("sp", 13),
    ("lr", 14),
    ("pc", 15),
    ("cpsr", 25),
];

/// Maps architectural register names to remote register numbers. Values travel in target byte
/// order (little-endian) and are `width` bytes wide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterMap {
    numbers: HashMap<String, u32>,
    width: usize,
}

impl RegisterMap {
    pub fn new(numbers: impl IntoIterator<Item = (impl Into<String>, u32)>, width: usize) -> Self {
        Self {
            numbers: numbers
                .into_iter()
                .map(|(name, number)| (name.into(), number))
                .collect(),
            width: width.clamp(1, 8),
        }
    }

    pub fn arm() -> Self {
        Self::new(ARM_REGISTER_NUMBERS, 4)
    }

    pub fn number(&self, name: &str) -> Option<u32> {
        self.numbers.get(name).copied()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn encode(&self, value: u64) -> String {
        hex_encode(&value.to_le_bytes()[..self.width])
    }

    pub fn decode(&self, hex: &[u8]) -> Result<u64> {
        if hex.iter().all(|&b| b == b'x') && !hex.is_empty() {
            return Err(Error::Malformed("register value unavailable".to_string()));
        }

        let bytes = hex_decode(hex)?;
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(Error::Malformed(format!(
                "register value of {} bytes",
                bytes.len()
            )));
        }

        let mut value = [0u8; 8];
        value[..bytes.len()].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(value))
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::arm()
    }
}
