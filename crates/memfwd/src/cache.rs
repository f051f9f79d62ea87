use std::collections::BTreeMap;

/// Byte-granular cache of values observed by the forwarding channel.
///
/// A cache belongs to exactly one range worker, which is the only writer. Reads hit only when
/// every requested byte is cached.
#[derive(Debug, Default)]
pub struct ConcreteCache {
    bytes: BTreeMap<u64, u8>,
}

impl ConcreteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a little-endian value of `length` bytes.
    pub fn get(&self, address: u64, length: usize) -> Option<u64> {
        let mut value = [0u8; 8];
        let mut count = 0;
        for (i, (&offset, &byte)) in self
            .bytes
            .range(address..address.checked_add(length as u64)?)
            .enumerate()
        {
            if offset != address + i as u64 || i >= value.len() {
                return None;
            }

            value[i] = byte;
            count += 1;
        }

        (count == length).then(|| u64::from_le_bytes(value))
    }

    /// Store the low `length` bytes of `value`, little-endian.
    pub fn insert(&mut self, address: u64, length: usize, value: u64) {
        for (i, byte) in value.to_le_bytes().into_iter().take(length).enumerate() {
            self.bytes.insert(address.wrapping_add(i as u64), byte);
        }
    }

    pub fn invalidate(&mut self, address: u64, length: usize) {
        for i in 0..length as u64 {
            self.bytes.remove(&address.wrapping_add(i));
        }
    }

    /// Number of cached bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
