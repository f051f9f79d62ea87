use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use debuggable::{Debuggable, SharedTarget};
use tracing::warn;

/// Failure reported by a [BackingProvider].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderError {
    /// The access faulted. The emulated program observes a memory-access fault.
    Fault(String),

    /// The provider's connection dropped. This is fatal to the current run.
    Lost(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// The entity that actually services a forwarded access. Values are little-endian and at most 8
/// bytes wide. A provider may back several ranges, each served from its own worker thread.
pub trait BackingProvider: Send + Sync {
    fn read(&self, address: u64, length: usize) -> ProviderResult<u64>;
    fn write(&self, address: u64, length: usize, value: u64) -> ProviderResult<()>;
}

/// Named providers referenced by [crate::MemoryRange::provider].
#[derive(Clone, Default)]
pub struct Providers {
    providers: HashMap<String, Arc<dyn BackingProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        provider: impl BackingProvider + 'static,
    ) -> Self {
        self.insert(name, Arc::new(provider));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn BackingProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackingProvider>> {
        self.providers.get(name).cloned()
    }
}

/// Forwards accesses to a [Debuggable], typically the physical target halted at handoff.
pub struct TargetProvider<D> {
    target: SharedTarget<D>,
}

impl<D: Debuggable> TargetProvider<D> {
    pub fn new(target: SharedTarget<D>) -> Self {
        Self { target }
    }
}

fn provider_error(err: debuggable::Error) -> ProviderError {
    if err.is_target_lost() {
        warn!("backing target lost: {err}");
        ProviderError::Lost(err.to_string())
    } else {
        ProviderError::Fault(err.to_string())
    }
}

impl<D: Debuggable + Send> BackingProvider for TargetProvider<D> {
    fn read(&self, address: u64, length: usize) -> ProviderResult<u64> {
        let bytes = self
            .target
            .lock()
            .read_memory(address, length)
            .map_err(provider_error)?;

        let mut value = [0u8; 8];
        let count = bytes.len().min(value.len());
        value[..count].copy_from_slice(&bytes[..count]);
        Ok(u64::from_le_bytes(value))
    }

    fn write(&self, address: u64, length: usize, value: u64) -> ProviderResult<()> {
        let bytes = value.to_le_bytes();
        let length = length.min(bytes.len());
        self.target
            .lock()
            .write_memory(address, &bytes[..length])
            .map_err(provider_error)
    }
}

/// Plain memory model. Bytes never written read as zero.
#[derive(Debug, Default)]
pub struct RamProvider {
    bytes: Mutex<BTreeMap<u64, u8>>,
}

impl RamProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(address: u64, bytes: &[u8]) -> Self {
        let provider = Self::default();
        provider.load(address, bytes);
        provider
    }

    pub fn load(&self, address: u64, bytes: &[u8]) {
        let mut memory = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        for (i, &byte) in bytes.iter().enumerate() {
            memory.insert(address.wrapping_add(i as u64), byte);
        }
    }
}

impl BackingProvider for RamProvider {
    fn read(&self, address: u64, length: usize) -> ProviderResult<u64> {
        let memory = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        let mut value = [0u8; 8];
        for (i, slot) in value.iter_mut().take(length).enumerate() {
            *slot = memory
                .get(&address.wrapping_add(i as u64))
                .copied()
                .unwrap_or_default();
        }

        Ok(u64::from_le_bytes(value))
    }

    fn write(&self, address: u64, length: usize, value: u64) -> ProviderResult<()> {
        let mut memory = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        for (i, byte) in value.to_le_bytes().into_iter().take(length).enumerate() {
            memory.insert(address.wrapping_add(i as u64), byte);
        }

        Ok(())
    }
}
