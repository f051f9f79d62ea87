use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use debuggable::sim::SimTarget;
use debuggable::{Breakpoint, Debuggable, RegisterSet};


/// Wraps a [SimTarget] to observe how the session and the transfer drive it.
pub struct Observed {
    inner: SimTarget,
    stops: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<(String, u64)>>>,
    fail_write: Option<String>,
}

impl Observed {
    pub fn new(inner: SimTarget) -> Self {
        Self {
            inner,
            stops: Arc::default(),
            writes: Arc::default(),
            fail_write: None,
        }
    }

    /// Make writes to `register` fail with an unknown register error.
    pub fn failing_write(mut self, register: &str) -> Self {
        self.fail_write = Some(register.to_string());
        self
    }

    pub fn stops(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stops)
    }

    pub fn writes(&self) -> Arc<Mutex<Vec<(String, u64)>>> {
        Arc::clone(&self.writes)
    }

    pub fn inner(&self) -> &SimTarget {
        &self.inner
    }
}

impl Debuggable for Observed {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self) -> debuggable::Result<()> {
        self.inner.start()
    }

    fn set_breakpoint(&mut self, address: u64) -> debuggable::Result<Breakpoint> {
        self.inner.set_breakpoint(address)
    }

    fn clear_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> debuggable::Result<()> {
        self.inner.clear_breakpoint(breakpoint)
    }

    fn continue_execution(&mut self) -> debuggable::Result<()> {
        self.inner.continue_execution()
    }

    fn wait_for_stop(
        &mut self,
        breakpoint: &mut Breakpoint,
        timeout: Duration,
    ) -> debuggable::Result<()> {
        self.inner.wait_for_stop(breakpoint, timeout)
    }

    fn read_register(&mut self, name: &str) -> debuggable::Result<u64> {
        self.inner.read_register(name)
    }

    fn write_register(&mut self, name: &str, value: u64) -> debuggable::Result<()> {
        if self.fail_write.as_deref() == Some(name) {
            return Err(debuggable::Error::UnknownRegister(name.to_string()));
        }

        self.writes.lock().unwrap().push((name.to_string(), value));
        self.inner.write_register(name, value)
    }

    fn read_memory(&mut self, address: u64, length: usize) -> debuggable::Result<Vec<u8>> {
        self.inner.read_memory(address, length)
    }

    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> debuggable::Result<()> {
        self.inner.write_memory(address, bytes)
    }

    fn stop(&mut self) -> debuggable::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop()
    }

    fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }
}

/// Simulated ARM unit with 64 KiB of memory at `base`.
pub fn sim(name: &str, base: u64) -> SimTarget {
    SimTarget::new(name, RegisterSet::arm())
        .expect("arm register set has a pc")
        .with_region(base, 0x1_0000)
}
