use std::sync::{Arc, Mutex};

use crate::*;

/// Provider that records every access and delegates to plain memory.
#[derive(Default)]
struct RecordingProvider {
    memory: RamProvider,
    accesses: Mutex<Vec<(Operation, u64)>>,
    fail: Option<ProviderError>,
}

impl BackingProvider for RecordingProvider {
    fn read(&self, address: u64, length: usize) -> ProviderResult<u64> {
        self.accesses
            .lock()
            .unwrap()
            .push((Operation::Read, address));
        match &self.fail {
            Some(err) => Err(err.clone()),
            None => self.memory.read(address, length),
        }
    }

    fn write(&self, address: u64, length: usize, value: u64) -> ProviderResult<()> {
        self.accesses
            .lock()
            .unwrap()
            .push((Operation::Write, address));
        match &self.fail {
            Some(err) => Err(err.clone()),
            None => self.memory.write(address, length, value),
        }
    }
}

fn lane(access: &[Access], write_back: bool, provider: Arc<RecordingProvider>) -> Lane {
    let range = MemoryRange::new(
        "range",
        0x2000_0000,
        0x1000,
        access.iter().copied(),
        "provider",
        write_back,
    )
    .expect("valid range");
    Lane::new(range, provider)
}

const CONCRETE: &[Access] = &[
    Access::Read,
    Access::Write,
    Access::Memory,
    Access::ConcreteValue,
];

const IO: &[Access] = &[Access::Read, Access::Write, Access::Io];

#[test]
fn concrete_reads_are_cached() {
    let provider = Arc::new(RecordingProvider {
        memory: RamProvider::with_bytes(0x2000_0000, &[0x11, 0x22, 0x33, 0x44]),
        ..Default::default()
    });
    let mut lane = lane(CONCRETE, false, Arc::clone(&provider));

    for id in 0..3 {
        let response = lane.serve(&Request::read(id, 0x2000_0000, 4));
        assert_eq!(response, Response::ok(id, Some(0x4433_2211)));
    }

    assert_eq!(provider.accesses.lock().unwrap().len(), 1);
    assert_eq!(lane.stats().cache_hits, 2);
    assert_eq!(lane.stats().forwarded, 1);
}

#[test]
fn io_reads_are_always_forwarded() {
    let provider = Arc::new(RecordingProvider::default());
    let mut lane = lane(IO, true, Arc::clone(&provider));

    lane.serve(&Request::read(1, 0x2000_0000, 4));
    lane.serve(&Request::read(2, 0x2000_0000, 4));
    assert_eq!(provider.accesses.lock().unwrap().len(), 2);
    assert!(lane.cache().is_empty());
}

#[test]
fn writes_without_write_back_stay_in_cache() {
    let provider = Arc::new(RecordingProvider::default());
    let mut lane = lane(IO, false, Arc::clone(&provider));

    let response = lane.serve(&Request::write(1, 0x2000_0010, 4, 0xdead_beef));
    assert!(response.is_ok());

    let response = lane.serve(&Request::read(2, 0x2000_0010, 4));
    assert_eq!(response.value, Some(0xdead_beef));

    // The provider never observed the write or the read
    assert!(provider.accesses.lock().unwrap().is_empty());
    assert_eq!(provider.memory.read(0x2000_0010, 4), Ok(0));
}

#[test]
fn writes_with_write_back_reach_provider() {
    let provider = Arc::new(RecordingProvider::default());
    let mut lane = lane(CONCRETE, true, Arc::clone(&provider));

    lane.serve(&Request::read(1, 0x2000_0010, 4));
    let response = lane.serve(&Request::write(2, 0x2000_0010, 4, 0xdead_beef));
    assert!(response.is_ok());
    assert_eq!(provider.memory.read(0x2000_0010, 4), Ok(0xdead_beef));

    // Cache reflects the written value instead of the stale read
    let response = lane.serve(&Request::read(3, 0x2000_0010, 4));
    assert_eq!(response.value, Some(0xdead_beef));
    assert_eq!(
        *provider.accesses.lock().unwrap(),
        vec![
            (Operation::Read, 0x2000_0010),
            (Operation::Write, 0x2000_0010)
        ]
    );
}

#[test]
fn provider_fault_is_a_fault_response() {
    let provider = Arc::new(RecordingProvider {
        fail: Some(ProviderError::Fault("bus error".to_string())),
        ..Default::default()
    });
    let mut lane = lane(IO, true, provider);

    assert_eq!(lane.serve(&Request::read(9, 0x2000_0000, 4)), Response::fault(9));
    assert_eq!(lane.stats().faulted, 1);
    assert!(lane.lost().is_none());
}

#[test]
fn provider_loss_faults_every_later_request() {
    let provider = Arc::new(RecordingProvider {
        fail: Some(ProviderError::Lost("probe disconnected".to_string())),
        ..Default::default()
    });
    let mut lane = lane(IO, true, Arc::clone(&provider));

    assert_eq!(lane.serve(&Request::read(1, 0x2000_0000, 4)), Response::fault(1));
    assert_eq!(lane.lost(), Some("probe disconnected"));
    assert_eq!(lane.serve(&Request::read(2, 0x2000_0000, 4)), Response::fault(2));
    assert_eq!(provider.accesses.lock().unwrap().len(), 1);
}

#[test]
fn route_rejections() -> Result<()> {
    let ranges = RangeMap::new([MemoryRange::new(
        "rom",
        0x1000,
        0x100,
        [Access::Read, Access::Execute],
        "ram",
        false,
    )?])?;

    assert_eq!(route(&ranges, &Request::read(1, 0x1000, 4)), Ok(0));
    assert_eq!(route(&ranges, &Request::execute(1, 0x10fc, 4)), Ok(0));
    assert_eq!(
        route(&ranges, &Request::read(1, 0x10fe, 4)),
        Err(Rejection::Unmapped {
            address: 0x10fe,
            length: 4
        })
    );
    assert_eq!(
        route(&ranges, &Request::read(1, 0x1000, 16)),
        Err(Rejection::InvalidLength(16))
    );
    assert!(matches!(
        route(&ranges, &Request::write(1, 0x1000, 4, 0)),
        Err(Rejection::NotPermitted { .. })
    ));

    let mut missing_value = Request::write(1, 0x1000, 4, 0);
    missing_value.value = None;
    let ranges = RangeMap::new([MemoryRange::new(
        "ram",
        0x1000,
        0x100,
        [Access::Write],
        "ram",
        false,
    )?])?;
    assert_eq!(route(&ranges, &missing_value), Err(Rejection::MissingValue));
    Ok(())
}

#[test]
fn forwarder_requires_known_providers() -> Result<()> {
    let ranges = RangeMap::new([MemoryRange::new(
        "rom",
        0x1000,
        0x100,
        [Access::Read],
        "missing",
        false,
    )?])?;

    let result = Forwarder::new(ranges, &Providers::new().with("ram", RamProvider::new()));
    assert!(matches!(result, Err(Error::UnknownProvider { .. })));
    Ok(())
}

#[test]
fn forwarder_faults_outside_ranges() -> Result<()> {
    let ranges = RangeMap::new([MemoryRange::new(
        "ram",
        0x1000,
        0x100,
        [Access::Read, Access::Write],
        "ram",
        true,
    )?])?;

    let mut forwarder = Forwarder::new(ranges, &Providers::new().with("ram", RamProvider::new()))?;
    assert!(forwarder.serve(&Request::write(1, 0x1000, 4, 7)).is_ok());
    assert_eq!(forwarder.serve(&Request::read(2, 0x1000, 4)).value, Some(7));
    assert_eq!(forwarder.serve(&Request::read(3, 0x1100, 4)), Response::fault(3));
    assert_eq!(forwarder.rejected(), 1);
    assert!(forwarder.lost().is_none());
    Ok(())
}
