use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;

use crate::sim::*;
use crate::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn started(target: SimTarget) -> SimTarget {
    let mut target = target;
    target.start().expect("failed to start");
    target
}

fn arm_target() -> SimTarget {
    SimTarget::new("sim", RegisterSet::arm())
        .expect("valid register set")
        .with_region(0x1000, 0x100)
}

/// Bus that serves a single word window and faults everything else.
#[derive(Clone, Default)]
struct WindowBus {
    stores: Arc<Mutex<Vec<(u64, u64)>>>,
    lost: bool,
}

impl MemoryBus for WindowBus {
    fn claims(&self, address: u64, _length: usize) -> bool {
        (0xe000_0000..0xe000_1000).contains(&address)
    }

    fn load(&mut self, address: u64, _length: usize) -> BusResult<u64> {
        if self.lost {
            Err(BusError::Lost("peer closed".to_string()))
        } else if self.claims(address, 4) {
            Ok(0xcafe)
        } else {
            Err(BusError::Fault)
        }
    }

    fn store(&mut self, address: u64, _length: usize, value: u64) -> BusResult<()> {
        if self.claims(address, 4) {
            self.stores.lock().unwrap().push((address, value));
            Ok(())
        } else {
            Err(BusError::Fault)
        }
    }

    fn fetch(&mut self, address: u64, length: usize) -> BusResult<u64> {
        self.load(address, length)
    }
}

#[test]
fn run_to_breakpoint() -> Result<()> {
    let mut target = started(arm_target().with_program([
        Step::Goto(0x1000),
        Step::Goto(0x1004),
        Step::Goto(0x1010),
        Step::Goto(0x1020),
    ]));

    let mut other = target.set_breakpoint(0x1004)?;
    let mut breakpoint = target.set_breakpoint(0x1010)?;
    target.continue_execution()?;
    target.wait_for_stop(&mut breakpoint, TIMEOUT)?;

    assert_eq!(target.pc(), 0x1010);
    assert_eq!(breakpoint.state(), BreakpointState::Hit);
    assert_eq!(other.state(), BreakpointState::Armed);
    assert_eq!(target.state(), SimState::Halted);
    assert_eq!(target.remaining_steps(), 1);

    target.clear_breakpoint(&mut other)?;
    assert_eq!(other.state(), BreakpointState::Cleared);
    Ok(())
}

#[test]
fn shared_address_stays_armed_until_last_clear() -> Result<()> {
    let mut target = started(arm_target().with_program([
        Step::Goto(0x1000),
        Step::Goto(0x1010),
        Step::Goto(0x1020),
    ]));

    let mut first = target.set_breakpoint(0x1010)?;
    let mut second = target.set_breakpoint(0x1010)?;
    target.clear_breakpoint(&mut first)?;
    // Clearing twice releases only one installation
    target.clear_breakpoint(&mut first)?;

    target.continue_execution()?;
    target.wait_for_stop(&mut second, TIMEOUT)?;
    assert_eq!(target.pc(), 0x1010);
    assert_eq!(second.state(), BreakpointState::Hit);
    Ok(())
}

#[test]
fn wait_without_continue() -> Result<()> {
    let mut target = started(arm_target().with_program([Step::Goto(0x1000)]));
    let mut breakpoint = target.set_breakpoint(0x1000)?;
    let result = target.wait_for_stop(&mut breakpoint, TIMEOUT);
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    Ok(())
}

#[test]
fn stall_times_out() -> Result<()> {
    let mut target = started(arm_target().with_program([Step::Goto(0x1000), Step::Stall]));
    let mut breakpoint = target.set_breakpoint(0x1010)?;
    target.continue_execution()?;
    let result = target.wait_for_stop(&mut breakpoint, Duration::from_millis(20));
    assert!(matches!(result, Err(Error::Timeout { address: 0x1010, .. })));
    assert_eq!(breakpoint.state(), BreakpointState::Armed);
    Ok(())
}

#[test]
fn disconnect_is_target_lost() -> Result<()> {
    let mut target = started(arm_target().with_program([Step::Disconnect]));
    let mut breakpoint = target.set_breakpoint(0x1010)?;
    target.continue_execution()?;
    let result = target.wait_for_stop(&mut breakpoint, TIMEOUT);
    assert!(result.is_err_and(|err| err.is_target_lost()));
    assert_eq!(target.state(), SimState::Lost);

    // Teardown still succeeds on a lost target
    target.stop()?;
    assert!(target.is_stopped());
    Ok(())
}

#[test]
fn breakpoint_outside_mapped_memory() {
    let mut target = started(arm_target());
    let result = target.set_breakpoint(0x2000);
    assert!(matches!(
        result,
        Err(Error::InvalidAddress {
            address: 0x2000,
            ..
        })
    ));
}

#[test]
fn local_memory_access() -> Result<()> {
    let mut target = started(arm_target());
    target.write_memory(0x1010, &[1, 2, 3, 4])?;
    assert_eq!(target.read_memory(0x1010, 4)?, vec![1, 2, 3, 4]);

    let result = target.read_memory(0x10fe, 4);
    assert!(matches!(result, Err(Error::InaccessibleMemory { .. })));
    Ok(())
}

#[test]
fn unknown_register_access() {
    let mut target = started(arm_target());
    assert!(matches!(
        target.read_register("rax"),
        Err(Error::UnknownRegister(_))
    ));
    assert!(matches!(
        target.write_register("rax", 0),
        Err(Error::UnknownRegister(_))
    ));
}

#[test]
fn bus_access_and_faults() -> Result<()> {
    let bus = WindowBus::default();
    let stores = Arc::clone(&bus.stores);
    let mut target = started(
        arm_target()
            .with_bus(bus)
            .with_program([
                Step::Load {
                    register: "r0".to_string(),
                    address: 0xe000_0000,
                    length: 4,
                },
                Step::Store {
                    register: "r0".to_string(),
                    address: 0xe000_0004,
                    length: 4,
                },
                // Unmapped locally and rejected by the bus
                Step::Load {
                    register: "r1".to_string(),
                    address: 0xf000_0000,
                    length: 4,
                },
                Step::Fetch {
                    address: 0xf000_0000,
                },
                Step::Goto(0x1000),
            ]),
    );

    let mut breakpoint = target.set_breakpoint(0x1000)?;
    target.continue_execution()?;
    target.wait_for_stop(&mut breakpoint, TIMEOUT)?;

    assert_eq!(target.read_register("r0")?, 0xcafe);
    assert_eq!(target.read_register("r1")?, 0);
    assert_eq!(*stores.lock().unwrap(), vec![(0xe000_0004, 0xcafe)]);

    let kinds: Vec<_> = target.aborts().iter().map(|abort| abort.kind).collect();
    assert_eq!(kinds, vec![AbortKind::Data, AbortKind::Prefetch]);
    Ok(())
}

#[test]
fn lost_bus_is_target_lost() -> Result<()> {
    let bus = WindowBus {
        lost: true,
        ..Default::default()
    };
    let mut target = started(arm_target().with_bus(bus).with_program([
        Step::Load {
            register: "r0".to_string(),
            address: 0xe000_0000,
            length: 4,
        },
        Step::Goto(0x1000),
    ]));

    let mut breakpoint = target.set_breakpoint(0x1000)?;
    target.continue_execution()?;
    let result = target.wait_for_stop(&mut breakpoint, TIMEOUT);
    assert!(result.is_err_and(|err| err.is_target_lost()));
    Ok(())
}

#[test]
fn stop_is_idempotent() -> Result<()> {
    // Never started
    let mut target = arm_target();
    target.stop()?;
    target.stop()?;
    assert!(target.is_stopped());
    assert!(target.start().is_err());
    Ok(())
}

proptest! {
    #[test]
    fn register_round_trip(values in proptest::collection::vec(any::<u64>(), 17)) {
        let set = RegisterSet::arm();
        let mut target = started(arm_target());

        for (name, &value) in set.names().zip(values.iter()) {
            target.write_register(name, value).unwrap();
        }

        let read: Vec<u64> = set
            .names()
            .map(|name| target.read_register(name).unwrap())
            .collect();
        prop_assert_eq!(read, values);
    }
}
