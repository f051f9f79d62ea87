use std::sync::Arc;
use std::time::Duration;

use debuggable::SharedTarget;
use gdb_target::{GdbTarget, RegisterMap, ARM_REGISTER_NUMBERS};
use memfwd::{ForwardingChannel, Forwarder, Providers, RamProvider, TargetProvider};
use tracing::info;

use crate::config::{EndpointConfig, SessionConfig, RAM_PROVIDER, SOURCE_PROVIDER};
use crate::error::{Error, Result};
use crate::probe::TelnetProbe;
use crate::session::{Phase, Report, Session, SessionError, SessionPlan};
use crate::symbols::ElfSymbols;

/// Build the gdb remote target for an endpoint, checking that every transferred register has a
/// remote number.
fn gdb_target(name: &str, endpoint: &EndpointConfig, plan: &SessionPlan) -> Result<GdbTarget> {
    let registers = match &endpoint.register_numbers {
        Some(numbers) => RegisterMap::new(numbers.clone(), endpoint.register_width),
        None => RegisterMap::new(ARM_REGISTER_NUMBERS, endpoint.register_width),
    };

    if let Some(missing) = plan
        .registers
        .names()
        .find(|register| registers.number(register).is_none())
    {
        return Err(Error::Config(format!(
            "{name} endpoint has no register number for `{missing}`"
        )));
    }

    Ok(GdbTarget::new(name, endpoint.address.clone())
        .with_registers(registers)
        .with_breakpoint_kind(endpoint.breakpoint_kind))
}

fn forwarding_channel(
    config: &SessionConfig,
    source: &SharedTarget<GdbTarget>,
) -> Result<Option<ForwardingChannel>> {
    let ranges = config.range_map()?;
    if ranges.is_empty() {
        info!("no forwarded ranges configured");
        return Ok(None);
    }

    let mut providers = Providers::new();
    providers.insert(SOURCE_PROVIDER, Arc::new(TargetProvider::new(source.clone())));
    providers.insert(RAM_PROVIDER, Arc::new(RamProvider::new()));

    let forwarder = Forwarder::new(ranges, &providers)?;
    let channel = ForwardingChannel::bind(&config.forwarding.listen_address, forwarder)?;
    Ok(Some(channel))
}

/// Run a complete session described by `config`: resolve the breakpoints from the binary image,
/// connect to the source and destination gdb endpoints, serve the forwarded ranges and run the
/// state transfer.
pub fn run(config: &SessionConfig) -> std::result::Result<Report, SessionError> {
    let resolve = |err: Error| SessionError::new(Phase::Resolve, err);

    if !config.binary.exists() {
        return Err(resolve(Error::BinaryNotFound(config.binary.clone())));
    }

    let symbols = ElfSymbols::open(&config.binary).map_err(resolve)?;
    let plan = SessionPlan::resolve(config, &symbols).map_err(resolve)?;

    let source = SharedTarget::new(gdb_target("source", &config.source, &plan).map_err(resolve)?);
    let destination = gdb_target("destination", &config.destination, &plan).map_err(resolve)?;
    let channel = forwarding_channel(config, &source).map_err(resolve)?;

    let mut session = Session::new(plan, source, destination);
    if let Some(channel) = channel {
        info!(
            address = %channel.local_addr(),
            ranges = channel.ranges().len(),
            "forwarding channel listening"
        );
        session = session.with_channel(channel);
    }

    if let Some(probe) = &config.probe {
        session = session.with_probe(TelnetProbe::new(
            probe.address.clone(),
            probe.reset_command.clone(),
            Duration::from_millis(probe.timeout_ms),
        ));
    }

    session.run()
}
