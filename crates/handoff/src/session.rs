use std::fmt;
use std::time::{Duration, Instant};

use debuggable::{Debuggable, RegisterSet, RegisterSnapshot};
use memfwd::{ChannelReport, ForwardingChannel};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::probe::{NoProbe, ProbeControl};
use crate::symbols::{resolve_with_fallback, Resolved, Symbols};
use crate::transfer::{self, StackPointerFixup};

/// Step of a session, named in diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Symbol resolution and collaborator setup, before any target is touched.
    Resolve,
    Reset,
    Handoff,
    StateTransfer,
    DestinationRun,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolve => "resolve",
            Phase::Reset => "reset",
            Phase::Handoff => "handoff",
            Phase::StateTransfer => "state-transfer",
            Phase::DestinationRun => "destination-run",
        };

        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    SourceRunning,
    Handoff,
    DestinationRunning,
    Terminated,
    Aborted,
}

fn after_handoff(elapsed: &Option<Duration>) -> String {
    match elapsed {
        Some(elapsed) => format!(" {elapsed:.3?} after handoff"),
        None => String::new(),
    }
}

/// Fatal session failure.
#[derive(thiserror::Error, Debug)]
#[error("{phase} phase failed{}: {error}", after_handoff(.elapsed))]
pub struct SessionError {
    pub phase: Phase,

    /// Time since the source reached the handoff point, if it did.
    pub elapsed: Option<Duration>,

    #[source]
    pub error: Error,
}

impl SessionError {
    pub fn new(phase: Phase, error: impl Into<Error>) -> Self {
        Self {
            phase,
            elapsed: None,
            error: error.into(),
        }
    }

    pub fn is_target_lost(&self) -> bool {
        self.error.is_target_lost()
    }

    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }
}

type PhaseResult<T> = std::result::Result<T, (Phase, Error)>;

trait During<T> {
    fn during(self, phase: Phase) -> PhaseResult<T>;
}

impl<T, E: Into<Error>> During<T> for std::result::Result<T, E> {
    fn during(self, phase: Phase) -> PhaseResult<T> {
        self.map_err(|err| (phase, err.into()))
    }
}

/// Everything a session needs that does not depend on a live target.
#[derive(Clone, Debug)]
pub struct SessionPlan {
    pub registers: RegisterSet,
    pub handoff: Resolved,
    pub termination: Resolved,

    /// `None` keeps the transferred stack pointer.
    pub stack_pointer: Option<StackPointerFixup>,

    pub handoff_timeout: Duration,
    pub destination_timeout: Duration,
}

impl SessionPlan {
    /// Resolve the handoff and termination points of `config` against `symbols`.
    pub fn resolve(config: &SessionConfig, symbols: &(impl Symbols + ?Sized)) -> Result<Self> {
        let handoff = resolve_with_fallback(symbols, &config.handoff_symbol, &[])?;
        let termination = resolve_with_fallback(
            symbols,
            &config.termination_symbol,
            &config.termination_fallbacks,
        )?;

        info!(
            handoff = %handoff.name,
            handoff_address = %format_args!("{:#x}", handoff.address),
            termination = %termination.name,
            termination_address = %format_args!("{:#x}", termination.address),
            "resolved breakpoints"
        );

        Ok(Self {
            registers: config.register_set()?,
            handoff,
            termination,
            stack_pointer: config
                .stack_pointer
                .map(|value| StackPointerFixup::new(config.stack_pointer_register.clone(), value)),
            handoff_timeout: config.handoff_timeout(),
            destination_timeout: config.destination_timeout(),
        })
    }
}

/// Outcome of a session that reached its termination point.
#[derive(Clone, Debug)]
pub struct Report {
    pub handoff: Resolved,
    pub termination: Resolved,

    /// Source registers at the handoff point.
    pub handoff_registers: RegisterSnapshot,

    /// Destination registers right before it was continued.
    pub ready_registers: RegisterSnapshot,

    /// Transferred and overriding stack pointer values, when the override is enabled.
    pub stack_pointer: Option<(u64, u64)>,

    /// Wall-clock time from continuing the destination to reaching the termination point.
    pub elapsed: Duration,

    pub forwarding: Option<ChannelReport>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "handoff at {} ({:#x}), terminated at {} ({:#x})",
            self.handoff.name, self.handoff.address, self.termination.name, self.termination.address
        )?;
        writeln!(f, "elapsed: {:.6}s", self.elapsed.as_secs_f64())?;

        if let Some((transferred, value)) = self.stack_pointer {
            writeln!(f, "stack pointer: {transferred:#x} -> {value:#x}")?;
        }

        writeln!(f, "\nregisters at handoff:")?;
        write!(f, "{}", self.handoff_registers)?;
        writeln!(f, "\nregisters at destination ready:")?;
        write!(f, "{}", self.ready_registers)?;

        if let Some(forwarding) = &self.forwarding {
            writeln!(f, "\nforwarding ({} rejected):", forwarding.rejected)?;
            for (name, stats) in &forwarding.ranges {
                writeln!(
                    f,
                    "  {name}: served {}, faulted {}, cache hits {}, forwarded {}",
                    stats.served, stats.faulted, stats.cache_hits, stats.forwarded
                )?;
            }

            if let Some(reason) = &forwarding.lost {
                writeln!(f, "  provider lost: {reason}")?;
            }
        }

        Ok(())
    }
}

/// A single hybrid run: the source executes to the handoff point, its registers move to the
/// destination, and the destination executes to the termination point.
///
/// Both targets are stopped exactly once, whether the run completes, fails in any phase, or the
/// session is dropped without running.
pub struct Session<S: Debuggable, D: Debuggable> {
    plan: SessionPlan,
    source: S,
    destination: D,
    probe: Box<dyn ProbeControl>,
    channel: Option<ForwardingChannel>,
    state: SessionState,
    teardowns: usize,
}

impl<S: Debuggable, D: Debuggable> Session<S, D> {
    pub fn new(plan: SessionPlan, source: S, destination: D) -> Self {
        Self {
            plan,
            source,
            destination,
            probe: Box::new(NoProbe),
            channel: None,
            state: SessionState::Created,
            teardowns: 0,
        }
    }

    pub fn with_probe(mut self, probe: impl ProbeControl + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Attach the forwarding channel serving the destination. It is shut down with the session.
    pub fn with_channel(mut self, channel: ForwardingChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of times the teardown sequence ran. At most one.
    pub fn teardown_count(&self) -> usize {
        self.teardowns
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    /// Run the session to completion. Both targets are stopped before this returns.
    pub fn run(&mut self) -> std::result::Result<Report, SessionError> {
        if self.state != SessionState::Created {
            return Err(SessionError::new(Phase::Reset, Error::AlreadyRun));
        }

        let mut handoff_at = None;
        let result = self.execute(&mut handoff_at);
        let forwarding = self.teardown();

        match result {
            Ok(mut report) => {
                self.state = SessionState::Terminated;
                report.forwarding = forwarding;
                info!(elapsed = ?report.elapsed, "session terminated");
                Ok(report)
            }
            Err((phase, err)) => {
                self.state = SessionState::Aborted;
                let err = SessionError {
                    phase,
                    elapsed: handoff_at.map(|at: Instant| at.elapsed()),
                    error: err,
                };

                error!("session aborted: {err}");
                Err(err)
            }
        }
    }

    fn execute(&mut self, handoff_at: &mut Option<Instant>) -> PhaseResult<Report> {
        info!(phase = %Phase::Reset, "resetting source");
        self.probe.reset_halt().during(Phase::Reset)?;
        self.source.start().during(Phase::Reset)?;
        self.destination.start().during(Phase::Reset)?;

        info!(
            phase = %Phase::Handoff,
            source = self.source.name(),
            symbol = %self.plan.handoff.name,
            address = %format_args!("{:#x}", self.plan.handoff.address),
            "running source to handoff point"
        );
        let mut breakpoint = self
            .source
            .set_breakpoint(self.plan.handoff.address)
            .during(Phase::Handoff)?;
        self.source.continue_execution().during(Phase::Handoff)?;
        self.state = SessionState::SourceRunning;
        self.source
            .wait_for_stop(&mut breakpoint, self.plan.handoff_timeout)
            .during(Phase::Handoff)?;
        *handoff_at = Some(Instant::now());
        self.state = SessionState::Handoff;
        self.source
            .clear_breakpoint(&mut breakpoint)
            .during(Phase::Handoff)?;

        info!(
            phase = %Phase::StateTransfer,
            registers = self.plan.registers.len(),
            "transferring registers"
        );
        let handoff_registers = transfer::snapshot(&mut self.source, &self.plan.registers)
            .during(Phase::StateTransfer)?;
        transfer::restore(&mut self.destination, &self.plan.registers, &handoff_registers)
            .during(Phase::StateTransfer)?;

        let stack_pointer = match &self.plan.stack_pointer {
            Some(fixup) => Some(fixup.apply(&mut self.destination).during(Phase::StateTransfer)?),
            None => {
                info!("stack pointer override disabled, keeping transferred value");
                None
            }
        };

        let ready_registers = transfer::snapshot(&mut self.destination, &self.plan.registers)
            .during(Phase::StateTransfer)?;

        info!(
            phase = %Phase::DestinationRun,
            destination = self.destination.name(),
            symbol = %self.plan.termination.name,
            address = %format_args!("{:#x}", self.plan.termination.address),
            "running destination to termination point"
        );
        let mut termination = self
            .destination
            .set_breakpoint(self.plan.termination.address)
            .during(Phase::DestinationRun)?;
        let started = Instant::now();
        self.destination
            .continue_execution()
            .during(Phase::DestinationRun)?;
        self.state = SessionState::DestinationRunning;
        let stopped = self
            .destination
            .wait_for_stop(&mut termination, self.plan.destination_timeout);
        let elapsed = started.elapsed();

        // A lost provider explains whatever the destination reported
        if let Some(channel) = &self.channel {
            channel.health().during(Phase::DestinationRun)?;
        }

        stopped.during(Phase::DestinationRun)?;
        self.destination
            .clear_breakpoint(&mut termination)
            .during(Phase::DestinationRun)?;

        Ok(Report {
            handoff: self.plan.handoff.clone(),
            termination: self.plan.termination.clone(),
            handoff_registers,
            ready_registers,
            stack_pointer,
            elapsed,
            forwarding: None,
        })
    }

    /// Stop the destination, the forwarding channel and the source, in that order. Runs once.
    fn teardown(&mut self) -> Option<ChannelReport> {
        if self.teardowns > 0 {
            return None;
        }

        self.teardowns += 1;
        debug!("tearing down session");

        if let Err(err) = self.destination.stop() {
            warn!(target = self.destination.name(), "failed to stop destination: {err}");
        }

        let forwarding = self.channel.as_mut().map(ForwardingChannel::shutdown);

        if let Err(err) = self.source.stop() {
            warn!(target = self.source.name(), "failed to stop source: {err}");
        }

        forwarding
    }
}

impl<S: Debuggable, D: Debuggable> Drop for Session<S, D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
