//! handoff - run firmware on a physical target up to a handoff point, then continue it in an
//! emulator.
//!
//! Usage:
//!   handoff <config.json>          Run a session
//!   handoff <config.json> --check  Validate the configuration and resolve symbols only

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use handoff::config::SessionConfig;
use handoff::{ElfSymbols, SessionPlan};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "handoff")]
#[command(
    about = "Hybrid firmware execution across a debug probe and an emulator",
    long_about = None
)]
struct Cli {
    /// Session configuration file
    config: PathBuf,

    /// Resolve breakpoints and print the plan without contacting any target
    #[arg(long)]
    check: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn initialize_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn check(config: &SessionConfig) -> handoff::Result<()> {
    let symbols = ElfSymbols::open(&config.binary)?;
    let plan = SessionPlan::resolve(config, &symbols)?;

    println!(
        "handoff:     {} at {:#x}",
        plan.handoff.name, plan.handoff.address
    );
    println!(
        "termination: {} at {:#x}{}",
        plan.termination.name,
        plan.termination.address,
        if plan.termination.substituted() {
            format!(" (substituted for {})", plan.termination.requested)
        } else {
            String::new()
        }
    );

    match &plan.stack_pointer {
        Some(fixup) => println!("stack pointer: {} = {:#x}", fixup.register, fixup.value),
        None => println!("stack pointer: transferred unchanged"),
    }

    println!("registers:   {}", plan.registers.names().collect::<Vec<_>>().join(" "));
    for range in config.range_map()?.iter() {
        println!("forwarding:  {range}");
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    initialize_logging(cli.verbose);

    let config = match SessionConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load {}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        return match check(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err}");
                ExitCode::FAILURE
            }
        };
    }

    match handoff::orchestrator::run(&config) {
        Ok(report) => {
            print!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
