#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point for the leak probe tool.
//!
//! Probes one TOML serialization of a small table for allocations that outlive the call. The
//! serializer is first called with a table holding an integer and with one holding an array,
//! which initializes anything it creates on first use. Each leaked group is printed on its own
//! line, prefixed with `1`.
//!
//! This module is excluded from mutation testing because testing process entry/exit behavior
//! is impractical - it requires spawning subprocesses and checking exit codes.

use std::num::NonZero;
use std::process::ExitCode;

use argh::FromArgs;
use leak_probe::{Allocator, DEFAULT_FRAME_DEPTH, Exclusion, GroupBy, LeakProbe, TrackingScope};
use toml::{Table, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

// Printed before each leaked group.
const LEAK_MARKER: &str = "1";

/// Probes a TOML serialization call for allocations that outlive it.
#[derive(FromArgs)]
struct Args {
    /// number of stack frames retained per allocation (default 10)
    #[argh(option, default = "DEFAULT_FRAME_DEPTH")]
    frame_depth: NonZero<usize>,

    /// how allocations are grouped: line, file or traceback (default line)
    #[argh(option, default = "GroupBy::Line")]
    group_by: GroupBy,

    /// additional exclusion: crate:NAME, path:PATH, segments:PATH or text:SUBSTRING
    #[argh(option)]
    exclude: Vec<Exclusion>,

    /// only record allocations made by the probing thread
    #[argh(switch)]
    thread_only: bool,

    /// also report growth that originates in the Rust standard library
    #[argh(switch)]
    no_default_exclusions: bool,
}

fn table(value: Value) -> Table {
    let mut table = Table::new();
    table.insert("value".to_owned(), value);
    table
}

fn integers(values: &[i64]) -> Value {
    Value::Array(values.iter().copied().map(Value::Integer).collect())
}

fn serialize(value: Table) -> Result<String, toml::ser::Error> {
    toml::to_string(&value)
}

fn probe(args: Args) -> Result<ExitCode, leak_probe::ProbeError<toml::ser::Error>> {
    let mut probe = LeakProbe::new()
        .frame_depth(args.frame_depth)
        .group_by(args.group_by)
        .scope(if args.thread_only {
            TrackingScope::Thread
        } else {
            TrackingScope::Process
        });

    if args.no_default_exclusions {
        probe = probe.exclusions([]);
    }

    for exclusion in args.exclude {
        probe = probe.exclude(exclusion);
    }

    // Built up front so that the inputs exist before tracking starts.
    let warm_up_inputs = [table(Value::Integer(1)), table(integers(&[1]))];
    let trial_input = table(integers(&[1, 1]));

    let leaks = probe.run(serialize, warm_up_inputs, trial_input)?;

    info!(leaks = leaks.len(), "probe finished");

    for leak in &leaks {
        println!("{LEAK_MARKER} {leak}");
    }

    Ok(ExitCode::SUCCESS)
}

// Binary entry point - mutations would require subprocess testing which is impractical.
#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Args = argh::from_env();

    match probe(args) {
        Ok(exit_code) => exit_code,
        Err(e) => {
            error!(error = %e, "leak probe failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
