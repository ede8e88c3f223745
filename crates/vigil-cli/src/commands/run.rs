//! Run command - Execute a program and print its trace.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use vigil::prelude::*;
use vigil_core::TracerConfig;

use crate::program::Program;
use crate::OutputFormat;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Path to the program (TOML)
    #[arg(required = true)]
    pub program: PathBuf,

    /// Events to record, comma separated (default: the program's list)
    #[arg(short, long, value_delimiter = ',')]
    pub events: Vec<String>,

    /// Maximum number of records kept
    #[arg(long, default_value = "10000")]
    pub max_records: usize,

    /// Also log every event as it happens
    #[arg(long)]
    pub log_events: bool,
}

/// Execute the run command.
pub fn execute(args: RunArgs, config: TracerConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    let program = Program::load(&args.program)?;
    let events = if args.events.is_empty() {
        program.events()?
    } else {
        EventSet::parse(&args.events).context("Invalid --events")?
    };

    let mut builder = Vigil::builder().with_config(config);
    if args.log_events {
        builder = builder.with_observer(Arc::new(
            LoggingObserver::new().with_level(tracing::Level::INFO),
        ));
    }
    let runtime = builder.build().context("Failed to create runtime")?;

    if !quiet {
        tracing::info!(
            program = %args.program.display(),
            events = %events,
            "Running program"
        );
    }

    let report = program
        .record(&runtime, events, args.max_records)
        .context("Failed to run program")?;

    match format {
        OutputFormat::Human => {
            if !quiet || !report.is_success() {
                println!("{}", report.to_text());
            }
        }
        OutputFormat::Json | OutputFormat::JsonCompact => {
            println!("{}", format.json(&report)?);
        }
    }

    if report.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Program did not complete cleanly"))
    }
}
