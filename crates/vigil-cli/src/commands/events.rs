//! Events command - List event kinds and their attributes.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use vigil_core::{Attribute, Availability, EventKind, EventSet};

use crate::OutputFormat;

/// Arguments for the events command.
#[derive(Args)]
pub struct EventsArgs {
    /// Only these events, comma separated
    #[arg(value_delimiter = ',')]
    pub only: Vec<String>,

    /// Show which attributes each event defines
    #[arg(long, short)]
    pub attributes: bool,
}

/// One event kind as listed.
#[derive(Debug, Serialize)]
struct EventInfo {
    name: &'static str,
    legacy_name: &'static str,
    targetable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    defined: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    absent: Option<Vec<&'static str>>,
}

impl EventInfo {
    fn new(kind: EventKind, attributes: bool) -> Self {
        let with = |availability: Availability| {
            attributes.then(|| {
                Attribute::ALL
                    .into_iter()
                    .filter(|a| kind.availability(*a) == availability)
                    .map(Attribute::name)
                    .collect()
            })
        };
        Self {
            name: kind.name(),
            legacy_name: kind.legacy_name(),
            targetable: EventSet::TARGETABLE.contains(kind),
            defined: with(Availability::Defined),
            absent: with(Availability::Absent),
        }
    }
}

/// Execute the events command.
pub fn execute(args: EventsArgs, format: OutputFormat) -> Result<()> {
    let selected = if args.only.is_empty() {
        EventSet::ALL
    } else {
        EventSet::parse(&args.only)?
    };
    let events: Vec<EventInfo> = selected
        .iter()
        .map(|kind| EventInfo::new(kind, args.attributes))
        .collect();

    match format {
        OutputFormat::Human => {
            println!("{:<16} {:<16} TARGETABLE", "EVENT", "LEGACY");
            for event in &events {
                println!(
                    "{:<16} {:<16} {}",
                    event.name,
                    event.legacy_name,
                    if event.targetable { "yes" } else { "no" }
                );
                if let Some(defined) = &event.defined {
                    println!("    defined: {}", defined.join(", "));
                }
                if let Some(absent) = event.absent.as_ref().filter(|a| !a.is_empty()) {
                    println!("    absent:  {}", absent.join(", "));
                }
            }
        }
        OutputFormat::Json | OutputFormat::JsonCompact => {
            println!("{}", format.json(&events)?);
        }
    }

    Ok(())
}
