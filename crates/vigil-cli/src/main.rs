//! Vigil CLI - Command-line interface for the Vigil tracing engine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use vigil_core::TracerConfig;

mod commands;
mod program;

/// Vigil Execution-Event Tracer
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Tracer configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long, global = true, default_value = "human")]
    pub format: OutputFormat,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Output format options.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    #[default]
    Human,
    /// JSON output
    Json,
    /// Compact JSON (single line)
    JsonCompact,
}

impl OutputFormat {
    /// Render a serializable value in this format's JSON flavour.
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<String> {
        Ok(match self {
            OutputFormat::JsonCompact => serde_json::to_string(value)?,
            _ => serde_json::to_string_pretty(value)?,
        })
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a program and print its trace
    Run(commands::run::RunArgs),
    /// Check a program and verify its calls and returns balance
    Check(commands::check::CheckArgs),
    /// List event kinds and the attributes each one defines
    Events(commands::events::EventsArgs),
}

/// Load the tracer configuration, or the defaults when no file is given.
fn load_config(path: Option<&Path>) -> Result<TracerConfig> {
    let Some(path) = path else {
        return Ok(TracerConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: TracerConfig =
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))?;
    config.validate().context("Invalid tracer configuration")?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vigil={log_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Run(args) => commands::run::execute(args, config, cli.format, cli.quiet),
        Commands::Check(args) => commands::check::execute(args, config, cli.format),
        Commands::Events(args) => commands::events::execute(args, cli.format),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !cli.quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["vigil", "-vv", "-f", "json", "run", "prog.toml", "-e", "call,line"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.format, OutputFormat::Json));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.program, PathBuf::from("prog.toml"));
                assert_eq!(args.events, vec!["call".to_string(), "line".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_default_config_without_file() {
        assert_eq!(load_config(None).unwrap(), TracerConfig::default());
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(Some(Path::new("/nonexistent/vigil.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config"));
    }

    #[test]
    fn test_config_toml() {
        let config: TracerConfig =
            toml::from_str("collect_stats = false\nmax_dispatch_depth = 8\n").unwrap();
        assert!(!config.collect_stats);
        assert_eq!(config.max_dispatch_depth, 8);
        assert_eq!(config.default_events, TracerConfig::default().default_events);
    }
}
