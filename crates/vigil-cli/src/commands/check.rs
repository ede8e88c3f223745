//! Check command - Validate a program and verify call/return balance.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use vigil::prelude::*;
use vigil_core::TracerConfig;
use vigil_observe::DiagnosticLevel;

use crate::program::Program;
use crate::OutputFormat;

/// Arguments for the check command.
#[derive(Args)]
pub struct CheckArgs {
    /// Path to the program (TOML)
    #[arg(required = true)]
    pub program: PathBuf,

    /// Treat an uncaught exception as a failure
    #[arg(long)]
    pub strict: bool,
}

/// Check result.
#[derive(Debug, Serialize)]
struct CheckResult {
    valid: bool,
    path: String,
    checked: u64,
    max_depth: usize,
    notes: Vec<String>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

/// Execute the check command.
pub fn execute(args: CheckArgs, config: TracerConfig, format: OutputFormat) -> Result<()> {
    let program = Program::load(&args.program)?;
    let runtime = Vigil::builder()
        .with_config(config)
        .build()
        .context("Failed to create runtime")?;

    let mut result = CheckResult {
        valid: true,
        path: args.program.display().to_string(),
        checked: 0,
        max_depth: 0,
        notes: Vec::new(),
        warnings: Vec::new(),
        errors: program.problems(),
    };

    // Only run programs that resolve
    if result.errors.is_empty() {
        match program.record(&runtime, CallBalance::events(), 0) {
            Ok(report) => {
                if let Some(balance) = &report.balance {
                    result.checked = balance.checked;
                    result.max_depth = balance.max_depth;
                }
                for diagnostic in report.diagnostics {
                    match diagnostic.level {
                        DiagnosticLevel::Error => result.errors.push(diagnostic.message),
                        DiagnosticLevel::Warning if args.strict => {
                            result.errors.push(diagnostic.message)
                        }
                        DiagnosticLevel::Warning => result.warnings.push(diagnostic.message),
                        DiagnosticLevel::Info => result.notes.push(diagnostic.message),
                    }
                }
            }
            Err(e) => result.errors.push(e.to_string()),
        }
    }
    result.valid = result.errors.is_empty();

    match format {
        OutputFormat::Human => {
            if result.valid {
                println!("Program is balanced: {}", result.path);
                println!("  Records checked: {}", result.checked);
                println!("  Max depth: {}", result.max_depth);
                for note in &result.notes {
                    println!("  {note}");
                }

                if !result.warnings.is_empty() {
                    println!("\nWarnings:");
                    for warning in &result.warnings {
                        println!("  - {warning}");
                    }
                }
            } else {
                println!("Program FAILED checks: {}", result.path);
                for error in &result.errors {
                    println!("  Error: {error}");
                }
            }
        }
        OutputFormat::Json | OutputFormat::JsonCompact => {
            println!("{}", format.json(&result)?);
        }
    }

    if result.valid {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Check failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(strict: bool) -> CheckArgs {
        CheckArgs {
            program: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("programs/greeter.toml"),
            strict,
        }
    }

    #[test]
    fn test_sample_report_notes_balance() {
        let program = Program::load(&args(false).program).unwrap();
        let runtime = Vigil::with_defaults().unwrap();
        let report = program.record(&runtime, CallBalance::events(), 0).unwrap();

        let notes: Vec<&str> = report
            .diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Info)
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].starts_with("Checked "));
    }

    #[test]
    fn test_check_sample() {
        execute(args(false), TracerConfig::default(), OutputFormat::JsonCompact).unwrap();
        execute(args(true), TracerConfig::default(), OutputFormat::JsonCompact).unwrap();
    }
}
