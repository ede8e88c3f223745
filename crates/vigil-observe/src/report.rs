//! Trace run reports.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vigil_core::{Exception, Value};
use vigil_hook::TraceStats;

use crate::balance::BalanceReport;
use crate::record::TraceRecord;

/// Unique identifier for a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportId(Uuid);

impl ReportId {
    /// Create a new random report ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the traced program ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The program finished with a value.
    Completed {
        /// Final value, rendered.
        value: String,
    },
    /// An exception escaped the program.
    Raised {
        /// Exception class.
        class: String,
        /// Exception message.
        message: String,
    },
}

impl RunOutcome {
    /// Build from a settled program result.
    pub fn from_result(result: &Result<Value, Exception>) -> Self {
        match result {
            Ok(value) => RunOutcome::Completed {
                value: value.to_string(),
            },
            Err(exception) => RunOutcome::Raised {
                class: exception.class.to_string(),
                message: exception.message.clone(),
            },
        }
    }

    /// Whether the program completed.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

/// A diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity level.
    pub level: DiagnosticLevel,
    /// Message.
    pub message: String,
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

/// Everything known about one traced run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    /// Unique report ID.
    pub report_id: ReportId,
    /// Program name, if known.
    pub program: Option<String>,
    /// How the program ended.
    pub outcome: RunOutcome,
    /// Tracer counters at the end of the run.
    pub stats: TraceStats,
    /// Captured records.
    pub records: Vec<TraceRecord>,
    /// Records that did not fit in the recorder.
    pub dropped_records: u64,
    /// Call/return balance, when checked.
    pub balance: Option<BalanceReport>,
    /// Diagnostic messages.
    pub diagnostics: Vec<Diagnostic>,
}

impl TraceReport {
    /// Create a report with no records.
    pub fn new(program: Option<String>, outcome: RunOutcome, stats: TraceStats) -> Self {
        Self {
            report_id: ReportId::new(),
            program,
            outcome,
            stats,
            records: Vec::new(),
            dropped_records: 0,
            balance: None,
            diagnostics: Vec::new(),
        }
    }

    /// Attach captured records.
    pub fn with_records(mut self, records: Vec<TraceRecord>, dropped: u64) -> Self {
        self.records = records;
        self.dropped_records = dropped;
        self
    }

    /// Attach a balance check. Violations become error diagnostics.
    pub fn with_balance(mut self, balance: BalanceReport) -> Self {
        for violation in &balance.violations {
            self.add_error(format!("Unbalanced trace: {violation}"));
        }
        self.balance = Some(balance);
        self
    }

    /// Add an info diagnostic.
    pub fn add_info(&mut self, message: impl Into<String>) {
        self.push(DiagnosticLevel::Info, message.into());
    }

    /// Add a warning diagnostic.
    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.push(DiagnosticLevel::Warning, message.into());
    }

    /// Add an error diagnostic.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.push(DiagnosticLevel::Error, message.into());
    }

    fn push(&mut self, level: DiagnosticLevel, message: String) {
        self.diagnostics.push(Diagnostic { level, message });
    }

    /// Whether the program completed and the trace is balanced.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
            && self.balance.as_ref().is_none_or(BalanceReport::is_balanced)
    }

    /// Format as human-readable text.
    pub fn to_text(&self) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "Trace Report: {}", self.report_id);
        if let Some(program) = &self.program {
            let _ = writeln!(output, "Program: {program}");
        }
        output.push('\n');

        match &self.outcome {
            RunOutcome::Completed { value } => {
                let _ = writeln!(output, "Outcome: Completed => {value}");
            }
            RunOutcome::Raised { class, message } => {
                let _ = writeln!(output, "Outcome: Raised {class}: {message}");
            }
        }

        if !self.records.is_empty() {
            output.push_str("\nEvents:\n");
            for record in &self.records {
                let _ = writeln!(output, "  {record}");
            }
            if self.dropped_records > 0 {
                let _ = writeln!(output, "  ... {} more not recorded", self.dropped_records);
            }
        }

        output.push_str("\nStatistics:\n");
        let _ = writeln!(output, "  Sessions Created: {}", self.stats.sessions_created);
        let _ = writeln!(output, "  Callbacks: {}", self.stats.callbacks_invoked);
        let _ = writeln!(output, "  Callback Errors: {}", self.stats.callback_errors);
        let _ = writeln!(output, "  Reentry Suppressed: {}", self.stats.reentry_suppressed);
        if self.stats.contention_skipped > 0 {
            let _ = writeln!(output, "  Contention Skipped: {}", self.stats.contention_skipped);
        }
        for (kind, count) in &self.stats.events {
            let _ = writeln!(output, "  {:<16}{count}", format!("{kind}:"));
        }

        if let Some(balance) = &self.balance {
            let verdict = if balance.is_balanced() { "balanced" } else { "UNBALANCED" };
            let _ = writeln!(
                output,
                "\nBalance: {verdict} ({} records, max depth {})",
                balance.checked, balance.max_depth
            );
        }

        if !self.diagnostics.is_empty() {
            output.push_str("\nDiagnostics:\n");
            for diag in &self.diagnostics {
                let level = match diag.level {
                    DiagnosticLevel::Info => "INFO",
                    DiagnosticLevel::Warning => "WARN",
                    DiagnosticLevel::Error => "ERROR",
                };
                let _ = writeln!(output, "  [{level}] {}", diag.message);
            }
        }

        output
    }

    /// Format as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Format as pretty JSON string.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{CallFamily, Violation};
    use vigil_core::{ContextId, EventKind, FiberId};

    #[test]
    fn test_report_ids_differ() {
        assert_ne!(ReportId::new(), ReportId::new());
    }

    #[test]
    fn test_outcome_from_result() {
        let ok = RunOutcome::from_result(&Ok(Value::from(3)));
        assert_eq!(ok, RunOutcome::Completed { value: "3".to_string() });
        assert!(ok.is_success());

        let err = RunOutcome::from_result(&Err(Exception::runtime_error("boom")));
        assert!(!err.is_success());
    }

    #[test]
    fn test_unbalanced_report_fails() {
        let mut stats = TraceStats::default();
        stats.events.insert(EventKind::Call, 1);
        let balance = BalanceReport {
            checked: 1,
            max_depth: 1,
            violations: vec![Violation::Unclosed {
                context: ContextId::next(),
                fiber: FiberId::next(),
                family: CallFamily::Method,
                depth: 1,
            }],
        };
        let report = TraceReport::new(
            Some("demo".to_string()),
            RunOutcome::Completed { value: "nil".to_string() },
            stats,
        )
        .with_balance(balance);

        assert!(!report.is_success());
        assert_eq!(report.diagnostics.len(), 1);
        let text = report.to_text();
        assert!(text.contains("Program: demo"));
        assert!(text.contains("UNBALANCED"));
        assert!(text.contains("call:"));
    }

    #[test]
    fn test_report_json() {
        let report = TraceReport::new(
            None,
            RunOutcome::Raised {
                class: "RuntimeError".to_string(),
                message: "boom".to_string(),
            },
            TraceStats::default(),
        );
        let json = report.to_json();
        assert_eq!(json["outcome"]["status"], "raised");
        assert_eq!(json["outcome"]["class"], "RuntimeError");
        assert!(report.to_json_pretty().contains("\"program\": null"));
    }
}
