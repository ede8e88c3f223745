//! Call/return balance checking.
//!
//! Per thread and fiber, `call`/`return` must nest like parentheses, and so
//! must `b_call`/`b_return` and `c_call`/`c_return`, each family on its own.
//! [`CallBalance`] follows a record stream and reports every place where
//! that breaks.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use vigil_core::{ContextId, EventKind, EventSet, FiberId, Symbol};

use crate::observer::TraceObserver;
use crate::record::TraceRecord;

/// One of the three independently nested event families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFamily {
    /// `call` / `return`.
    Method,
    /// `b_call` / `b_return`.
    Block,
    /// `c_call` / `c_return`.
    Native,
}

impl CallFamily {
    /// Family of a call- or return-kind event.
    pub fn of(event: EventKind) -> Option<Self> {
        match event {
            EventKind::Call | EventKind::Return => Some(CallFamily::Method),
            EventKind::BCall | EventKind::BReturn => Some(CallFamily::Block),
            EventKind::CCall | EventKind::CReturn => Some(CallFamily::Native),
            _ => None,
        }
    }
}

/// A broken nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Violation {
    /// A return with no open call.
    Unmatched {
        /// The offending record.
        record: TraceRecord,
    },
    /// A return closing a call of a different method.
    Mismatched {
        /// Method of the open call.
        expected: Option<Symbol>,
        /// The offending record.
        record: TraceRecord,
    },
    /// Calls still open when the check finished.
    Unclosed {
        /// Thread.
        context: ContextId,
        /// Fiber.
        fiber: FiberId,
        /// Family left open.
        family: CallFamily,
        /// Open calls.
        depth: usize,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Unmatched { record } => write!(f, "unmatched {record}"),
            Violation::Mismatched { expected, record } => match expected {
                Some(expected) => write!(f, "expected return from {expected}, got {record}"),
                None => write!(f, "expected anonymous return, got {record}"),
            },
            Violation::Unclosed {
                context,
                fiber,
                family,
                depth,
            } => write!(f, "{depth} open {family:?} call(s) on {context}/{fiber}"),
        }
    }
}

/// Outcome of a balance check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    /// Records checked.
    pub checked: u64,
    /// Deepest nesting seen in any family.
    pub max_depth: usize,
    /// Everything that did not nest.
    pub violations: Vec<Violation>,
}

impl BalanceReport {
    /// Whether every call was closed in order.
    pub fn is_balanced(&self) -> bool {
        self.violations.is_empty()
    }
}

type StackKey = (ContextId, FiberId, CallFamily);

#[derive(Default)]
struct BalanceState {
    stacks: BTreeMap<StackKey, Vec<Option<Symbol>>>,
    checked: u64,
    max_depth: usize,
    violations: Vec<Violation>,
}

/// Follows call and return records and checks their nesting.
#[derive(Default)]
pub struct CallBalance {
    state: Mutex<BalanceState>,
}

impl CallBalance {
    /// Create an empty checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Event kinds the checker needs.
    pub fn events() -> EventSet {
        EventSet::A_CALL | EventSet::A_RETURN
    }

    /// Feed one record. Other kinds are ignored.
    pub fn observe(&self, record: &TraceRecord) {
        let Some(family) = CallFamily::of(record.event) else {
            return;
        };
        let mut state = self.state.lock();
        state.checked += 1;
        let key = (record.context, record.fiber, family);

        if record.event.is_call() {
            let stack = state.stacks.entry(key).or_default();
            stack.push(record.method_id.clone());
            let depth = stack.len();
            state.max_depth = state.max_depth.max(depth);
            return;
        }

        let opened = state.stacks.get_mut(&key).and_then(Vec::pop);
        match opened {
            None => state.violations.push(Violation::Unmatched {
                record: record.clone(),
            }),
            Some(expected) if expected != record.method_id => {
                state.violations.push(Violation::Mismatched {
                    expected,
                    record: record.clone(),
                });
            }
            Some(_) => {}
        }
    }

    /// Current open depth for one thread, fiber and family.
    pub fn depth(&self, context: ContextId, fiber: FiberId, family: CallFamily) -> usize {
        self.state
            .lock()
            .stacks
            .get(&(context, fiber, family))
            .map_or(0, Vec::len)
    }

    /// Report violations so far, counting calls still open as unclosed.
    pub fn report(&self) -> BalanceReport {
        let state = self.state.lock();
        let mut violations = state.violations.clone();
        for (&(context, fiber, family), stack) in &state.stacks {
            if !stack.is_empty() {
                violations.push(Violation::Unclosed {
                    context,
                    fiber,
                    family,
                    depth: stack.len(),
                });
            }
        }
        BalanceReport {
            checked: state.checked,
            max_depth: state.max_depth,
            violations,
        }
    }
}

impl TraceObserver for CallBalance {
    fn on_record(&self, record: &TraceRecord) {
        self.observe(record);
    }

    fn event_filter(&self) -> Option<EventSet> {
        Some(Self::events())
    }
}

impl fmt::Debug for CallBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallBalance")
            .field("checked", &state.checked)
            .field("open", &state.stacks.values().map(Vec::len).sum::<usize>())
            .field("violations", &state.violations.len())
            .finish()
    }
}
