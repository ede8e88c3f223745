//! Observable event kinds and per-event attribute availability.
//!
//! Every instrumentation point in a host engine reports exactly one
//! [`EventKind`]. Sessions subscribe to an [`EventSet`], a compact bitmask
//! that the dispatcher can test without taking any lock.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// A kind of observable execution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new source line is about to execute.
    Line,
    /// Entry into a method defined in the managed language.
    Call,
    /// Exit from a method defined in the managed language.
    Return,
    /// Entry into a natively implemented method.
    CCall,
    /// Exit from a natively implemented method.
    CReturn,
    /// Start of a class or module body.
    Class,
    /// End of a class or module body.
    End,
    /// Entry into a block.
    BCall,
    /// Exit from a block.
    BReturn,
    /// An exception is raised.
    Raise,
    /// An exception is caught by a handler.
    Rescue,
    /// A thread starts running.
    ThreadBegin,
    /// A thread finishes running.
    ThreadEnd,
    /// Control moves from one fiber to another.
    FiberSwitch,
    /// Source text has been compiled into executable code.
    ScriptCompiled,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [EventKind; 15] = [
        EventKind::Line,
        EventKind::Call,
        EventKind::Return,
        EventKind::CCall,
        EventKind::CReturn,
        EventKind::Class,
        EventKind::End,
        EventKind::BCall,
        EventKind::BReturn,
        EventKind::Raise,
        EventKind::Rescue,
        EventKind::ThreadBegin,
        EventKind::ThreadEnd,
        EventKind::FiberSwitch,
        EventKind::ScriptCompiled,
    ];

    /// The canonical snake_case name.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Line => "line",
            EventKind::Call => "call",
            EventKind::Return => "return",
            EventKind::CCall => "c_call",
            EventKind::CReturn => "c_return",
            EventKind::Class => "class",
            EventKind::End => "end",
            EventKind::BCall => "b_call",
            EventKind::BReturn => "b_return",
            EventKind::Raise => "raise",
            EventKind::Rescue => "rescue",
            EventKind::ThreadBegin => "thread_begin",
            EventKind::ThreadEnd => "thread_end",
            EventKind::FiberSwitch => "fiber_switch",
            EventKind::ScriptCompiled => "script_compiled",
        }
    }

    /// The name reported to legacy global trace functions.
    pub fn legacy_name(self) -> &'static str {
        match self {
            EventKind::CCall => "c-call",
            EventKind::CReturn => "c-return",
            EventKind::BCall => "b-call",
            EventKind::BReturn => "b-return",
            EventKind::ThreadBegin => "thread-begin",
            EventKind::ThreadEnd => "thread-end",
            EventKind::FiberSwitch => "fiber-switch",
            EventKind::ScriptCompiled => "script-compiled",
            other => other.name(),
        }
    }

    /// Position of this kind in [`EventKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The bit used for this kind inside an [`EventSet`].
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Whether this kind opens a frame (`call`, `c_call`, `b_call`).
    pub fn is_call(self) -> bool {
        matches!(self, EventKind::Call | EventKind::CCall | EventKind::BCall)
    }

    /// Whether this kind closes a frame (`return`, `c_return`, `b_return`).
    pub fn is_return(self) -> bool {
        matches!(
            self,
            EventKind::Return | EventKind::CReturn | EventKind::BReturn
        )
    }

    /// The closing kind paired with an opening kind.
    pub fn closing(self) -> Option<EventKind> {
        match self {
            EventKind::Call => Some(EventKind::Return),
            EventKind::CCall => Some(EventKind::CReturn),
            EventKind::BCall => Some(EventKind::BReturn),
            EventKind::Class => Some(EventKind::End),
            _ => None,
        }
    }

    /// How `attribute` behaves when read during an event of this kind.
    pub fn availability(self, attribute: Attribute) -> Availability {
        match attribute {
            Attribute::Event
            | Attribute::Lineno
            | Attribute::MethodId
            | Attribute::CalleeId
            | Attribute::DefinedClass
            | Attribute::SelfValue => Availability::Defined,
            Attribute::Path => match self {
                EventKind::ThreadBegin | EventKind::ThreadEnd => Availability::Absent,
                _ => Availability::Defined,
            },
            Attribute::Binding => match self {
                EventKind::CCall
                | EventKind::CReturn
                | EventKind::ThreadBegin
                | EventKind::ThreadEnd
                | EventKind::FiberSwitch
                | EventKind::ScriptCompiled => Availability::Absent,
                _ => Availability::Defined,
            },
            Attribute::ReturnValue if self.is_return() => Availability::Defined,
            Attribute::RaisedException
                if matches!(self, EventKind::Raise | EventKind::Rescue) =>
            {
                Availability::Defined
            }
            Attribute::Parameters if self.is_call() || self.is_return() => Availability::Defined,
            Attribute::CompiledPath | Attribute::EvalScript
                if self == EventKind::ScriptCompiled =>
            {
                Availability::Defined
            }
            _ => Availability::Undefined,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().trim_start_matches(':').replace('-', "_");
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| ConfigurationError::UnknownEvent(s.to_string()))
    }
}

/// A readable attribute of an event frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// The event kind itself.
    Event,
    /// Current line number.
    Lineno,
    /// Current source path.
    Path,
    /// Original name of the executing method.
    MethodId,
    /// Name the executing method was invoked under.
    CalleeId,
    /// Class that owns the executing method.
    DefinedClass,
    /// Receiver of the executing frame.
    SelfValue,
    /// Snapshot-capable handle on local variables.
    Binding,
    /// Value produced by the returning frame.
    ReturnValue,
    /// Exception being raised or rescued.
    RaisedException,
    /// Parameter list of the executing method or block.
    Parameters,
    /// Path of freshly compiled source.
    CompiledPath,
    /// Text of freshly compiled source.
    EvalScript,
}

impl Attribute {
    /// Every attribute, in declaration order.
    pub const ALL: [Attribute; 13] = [
        Attribute::Event,
        Attribute::Lineno,
        Attribute::Path,
        Attribute::MethodId,
        Attribute::CalleeId,
        Attribute::DefinedClass,
        Attribute::SelfValue,
        Attribute::Binding,
        Attribute::ReturnValue,
        Attribute::RaisedException,
        Attribute::Parameters,
        Attribute::CompiledPath,
        Attribute::EvalScript,
    ];

    /// Attribute name as exposed to callbacks.
    pub fn name(self) -> &'static str {
        match self {
            Attribute::Event => "event",
            Attribute::Lineno => "lineno",
            Attribute::Path => "path",
            Attribute::MethodId => "method_id",
            Attribute::CalleeId => "callee_id",
            Attribute::DefinedClass => "defined_class",
            Attribute::SelfValue => "self",
            Attribute::Binding => "binding",
            Attribute::ReturnValue => "return_value",
            Attribute::RaisedException => "raised_exception",
            Attribute::Parameters => "parameters",
            Attribute::CompiledPath => "compiled_path",
            Attribute::EvalScript => "eval_script",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of reading an attribute during a particular event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// The attribute carries a meaningful value.
    Defined,
    /// The attribute is readable but always empty for this event.
    Absent,
    /// Reading the attribute is an error for this event.
    Undefined,
}

/// A set of event kinds stored as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<EventKind>", try_from = "Vec<String>")]
pub struct EventSet(u32);

impl EventSet {
    /// The empty set.
    pub const EMPTY: EventSet = EventSet(0);

    /// Every event kind.
    pub const ALL: EventSet = EventSet((1 << 15) - 1);

    /// `call`, `b_call` and `c_call`.
    pub const A_CALL: EventSet = EventSet(
        (1 << EventKind::Call as u32) | (1 << EventKind::BCall as u32) | (1 << EventKind::CCall as u32),
    );

    /// `return`, `b_return` and `c_return`.
    pub const A_RETURN: EventSet = EventSet(
        (1 << EventKind::Return as u32)
            | (1 << EventKind::BReturn as u32)
            | (1 << EventKind::CReturn as u32),
    );

    /// Events delivered to legacy global trace functions.
    pub const LEGACY: EventSet = EventSet(
        (1 << EventKind::Line as u32)
            | (1 << EventKind::Call as u32)
            | (1 << EventKind::Return as u32)
            | (1 << EventKind::CCall as u32)
            | (1 << EventKind::CReturn as u32)
            | (1 << EventKind::Class as u32)
            | (1 << EventKind::End as u32)
            | (1 << EventKind::Raise as u32),
    );

    /// Events that a code-targeted session can observe.
    pub const TARGETABLE: EventSet = EventSet(
        (1 << EventKind::Line as u32)
            | (1 << EventKind::Class as u32)
            | (1 << EventKind::End as u32)
            | (1 << EventKind::Call as u32)
            | (1 << EventKind::Return as u32)
            | (1 << EventKind::CCall as u32)
            | (1 << EventKind::CReturn as u32)
            | (1 << EventKind::BCall as u32)
            | (1 << EventKind::BReturn as u32)
            | (1 << EventKind::Rescue as u32),
    );

    /// Build a set from the given kinds.
    pub fn of(kinds: &[EventKind]) -> Self {
        kinds.iter().fold(Self::EMPTY, |set, kind| set.with(*kind))
    }

    /// Parse event names, accepting the `a_call` and `a_return` aliases.
    pub fn parse<I, S>(names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::EMPTY;
        for name in names {
            let name = name.as_ref();
            set |= match name.trim().trim_start_matches(':') {
                "a_call" => Self::A_CALL,
                "a_return" => Self::A_RETURN,
                "all" => Self::ALL,
                _ => EventSet::from(name.parse::<EventKind>()?),
            };
        }
        Ok(set)
    }

    /// Raw bitmask.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build a set from a raw bitmask, discarding unknown bits.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Whether `kind` is a member.
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Return a copy of this set with `kind` added.
    pub fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Add `kind` in place.
    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= kind.bit();
    }

    /// Kinds present in both sets.
    pub fn intersection(self, other: EventSet) -> Self {
        Self(self.0 & other.0)
    }

    /// Whether the set has no members.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of members.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate the members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl From<EventKind> for EventSet {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

impl From<&[EventKind]> for EventSet {
    fn from(kinds: &[EventKind]) -> Self {
        Self::of(kinds)
    }
}

impl<const N: usize> From<[EventKind; N]> for EventSet {
    fn from(kinds: [EventKind; N]) -> Self {
        Self::of(&kinds)
    }
}

impl From<EventSet> for Vec<EventKind> {
    fn from(set: EventSet) -> Self {
        set.iter().collect()
    }
}

impl TryFrom<Vec<String>> for EventSet {
    type Error = ConfigurationError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(names)
    }
}

impl FromStr for EventSet {
    type Err = ConfigurationError;

    /// Parse a comma separated list such as `"call,return,line"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.split(',').map(str::trim).filter(|name| !name.is_empty()))
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOr<EventKind> for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventKind) -> EventSet {
        self.with(rhs)
    }
}

impl BitOr for EventKind {
    type Output = EventSet;

    fn bitor(self, rhs: EventKind) -> EventSet {
        EventSet::from(self).with(rhs)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(EventKind::name).collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.name().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!("c-call".parse::<EventKind>().unwrap(), EventKind::CCall);
        assert!("bogus".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_legacy_names() {
        assert_eq!(EventKind::CCall.legacy_name(), "c-call");
        assert_eq!(EventKind::CReturn.legacy_name(), "c-return");
        assert_eq!(EventKind::Line.legacy_name(), "line");
    }

    #[test]
    fn test_aliases_expand() {
        let set = EventSet::parse(["a_call", "line"]).unwrap();
        assert!(set.contains(EventKind::Call));
        assert!(set.contains(EventKind::BCall));
        assert!(set.contains(EventKind::CCall));
        assert!(set.contains(EventKind::Line));
        assert!(!set.contains(EventKind::Return));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_set_from_str() {
        let set: EventSet = "call, return".parse().unwrap();
        assert_eq!(set, EventSet::of(&[EventKind::Call, EventKind::Return]));
        assert_eq!(set.to_string(), "call,return");
        assert!("call,nope".parse::<EventSet>().is_err());
    }

    #[test]
    fn test_all_contains_every_kind() {
        assert_eq!(EventSet::ALL.len(), EventKind::ALL.len());
        assert!(!EventSet::TARGETABLE.contains(EventKind::Raise));
        assert!(EventSet::TARGETABLE.contains(EventKind::Rescue));
    }

    #[test]
    fn test_attribute_availability() {
        use Availability::*;

        assert_eq!(EventKind::Line.availability(Attribute::ReturnValue), Undefined);
        assert_eq!(EventKind::BReturn.availability(Attribute::ReturnValue), Defined);
        assert_eq!(EventKind::CCall.availability(Attribute::Binding), Absent);
        assert_eq!(EventKind::ThreadBegin.availability(Attribute::Path), Absent);
        assert_eq!(EventKind::Rescue.availability(Attribute::RaisedException), Defined);
        assert_eq!(EventKind::Line.availability(Attribute::Parameters), Undefined);
        assert_eq!(EventKind::CReturn.availability(Attribute::Parameters), Defined);
        assert_eq!(
            EventKind::ScriptCompiled.availability(Attribute::EvalScript),
            Defined
        );
        assert_eq!(EventKind::Call.availability(Attribute::EvalScript), Undefined);
    }

    #[test]
    fn test_set_try_from_names() {
        let set = EventSet::try_from(vec!["a_return".to_string()]).unwrap();
        assert_eq!(set, EventSet::A_RETURN);
        let names: Vec<EventKind> = set.into();
        assert_eq!(names, vec![EventKind::Return, EventKind::CReturn, EventKind::BReturn]);
    }
}
