//! Non-local control flow.
//!
//! Managed code leaves a frame in one of four ways: a normal value, a raised
//! exception, a `break` aimed at the frame that yielded the block, or a
//! `return` aimed at the frame that owns it. The last three travel up the
//! Rust stack as [`Unwind`] so that every frame they pass through can emit
//! its closing event before popping.

use vigil_core::{Exception, FrameTag, Value};

/// A non-local exit in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Unwind {
    /// An exception propagating to the nearest handler.
    Raise(Exception),
    /// `break value`, caught by the activation tagged `target`.
    Break {
        /// The break value.
        value: Value,
        /// Activation that stops the unwind.
        target: FrameTag,
    },
    /// `return value`, caught by the activation tagged `target`.
    Return {
        /// The return value.
        value: Value,
        /// Activation that stops the unwind.
        target: FrameTag,
    },
}

/// Outcome of running managed code.
pub type Flow<T = Value> = Result<T, Unwind>;

impl Unwind {
    /// The exception, if this is a raise.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Unwind::Raise(exception) => Some(exception),
            _ => None,
        }
    }

    /// Convert an unwind that escaped every frame into an exception.
    pub fn into_exception(self) -> Exception {
        match self {
            Unwind::Raise(exception) => exception,
            Unwind::Break { .. } => Exception::local_jump_error("break from proc-closure"),
            Unwind::Return { .. } => Exception::local_jump_error("unexpected return"),
        }
    }
}

impl From<Exception> for Unwind {
    fn from(exception: Exception) -> Self {
        Unwind::Raise(exception)
    }
}

/// Settle a top-level flow: a stray `return` ends the script with its value.
pub fn settle(flow: Flow) -> Result<Value, Exception> {
    match flow {
        Ok(value) | Err(Unwind::Return { value, .. }) => Ok(value),
        Err(unwind) => Err(unwind.into_exception()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle() {
        assert_eq!(settle(Ok(Value::from(1))), Ok(Value::from(1)));
        let returned = Err(Unwind::Return {
            value: Value::sym("x"),
            target: FrameTag::next(),
        });
        assert_eq!(settle(returned), Ok(Value::sym("x")));

        let broken = Err(Unwind::Break {
            value: Value::Nil,
            target: FrameTag::next(),
        });
        assert!(settle(broken).unwrap_err().is("LocalJumpError"));
    }

    #[test]
    fn test_exception_accessor() {
        let exception = Exception::runtime_error("boom");
        let unwind = Unwind::from(exception.clone());
        assert_eq!(unwind.exception(), Some(&exception));
        assert_eq!(unwind.into_exception(), exception);
    }
}
