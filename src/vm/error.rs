//! Runtime and embedding error types.

use std::fmt;

use thiserror::Error;

use super::bytecode::BytecodeError;
use super::value::Value;
use super::verifier::VerifyError;

/// Category of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DivideByZero,
    IndexOutOfRange,
    ArityMismatch,
    TypeMismatch,
    StackOverflow,
    OutOfMemory,
    Cancelled,
    /// Raised by the `throw` instruction.
    Thrown,
    /// Raised by a host-registered native function.
    Native,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::DivideByZero => "DivideByZero",
            ErrorKind::IndexOutOfRange => "IndexOutOfRange",
            ErrorKind::ArityMismatch => "ArityMismatch",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Thrown => "Thrown",
            ErrorKind::Native => "Native",
        }
    }

    /// Whether a `try` handler inside the script may intercept this kind.
    /// Cancellation always reaches the host.
    pub fn is_catchable(self) -> bool {
        !matches!(self, ErrorKind::Cancelled)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where in the bytecode a runtime error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    /// Instruction index within the function.
    pub offset: usize,
    pub line: Option<u32>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in {} at {}", self.function, self.offset)?;
        if let Some(line) = self.line {
            write!(f, ", line {}", line)?;
        }
        Ok(())
    }
}

fn fmt_location(location: &Option<Location>) -> String {
    match location {
        Some(loc) => format!(" ({})", loc),
        None => String::new(),
    }
}

/// A recoverable error raised while executing bytecode.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", fmt_location(.location))]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<Location>,
    /// The value passed to `throw`. A heap reference here is only valid
    /// until the VM next collects garbage.
    pub value: Option<Value>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            value: None,
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, message)
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Native, message)
    }

    pub fn arity(name: &str, expected: usize, got: usize) -> Self {
        Self::new(
            ErrorKind::ArityMismatch,
            format!("{} expects {} argument(s), got {}", name, expected, got),
        )
    }

    pub fn thrown(value: Value, message: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            ..Self::new(ErrorKind::Thrown, message)
        }
    }

    pub(crate) fn at(mut self, location: Location) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        }
        self
    }
}

/// Errors surfaced through the embedding API.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Bytecode(BytecodeError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("undefined entry point '{0}'")]
    UndefinedEntry(String),
    /// An engine invariant was violated. The VM refuses further work.
    #[error("internal error: {0}")]
    Internal(String),
    #[error("VM is unusable after an earlier internal error")]
    Poisoned,
}

impl VmError {
    pub fn runtime_kind(&self) -> Option<ErrorKind> {
        match self {
            VmError::Runtime(e) => Some(e.kind),
            _ => None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        VmError::Internal(message.into())
    }
}

impl From<BytecodeError> for VmError {
    /// Malformed code found while decoding is a verification failure.
    fn from(e: BytecodeError) -> Self {
        match e {
            BytecodeError::Verify(v) => VmError::Verify(v),
            other => VmError::Bytecode(other),
        }
    }
}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        RuntimeError::new(kind, kind.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_location() {
        let err = RuntimeError::new(ErrorKind::DivideByZero, "integer division by zero").at(
            Location {
                function: "main".to_string(),
                offset: 4,
                line: Some(12),
            },
        );
        assert_eq!(
            err.to_string(),
            "DivideByZero: integer division by zero (in main at 4, line 12)"
        );
    }

    #[test]
    fn test_first_location_wins() {
        let loc = |name: &str| Location {
            function: name.to_string(),
            offset: 0,
            line: None,
        };
        let err = RuntimeError::from(ErrorKind::OutOfMemory)
            .at(loc("inner"))
            .at(loc("outer"));
        assert_eq!(err.location.unwrap().function, "inner");
    }

    #[test]
    fn test_cancelled_is_not_catchable() {
        assert!(!ErrorKind::Cancelled.is_catchable());
        assert!(ErrorKind::StackOverflow.is_catchable());
    }

    #[test]
    fn test_vm_error_kind() {
        let err = VmError::from(RuntimeError::arity("add", 2, 1));
        assert_eq!(err.runtime_kind(), Some(ErrorKind::ArityMismatch));
        assert_eq!(
            err.to_string(),
            "ArityMismatch: add expects 2 argument(s), got 1"
        );
        assert_eq!(VmError::Poisoned.runtime_kind(), None);
    }
}
