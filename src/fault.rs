//! Machine error kinds and the trap type threaded through instruction
//! handlers.
//!
//! Any in-process failure becomes an `Exception` value installed as the
//! stack's thrown object; the unwinder decides handling.  Stack
//! corruption is the one fatal kind: it bypasses catch, terminates the
//! scheduler loop and marks the kernel terminating.

use thiserror::Error;

use crate::common::id;
use crate::value::{Exception, Value};

/// Failures the machine itself can signal while executing an instruction.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("{0}")]
    OutOfRange(String),
    #[error("read from null register: {0}")]
    NullRead(usize),
    #[error("{0}")]
    Arithmetic(String),
    #[error("expected {expected} but got {got}")]
    Type { expected: &'static str, got: String },
    #[error("call to undefined symbol: {0}")]
    UndefinedSymbol(String),
    #[error("failed to link: {0}")]
    Link(String),
    #[error("stack size ({limit}) exceeded with call to '{function}'")]
    StackOverflow { function: String, limit: usize },
    #[error("stack corruption: frame for function {0} pushed more than once")]
    StackCorruption(String),
    #[error("unused pass-by-move parameter")]
    MovedParameterUnused,
    #[error("timeout expired")]
    Timeout,
    #[error("instruction pointer unchanged: execution entered an infinite loop")]
    InstructionUnchanged,
    #[error("malformed bytecode: {0}")]
    InvalidInstruction(String),
    #[error("{0}")]
    Exception(String),
}

impl Fault {
    /// Type name used by the unwinder to match catchers.
    pub fn kind(&self) -> &'static str {
        match self {
            Fault::OutOfRange(_) => "OutOfRange",
            Fault::NullRead(_) => "NullRead",
            Fault::Arithmetic(_) => "ArithmeticError",
            Fault::Type { .. } => "TypeError",
            Fault::UndefinedSymbol(_) => "UndefinedSymbol",
            Fault::Link(_) => "LinkError",
            Fault::StackOverflow { .. } => "StackOverflow",
            Fault::StackCorruption(_) => "StackCorruption",
            Fault::MovedParameterUnused => "MovedParameterUnused",
            Fault::Timeout => "TimeoutError",
            Fault::InstructionUnchanged => "InstructionUnchanged",
            Fault::InvalidInstruction(_) => "InvalidInstruction",
            Fault::Exception(_) => "Exception",
        }
    }

    pub fn into_value(self) -> Value {
        Value::Exception(Exception::new(id(self.kind()), self.to_string()))
    }
}

/// Control-flow outcome of a failed instruction handler.
///
/// `Raise` feeds the unwinder, `Halt` stops the whole machine, `Fatal`
/// cannot be caught by user code.
#[derive(Debug)]
pub enum Trap {
    Raise(Value),
    Halt,
    Fatal(String),
}

impl From<Fault> for Trap {
    fn from(fault: Fault) -> Trap {
        match fault {
            Fault::StackCorruption(_) => Trap::Fatal(fault.to_string()),
            other => Trap::Raise(other.into_value()),
        }
    }
}

impl From<Value> for Trap {
    fn from(thrown: Value) -> Trap {
        Trap::Raise(thrown)
    }
}
