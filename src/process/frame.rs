//! Call frames and try frames.

use crate::common::{id, Id, Map};
use crate::registers::{RegisterSet, RsSel};

/// A register picked out at operand-resolution time: concrete set plus
/// index.  `deref` marks pointer-dereference access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResolvedReg {
    pub rs: RsSel,
    pub index: usize,
    pub deref: bool,
}

/// Activation record for one call.
///
/// Created by the `frame` instruction, populated by `param`/`pamv`,
/// activated on `call`, destroyed on `return`/`tailcall` or by an
/// exception unwind.
pub struct Frame {
    pub function_name: Id,
    pub arguments: RegisterSet,
    pub local_register_set: RegisterSet,
    /// Byte cursor in the caller's module to resume at.
    pub return_address: Option<usize>,
    /// Caller register receiving the return value; None discards it.
    pub return_target: Option<ResolvedReg>,
    /// Calls to invoke, most recent first, when this frame exits.
    pub deferred: Vec<Frame>,
    /// Identity used to detect a frame pushed more than once.
    pub(crate) serial: u64,
}

impl Frame {
    pub fn new(arguments_size: usize, registers_size: usize) -> Frame {
        Frame {
            function_name: id(""),
            arguments: RegisterSet::new(arguments_size),
            local_register_set: RegisterSet::new(registers_size),
            return_address: None,
            return_target: None,
            deferred: Vec::new(),
            serial: 0,
        }
    }
}

/// Entry in the exception-handling stack.
///
/// Created by `try`, augmented by `catch`, committed by `enter`,
/// consumed by `leave` or by an unwind that crosses it.
pub struct TryFrame {
    /// Type name to catcher block entry.
    pub catchers: Map<Id, Id>,
    /// Call-stack depth in effect when `enter` committed this frame.
    pub associated_frame: usize,
    /// Where `leave` resumes, just past the `enter` instruction.
    pub return_address: usize,
}

impl Default for TryFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrame {
    pub fn new() -> TryFrame {
        TryFrame {
            catchers: Map::new(),
            associated_frame: 0,
            return_address: 0,
        }
    }
}
